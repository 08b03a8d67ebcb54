//! tether-channel — the layered channel stack.
//!
//! Bottom to top: a [`duplex::ByteDuplex`] carries bytes, a
//! [`pipe::BlobPipe`] turns them into acknowledged messages, an
//! [`object::ObjectPipe`] turns messages into values, and an
//! [`rpc::RpcChannel`] turns values into remote calls. [`facade`] is the
//! executor surface built on top. Every layer registers with a
//! [`supervision::Supervisor`] that tears the whole composition down together.

pub mod duplex;
pub mod facade;
pub mod object;
pub mod pipe;
pub mod rpc;
pub mod supervision;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use duplex::{ByteDuplex, ByteSink, DuplexError, Framing, MemoryDuplex, StreamDuplex};
pub use facade::{RemoteNode, TaskRegistry};
pub use object::{ObjectPipe, ObjectReceiver, RemoteHandle, Value};
pub use pipe::{BlobPipe, BlobReceiver, Delivery, PipeError};
pub use rpc::{Interface, RemoteError, RpcChannel, RpcError, ServiceObject};
pub use supervision::{Component, Supervisor};

/// Lock a std mutex, ignoring poison. No critical section in this crate
/// leaves its data half-updated across a panic point.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
