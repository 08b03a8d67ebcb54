//! Object pipe — structured values over a reliable blob pipe.
//!
//! Outbound objects pass through the marshaling chain, then `serde_json`,
//! then the blob pipe. Inbound blobs take the reverse path. Failures on
//! either side surface through the blob pipe's per-message result: a local
//! marshaling error fails the [`Delivery`], a remote decoding error comes
//! back as a NACK.

pub mod marshal;
pub mod value;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::pipe::{BlobPipe, BlobReceiver, Delivery, PipeError};
use crate::supervision::Component;

pub use marshal::{MarshalChain, MarshalError, Marshaler};
pub use value::{downcast_live, LiveObject, RemoteHandle, Value, WireValue};

/// A message type that can travel through an object pipe.
pub trait Portable: Sized + Send + 'static {
    type Wire: Serialize + DeserializeOwned;

    fn to_wire(self, chain: &MarshalChain) -> Result<Self::Wire, MarshalError>;

    fn from_wire(wire: Self::Wire, chain: &MarshalChain) -> Result<Self, MarshalError>;
}

impl Portable for Value {
    type Wire = WireValue;

    fn to_wire(self, chain: &MarshalChain) -> Result<WireValue, MarshalError> {
        chain.to_wire(self)
    }

    fn from_wire(wire: WireValue, chain: &MarshalChain) -> Result<Value, MarshalError> {
        chain.from_wire(wire)
    }
}

/// Consumer of inbound objects.
pub trait ObjectReceiver<T>: Send + Sync {
    /// `Err(reason)` is reported to the sender.
    fn receive(&self, object: T) -> Result<(), String>;

    /// Called exactly once when the pipe closes.
    fn closed(&self);
}

pub struct ObjectPipe<T: Portable> {
    inner: Arc<ObjectInner<T>>,
}

impl<T: Portable> Clone for ObjectPipe<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ObjectInner<T> {
    blob: BlobPipe,
    chain: MarshalChain,
    receiver: OnceLock<Arc<dyn ObjectReceiver<T>>>,
    notified: AtomicBool,
}

impl<T: Portable> ObjectPipe<T> {
    pub fn new(blob: BlobPipe, chain: MarshalChain) -> Self {
        let inner = Arc::new(ObjectInner {
            blob,
            chain,
            receiver: OnceLock::new(),
            notified: AtomicBool::new(false),
        });
        let component: Arc<dyn Component> = inner.clone();
        inner.blob.supervisor().register(Arc::downgrade(&component));
        Self { inner }
    }

    /// Register the single consumer and start receiving.
    pub fn bind(&self, receiver: Arc<dyn ObjectReceiver<T>>) -> Result<(), PipeError> {
        self.inner
            .receiver
            .set(receiver)
            .map_err(|_| PipeError::AlreadyBound)?;
        let adapter = Arc::new(Decoder {
            inner: Arc::downgrade(&self.inner),
        });
        self.inner.blob.bind(adapter)
    }

    /// Marshal and send one object.
    pub fn send_object(&self, object: T) -> Delivery {
        match self.encode(object) {
            Ok(bytes) => self.inner.blob.send(bytes),
            Err(e) => {
                tracing::debug!(pipe = %self.inner.blob.name(), error = %e, "marshaling failed");
                Delivery::failed(PipeError::Marshal(e.to_string()))
            }
        }
    }

    fn encode(&self, object: T) -> Result<Bytes, MarshalError> {
        let wire = object.to_wire(&self.inner.chain)?;
        let json = serde_json::to_vec(&wire).map_err(|e| MarshalError::Encode(e.to_string()))?;
        Ok(Bytes::from(json))
    }

    /// Close this pipe and the blob pipe beneath it.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn blob_pipe(&self) -> &BlobPipe {
        &self.inner.blob
    }

    pub fn chain(&self) -> &MarshalChain {
        &self.inner.chain
    }
}

impl<T: Portable> ObjectInner<T> {
    fn close(&self) {
        self.blob.close();
        self.notify_closed();
    }

    fn notify_closed(&self) {
        if let Some(receiver) = self.receiver.get() {
            if !self.notified.swap(true, Ordering::SeqCst) {
                receiver.closed();
            }
        }
    }
}

impl<T: Portable> Component for ObjectInner<T> {
    fn name(&self) -> String {
        format!("{}/objects", self.blob.name())
    }

    fn shutdown(&self) {
        self.close();
    }
}

/// Blob receiver that decodes into `T` before handing over.
struct Decoder<T> {
    inner: std::sync::Weak<ObjectInner<T>>,
}

impl<T: Portable> BlobReceiver for Decoder<T> {
    fn receive(&self, blob: Bytes) -> Result<(), String> {
        let inner = self.inner.upgrade().ok_or("object pipe dropped")?;
        let receiver = inner.receiver.get().ok_or("object pipe has no receiver")?;

        let wire: T::Wire = serde_json::from_slice(&blob)
            .map_err(|e| MarshalError::Decode(e.to_string()).to_string())?;
        let object = T::from_wire(wire, &inner.chain).map_err(|e| e.to_string())?;
        receiver.receive(object)
    }

    fn closed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.notify_closed();
        }
    }
}
