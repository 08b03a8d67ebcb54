//! Tether integration test harness.
//!
//! Cross-layer scenarios over in-memory duplex pairs and tokio byte
//! streams. Nothing here needs a network or a separate process.
//!
//!   cargo test --test integration
//!
//! Anything that parks a thread on a call (`invoke_blocking`, `exec`,
//! `calc`) runs under `spawn_blocking`, never on a runtime worker.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use tether_channel::duplex::MemoryDuplex;
use tether_channel::pipe::{BlobPipe, BlobReceiver};
use tether_channel::rpc::{RpcChannel, Singletons};
use tether_channel::supervision::Supervisor;
use tether_core::config::PipeConfig;

mod facade;
mod pipe;
mod reconnect;
mod rpc;
mod stream;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Await `f`, failing the test if it takes longer than [`TIMEOUT`].
pub async fn within<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, f)
        .await
        .expect("timed out")
}

/// Poll `cond` until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Records every blob it is handed, refusing those that match `refuse`.
#[derive(Default)]
pub struct Recorder {
    pub blobs: Mutex<Vec<Bytes>>,
    pub refuse: Option<(Bytes, String)>,
}

impl Recorder {
    pub fn refusing(blob: &'static [u8], reason: &str) -> Self {
        Self {
            blobs: Mutex::default(),
            refuse: Some((Bytes::from_static(blob), reason.to_string())),
        }
    }

    pub fn received(&self) -> Vec<Bytes> {
        self.blobs.lock().unwrap().clone()
    }

    pub fn count(&self, blob: &[u8]) -> usize {
        self.blobs.lock().unwrap().iter().filter(|b| b.as_ref() == blob).count()
    }
}

impl BlobReceiver for Recorder {
    fn receive(&self, blob: Bytes) -> Result<(), String> {
        self.blobs.lock().unwrap().push(blob.clone());
        match &self.refuse {
            Some((refused, reason)) if *refused == blob => Err(reason.clone()),
            _ => Ok(()),
        }
    }

    fn closed(&self) {}
}

pub fn blob_pipe(name: &str) -> BlobPipe {
    BlobPipe::new(name, PipeConfig::default(), Supervisor::new(name)).unwrap()
}

/// Sender `a` and receiving pipe `b` joined by an in-memory pair. The
/// duplex ends are returned so tests can sever them.
pub fn pipe_pair(
    receiver: Arc<Recorder>,
) -> (BlobPipe, BlobPipe, Arc<MemoryDuplex>, Arc<MemoryDuplex>) {
    let a = blob_pipe("a");
    let b = blob_pipe("b");
    b.bind(receiver).unwrap();
    let (x, y) = MemoryDuplex::pair();
    a.attach_stream(x.clone()).unwrap();
    b.attach_stream(y.clone()).unwrap();
    (a, b, x, y)
}

/// Controller channel `a` and agent channel `b`, with `singletons` on `b`.
pub fn channel_pair(singletons: Singletons) -> (RpcChannel, RpcChannel) {
    let a = RpcChannel::builder("controller").build().unwrap();
    let b = RpcChannel::builder("agent")
        .singletons(singletons)
        .build()
        .unwrap();
    let (x, y) = MemoryDuplex::pair();
    a.attach_stream(x).unwrap();
    b.attach_stream(y).unwrap();
    (a, b)
}
