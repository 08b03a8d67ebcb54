//! Reliable blob pipe — acknowledged, deduplicated delivery of opaque
//! payloads over a replaceable byte duplex.
//!
//! The sender keeps every message until the peer's application has
//! processed it (ACK-DELIVERED) or refused it (NACK). The receiver keeps a
//! record of every message it has seen until the sender retires it
//! (ACK-OF-NACK), so retransmissions after a reconnect are recognised and
//! never handed to the application twice.
//!
//! Attaching a stream, first or replacement, triggers a resync: our inbound
//! ack states, our failed inbound messages, then every outbound body the
//! peer has not confirmed receiving.

mod state;

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use tether_core::config::PipeConfig;
use tether_core::wire::{MessageId, Packet};

use crate::duplex::{ByteDuplex, ByteSink, DuplexError};
use crate::lock;
use crate::supervision::{Component, Supervisor};

use state::{Effects, PipeState};

/// Consumer of inbound blobs.
pub trait BlobReceiver: Send + Sync {
    /// Process one blob. `Err(reason)` is sent back to the sender as a NACK.
    fn receive(&self, blob: Bytes) -> Result<(), String>;

    /// The pipe has closed. Called at most once.
    fn closed(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("pipe closed")]
    Closed,

    #[error("message {id} rejected by peer: {reason}")]
    Rejected { id: MessageId, reason: String },

    #[error("too many messages in flight (limit {0})")]
    TooManyInFlight(usize),

    #[error("pipe already has a receiver")]
    AlreadyBound,

    #[error("marshaling failed: {0}")]
    Marshal(String),

    #[error("stream rejected: {0}")]
    Stream(#[from] DuplexError),

    #[error("no tokio runtime available")]
    NoRuntime,
}

// ── Delivery ──────────────────────────────────────────────────────────────────

/// Resolves once the peer's application has accepted or refused a message.
#[must_use = "a Delivery reports whether the peer processed the message"]
pub struct Delivery {
    id: Option<MessageId>,
    rx: Option<oneshot::Receiver<Result<(), PipeError>>>,
    early: Option<PipeError>,
}

impl Delivery {
    /// A delivery that has already failed.
    pub fn failed(error: PipeError) -> Self {
        Self {
            id: None,
            rx: None,
            early: Some(error),
        }
    }

    /// The wire id of the message, if it was ever assigned one.
    pub fn id(&self) -> Option<MessageId> {
        self.id
    }
}

impl Future for Delivery {
    type Output = Result<(), PipeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(err) = self.early.take() {
            return Poll::Ready(Err(err));
        }
        match self.rx.as_mut() {
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.unwrap_or(Err(PipeError::Closed))),
            None => Poll::Ready(Err(PipeError::Closed)),
        }
    }
}

// ── Pipe ──────────────────────────────────────────────────────────────────────

/// Handle to a reliable blob pipe. Clones share the same pipe.
#[derive(Clone)]
pub struct BlobPipe {
    inner: Arc<PipeInner>,
}

struct PipeInner {
    name: String,
    config: PipeConfig,
    supervisor: Arc<Supervisor>,
    runtime: Handle,
    state: Mutex<Shared>,
    receiver: OnceLock<Arc<dyn BlobReceiver>>,
    deliveries: mpsc::UnboundedSender<(MessageId, Bytes)>,
    pending_deliveries: Mutex<Option<mpsc::UnboundedReceiver<(MessageId, Bytes)>>>,
    closed: AtomicBool,
}

struct Shared {
    protocol: PipeState,
    /// The attached stream and the generation it was attached under.
    stream: Option<(u64, Arc<dyn ByteDuplex>)>,
    generation: u64,
}

impl BlobPipe {
    /// Create a pipe on the current tokio runtime. No stream is attached yet;
    /// sends made before [`BlobPipe::attach_stream`] go out on resync.
    pub fn new(
        name: impl Into<String>,
        config: PipeConfig,
        supervisor: Arc<Supervisor>,
    ) -> Result<Self, PipeError> {
        let runtime = Handle::try_current().map_err(|_| PipeError::NoRuntime)?;
        let (deliveries, pending) = mpsc::unbounded_channel();
        let inner = Arc::new(PipeInner {
            name: name.into(),
            state: Mutex::new(Shared {
                protocol: PipeState::new(config.max_packet_bytes),
                stream: None,
                generation: 0,
            }),
            config,
            supervisor: supervisor.clone(),
            runtime,
            receiver: OnceLock::new(),
            deliveries,
            pending_deliveries: Mutex::new(Some(pending)),
            closed: AtomicBool::new(false),
        });

        let component: Arc<dyn Component> = inner.clone();
        supervisor.register(Arc::downgrade(&component));
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register the single consumer. Blobs that arrived earlier are handed
    /// over now, in arrival order.
    pub fn bind(&self, receiver: Arc<dyn BlobReceiver>) -> Result<(), PipeError> {
        if self.is_closed() {
            return Err(PipeError::Closed);
        }
        self.inner
            .receiver
            .set(receiver.clone())
            .map_err(|_| PipeError::AlreadyBound)?;
        let queue = lock(&self.inner.pending_deliveries)
            .take()
            .ok_or(PipeError::AlreadyBound)?;

        let pipe = Arc::downgrade(&self.inner);
        self.inner
            .runtime
            .spawn(deliver_loop(pipe, receiver, queue));
        Ok(())
    }

    /// Send a blob. The returned future resolves once the peer's receiver
    /// has processed it. Never fails synchronously.
    pub fn send(&self, body: Bytes) -> Delivery {
        if self.is_closed() {
            return Delivery::failed(PipeError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        let limit = self.inner.config.in_flight_limit();

        let (id, stream) = {
            let mut shared = lock(&self.inner.state);
            match shared.protocol.enqueue(body.clone(), tx, limit) {
                Ok(id) => (id, shared.stream.clone()),
                Err((_, err)) => return Delivery::failed(err),
            }
        };
        tracing::trace!(pipe = %self.inner.name, %id, len = body.len(), "send");

        if let Some((generation, stream)) = stream {
            self.inner
                .write(generation, &stream, vec![Packet::Data { id, payload: body }]);
        }
        Delivery {
            id: Some(id),
            rx: Some(rx),
            early: None,
        }
    }

    /// Install `stream` as the active duplex, closing any previous one, and
    /// resync with the peer.
    pub fn attach_stream(&self, stream: Arc<dyn ByteDuplex>) -> Result<(), PipeError> {
        self.inner.attach(stream)
    }

    /// Fail all pending sends, drop the stream and notify the receiver.
    /// Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Outbound messages not yet finally acknowledged.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.state).protocol.in_flight()
    }

    /// Inbound messages the sender has not yet retired.
    pub fn inbound_pending(&self) -> usize {
        lock(&self.inner.state).protocol.inbound_len()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.inner.supervisor
    }
}

impl PipeInner {
    fn attach(self: &Arc<Self>, stream: Arc<dyn ByteDuplex>) -> Result<(), PipeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipeError::Closed);
        }

        let (generation, previous, packets) = {
            let mut shared = lock(&self.state);
            shared.generation += 1;
            let generation = shared.generation;
            let previous = shared.stream.replace((generation, stream.clone()));
            shared.protocol.reader =
                tether_core::wire::PacketReader::new(self.config.max_packet_bytes);
            (generation, previous, shared.protocol.resync())
        };
        if let Some((_, previous)) = previous {
            tracing::debug!(pipe = %self.name, old = %previous.describe(), "replacing stream");
            previous.close();
        }

        let sink = Arc::new(PipeSink {
            pipe: Arc::downgrade(self),
            generation,
        });
        if let Err(e) = stream.bind(sink) {
            let mut shared = lock(&self.state);
            if shared.generation == generation {
                shared.stream = None;
            }
            return Err(e.into());
        }

        tracing::info!(
            pipe = %self.name,
            stream = %stream.describe(),
            generation,
            resync = packets.len(),
            "stream attached"
        );
        self.write(generation, &stream, packets);
        Ok(())
    }

    /// Write packets as one buffer. A failed write rejects the stream.
    fn write(&self, generation: u64, stream: &Arc<dyn ByteDuplex>, packets: Vec<Packet>) {
        if packets.is_empty() {
            return;
        }
        let mut buf = BytesMut::new();
        for packet in &packets {
            buf.extend_from_slice(&packet.encode());
        }
        if let Err(e) = stream.write(buf.freeze()) {
            self.stream_lost(generation, Some(e));
        }
    }

    fn on_bytes(&self, generation: u64, data: Bytes) {
        let mut fx = Effects::default();
        let mut corruption = None;
        let stream = {
            let mut shared = lock(&self.state);
            if shared.generation != generation || self.closed.load(Ordering::SeqCst) {
                return;
            }
            shared.protocol.reader.push(&data);
            loop {
                match shared.protocol.reader.next_packet() {
                    Ok(Some(packet)) => {
                        tracing::trace!(pipe = %self.name, kind = ?packet.kind(), id = %packet.id(), "packet");
                        shared.protocol.handle(packet, &mut fx);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        corruption = Some(e);
                        break;
                    }
                }
            }
            shared.stream.clone()
        };

        let (packets, deliveries) = fx.resolve();
        for delivery in deliveries {
            let _ = self.deliveries.send(delivery);
        }
        if let Some((stream_generation, stream)) = stream {
            if stream_generation == generation {
                self.write(generation, &stream, packets);
            }
        }
        if let Some(e) = corruption {
            self.stream_lost(generation, Some(DuplexError::Broken(format!("corrupt stream: {e}"))));
        }
    }

    /// The receiver finished with an inbound message.
    fn delivered(&self, id: MessageId, outcome: Result<(), String>) {
        if let Err(reason) = &outcome {
            tracing::debug!(pipe = %self.name, %id, reason, "receiver refused message");
        }
        let (ack, stream) = {
            let mut shared = lock(&self.state);
            (shared.protocol.delivered(id, outcome), shared.stream.clone())
        };
        if let (Some(ack), Some((generation, stream))) = (ack, stream) {
            self.write(generation, &stream, vec![ack]);
        }
    }

    /// Drop the stream of `generation`, if it is still the active one, and
    /// report the loss according to the reconnect policy.
    fn stream_lost(&self, generation: u64, error: Option<DuplexError>) {
        let stream = {
            let mut shared = lock(&self.state);
            match &shared.stream {
                Some((g, _)) if *g == generation => shared.stream.take(),
                _ => None,
            }
        };
        let Some((_, stream)) = stream else {
            return;
        };
        stream.close();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let described = stream.describe();
        match (self.config.reconnect, error) {
            (true, error) => {
                let cause = error.map_or_else(|| "end of stream".to_string(), |e| e.to_string());
                self.supervisor.warning(
                    &self.name,
                    &format!("lost stream {described} ({cause}); waiting for a replacement"),
                );
            }
            (false, None) => self.supervisor.terminate(&self.name, "stream closed by peer"),
            (false, Some(e)) => self.supervisor.fatal(&self.name, &e.to_string()),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (pending, stream) = {
            let mut shared = lock(&self.state);
            (shared.protocol.drain_outbound(), shared.stream.take())
        };
        tracing::debug!(pipe = %self.name, pending = pending.len(), "closing pipe");

        for done in pending {
            let _ = done.send(Err(PipeError::Closed));
        }
        if let Some((_, stream)) = stream {
            stream.close();
        }
        if let Some(receiver) = self.receiver.get() {
            receiver.closed();
        }
        self.supervisor.terminate(&self.name, "pipe closed");
    }
}

impl Component for PipeInner {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn shutdown(&self) {
        self.close();
    }
}

async fn deliver_loop(
    pipe: Weak<PipeInner>,
    receiver: Arc<dyn BlobReceiver>,
    mut queue: mpsc::UnboundedReceiver<(MessageId, Bytes)>,
) {
    while let Some((id, blob)) = queue.recv().await {
        let outcome = catch_unwind(AssertUnwindSafe(|| receiver.receive(blob)))
            .unwrap_or_else(|_| Err("receiver panicked".to_string()));
        let Some(inner) = pipe.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        inner.delivered(id, outcome);
    }
}

/// Routes duplex callbacks to the pipe, tagged with the stream generation so
/// a replaced stream can no longer affect it.
struct PipeSink {
    pipe: Weak<PipeInner>,
    generation: u64,
}

impl ByteSink for PipeSink {
    fn on_bytes(&self, data: Bytes) {
        if let Some(pipe) = self.pipe.upgrade() {
            pipe.on_bytes(self.generation, data);
        }
    }

    fn on_closed(&self, error: Option<DuplexError>) {
        if let Some(pipe) = self.pipe.upgrade() {
            pipe.stream_lost(self.generation, error);
        }
    }
}
