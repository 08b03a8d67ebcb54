//! Byte duplex — the replaceable stream underneath a blob pipe.
//!
//! A duplex pushes every buffer it reads into one registered [`ByteSink`]
//! and reports the end of the stream exactly once: `on_closed(None)` for a
//! clean EOF, `on_closed(Some(err))` for a broken or corrupt stream.
//!
//! Two implementations:
//!   - [`MemoryDuplex`]: an in-process pair, with a `sever` switch that makes
//!     the link go silent without notifying either side.
//!   - [`StreamDuplex`]: any tokio `AsyncRead + AsyncWrite`, optionally
//!     wrapped in envelope framing so write boundaries survive coalescing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tether_core::envelope::{EnvelopeReader, EnvelopeWriter};

use crate::lock;

const READ_BUF_LEN: usize = 8192;

/// Receives buffers pushed by a duplex.
pub trait ByteSink: Send + Sync {
    fn on_bytes(&self, data: Bytes);

    /// The stream ended. `None` is a clean EOF.
    fn on_closed(&self, error: Option<DuplexError>);
}

/// A bidirectional byte stream with push-style reads.
pub trait ByteDuplex: Send + Sync {
    /// Register the single sink and start reading. Requires a tokio runtime.
    fn bind(&self, sink: Arc<dyn ByteSink>) -> Result<(), DuplexError>;

    /// Queue a buffer for writing. Never blocks.
    fn write(&self, data: Bytes) -> Result<(), DuplexError>;

    /// Stop reading and writing. Does not call the sink.
    fn close(&self);

    /// Human-readable label for logs.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DuplexError {
    #[error("stream closed")]
    Closed,

    #[error("stream broken: {0}")]
    Broken(String),

    #[error("stream already has a sink")]
    AlreadyBound,

    #[error("no tokio runtime available")]
    NoRuntime,
}

// ── In-memory pair ────────────────────────────────────────────────────────────

/// One end of an in-process duplex pair.
pub struct MemoryDuplex {
    label: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    severed: Arc<AtomicBool>,
}

impl MemoryDuplex {
    /// Two connected ends. Bytes written to one are pushed to the other's sink.
    pub fn pair() -> (Arc<MemoryDuplex>, Arc<MemoryDuplex>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let severed = Arc::new(AtomicBool::new(false));

        let end = |label: &str, tx, rx| {
            Arc::new(MemoryDuplex {
                label: label.to_string(),
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
                pump: Mutex::new(None),
                severed: severed.clone(),
            })
        };
        (end("memory:a", a_tx, a_rx), end("memory:b", b_tx, b_rx))
    }

    /// Cut the link silently in both directions. Writes keep succeeding,
    /// nothing arrives, and neither sink is told.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
    }

    pub fn is_severed(&self) -> bool {
        self.severed.load(Ordering::SeqCst)
    }
}

impl ByteDuplex for MemoryDuplex {
    fn bind(&self, sink: Arc<dyn ByteSink>) -> Result<(), DuplexError> {
        let runtime = Handle::try_current().map_err(|_| DuplexError::NoRuntime)?;
        let mut rx = lock(&self.rx).take().ok_or(DuplexError::AlreadyBound)?;
        let severed = self.severed.clone();

        let task = runtime.spawn(async move {
            while let Some(buf) = rx.recv().await {
                if severed.load(Ordering::SeqCst) {
                    continue;
                }
                sink.on_bytes(buf);
            }
            if !severed.load(Ordering::SeqCst) {
                sink.on_closed(None);
            }
        });
        *lock(&self.pump) = Some(task);
        Ok(())
    }

    fn write(&self, data: Bytes) -> Result<(), DuplexError> {
        let tx = lock(&self.tx);
        let tx = tx.as_ref().ok_or(DuplexError::Closed)?;
        if self.severed.load(Ordering::SeqCst) {
            return Ok(());
        }
        tx.send(data)
            .map_err(|_| DuplexError::Broken("peer end dropped".into()))
    }

    fn close(&self) {
        lock(&self.tx).take();
        lock(&self.rx).take();
        if let Some(task) = lock(&self.pump).take() {
            task.abort();
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

// ── Tokio stream ──────────────────────────────────────────────────────────────

/// How buffers are laid out on a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Bytes pass through untouched. Read buffers may split or merge writes.
    Raw,
    /// Each write becomes one enveloped message, and each read delivers
    /// exactly one written buffer.
    Envelope { chunk_capacity: usize },
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A duplex over a tokio reader/writer pair.
pub struct StreamDuplex {
    label: String,
    framing: Framing,
    halves: Mutex<Option<(BoxedReader, BoxedWriter, mpsc::UnboundedReceiver<Bytes>)>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamDuplex {
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W, framing: Framing) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        // Writes made before `bind` wait in the queue.
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            label: label.into(),
            framing,
            halves: Mutex::new(Some((Box::new(reader), Box::new(writer), rx))),
            tx: Mutex::new(Some(tx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Wrap a single bidirectional stream.
    pub fn from_stream<S>(label: impl Into<String>, stream: S, framing: Framing) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(label, reader, writer, framing)
    }

    pub fn tcp(stream: tokio::net::TcpStream, framing: Framing) -> Self {
        let label = stream
            .peer_addr()
            .map(|addr| format!("tcp:{addr}"))
            .unwrap_or_else(|_| "tcp".to_string());
        let (reader, writer) = stream.into_split();
        Self::new(label, reader, writer, framing)
    }

    /// The process's own stdin/stdout.
    pub fn stdio(framing: Framing) -> Self {
        Self::new("stdio", tokio::io::stdin(), tokio::io::stdout(), framing)
    }
}

impl ByteDuplex for StreamDuplex {
    fn bind(&self, sink: Arc<dyn ByteSink>) -> Result<(), DuplexError> {
        let runtime = Handle::try_current().map_err(|_| DuplexError::NoRuntime)?;
        let (reader, writer, rx) = lock(&self.halves).take().ok_or(DuplexError::AlreadyBound)?;

        let write_task = runtime.spawn(write_loop(writer, rx, self.framing, sink.clone()));
        let read_task = runtime.spawn(read_loop(reader, self.framing, sink));
        lock(&self.tasks).extend([write_task, read_task]);
        Ok(())
    }

    fn write(&self, data: Bytes) -> Result<(), DuplexError> {
        let tx = lock(&self.tx);
        let tx = tx.as_ref().ok_or(DuplexError::Closed)?;
        tx.send(data)
            .map_err(|_| DuplexError::Broken("writer stopped".into()))
    }

    fn close(&self) {
        // Dropping the sender lets the writer drain and shut down.
        lock(&self.tx).take();
        lock(&self.halves).take();
        let mut tasks = lock(&self.tasks);
        if let Some(read_task) = tasks.pop() {
            read_task.abort();
        }
        tasks.clear();
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

async fn write_loop(
    mut writer: BoxedWriter,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    framing: Framing,
    sink: Arc<dyn ByteSink>,
) {
    let mut envelope = match framing {
        Framing::Raw => None,
        Framing::Envelope { chunk_capacity } => Some(EnvelopeWriter::new(chunk_capacity)),
    };

    while let Some(buf) = rx.recv().await {
        let out = match envelope.as_mut() {
            Some(env) => {
                env.write(&buf);
                env.close_message()
            }
            None => buf,
        };
        let result = async {
            writer.write_all(&out).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "stream write failed");
            sink.on_closed(Some(DuplexError::Broken(e.to_string())));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: BoxedReader, framing: Framing, sink: Arc<dyn ByteSink>) {
    let mut envelope = match framing {
        Framing::Raw => None,
        Framing::Envelope { chunk_capacity } => Some(EnvelopeReader::new(chunk_capacity)),
    };
    let mut buf = vec![0u8; READ_BUF_LEN];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                sink.on_closed(Some(DuplexError::Broken(e.to_string())));
                return;
            }
        };

        let Some(env) = envelope.as_mut() else {
            if n == 0 {
                sink.on_closed(None);
                return;
            }
            sink.on_bytes(Bytes::copy_from_slice(&buf[..n]));
            continue;
        };

        if n == 0 {
            match env.finish() {
                Ok(Some(message)) => sink.on_bytes(message),
                Ok(None) => {}
                Err(e) => {
                    sink.on_closed(Some(DuplexError::Broken(e.to_string())));
                    return;
                }
            }
            sink.on_closed(None);
            return;
        }

        env.push(&buf[..n]);
        loop {
            match env.next_message() {
                Ok(Some(message)) => sink.on_bytes(message),
                Ok(None) => break,
                Err(e) => {
                    sink.on_closed(Some(DuplexError::Broken(e.to_string())));
                    return;
                }
            }
        }
    }
}
