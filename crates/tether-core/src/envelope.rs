//! Envelope framing — message boundaries over a raw byte stream.
//!
//! A message is written as one or more chunks, each prefixed with a 2-byte
//! big-endian length, followed by a zero-length chunk that ends it:
//!
//!   [len][bytes…] [len][bytes…] … [0x00 0x00]
//!
//! Chunks never exceed the working buffer capacity. A reader seeing a
//! declared length larger than its own working buffer treats the stream as
//! corrupt.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::WireError;

/// Default working buffer size, in bytes.
pub const DEFAULT_CHUNK_CAPACITY: usize = 8192;

/// Largest chunk a 2-byte length prefix can describe.
pub const MAX_CHUNK_CAPACITY: usize = u16::MAX as usize;

const CHUNK_HEADER_LEN: usize = 2;

fn clamp_capacity(capacity: usize) -> usize {
    capacity.clamp(1, MAX_CHUNK_CAPACITY)
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Buffers message bytes and emits them as an enveloped record.
#[derive(Debug)]
pub struct EnvelopeWriter {
    pending: BytesMut,
    chunk_capacity: usize,
}

impl Default for EnvelopeWriter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_CAPACITY)
    }
}

impl EnvelopeWriter {
    pub fn new(chunk_capacity: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            chunk_capacity: clamp_capacity(chunk_capacity),
        }
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Append bytes to the message being built.
    pub fn write(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Bytes written since the last `close_message`.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Flush the buffered message as chunks plus the end marker.
    /// The writer is empty afterwards.
    pub fn close_message(&mut self) -> Bytes {
        let body = self.pending.split().freeze();
        let chunks = body.len().div_ceil(self.chunk_capacity);
        let mut out = BytesMut::with_capacity(body.len() + (chunks + 1) * CHUNK_HEADER_LEN);
        for chunk in body.chunks(self.chunk_capacity) {
            out.put_u16(chunk.len() as u16);
            out.put_slice(chunk);
        }
        out.put_u16(0);
        out.freeze()
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Reconstructs enveloped messages from push-style buffers.
#[derive(Debug)]
pub struct EnvelopeReader {
    /// Raw stream bytes not yet consumed.
    incoming: BytesMut,
    /// The message under assembly.
    message: BytesMut,
    chunk_capacity: usize,
}

impl Default for EnvelopeReader {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_CAPACITY)
    }
}

impl EnvelopeReader {
    pub fn new(chunk_capacity: usize) -> Self {
        Self {
            incoming: BytesMut::new(),
            message: BytesMut::new(),
            chunk_capacity: clamp_capacity(chunk_capacity),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    /// Consume chunks until a message completes.
    ///
    /// Returns `None` when more bytes are needed. After a message is
    /// returned the reader is positioned at the start of the next one.
    pub fn next_message(&mut self) -> Result<Option<Bytes>, WireError> {
        loop {
            if self.incoming.len() < CHUNK_HEADER_LEN {
                return Ok(None);
            }
            let len = (&self.incoming[..CHUNK_HEADER_LEN]).get_u16() as usize;
            if len > self.chunk_capacity {
                return Err(WireError::ChunkTooLarge {
                    len,
                    capacity: self.chunk_capacity,
                });
            }
            if len == 0 {
                self.incoming.advance(CHUNK_HEADER_LEN);
                return Ok(Some(self.message.split().freeze()));
            }
            if self.incoming.len() < CHUNK_HEADER_LEN + len {
                return Ok(None);
            }
            self.incoming.advance(CHUNK_HEADER_LEN);
            let chunk = self.incoming.split_to(len);
            self.message.extend_from_slice(&chunk);
        }
    }

    /// The stream has ended. A message assembled from complete chunks but
    /// missing its end marker is returned as-is; a half-read chunk is an
    /// error.
    pub fn finish(&mut self) -> Result<Option<Bytes>, WireError> {
        if let Some(message) = self.next_message()? {
            return Ok(Some(message));
        }
        if !self.incoming.is_empty() {
            return Err(WireError::TruncatedChunk(self.incoming.len()));
        }
        if self.message.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.message.split().freeze()))
    }
}
