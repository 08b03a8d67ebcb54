//! Error types for remote invocation.
//!
//! A failure inside a remote implementation travels back as data
//! ([`RemoteError`]) and is merged into [`RpcError`] at the caller.

use std::fmt;
use std::panic::Location;

use serde::{Deserialize, Serialize};

use crate::pipe::PipeError;

use super::message::MethodSig;

/// Kind reported when the target instance is not exported.
pub const NO_SUCH_INSTANCE: &str = "NoSuchInstance";
/// Kind reported when the target does not implement the method.
pub const NO_SUCH_METHOD: &str = "NoSuchMethod";
/// Kind reported when arguments do not match the method's parameters.
pub const BAD_ARGUMENTS: &str = "BadArguments";
/// Kind reported when an implementation panicked.
pub const PANIC: &str = "Panic";
/// Kind reported when a result could not be marshaled back.
pub const UNPORTABLE_RESULT: &str = "UnportableResult";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOrigin {
    /// Raised inside the remote implementation.
    Remote,
    /// The local call site that started the invocation.
    Local,
    /// Channel machinery. Trimmed before the error reaches the caller.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrame {
    pub location: String,
    pub origin: FrameOrigin,
}

/// A failure raised by a remote implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub trace: Vec<TraceFrame>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Append a frame to the trace.
    pub fn at(mut self, location: impl Into<String>, origin: FrameOrigin) -> Self {
        self.trace.push(TraceFrame {
            location: location.into(),
            origin,
        });
        self
    }

    /// Drop channel-internal frames and append the caller's location.
    pub fn spliced(mut self, call_site: &Location<'_>, method: &MethodSig) -> Self {
        self.trace.retain(|f| f.origin != FrameOrigin::Internal);
        self.at(
            format!(
                "{method} called at {}:{}:{}",
                call_site.file(),
                call_site.line(),
                call_site.column()
            ),
            FrameOrigin::Local,
        )
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for frame in &self.trace {
            write!(f, "\n    at {}", frame.location)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// The method declares this error kind.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The remote side failed with a kind the method does not declare.
    #[error("undeclared error from {method}: {source}")]
    Undeclared { method: String, source: RemoteError },

    #[error("channel closed")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(PipeError),

    #[error("{0}")]
    Definition(String),

    #[error("no tokio runtime available")]
    NoRuntime,
}

impl RpcError {
    /// The remote failure, declared or not.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            RpcError::Remote(e) | RpcError::Undeclared { source: e, .. } => Some(e),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, RpcError::Closed)
    }
}

impl From<PipeError> for RpcError {
    fn from(e: PipeError) -> Self {
        match e {
            PipeError::Closed => RpcError::Closed,
            PipeError::NoRuntime => RpcError::NoRuntime,
            other => RpcError::Transport(other),
        }
    }
}
