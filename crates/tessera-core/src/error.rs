//! Error codes and error types.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Fault codes carried by an RPC response that failed on the remote side.
///
/// Codes 0-99 follow gRPC numbering where a gRPC equivalent exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum FaultCode {
    InvalidArgument = 3,
    NotFound = 4,
    Unimplemented = 11,
    Internal = 12,
    Unavailable = 13,
}

impl FaultCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            3 => Some(Self::InvalidArgument),
            4 => Some(Self::NotFound),
            11 => Some(Self::Unimplemented),
            12 => Some(Self::Internal),
            13 => Some(Self::Unavailable),
            _ => None,
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "not found"),
            Self::Unimplemented => write!(f, "unimplemented"),
            Self::Internal => write!(f, "internal error"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// A failure reported by the peer instead of a response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteFault {
    pub code: FaultCode,
    pub message: String,
}

impl RemoteFault {
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FaultCode::Internal, message)
    }
}

/// Transport-level errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("frame of {len} bytes exceeds max {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Session lifecycle and establishment errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is already registered")]
    DuplicateId(String),
    #[error("session closed")]
    Closed,
    #[error("session is not active yet")]
    NotActive,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The non-success outcomes of an RPC call.
///
/// These are values delivered through the same promise or callback as a
/// successful response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("rpc timed out")]
    Timeout,
    #[error("session closed")]
    SessionClosed,
    #[error("remote fault: {0}")]
    Remote(RemoteFault),
    #[error("synchronous call issued from a session worker thread")]
    WouldBlockWorker,
    #[error("no rpc handler in the pipeline")]
    Unroutable,
}

/// Result delivered to RPC callers.
pub type RpcResult<M> = Result<M, RpcError>;

/// Failure cause stored in a completed promise.
pub type Cause = Arc<dyn std::error::Error + Send + Sync>;

/// Errors from the future/promise primitive.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PromiseError {
    #[error("promise already complete")]
    AlreadyComplete,
    #[error("timed out waiting for promise")]
    Timeout,
    #[error("promise cancelled")]
    Cancelled,
    #[error("promise failed: {0}")]
    Failed(Cause),
    #[error("void promise has no result")]
    Void,
}

/// Error returned by a pipeline handler. Logged and contained at the
/// pipeline boundary.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a single handler invocation.
pub type HandlerResult = Result<(), HandlerError>;

/// Pipeline mutation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("handler {0:?} already exists")]
    DuplicateName(String),
    #[error("no handler named {0:?}")]
    NotFound(String),
}
