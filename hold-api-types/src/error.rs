//! Error codes surfaced to peers and clients.
//!
//! Every code is a distinct integer; the human readable message travels
//! next to it. Errors wrap freely into `anyhow::Error` chains - the code of
//! a chain is the code of the innermost [`NodeError`] found in it.

use anyhow::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoSuchSession,
    SessionAlreadyExists,
    NoSuchChunk,
    ChunkAlreadyExists,
    BlockContentMismatch,
    WindowError,
    OutOfSpace,
    Unavailable,
    RemoteCallFailed,
    ChunkPrecachingFailed,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::NoSuchSession => 101,
            ErrorCode::SessionAlreadyExists => 102,
            ErrorCode::NoSuchChunk => 103,
            ErrorCode::ChunkAlreadyExists => 104,
            ErrorCode::BlockContentMismatch => 105,
            ErrorCode::WindowError => 106,
            ErrorCode::OutOfSpace => 107,
            ErrorCode::Unavailable => 108,
            ErrorCode::RemoteCallFailed => 109,
            ErrorCode::ChunkPrecachingFailed => 110,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{message} (code {code:?})")]
pub struct NodeError {
    pub code: ErrorCode,
    pub message: String,
}

impl NodeError {
    pub fn new<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Build an `anyhow::Error` carrying a typed code.
pub fn node_error<S: Into<String>>(code: ErrorCode, message: S) -> Error {
    NodeError::new(code, message).into()
}

/// Extract the typed code from an error chain, if any.
pub fn error_code(err: &Error) -> Option<ErrorCode> {
    // anyhow's downcast searches context values as well as the root cause
    if let Some(node_err) = err.downcast_ref::<NodeError>() {
        return Some(node_err.code);
    }
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<NodeError>())
        .map(|node_err| node_err.code)
        .next()
}

/// True if the chain carries exactly this code.
pub fn has_code(err: &Error, code: ErrorCode) -> bool {
    error_code(err) == Some(code)
}
