//! Error taxonomy for the session core
//!
//! Probe failures never surface here (the prober absorbs them); everything
//! else propagates as `Result<T, Error>`.

use std::io;

use thiserror::Error;

use crate::framing::{DecodeError, EncodeError};
use crate::protocol::ErrorCode;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller contract violation
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("connect failed: {0}")]
    NetworkConnect(String),

    #[error("bind failed: {0}")]
    NetworkBind(String),

    /// Malformed or unexpected traffic, or a peer that went away
    #[error("protocol error: {0}")]
    NetworkProtocol(String),

    #[error("allocation failed: {0}")]
    Memory(String),

    /// Operation attempted in the wrong lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session is full")]
    SessionFull,

    #[error("failed to spawn thread: {0}")]
    Thread(String),

    /// Error reply from the discovery service
    #[error("discovery service refused ({code}): {message}")]
    Acds { code: ErrorCode, message: String },

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error means the remote end is gone
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::NetworkProtocol(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        Error::NetworkProtocol(e.to_string())
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::NetworkProtocol(e.to_string())
    }
}
