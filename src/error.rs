//! Error taxonomy for the IPC core.
//!
//! Mirrors the manual, dependency-free style of the teacher crate's
//! `ProtocolError`: a small hierarchy of plain structs/enums implementing
//! `Display` and `Error` by hand, no `thiserror`. A closed taxonomy is needed
//! here (rather than an opaque report type) because [`IpcError`] is stored
//! once per connection and handed out by reference to every waiter whose
//! request never got a reply.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Root error type returned by every fallible entry point of the IPC core.
#[derive(Debug, Clone)]
pub enum IpcError {
    /// Framing or socket-level failure.
    Transport(Arc<TransportError>),
    /// Encoding or decoding a [`crate::codec::Value`] failed.
    Codec(Arc<CodecError>),
    /// The connection or listener was already closed.
    Closed,
    /// The operation was cancelled before it completed.
    Cancelled,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpcError::Transport(e) => write!(f, "ipc transport error: {e}"),
            IpcError::Codec(e) => write!(f, "ipc codec error: {e}"),
            IpcError::Closed => write!(f, "ipc connection closed"),
            IpcError::Cancelled => write!(f, "ipc operation cancelled"),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpcError::Transport(e) => Some(e.as_ref()),
            IpcError::Codec(e) => Some(e.as_ref()),
            IpcError::Closed | IpcError::Cancelled => None,
        }
    }
}

impl From<TransportError> for IpcError {
    fn from(e: TransportError) -> Self {
        IpcError::Transport(Arc::new(e))
    }
}

impl From<CodecError> for IpcError {
    fn from(e: CodecError) -> Self {
        IpcError::Codec(Arc::new(e))
    }
}

/// Socket- and framing-level failure: short reads, bad headers, FD
/// ancillary-data overflow, or a raw OS error from the underlying socket.
#[derive(Debug)]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        TransportError(msg.into())
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError(e.to_string())
    }
}

impl From<io::Error> for IpcError {
    fn from(e: io::Error) -> Self {
        IpcError::from(TransportError::from(e))
    }
}

impl From<nix::Error> for TransportError {
    fn from(e: nix::Error) -> Self {
        TransportError(e.to_string())
    }
}

impl From<nix::Error> for IpcError {
    fn from(e: nix::Error) -> Self {
        IpcError::from(TransportError::from(e))
    }
}

/// Value-codec failure, never fatal to the connection itself.
#[derive(Debug)]
pub enum CodecError {
    /// Failed while writing a [`crate::codec::Value`] to bytes.
    Encoder(EncoderError),
    /// Failed while parsing bytes into a [`crate::codec::Value`].
    Decoder(DecoderError),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Encoder(e) => write!(f, "{e}"),
            CodecError::Decoder(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Failure while turning a [`crate::codec::Value`] into bytes. Currently only
/// raised when an FD index would overflow a 32-bit marker, which cannot
/// happen with realistic message sizes but is checked rather than assumed.
#[derive(Debug)]
pub struct EncoderError(pub String);

impl fmt::Display for EncoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "encoder error: {}", self.0)
    }
}

impl std::error::Error for EncoderError {}

impl From<EncoderError> for CodecError {
    fn from(e: EncoderError) -> Self {
        CodecError::Encoder(e)
    }
}

impl From<EncoderError> for IpcError {
    fn from(e: EncoderError) -> Self {
        IpcError::from(CodecError::from(e))
    }
}

/// Failure while parsing bytes into a [`crate::codec::Value`]: unknown
/// marker, truncated input, trailing bytes, non-UTF-8 string, or an
/// out-of-range FD index.
#[derive(Debug)]
pub struct DecoderError(pub String);

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "decoder error: {}", self.0)
    }
}

impl std::error::Error for DecoderError {}

impl From<DecoderError> for CodecError {
    fn from(e: DecoderError) -> Self {
        CodecError::Decoder(e)
    }
}

impl From<DecoderError> for IpcError {
    fn from(e: DecoderError) -> Self {
        IpcError::from(CodecError::from(e))
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = core::result::Result<T, IpcError>;
