//! Error types for the Strand runtime

use strand_proto::ProtocolError;
use thiserror::Error;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No registered handler matched the requested service and method
    #[error("unimplemented")]
    Unimplemented,

    /// The call context was cancelled
    #[error("context canceled")]
    Canceled,

    /// The remote completed its send side; no further messages will arrive
    #[error("end of stream")]
    EndOfStream,

    /// The send side of the call has already been completed
    #[error("call already completed")]
    Completed,

    /// Error string reported by the remote in a terminal packet
    #[error("{0}")]
    Remote(String),

    /// A handler is already registered under this service ID
    #[error("handler already registered for service: {0}")]
    AlreadyRegistered(String),

    /// The peer violated the packet ordering contract
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying byte transport failed or went away
    #[error("transport error: {0}")]
    Transport(String),

    /// Wire-level failure from the packet codec
    #[error(transparent)]
    Wire(#[from] ProtocolError),

    /// I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Self::Wire(ProtocolError::Decode(err))
    }
}
