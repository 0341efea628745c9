//! Error types for wire-level operations

use thiserror::Error;

/// Errors produced by the packet codec and wire validation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Packet bytes failed protobuf decoding
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Frame exceeds the configured maximum
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Packet contents violate the wire contract
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Underlying transport I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
