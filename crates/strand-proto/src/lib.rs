//! # Strand Protocol
//!
//! Wire packet schema, framing codec, and raw-message container for the
//! Strand RPC runtime. Frames are varint-length-prefixed protobuf packets;
//! the schema here is hand-written [`prost`] derives so the encoding is
//! bit-exact without build-time code generation.

#![warn(missing_docs)]

/// Length-prefixed packet framing for async byte streams
pub mod codec;

/// Error types for wire-level operations
pub mod error;

/// Raw-message payload container
pub mod message;

/// Wire packet schema for calls and the nested stream tunnel
pub mod packet;

pub use codec::{PacketCodec, MAX_PACKET_SIZE};
pub use error::ProtocolError;
pub use message::RawMessage;
pub use packet::{
    CallData, CallStart, CallStartResp, Packet, RpcAck, RpcStreamInit, RpcStreamPacket,
};
