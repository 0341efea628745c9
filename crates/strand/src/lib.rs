//! # Strand
//!
//! A streaming RPC runtime carrying Protocol-Buffers-shaped services over
//! any reliable, ordered, bidirectional byte transport, from an in-memory
//! pipe to a WebSocket or a multiplexed sub-stream. Supports unary,
//! server-streaming, client-streaming, and bidirectional calls, usable
//! symmetrically on both endpoints of a link.
//!
//! The pieces line up with the data path: a [`Client`] opens a byte stream
//! per call and runs the client state machine over it; a [`Server`] accepts
//! byte streams and dispatches through its [`Mux`] to registered
//! [`Handler`]s; both ends hand user code a [`MsgStream`]. The
//! [`tunnel`] module nests a second session inside a live call so a
//! sub-component can expose its own service surface.

#![warn(missing_docs)]

pub use strand_proto as proto;

/// Client call state machine and facade
pub mod client;

/// Runtime configuration
pub mod config;

/// Error types for the Strand runtime
pub mod error;

/// Service registry and method dispatch
pub mod mux;

/// In-memory loopback transport
pub mod pipe;

/// Server call state machine and facade
pub mod server;

/// Per-call message stream handed to user code
pub mod stream;

/// Byte transport seam and packet pump
pub mod transport;

/// Nested RPC session tunneled inside a live bidirectional call
pub mod tunnel;

pub use client::Client;
pub use config::RpcConfig;
pub use error::Error;
pub use mux::{Handler, Mux};
pub use pipe::{pipe_client, PipeOpener};
pub use server::Server;
pub use stream::MsgStream;
pub use transport::{BoxedByteStream, ByteStream, OpenStream, PacketHandler, PacketWriter};
pub use tunnel::{
    handle_rpc_stream, open_rpc_stream, rpc_stream_client, MuxResolver, ResolvedMux,
    RpcStreamCaller, RpcStreamOpener, TunnelStream,
};

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;
