//! In-memory loopback transport
//!
//! Connects a [`Client`] to a [`Server`] in the same process: each opened
//! call gets a fresh duplex pipe with a server task on the far end. Useful
//! for tests and for wiring components together without a real transport.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::Client;
use crate::server::Server;
use crate::transport::{BoxedByteStream, OpenStream};
use crate::Result;

const PIPE_BUFFER: usize = 64 * 1024;

/// Opens calls against a server over in-memory duplex pipes.
pub struct PipeOpener {
    server: Arc<Server>,
    token: CancellationToken,
}

impl PipeOpener {
    /// Create an opener serving each call with `server`.
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            token: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl OpenStream for PipeOpener {
    async fn open_stream(&self) -> Result<BoxedByteStream> {
        let (client_io, server_io) = tokio::io::duplex(PIPE_BUFFER);
        let server = self.server.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_stream(&token, server_io).await {
                warn!("pipe call failed: {}", e);
            }
        });
        Ok(Box::new(client_io))
    }
}

/// A connected client serving every call through `server` over an in-memory
/// pipe.
pub fn pipe_client(server: Arc<Server>) -> Client {
    Client::new(Box::new(PipeOpener::new(server)))
}
