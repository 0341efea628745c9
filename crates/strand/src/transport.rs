//! Byte transport seam and packet pump
//!
//! Wraps a duplex byte stream into a serialized packet writer and a read pump
//! that feeds decoded packets to a handler. One pump task per stream; all
//! writes for a call go through its [`PacketWriter`], which serializes them
//! behind a lock.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use strand_proto::{Packet, PacketCodec};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Duplex byte stream contract consumed from transport collaborators.
///
/// Ordering and reliability are the transport's responsibility; this layer
/// only assumes reads yield bytes in write order and writes are atomic for
/// the buffer handed to them.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> ByteStream for T {}

/// Boxed byte stream as produced by [`OpenStream`] implementations.
pub type BoxedByteStream = Box<dyn ByteStream>;

/// Opens a fresh byte stream for each outgoing call.
///
/// A transport-level multiplexer is expected to hand out one byte stream per
/// call; this trait is the seam it plugs into.
#[async_trait]
pub trait OpenStream: Send + Sync {
    /// Open one byte stream. The caller runs exactly one call over it and
    /// closes it when the call terminates.
    async fn open_stream(&self) -> Result<BoxedByteStream>;
}

/// Consumer side of the packet read pump.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Handle one decoded packet. Returning an error terminates the pump.
    async fn handle_packet(&self, pkt: Packet) -> Result<()>;

    /// Called exactly once when the pump stops on end-of-stream (`None`) or
    /// on a read/handler error (`Some`). Not called when the pump is stopped
    /// by cancellation; the canceller owns cleanup in that case.
    async fn handle_close(&self, err: Option<Error>);
}

struct WriterState {
    io: WriteHalf<BoxedByteStream>,
    codec: PacketCodec,
    closed: bool,
}

/// Serialized packet writes onto the write half of a byte stream.
///
/// Safe to share across tasks; writes are serialized by an internal lock and
/// `close` is idempotent.
pub struct PacketWriter {
    inner: Mutex<WriterState>,
}

impl PacketWriter {
    fn new(io: WriteHalf<BoxedByteStream>, max_packet_size: usize) -> Self {
        Self {
            inner: Mutex::new(WriterState {
                io,
                codec: PacketCodec::with_max_packet_size(max_packet_size),
                closed: false,
            }),
        }
    }

    /// Serialize and send one packet. Fails if the transport write fails or
    /// the writer is already closed; the caller must treat the call as
    /// terminated on error.
    pub async fn send_packet(&self, pkt: &Packet) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.closed {
            return Err(Error::Transport("packet writer closed".into()));
        }
        let WriterState { io, codec, .. } = &mut *state;
        codec.write_packet(io, pkt).await?;
        Ok(())
    }

    /// Send one call-data packet. `None` data carries no payload; `Some` of
    /// length zero travels with the zero-length flag set.
    pub async fn send_call_data(
        &self,
        data: Option<Bytes>,
        complete: bool,
        error: Option<String>,
    ) -> Result<()> {
        self.send_packet(&Packet::call_data(data, complete, error))
            .await
    }

    /// Shut down the write half; idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.io.shutdown().await?;
        Ok(())
    }
}

/// Read half of a byte stream plus its framing codec.
pub struct PacketReader {
    io: ReadHalf<BoxedByteStream>,
    codec: PacketCodec,
}

/// Split a byte stream into its packet reader and shared packet writer.
pub fn packet_pair(
    conn: BoxedByteStream,
    max_packet_size: usize,
) -> (PacketReader, Arc<PacketWriter>) {
    let (read_half, write_half) = tokio::io::split(conn);
    let reader = PacketReader {
        io: read_half,
        codec: PacketCodec::with_max_packet_size(max_packet_size),
    };
    (reader, Arc::new(PacketWriter::new(write_half, max_packet_size)))
}

impl PacketReader {
    /// Run the read pump: decode framed packets and feed the handler until
    /// the stream ends, a packet is rejected, or `token` is cancelled.
    ///
    /// `handle_close` fires exactly once for the end-of-stream and error
    /// exits; the cancellation exit returns without it.
    pub async fn run_pump(mut self, handler: Arc<dyn PacketHandler>, token: CancellationToken) {
        loop {
            let pkt = tokio::select! {
                _ = token.cancelled() => {
                    debug!("read pump stopped by cancellation");
                    return;
                }
                res = self.codec.read_packet(&mut self.io) => match res {
                    Ok(Some(pkt)) => pkt,
                    Ok(None) => {
                        debug!("read pump reached end of stream");
                        handler.handle_close(None).await;
                        return;
                    }
                    Err(e) => {
                        warn!("read pump failed: {}", e);
                        handler.handle_close(Some(e.into())).await;
                        return;
                    }
                },
            };

            if let Err(e) = handler.handle_packet(pkt).await {
                warn!("packet handler rejected packet: {}", e);
                handler.handle_close(Some(e)).await;
                return;
            }
        }
    }
}
