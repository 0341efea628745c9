//! Nested RPC session tunneled inside a live bidirectional call
//!
//! A caller invokes a well-known bidirectional method on the host; inside
//! that call, a second RPC session runs against a sub-component's own mux.
//! The outer call's data frames carry [`RpcStreamPacket`]s; the nested
//! session sees an ordinary byte stream and brings its own packet framing,
//! so outer frames need not align with inner packet boundaries.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use strand_proto::packet::rpc_stream_packet::Body;
use strand_proto::RpcStreamPacket;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::Client;
use crate::mux::Mux;
use crate::server::Server;
use crate::stream::{CloseCb, MsgStream};
use crate::transport::{BoxedByteStream, OpenStream, PacketWriter};
use crate::{Error, Result};

/// Release hook invoked when a nested session ends.
pub type ReleaseFn = Box<dyn FnOnce() + Send + 'static>;

/// A resolved component mux plus its optional release hook.
pub struct ResolvedMux {
    /// Mux serving the component's RPC surface.
    pub mux: Arc<Mux>,
    /// Invoked once the nested session ends.
    pub release: Option<ReleaseFn>,
}

impl ResolvedMux {
    /// Resolve to `mux` with no release hook.
    pub fn new(mux: Arc<Mux>) -> Self {
        Self { mux, release: None }
    }

    /// Attach a release hook.
    pub fn with_release(mut self, release: ReleaseFn) -> Self {
        self.release = Some(release);
        self
    }
}

/// Resolves a component ID to the mux serving it.
#[async_trait]
pub trait MuxResolver: Send + Sync {
    /// Return the mux for `component_id`, or `None` when no such component
    /// exists.
    async fn resolve(&self, component_id: &str) -> Result<Option<ResolvedMux>>;
}

/// A static component table is the simplest resolver.
#[async_trait]
impl MuxResolver for HashMap<String, Arc<Mux>> {
    async fn resolve(&self, component_id: &str) -> Result<Option<ResolvedMux>> {
        Ok(self.get(component_id).map(|mux| ResolvedMux::new(mux.clone())))
    }
}

/// Starts the outer bidirectional call that carries a tunnel.
#[async_trait]
pub trait RpcStreamCaller: Send + Sync {
    /// Open the outer call and return its message stream.
    async fn call_rpc_stream(&self) -> Result<MsgStream>;
}

/// Open a tunnel over an already-started outer call (initiator side).
///
/// Sends the init packet naming `component_id`. With `wait_ack`, requires
/// exactly one ack before returning: a non-empty ack error fails the open
/// with the remote's message prefixed by `"remote: "`, and any other packet
/// is a protocol error.
pub async fn open_rpc_stream(
    mut stream: MsgStream,
    component_id: &str,
    wait_ack: bool,
) -> Result<TunnelStream> {
    if let Err(e) = stream.send(&RpcStreamPacket::init(component_id)).await {
        stream.close().await;
        return Err(e);
    }

    if wait_ack {
        let checked = match stream.recv::<RpcStreamPacket>().await {
            Ok(pkt) => match pkt.body {
                Some(Body::Ack(ack)) if ack.error.is_empty() => Ok(()),
                Some(Body::Ack(ack)) => Err(Error::Remote(format!("remote: {}", ack.error))),
                _ => Err(Error::Protocol("expected ack packet".into())),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = checked {
            stream.close().await;
            return Err(e);
        }
    }

    Ok(TunnelStream::new(stream))
}

/// Handle an incoming tunnel (acceptor side; the remote is the initiator).
///
/// Receives exactly one init packet, resolves its component ID, answers with
/// a single ack, and on success runs a full server session against the
/// resolved mux over the tunneled bytes. The resolver's release hook runs
/// when the nested session ends.
pub async fn handle_rpc_stream(mut stream: MsgStream, resolver: &dyn MuxResolver) -> Result<()> {
    let init = stream.recv::<RpcStreamPacket>().await?;
    let component_id = match init.body {
        Some(Body::Init(init)) => init.component_id,
        _ => return Err(Error::Protocol("expected init packet".into())),
    };
    if component_id.is_empty() {
        return Err(Error::Protocol(
            "invalid init packet: empty component id".into(),
        ));
    }
    debug!("tunnel init for component: {}", component_id);

    match resolver.resolve(&component_id).await {
        Ok(Some(ResolvedMux { mux, release })) => {
            let _release = release.map(ReleaseGuard::new);
            stream.send(&RpcStreamPacket::ack(None)).await?;

            let token = stream.context().clone();
            let server = Server::new(mux);
            server.serve_stream(&token, TunnelStream::new(stream)).await
        }
        resolved => {
            let msg = match resolved {
                Err(e) => e.to_string(),
                _ => "no server for that component".to_string(),
            };
            // the ack is best effort and the resolve error always wins; the
            // caller's completion path sends the one terminal frame that
            // carries it to the peer
            let _ = stream.send(&RpcStreamPacket::ack(Some(msg.clone()))).await;
            Err(Error::Protocol(msg))
        }
    }
}

/// Runs the release hook exactly once when dropped.
struct ReleaseGuard(Option<ReleaseFn>);

impl ReleaseGuard {
    fn new(release: ReleaseFn) -> Self {
        Self(Some(release))
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// Opens full RPC sessions through tunnels to one named component.
///
/// Plugs into [`Client`] as its open-stream implementation, so generated
/// stubs work unchanged against a sub-component.
pub struct RpcStreamOpener {
    caller: Box<dyn RpcStreamCaller>,
    component_id: String,
    wait_ack: bool,
}

impl RpcStreamOpener {
    /// Create an opener targeting `component_id` via `caller`.
    pub fn new(
        caller: Box<dyn RpcStreamCaller>,
        component_id: impl Into<String>,
        wait_ack: bool,
    ) -> Self {
        Self {
            caller,
            component_id: component_id.into(),
            wait_ack,
        }
    }
}

#[async_trait]
impl OpenStream for RpcStreamOpener {
    async fn open_stream(&self) -> Result<BoxedByteStream> {
        let stream = self.caller.call_rpc_stream().await?;
        let tunnel = open_rpc_stream(stream, &self.component_id, self.wait_ack).await?;
        Ok(Box::new(tunnel))
    }
}

/// A client whose calls all run through tunnels to `component_id`.
pub fn rpc_stream_client(
    caller: Box<dyn RpcStreamCaller>,
    component_id: impl Into<String>,
    wait_ack: bool,
) -> Client {
    Client::new(Box::new(RpcStreamOpener::new(caller, component_id, wait_ack)))
}

type SendFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Byte-stream view of a tunneled call.
///
/// Writes wrap each chunk in one tunnel data frame, never splitting it.
/// Reads drain incoming data frames, buffering any remainder; empty frames
/// are skipped and an ack carrying an error surfaces as a read error.
/// Shutting down half-closes the outer call and releases it.
pub struct TunnelStream {
    token: CancellationToken,
    writer: Arc<PacketWriter>,
    rx: mpsc::Receiver<std::io::Result<Bytes>>,

    read_buf: Bytes,
    read_done: bool,

    pending_send: Option<SendFuture>,
    write_closed: bool,
    close_cb: Option<CloseCb>,
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream").finish_non_exhaustive()
    }
}

impl TunnelStream {
    /// Wrap an outer call as a byte stream. The tunnel handshake must
    /// already be complete.
    pub fn new(stream: MsgStream) -> Self {
        let (token, writer, mut incoming, close_cb) = stream.into_parts();

        let (tx, rx) = mpsc::channel(8);
        let fwd_token = token.clone();
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    biased;
                    res = incoming.read_one() => match res {
                        Ok(data) => data,
                        Err(Error::EndOfStream) => break,
                        Err(e) => {
                            let _ = tx.send(Err(to_io(e))).await;
                            break;
                        }
                    },
                    _ = fwd_token.cancelled() => break,
                };

                let pkt = match RpcStreamPacket::decode(data) {
                    Ok(pkt) => pkt,
                    Err(e) => {
                        let _ = tx
                            .send(Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                e.to_string(),
                            )))
                            .await;
                        break;
                    }
                };
                match pkt.body {
                    Some(Body::Data(data)) if data.is_empty() => continue,
                    Some(Body::Data(data)) => {
                        if tx.send(Ok(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Body::Ack(ack)) if !ack.error.is_empty() => {
                        let _ = tx
                            .send(Err(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                ack.error,
                            )))
                            .await;
                        break;
                    }
                    // stray empty acks and init packets carry no bytes
                    _ => continue,
                }
            }
        });

        Self {
            token,
            writer,
            rx,
            read_buf: Bytes::new(),
            read_done: false,
            pending_send: None,
            write_closed: false,
            close_cb,
        }
    }

    fn send_frame(&self, data: Bytes) -> SendFuture {
        let writer = self.writer.clone();
        let token = self.token.clone();
        Box::pin(async move {
            if token.is_cancelled() {
                return Err(Error::Canceled);
            }
            let frame = RpcStreamPacket::data(data).encode_to_vec();
            writer.send_call_data(Some(frame.into()), false, None).await
        })
    }
}

fn to_io(err: Error) -> std::io::Error {
    let kind = match &err {
        Error::Canceled => std::io::ErrorKind::Interrupted,
        Error::Transport(_) | Error::Io(_) => std::io::ErrorKind::BrokenPipe,
        _ => std::io::ErrorKind::Other,
    };
    std::io::Error::new(kind, err.to_string())
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.read_done {
            return Poll::Ready(Ok(()));
        }

        // drain buffered bytes first; partial reads are fine
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf.split_to(n));
            return Poll::Ready(Ok(()));
        }

        match Pin::new(&mut self.rx).poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                self.read_done = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => {
                self.read_done = true;
                Poll::Ready(Err(e))
            }
            Poll::Ready(Some(Ok(data))) => {
                self.read_buf = data;
                self.poll_read(cx, buf)
            }
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel write side closed",
            )));
        }

        // finish the previous frame first
        if let Some(fut) = self.pending_send.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => self.pending_send = None,
                Poll::Ready(Err(e)) => {
                    self.pending_send = None;
                    return Poll::Ready(Err(to_io(e)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // one frame per chunk, never split
        let len = data.len();
        let mut fut = self.send_frame(Bytes::copy_from_slice(data));
        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(to_io(e))),
            // the frame owns its copy of the chunk, so it counts as accepted;
            // flush drives it to completion
            Poll::Pending => self.pending_send = Some(fut),
        }
        Poll::Ready(Ok(len))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.pending_send.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => {
                    self.pending_send = None;
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Err(e)) => {
                    self.pending_send = None;
                    Poll::Ready(Err(to_io(e)))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.write_closed {
            return Poll::Ready(Ok(()));
        }
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        self.write_closed = true;
        let writer = self.writer.clone();
        let close_cb = self.close_cb.take();
        tokio::spawn(async move {
            let _ = writer.send_call_data(None, true, None).await;
            if let Some(cb) = close_cb {
                cb();
            }
        });
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        // best-effort half-close if the write side was never shut down, so
        // the peer is not left waiting
        if self.write_closed && self.close_cb.is_none() {
            return;
        }
        let writer = self.writer.clone();
        let close_cb = self.close_cb.take();
        let write_closed = self.write_closed;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if !write_closed {
                        let _ = writer.send_call_data(None, true, None).await;
                    }
                    if let Some(cb) = close_cb {
                        cb();
                    }
                });
            }
            Err(_) => warn!("tunnel stream dropped outside a runtime; skipping close"),
        }
    }
}
