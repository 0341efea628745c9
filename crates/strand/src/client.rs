//! Client call state machine and facade

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use strand_proto::packet::packet::Body;
use strand_proto::{CallData, Packet};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RpcConfig;
use crate::stream::{CloseCb, CloseReason, MsgStream, RecvQueue, RecvQueueSender};
use crate::transport::{packet_pair, OpenStream, PacketHandler, PacketWriter};
use crate::{Error, Result};

/// Client side of one on-going RPC call.
///
/// Owns the call's packet writer and receive queue; the read pump feeds it
/// via [`PacketHandler`]. Termination is funneled through `finalize`, which
/// runs at most once per call.
struct ClientRpc {
    token: CancellationToken,
    writer: Arc<PacketWriter>,
    inner: Mutex<ClientRpcInner>,
    remote_closed: AtomicBool,
    finalized: AtomicBool,
}

struct ClientRpcInner {
    incoming_tx: RecvQueueSender,
}

impl ClientRpc {
    /// Open a call: ship the start packet and hand back the user stream.
    async fn start(
        ctx: &CancellationToken,
        conn: crate::transport::BoxedByteStream,
        config: &RpcConfig,
        service: &str,
        method: &str,
        first: Option<Bytes>,
    ) -> Result<MsgStream> {
        let token = ctx.child_token();
        let (reader, writer) = packet_pair(conn, config.max_packet_size);
        let (incoming_tx, incoming_rx) = RecvQueue::channel(config.recv_buffer);

        let rpc = Arc::new(ClientRpc {
            token: token.clone(),
            writer: writer.clone(),
            inner: Mutex::new(ClientRpcInner { incoming_tx }),
            remote_closed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        });

        tokio::spawn(reader.run_pump(rpc.clone(), token.clone()));

        // cancelling the call context releases the transport even when the
        // user never closes the stream explicitly
        let watcher = rpc.clone();
        tokio::spawn(async move {
            watcher.token.cancelled().await;
            watcher.finalize().await;
        });

        debug!("starting call: service={} method={}", service, method);
        if let Err(e) = writer
            .send_packet(&Packet::call_start(service, method, first))
            .await
        {
            rpc.finalize().await;
            return Err(e);
        }

        let close_rpc = rpc.clone();
        let close_cb: CloseCb = Box::new(move || {
            tokio::spawn(async move {
                close_rpc.finalize().await;
            });
        });
        Ok(MsgStream::new(token, writer, incoming_rx, Some(close_cb)))
    }

    /// Terminate the call: best-effort cancel packet, cancel the context,
    /// release the transport, and close the receive queue. Idempotent.
    async fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let remote_closed = self.remote_closed.load(Ordering::SeqCst);
        self.token.cancel();
        if !remote_closed {
            let _ = self.writer.send_packet(&Packet::call_cancel()).await;
        }
        let _ = self.writer.close().await;

        let reason = if remote_closed {
            None
        } else {
            Some(CloseReason::Canceled)
        };
        self.inner.lock().await.incoming_tx.close(reason).await;
    }

    async fn handle_call_data(&self, pkt: CallData) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.incoming_tx.is_closed() {
            return Err(Error::Completed);
        }

        if !pkt.data.is_empty() || pkt.data_is_zero {
            inner.incoming_tx.push(pkt.data, &self.token).await?;
        }

        let mut complete = pkt.complete;
        if !pkt.error.is_empty() {
            complete = true;
            debug!("remote reported error: {}", pkt.error);
            inner
                .incoming_tx
                .close(Some(CloseReason::Remote(pkt.error)))
                .await;
        } else if complete {
            inner.incoming_tx.close(None).await;
        }

        if complete {
            self.remote_closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl PacketHandler for ClientRpc {
    async fn handle_packet(&self, pkt: Packet) -> Result<()> {
        pkt.validate()?;
        let Some(body) = pkt.body else {
            // unknown packet variant from a newer peer: no-op
            return Ok(());
        };
        match body {
            Body::CallData(data) => self.handle_call_data(data).await,
            Body::CallCancel(flag) => {
                if flag {
                    debug!("remote cancelled the call");
                    self.token.cancel();
                }
                Ok(())
            }
            // reserved; ignored for forward compatibility
            Body::CallStartResp(_) => Ok(()),
            Body::CallStart(_) => Err(Error::Protocol("unexpected call start packet".into())),
        }
    }

    async fn handle_close(&self, err: Option<Error>) {
        let reason = match err {
            Some(Error::Canceled) => Some(CloseReason::Canceled),
            Some(e) => Some(CloseReason::Transport(e.to_string())),
            None if self.remote_closed.load(Ordering::SeqCst) => None,
            None => Some(CloseReason::Transport(
                "transport closed before call completed".into(),
            )),
        };
        self.inner.lock().await.incoming_tx.close(reason).await;
        self.token.cancel();
    }
}

/// Thin front-end gluing a transport's open-stream callback to new calls.
pub struct Client {
    opener: Box<dyn OpenStream>,
    config: RpcConfig,
}

impl Client {
    /// Create a client over an open-stream implementation.
    pub fn new(opener: Box<dyn OpenStream>) -> Self {
        Self::with_config(opener, RpcConfig::default())
    }

    /// Create a client with custom runtime tunables.
    pub fn with_config(opener: Box<dyn OpenStream>, config: RpcConfig) -> Self {
        Self { opener, config }
    }

    /// Open a call and return its message stream.
    ///
    /// `first` is the optional first request body for call shapes that carry
    /// one in the start packet; `Some` of length zero is a present empty
    /// request, `None` means the client streams its requests.
    pub async fn new_stream(
        &self,
        ctx: &CancellationToken,
        service: &str,
        method: &str,
        first: Option<Bytes>,
    ) -> Result<MsgStream> {
        let conn = self.opener.open_stream().await?;
        ClientRpc::start(ctx, conn, &self.config, service, method, first).await
    }

    /// Unary convenience: send one request, receive one response.
    pub async fn invoke<Req, Resp>(
        &self,
        ctx: &CancellationToken,
        service: &str,
        method: &str,
        req: &Req,
    ) -> Result<Resp>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        let mut stream = self
            .new_stream(ctx, service, method, Some(req.encode_to_vec().into()))
            .await?;
        // best effort: if the call already terminated, the outcome arrives
        // through recv
        let _ = stream.close_send().await;
        let resp = stream.recv().await;
        stream.close().await;
        resp
    }
}
