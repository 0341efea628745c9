//! Server call state machine and facade

use std::sync::Arc;

use async_trait::async_trait;
use strand_proto::packet::packet::Body;
use strand_proto::{CallData, CallStart, Packet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RpcConfig;
use crate::mux::Mux;
use crate::stream::{CloseReason, MsgStream, RecvQueue, RecvQueueSender};
use crate::transport::{packet_pair, PacketHandler, PacketWriter};
use crate::{Error, Result};

/// Server side of one on-going RPC call.
///
/// Driven by the read pump: the first packet must be `CallStart`, which
/// records the target method and spawns the invocation task. The invocation
/// task emits the single terminal packet when the handler returns.
struct ServerRpc {
    token: CancellationToken,
    writer: Arc<PacketWriter>,
    mux: Arc<Mux>,
    inner: Mutex<ServerRpcInner>,
}

struct ServerRpcInner {
    started: bool,
    incoming_tx: RecvQueueSender,
    incoming_rx: Option<RecvQueue>,
}

impl ServerRpc {
    fn new(
        token: CancellationToken,
        writer: Arc<PacketWriter>,
        mux: Arc<Mux>,
        config: &RpcConfig,
    ) -> Self {
        let (incoming_tx, incoming_rx) = RecvQueue::channel(config.recv_buffer);
        Self {
            token,
            writer,
            mux,
            inner: Mutex::new(ServerRpcInner {
                started: false,
                incoming_tx,
                incoming_rx: Some(incoming_rx),
            }),
        }
    }

    async fn handle_call_start(&self, pkt: CallStart) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.started {
            return Err(Error::Protocol("call start must be sent only once".into()));
        }
        if inner.incoming_tx.is_closed() {
            return Err(Error::Completed);
        }
        inner.started = true;

        // queue the inline first request, if included; the queue is fresh so
        // this cannot block
        if !pkt.data.is_empty() || pkt.data_is_zero {
            inner.incoming_tx.try_push(pkt.data)?;
        }

        let incoming = inner
            .incoming_rx
            .take()
            .ok_or_else(|| Error::Protocol("call already invoked".into()))?;
        drop(inner);

        self.spawn_invoke(pkt.rpc_service, pkt.rpc_method, incoming);
        Ok(())
    }

    /// Run the handler in its own task; when it returns, emit the terminal
    /// packet, cancel the call context, and release the transport.
    fn spawn_invoke(&self, service: String, method: String, incoming: RecvQueue) {
        let mux = self.mux.clone();
        let writer = self.writer.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            debug!("invoking handler: service={} method={}", service, method);
            let stream = MsgStream::new(token.clone(), writer.clone(), incoming, None);
            let result = mux.invoke_method(&service, &method, stream).await;
            let error = match result {
                Ok(true) => None,
                Ok(false) => Some(Error::Unimplemented.to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(e) = &error {
                debug!("call finished with error: {}", e);
            }
            let _ = writer.send_call_data(None, true, error).await;
            token.cancel();
            let _ = writer.close().await;
        });
    }

    async fn handle_call_data(&self, pkt: CallData) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.started {
            return Err(Error::Protocol("call data before call start".into()));
        }
        if inner.incoming_tx.is_closed() {
            return Err(Error::Completed);
        }

        if !pkt.data.is_empty() || pkt.data_is_zero {
            inner.incoming_tx.push(pkt.data, &self.token).await?;
        }

        let mut complete = pkt.complete;
        if !pkt.error.is_empty() {
            complete = true;
            inner
                .incoming_tx
                .close(Some(CloseReason::Remote(pkt.error)))
                .await;
        } else if complete {
            inner.incoming_tx.close(None).await;
        }
        Ok(())
    }
}

#[async_trait]
impl PacketHandler for ServerRpc {
    async fn handle_packet(&self, pkt: Packet) -> Result<()> {
        pkt.validate()?;
        let Some(body) = pkt.body else {
            // unknown packet variant from a newer peer: no-op
            return Ok(());
        };
        match body {
            Body::CallStart(start) => self.handle_call_start(start).await,
            Body::CallData(data) => self.handle_call_data(data).await,
            Body::CallCancel(flag) => {
                if flag {
                    debug!("client cancelled the call");
                    self.token.cancel();
                }
                Ok(())
            }
            Body::CallStartResp(_) => {
                Err(Error::Protocol("unexpected call start response packet".into()))
            }
        }
    }

    async fn handle_close(&self, err: Option<Error>) {
        let mut inner = self.inner.lock().await;
        let started = inner.started;
        let reason = match err {
            Some(Error::Canceled) => Some(CloseReason::Canceled),
            Some(ref e) => Some(CloseReason::Transport(e.to_string())),
            None => None,
        };
        inner.incoming_tx.close(reason).await;
        drop(inner);

        if !started {
            // no invocation task will run; answer protocol errors and
            // release the stream ourselves
            if let Some(Error::Protocol(msg)) = &err {
                let _ = self
                    .writer
                    .send_call_data(None, true, Some(msg.clone()))
                    .await;
            }
            self.token.cancel();
            let _ = self.writer.close().await;
        } else {
            // the invocation task owns the terminal packet and the writer
            self.token.cancel();
        }
    }
}

/// Thin front-end turning accepted byte streams into server calls.
pub struct Server {
    mux: Arc<Mux>,
    config: RpcConfig,
}

impl Server {
    /// Create a server dispatching to `mux`.
    pub fn new(mux: Arc<Mux>) -> Self {
        Self::with_config(mux, RpcConfig::default())
    }

    /// Create a server with custom runtime tunables.
    pub fn with_config(mux: Arc<Mux>, config: RpcConfig) -> Self {
        Self { mux, config }
    }

    /// The mux this server dispatches to.
    pub fn mux(&self) -> &Arc<Mux> {
        &self.mux
    }

    /// Serve exactly one call on an accepted byte stream.
    ///
    /// Returns once the call terminates: handler completion, protocol error,
    /// client cancellation, transport loss, or cancellation of `ctx`. The
    /// stream is released before returning.
    pub async fn serve_stream<S>(&self, ctx: &CancellationToken, conn: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let token = ctx.child_token();
        let (reader, writer) = packet_pair(Box::new(conn), self.config.max_packet_size);
        let rpc = Arc::new(ServerRpc::new(
            token.clone(),
            writer.clone(),
            self.mux.clone(),
            &self.config,
        ));

        let pump = tokio::spawn(reader.run_pump(rpc, token.clone()));

        // every terminal path cancels the call token
        token.cancelled().await;
        let _ = writer.close().await;
        if let Err(e) = pump.await {
            warn!("read pump task failed: {}", e);
        }
        Ok(())
    }
}
