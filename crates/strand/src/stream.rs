//! Per-call message stream handed to user code

use std::sync::Arc;

use bytes::Bytes;
use strand_proto::ProtocolError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::PacketWriter;
use crate::{Error, Result};

/// Callback invoked at most once when a stream is closed.
pub(crate) type CloseCb = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Why the receive queue was closed. Recorded once; later closes keep the
/// first cause.
#[derive(Debug, Clone)]
pub(crate) enum CloseReason {
    /// Terminal error string reported by the remote.
    Remote(String),
    /// The call context was cancelled before a terminal packet arrived.
    Canceled,
    /// The transport failed before a terminal packet arrived.
    Transport(String),
}

impl CloseReason {
    fn into_error(self) -> Error {
        match self {
            CloseReason::Remote(msg) => Error::Remote(msg),
            CloseReason::Canceled => Error::Canceled,
            CloseReason::Transport(msg) => Error::Transport(msg),
        }
    }
}

/// Producer half of the bounded per-call receive queue.
pub(crate) struct RecvQueueSender {
    tx: Option<mpsc::Sender<Bytes>>,
    reason: Arc<Mutex<Option<CloseReason>>>,
}

impl RecvQueueSender {
    /// Push one payload; blocks while the queue is full (backpressure
    /// against the remote) and aborts when `token` is cancelled.
    pub(crate) async fn push(&self, data: Bytes, token: &CancellationToken) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(Error::Completed);
        };
        tokio::select! {
            _ = token.cancelled() => Err(Error::Canceled),
            res = tx.send(data) => res.map_err(|_| Error::Canceled),
        }
    }

    /// Push one payload without blocking. Only valid when the queue is known
    /// to have room, e.g. for the inline first payload on a fresh queue.
    pub(crate) fn try_push(&self, data: Bytes) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(Error::Completed);
        };
        tx.try_send(data)
            .map_err(|_| Error::Protocol("receive queue was full, expected empty".into()))
    }

    /// True once the queue has been closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Close the queue. Already-queued payloads still drain in order; after
    /// that every read reports `reason`. The first recorded reason wins.
    pub(crate) async fn close(&mut self, reason: Option<CloseReason>) {
        if let Some(reason) = reason {
            let mut slot = self.reason.lock().await;
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.tx = None;
    }
}

/// Consumer half of the bounded per-call receive queue.
pub(crate) struct RecvQueue {
    rx: mpsc::Receiver<Bytes>,
    reason: Arc<Mutex<Option<CloseReason>>>,
}

impl RecvQueue {
    /// Create a connected sender/receiver pair with the given capacity.
    pub(crate) fn channel(capacity: usize) -> (RecvQueueSender, RecvQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let reason = Arc::new(Mutex::new(None));
        (
            RecvQueueSender {
                tx: Some(tx),
                reason: reason.clone(),
            },
            RecvQueue { rx, reason },
        )
    }

    /// Read one payload, or the close outcome once the queue is drained.
    pub(crate) async fn read_one(&mut self) -> Result<Bytes> {
        match self.rx.recv().await {
            Some(data) => Ok(data),
            None => match self.reason.lock().await.clone() {
                Some(reason) => Err(reason.into_error()),
                None => Err(Error::EndOfStream),
            },
        }
    }
}

/// The per-call object handed to user code on both endpoints.
///
/// Supports sending and receiving protobuf messages, half-closing the send
/// side, and closing the call. The stream's [`context`](MsgStream::context)
/// is cancelled when the call is no longer valid.
pub struct MsgStream {
    token: CancellationToken,
    writer: Arc<PacketWriter>,
    incoming: RecvQueue,
    sent_close: bool,
    close_cb: Option<CloseCb>,
}

impl MsgStream {
    pub(crate) fn new(
        token: CancellationToken,
        writer: Arc<PacketWriter>,
        incoming: RecvQueue,
        close_cb: Option<CloseCb>,
    ) -> Self {
        Self {
            token,
            writer,
            incoming,
            sent_close: false,
            close_cb,
        }
    }

    /// Tear the stream apart for wrapping layers (the tunnel byte adapter).
    pub(crate) fn into_parts(
        self,
    ) -> (
        CancellationToken,
        Arc<PacketWriter>,
        RecvQueue,
        Option<CloseCb>,
    ) {
        (self.token, self.writer, self.incoming, self.close_cb)
    }

    /// Cancellation scope for the call; cancelled when the call terminates.
    pub fn context(&self) -> &CancellationToken {
        &self.token
    }

    /// Send one message to the remote.
    ///
    /// Fails fast when the call context is already cancelled or the send
    /// side was half-closed.
    pub async fn send<M: prost::Message>(&self, msg: &M) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Canceled);
        }
        if self.sent_close {
            return Err(Error::Completed);
        }
        let data = msg.encode_to_vec();
        self.writer
            .send_call_data(Some(data.into()), false, None)
            .await
    }

    /// Receive one message from the remote.
    ///
    /// Returns [`Error::EndOfStream`] once the remote has completed and all
    /// buffered payloads are drained, the remote-reported error if one was
    /// sent, or [`Error::Canceled`] when the call context is cancelled.
    /// A zero-length payload decodes into a default message; it is a
    /// legitimate value, not end-of-stream.
    pub async fn recv<M: prost::Message + Default>(&mut self) -> Result<M> {
        let data = tokio::select! {
            // drain buffered payloads before honoring cancellation
            biased;
            res = self.incoming.read_one() => res?,
            _ = self.token.cancelled() => return Err(Error::Canceled),
        };
        M::decode(data).map_err(|e| Error::Wire(ProtocolError::Decode(e)))
    }

    /// Signal that this side will send no further messages. Idempotent.
    pub async fn close_send(&mut self) -> Result<()> {
        if self.sent_close {
            return Ok(());
        }
        self.sent_close = true;
        debug!("half-closing send side");
        self.writer.send_call_data(None, true, None).await
    }

    /// Close the stream: best-effort half-close, then release the call.
    /// Idempotent; the release callback fires at most once.
    pub async fn close(&mut self) {
        let _ = self.close_send().await;
        if let Some(cb) = self.close_cb.take() {
            cb();
        }
    }
}
