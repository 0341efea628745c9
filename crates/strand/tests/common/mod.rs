//! Shared fixtures for end-to-end tests: test messages, a test service, and
//! a pipe-connected client/server pair.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use strand::{pipe_client, Client, Error, Handler, MsgStream, Mux, Result, Server};
use tokio::sync::{oneshot, Mutex};

/// Simple string payload used by the echo and ping-pong methods.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoMsg {
    /// Message body.
    #[prost(string, tag = "1")]
    pub body: String,
}

/// One operand of the streaming sum.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NumMsg {
    #[prost(uint64, tag = "1")]
    pub n: u64,
}

/// Result of the streaming sum.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SumMsg {
    #[prost(uint64, tag = "1")]
    pub sum: u64,
}

/// Request for a finite server-side stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CounterReq {
    #[prost(uint32, tag = "1")]
    pub count: u32,
}

/// One element of a server-side stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CounterTick {
    #[prost(uint32, tag = "1")]
    pub i: u32,
}

pub const TEST_SERVICE: &str = "strand.test.Echo";

/// Exercises every call shape. `Watch` streams ticks until cancelled and
/// reports through `watch_report` whether its post-cancellation send failed.
#[derive(Default)]
pub struct TestService {
    pub watch_report: Mutex<Option<oneshot::Sender<bool>>>,
}

#[async_trait]
impl Handler for TestService {
    fn service_id(&self) -> &str {
        TEST_SERVICE
    }

    fn method_ids(&self) -> &[&str] {
        &["Echo", "Sum", "Tick", "PingPong", "Watch"]
    }

    async fn invoke_method(
        &self,
        _service_id: &str,
        method_id: &str,
        mut stream: MsgStream,
    ) -> Result<bool> {
        match method_id {
            "Echo" => {
                let msg: EchoMsg = stream.recv().await?;
                stream.send(&msg).await?;
                Ok(true)
            }
            "Sum" => {
                let mut sum = 0u64;
                loop {
                    match stream.recv::<NumMsg>().await {
                        Ok(msg) => sum += msg.n,
                        Err(Error::EndOfStream) => break,
                        Err(e) => return Err(e),
                    }
                }
                stream.send(&SumMsg { sum }).await?;
                Ok(true)
            }
            "Tick" => {
                let req: CounterReq = stream.recv().await?;
                for i in 0..req.count {
                    stream.send(&CounterTick { i }).await?;
                }
                Ok(true)
            }
            "PingPong" => {
                loop {
                    match stream.recv::<EchoMsg>().await {
                        Ok(msg) => stream.send(&msg).await?,
                        Err(Error::EndOfStream) => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(true)
            }
            "Watch" => {
                let mut i = 0u32;
                loop {
                    tokio::select! {
                        _ = stream.context().cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {
                            if stream.send(&CounterTick { i }).await.is_err() {
                                break;
                            }
                            i += 1;
                        }
                    }
                }
                // after cancellation the next send must fail fast
                let send_failed = stream.send(&CounterTick { i }).await.is_err();
                if let Some(report) = self.watch_report.lock().await.take() {
                    let _ = report.send(send_failed);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Install a test subscriber once so `RUST_LOG` works under `cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A pipe-connected client against a server hosting one [`TestService`].
pub async fn echo_fixture() -> (Client, Arc<TestService>) {
    init_tracing();
    let service = Arc::new(TestService::default());
    let mux = Arc::new(Mux::new());
    mux.register(service.clone()).await.unwrap();
    let server = Arc::new(Server::new(mux));
    (pipe_client(server), service)
}
