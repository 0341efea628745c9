//! End-to-end tests for the nested stream tunnel.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use strand::proto::packet::rpc_stream_packet::Body;
use strand::proto::RpcStreamPacket;
use strand::{
    handle_rpc_stream, open_rpc_stream, pipe_client, rpc_stream_client, Client, Error, Handler,
    MsgStream, Mux, MuxResolver, ResolvedMux, Result, RpcStreamCaller, Server,
};
use tokio_util::sync::CancellationToken;

const HOST_SERVICE: &str = "strand.test.Host";

/// Host service exposing sub-components through one bidi tunnel method.
struct TunnelHost {
    components: HashMap<String, Arc<Mux>>,
}

#[async_trait]
impl Handler for TunnelHost {
    fn service_id(&self) -> &str {
        HOST_SERVICE
    }

    fn method_ids(&self) -> &[&str] {
        &["OpenStream"]
    }

    async fn invoke_method(
        &self,
        _service_id: &str,
        method_id: &str,
        stream: MsgStream,
    ) -> Result<bool> {
        match method_id {
            "OpenStream" => {
                handle_rpc_stream(stream, &self.components).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Opens the outer tunnel-carrying call against the host.
struct HostCaller {
    client: Arc<Client>,
    ctx: CancellationToken,
}

#[async_trait]
impl RpcStreamCaller for HostCaller {
    async fn call_rpc_stream(&self) -> Result<MsgStream> {
        self.client
            .new_stream(&self.ctx, HOST_SERVICE, "OpenStream", None)
            .await
    }
}

/// A host serving an `"echo"` sub-component, plus a client connected to it.
async fn tunnel_fixture() -> (Arc<Client>, CancellationToken) {
    init_tracing();
    let sub_mux = Arc::new(Mux::new());
    sub_mux
        .register(Arc::new(TestService::default()))
        .await
        .unwrap();

    let mut components = HashMap::new();
    components.insert("echo".to_string(), sub_mux);

    let host_mux = Arc::new(Mux::new());
    host_mux
        .register(Arc::new(TunnelHost { components }))
        .await
        .unwrap();

    let server = Arc::new(Server::new(host_mux));
    (Arc::new(pipe_client(server)), CancellationToken::new())
}

fn host_caller(client: Arc<Client>, ctx: CancellationToken) -> Box<dyn RpcStreamCaller> {
    Box::new(HostCaller { client, ctx })
}

#[tokio::test]
async fn test_unary_echo_through_tunnel() {
    let (host, ctx) = tunnel_fixture().await;
    let tunnel_client = rpc_stream_client(host_caller(host, ctx.clone()), "echo", true);

    let resp: EchoMsg = tunnel_client
        .invoke(&ctx, TEST_SERVICE, "Echo", &EchoMsg { body: "x".into() })
        .await
        .unwrap();
    assert_eq!(resp.body, "x");
}

#[tokio::test]
async fn test_absent_component_fails_the_ack() {
    let (host, ctx) = tunnel_fixture().await;
    let caller = HostCaller {
        client: host,
        ctx: ctx.clone(),
    };

    let outer = caller.call_rpc_stream().await.unwrap();
    let err = open_rpc_stream(outer, "absent", true).await.unwrap_err();
    assert_eq!(err.to_string(), "remote: no server for that component");
}

#[tokio::test]
async fn test_absent_component_error_reaches_outer_terminal() {
    let (host, ctx) = tunnel_fixture().await;

    // drive the outer call by hand instead of going through the handshake
    // helper, so the outer terminal frame itself is observable
    let mut stream = host
        .new_stream(&ctx, HOST_SERVICE, "OpenStream", None)
        .await
        .unwrap();
    stream
        .send(&RpcStreamPacket::init("absent"))
        .await
        .unwrap();

    let ack: RpcStreamPacket = stream.recv().await.unwrap();
    match ack.body {
        Some(Body::Ack(ack)) => assert_eq!(ack.error, "no server for that component"),
        other => panic!("unexpected tunnel packet: {:?}", other),
    }

    // exactly one terminal follows the ack, and it carries the resolve
    // error rather than a clean completion
    let err = stream.recv::<RpcStreamPacket>().await.unwrap_err();
    match err {
        Error::Remote(msg) => assert!(msg.contains("no server for that component")),
        other => panic!("unexpected error: {:?}", other),
    }
    stream.close().await;
}

#[tokio::test]
async fn test_tunnel_without_ack_wait() {
    let (host, ctx) = tunnel_fixture().await;
    let tunnel_client = rpc_stream_client(host_caller(host, ctx.clone()), "echo", false);

    let resp: EchoMsg = tunnel_client
        .invoke(&ctx, TEST_SERVICE, "Echo", &EchoMsg { body: "no-ack".into() })
        .await
        .unwrap();
    assert_eq!(resp.body, "no-ack");
}

#[tokio::test]
async fn test_streaming_through_tunnel() -> anyhow::Result<()> {
    let (host, ctx) = tunnel_fixture().await;
    let tunnel_client = rpc_stream_client(host_caller(host, ctx.clone()), "echo", true);

    let mut stream = tunnel_client
        .new_stream(&ctx, TEST_SERVICE, "Sum", None)
        .await?;
    for n in 1..=10u64 {
        stream.send(&NumMsg { n }).await?;
    }
    stream.close_send().await?;

    let resp: SumMsg = stream.recv().await?;
    assert_eq!(resp.sum, 55);
    stream.close().await;
    Ok(())
}

#[tokio::test]
async fn test_large_payload_through_tunnel() {
    let (host, ctx) = tunnel_fixture().await;
    let tunnel_client = rpc_stream_client(host_caller(host, ctx.clone()), "echo", true);

    // larger than the pipe buffer, so the nested frames cross many outer
    // chunks and the inner length prefix does the reassembly
    let body: String = "abcdefgh".repeat(16 * 1024);
    let resp: EchoMsg = tunnel_client
        .invoke(&ctx, TEST_SERVICE, "Echo", &EchoMsg { body: body.clone() })
        .await
        .unwrap();
    assert_eq!(resp.body, body);
}

#[tokio::test]
async fn test_repeated_tunnel_calls() {
    let (host, ctx) = tunnel_fixture().await;
    let tunnel_client = rpc_stream_client(host_caller(host, ctx.clone()), "echo", true);

    // each call opens its own outer call and nested session
    for i in 0..3 {
        let body = format!("round-{}", i);
        let resp: EchoMsg = tunnel_client
            .invoke(&ctx, TEST_SERVICE, "Echo", &EchoMsg { body: body.clone() })
            .await
            .unwrap();
        assert_eq!(resp.body, body);
    }
}

/// Resolver that flags when its release hook has run.
struct ReleasingResolver {
    mux: Arc<Mux>,
    released: Arc<AtomicBool>,
}

#[async_trait]
impl MuxResolver for ReleasingResolver {
    async fn resolve(&self, component_id: &str) -> Result<Option<ResolvedMux>> {
        if component_id != "echo" {
            return Ok(None);
        }
        let released = self.released.clone();
        Ok(Some(ResolvedMux::new(self.mux.clone()).with_release(
            Box::new(move || {
                released.store(true, Ordering::SeqCst);
            }),
        )))
    }
}

struct ReleasingHost {
    resolver: ReleasingResolver,
}

#[async_trait]
impl Handler for ReleasingHost {
    fn service_id(&self) -> &str {
        HOST_SERVICE
    }

    fn method_ids(&self) -> &[&str] {
        &["OpenStream"]
    }

    async fn invoke_method(
        &self,
        _service_id: &str,
        method_id: &str,
        stream: MsgStream,
    ) -> Result<bool> {
        match method_id {
            "OpenStream" => {
                handle_rpc_stream(stream, &self.resolver).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[tokio::test]
async fn test_release_hook_runs_when_session_ends() {
    let sub_mux = Arc::new(Mux::new());
    sub_mux
        .register(Arc::new(TestService::default()))
        .await
        .unwrap();
    let released = Arc::new(AtomicBool::new(false));

    let host_mux = Arc::new(Mux::new());
    host_mux
        .register(Arc::new(ReleasingHost {
            resolver: ReleasingResolver {
                mux: sub_mux,
                released: released.clone(),
            },
        }))
        .await
        .unwrap();

    let host = Arc::new(pipe_client(Arc::new(Server::new(host_mux))));
    let ctx = CancellationToken::new();
    let tunnel_client = rpc_stream_client(host_caller(host, ctx.clone()), "echo", true);

    let resp: EchoMsg = tunnel_client
        .invoke(&ctx, TEST_SERVICE, "Echo", &EchoMsg { body: "bye".into() })
        .await
        .unwrap();
    assert_eq!(resp.body, "bye");

    // the nested session winds down shortly after the call completes
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !released.load(Ordering::SeqCst) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "release hook never ran"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_tunnel_rejects_unexpected_first_packet() {
    // a host whose handler expects an init packet receives plain data
    let (host, ctx) = tunnel_fixture().await;

    let stream = host
        .new_stream(&ctx, HOST_SERVICE, "OpenStream", None)
        .await
        .unwrap();
    // skip the handshake and speak garbage: the acceptor reports a terminal
    // error on the outer call
    stream
        .send(&EchoMsg { body: "not-an-init".into() })
        .await
        .unwrap();

    let mut stream = stream;
    let err = stream.recv::<EchoMsg>().await.unwrap_err();
    assert!(matches!(err, Error::Remote(_)));
    stream.close().await;
}
