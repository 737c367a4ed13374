//! RpcClient against a real HTTP listener speaking the node's JSON-RPC dialect.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bitcoind_exporter::rpc::{Credentials, EndpointSource, RpcEndpoint};
use bitcoind_exporter::{RpcClient, RpcError, RpcTransport};
use chainwatch_resilience::Classify;
use serde_json::{json, Value};

// base64("alice:s3cret")
const AUTH: &str = "Basic YWxpY2U6czNjcmV0";

async fn node(headers: HeaderMap, Json(req): Json<Value>) -> Response {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(AUTH) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let id = req["id"].clone();
    match req["method"].as_str() {
        Some("uptime") => Json(json!({ "result": 42, "error": null, "id": id })).into_response(),
        Some("getblockchaininfo") => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "result": null, "error": { "code": -28, "message": "Loading block index..." }, "id": id })),
        )
            .into_response(),
        Some("getblock") => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "result": null, "error": { "code": -5, "message": "Block not found" }, "id": id })),
        )
            .into_response(),
        _ => (StatusCode::OK, "<html>proxy error page</html>").into_response(),
    }
}

async fn spawn_node() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, Router::new().route("/", post(node))).await;
    });
    addr
}

fn client(addr: SocketAddr, password: &str) -> RpcClient {
    let endpoint = RpcEndpoint::new(
        "http",
        "127.0.0.1",
        addr.port(),
        Some(Credentials { user: "alice".into(), password: password.into() }),
    )
    .unwrap();
    RpcClient::new(EndpointSource::Direct(endpoint), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn decodes_results_and_error_codes() {
    let addr = spawn_node().await;
    let c = client(addr, "s3cret");

    assert_eq!(c.call("uptime", &[]).await.unwrap(), json!(42));

    let warm = c.call("getblockchaininfo", &[]).await.unwrap_err();
    assert!(matches!(warm, RpcError::NotReady { .. }));
    assert!(warm.is_retryable());

    let missing = c.call("getblock", &[json!("00"), json!(2)]).await.unwrap_err();
    assert_eq!(missing, RpcError::Rpc { code: -5, message: "Block not found".into() });

    let html = c.call("getnettotals", &[]).await.unwrap_err();
    assert_eq!(html.kind(), "protocol");
    assert!(html.is_fatal());
}

#[tokio::test]
async fn rejected_credentials_are_fatal() {
    let addr = spawn_node().await;
    let err = client(addr, "wrong").call("uptime", &[]).await.unwrap_err();
    assert!(matches!(err, RpcError::Protocol(_)), "{err}");
    assert!(err.is_fatal());
    assert!(!err.is_retryable());
}
