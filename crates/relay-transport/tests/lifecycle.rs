//! End-to-end lifecycle coverage through the selector: create, send, status,
//! close, and the failure broadcast when a backend dies mid-request.

use pretty_assertions::assert_eq;
use serde_json::json;

use relay_transport::{
    ConnectionConfig, ConnectionState, TransportError, TransportSelector,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn process_config(script: &str) -> ConnectionConfig {
    serde_json::from_value(json!({
        "serverId": "backend-under-test",
        "command": "sh",
        "args": ["-c", script],
    }))
    .unwrap()
}

#[tokio::test]
async fn full_lifecycle_over_a_process_backend() {
    init_tracing();
    let selector = TransportSelector::default();
    selector.initialize().unwrap();

    let id = selector
        .create_connection(process_config(
            r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"capabilities":{"ping":true}}}'; sleep 5"#,
        ))
        .await
        .unwrap();

    let status = selector.get_status(&id).await;
    assert_eq!(status.status, ConnectionState::Connected);
    assert_eq!(status.metrics["total_connections"], json!(1));
    assert_eq!(status.metrics["active_connections"], json!(1));

    // The response must come back exactly as the backend produced it.
    let response = selector
        .send_message(&id, json!({"jsonrpc": "2.0", "method": "describe", "id": 1}))
        .await
        .unwrap();
    assert_eq!(
        response,
        json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {"ping": true}}})
    );

    selector.close_connection(&id).await.unwrap();

    let status = selector.get_status(&id).await;
    assert_eq!(status.status, ConnectionState::Unknown);
    assert_eq!(status.uptime_seconds, 0);
    assert_eq!(status.metrics, json!({}));

    // Closing again stays a no-op.
    selector.close_connection(&id).await.unwrap();
}

#[tokio::test]
async fn backend_death_rejects_the_pending_request() {
    init_tracing();
    let selector = TransportSelector::default();
    selector.initialize().unwrap();

    // Reads the request, then exits without answering.
    let id = selector
        .create_connection(process_config("read line"))
        .await
        .unwrap();

    let err = selector
        .send_message(&id, json!({"jsonrpc": "2.0", "method": "ping", "id": 1}))
        .await
        .unwrap_err();
    match err {
        TransportError::BackendTerminated(obj) => {
            assert_eq!(obj.code, -32603);
            assert_eq!(obj.message, "Process terminated");
        }
        other => panic!("expected BackendTerminated, got {other:?}"),
    }

    selector.close_connection(&id).await.unwrap();
}
