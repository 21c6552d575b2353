//! Live channel tests against a served router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use crewtrace_config::EngineConfig;
use crewtrace_monitor::StepStore;
use crewtrace_server::{router, ServerState};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);

async fn serve() -> Result<(Arc<ServerState>, String), String> {
    let store = Arc::new(StepStore::in_memory().map_err(|err| format!("open store: {err}"))?);
    let state = Arc::new(ServerState::new(EngineConfig::default(), store).map_err(|err| format!("state: {err}"))?);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|err| format!("bind: {err}"))?;
    let addr = listener.local_addr().map_err(|err| format!("local addr: {err}"))?;
    let app = router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((state, format!("ws://{addr}/ws")))
}

async fn subscribers_reach(state: &ServerState, expected: usize) -> Result<(), String> {
    timeout(WAIT, async {
        while state.broadcaster.subscriber_count() != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| format!("subscriber count never reached {expected}"))
}

async fn post_event(state: &Arc<ServerState>, event: Value) -> Result<StatusCode, String> {
    let req = Request::builder()
        .method(Method::POST)
        .uri("/event")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(event.to_string()))
        .map_err(|err| format!("build request: {err}"))?;
    let response = router(state.clone())
        .oneshot(req)
        .await
        .map_err(|err| format!("route request: {err}"))?;
    Ok(response.status())
}

#[tokio::test]
async fn run_subscriber_receives_agent_updates() -> Result<(), String> {
    let (state, url) = serve().await?;
    let (mut ws, _) = connect_async(format!("{url}?run_id=r1"))
        .await
        .map_err(|err| format!("connect: {err}"))?;
    subscribers_reach(&state, 1).await?;

    let other = post_event(&state, json!({"run_id": "r2", "id": "x", "agent_name": "other"})).await?;
    assert_eq!(other, StatusCode::ACCEPTED);
    let status = post_event(
        &state,
        json!({"run_id": "r1", "id": "s1", "agent_name": "writer", "status": "success", "latency_ms": 40}),
    )
    .await?;
    assert_eq!(status, StatusCode::ACCEPTED);

    let frame = timeout(WAIT, ws.next())
        .await
        .map_err(|_| "no live message".to_string())?
        .ok_or("socket closed")?
        .map_err(|err| format!("read: {err}"))?;
    let Message::Text(text) = frame else {
        return Err(format!("unexpected frame: {frame:?}"));
    };
    let message: Value = serde_json::from_str(&text).map_err(|err| format!("decode: {err}"))?;
    assert_eq!(message["type"], "agent_update");
    assert_eq!(message["run_id"], "r1");
    assert_eq!(message["agent_id"], "s1");
    assert_eq!(message["status"], "success");
    assert_eq!(message["latency_ms"], 40);

    ws.close(None).await.map_err(|err| format!("close: {err}"))?;
    subscribers_reach(&state, 0).await
}

#[tokio::test]
async fn global_subscriber_sees_run_changes() -> Result<(), String> {
    let (state, url) = serve().await?;
    let (mut ws, _) = connect_async(url).await.map_err(|err| format!("connect: {err}"))?;
    subscribers_reach(&state, 1).await?;

    post_event(&state, json!({"run_id": "r1", "id": "s1", "agent_name": "writer"})).await?;

    let mut kinds = Vec::new();
    while kinds.len() < 2 {
        let frame = timeout(WAIT, ws.next())
            .await
            .map_err(|_| format!("only received {kinds:?}"))?
            .ok_or("socket closed")?
            .map_err(|err| format!("read: {err}"))?;
        if let Message::Text(text) = frame {
            let message: Value = serde_json::from_str(&text).map_err(|err| format!("decode: {err}"))?;
            kinds.push(message["type"].as_str().unwrap_or_default().to_string());
        }
    }
    assert_eq!(kinds, vec!["agent_update", "runs_changed"]);

    drop(ws);
    subscribers_reach(&state, 0).await
}
