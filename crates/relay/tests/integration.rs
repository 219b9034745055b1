use std::io::{Cursor, Write};
use std::time::Duration;

use axum::{
    body::{Body, BodyDataStream},
    http::{Request, StatusCode},
    Router,
};
use futures_util::StreamExt;
use mlgen_relay::{
    state::AppState, DisconnectPolicy, JobRelay, PublishOutcome, RelaySettings,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate, Times};

fn test_app(backend_url: String) -> (Router, AppState) {
    test_app_with(backend_url, DisconnectPolicy::Detach)
}

fn test_app_with(backend_url: String, on_disconnect: DisconnectPolicy) -> (Router, AppState) {
    let relay = JobRelay::new(RelaySettings {
        backend_url,
        job_timeout: Duration::from_secs(10),
        ..RelaySettings::default()
    })
    .unwrap();
    let state = AppState::new(relay, on_disconnect);
    (mlgen_relay::app(state.clone()), state)
}

/// Helper to make a request to the app.
async fn request(
    app: Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, String) {
    let mut builder = Request::builder().method(method).uri(uri);

    let body = if let Some(json) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(serde_json::to_string(&json).unwrap())
    } else {
        Body::empty()
    };

    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// Minimal SSE frame reader over a response body.
struct SseReader {
    body: BodyDataStream,
    buf: String,
}

impl SseReader {
    async fn open(app: Router) -> Self {
        let response = app
            .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
        Self {
            body: response.into_body().into_data_stream(),
            buf: String::new(),
        }
    }

    /// Next `(event, data)` pair, skipping keep-alive comments.
    async fn next_event(&mut self) -> (String, String) {
        loop {
            if let Some(end) = self.buf.find("\n\n") {
                let frame: String = self.buf.drain(..end + 2).collect();
                let mut event = String::from("message");
                let mut data = Vec::new();
                for line in frame.lines() {
                    if let Some(v) = line.strip_prefix("event:") {
                        event = v.trim().to_string();
                    } else if let Some(v) = line.strip_prefix("data:") {
                        data.push(v.trim_start().to_string());
                    }
                }
                if data.is_empty() {
                    continue;
                }
                return (event, data.join("\n"));
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.body.next())
                .await
                .expect("timed out waiting for SSE frame")
                .expect("SSE stream ended")
                .unwrap();
            self.buf.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }

    async fn next_message(&mut self) -> Value {
        let (event, data) = self.next_event().await;
        assert_eq!(event, "message");
        serde_json::from_str(&data).unwrap()
    }
}

async fn open_session(app: &Router) -> (SseReader, String) {
    let mut reader = SseReader::open(app.clone()).await;
    let (event, endpoint) = reader.next_event().await;
    assert_eq!(event, "endpoint");
    assert!(endpoint.starts_with("/messages/?session_id="));
    (reader, endpoint)
}

fn bundle(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn tool_call(id: u64, destination: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {
            "name": "generate_ml_project",
            "arguments": {
                "user_prompt": "predict churn",
                "target_variable": "churned",
                "file_path": "/data/customers.csv",
                "download_location": destination,
            }
        }
    })
}

/// Backend that streams two steps and serves the bundle after `delay`.
async fn slow_bundle_backend(delay: Duration, expected_downloads: impl Into<Times>) -> MockServer {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate-ml-project/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: step1\ndata: step2\ndata: download:/files/x.zip\n",
            "text/event-stream",
        ))
        .expect(1)
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/x.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(delay)
                .set_body_raw(bundle(&[("model.py", "fit()")]), "application/zip"),
        )
        .expect(expected_downloads)
        .mount(&backend)
        .await;
    backend
}

#[tokio::test]
async fn health_check() {
    let (app, _) = test_app("http://127.0.0.1:1".into());
    let (status, body) = request(app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn messages_without_session_id_is_bad_request() {
    let (app, _) = test_app("http://127.0.0.1:1".into());
    let (status, body) = request(
        app,
        "POST",
        "/messages/",
        Some(json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("session_id"));
}

#[tokio::test]
async fn messages_for_unknown_session_is_not_found() {
    let (app, _) = test_app("http://127.0.0.1:1".into());
    let uri = format!("/messages/?session_id={}", uuid::Uuid::new_v4());
    let (status, _) = request(
        app,
        "POST",
        &uri,
        Some(json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sse_session_answers_requests_and_cleans_up_on_disconnect() {
    let (app, state) = test_app("http://127.0.0.1:1".into());
    let (mut reader, endpoint) = open_session(&app).await;
    assert_eq!(state.sessions.len(), 1);

    let (status, _) = request(
        app.clone(),
        "POST",
        &endpoint,
        Some(json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let reply = reader.next_message().await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["tools"][0]["name"], "generate_ml_project");

    let (status, _) = request(app.clone(), "POST", &endpoint, Some(json!({ "not": "rpc" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    drop(reader);
    assert!(state.sessions.is_empty());

    let (status, _) = request(
        app,
        "POST",
        &endpoint,
        Some(json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tool_call_streams_progress_and_unpacks_bundle() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate-ml-project/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: step1\ndata: step2\ndata: download:/files/x.zip\n",
            "text/event-stream",
        ))
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/x.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(bundle(&[("model.py", "fit()")]), "application/zip"),
        )
        .mount(&backend)
        .await;

    let out = tempfile::TempDir::new().unwrap();
    let destination = format!("{}/project/", out.path().display());
    let (app, _) = test_app(backend.uri());
    let (mut reader, endpoint) = open_session(&app).await;

    let (status, _) = request(
        app,
        "POST",
        &endpoint,
        Some(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": {
                "name": "generate_ml_project",
                "arguments": {
                    "user_prompt": "predict churn",
                    "target_variable": "churned",
                    "file_path": "/data/customers.csv",
                    "download_location": destination,
                }
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut events = Vec::new();
    for _ in 0..3 {
        let msg = reader.next_message().await;
        assert_eq!(msg["method"], "mcp/event");
        events.push(msg["params"]["message"].as_str().unwrap().to_string());
    }
    assert_eq!(
        events,
        vec![
            "step1".to_string(),
            "step2".to_string(),
            format!("download_ready: {destination}"),
        ]
    );

    let reply = reader.next_message().await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["result"]["isError"], false);
    assert!(reply["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .starts_with("Successfully created ml project"));

    let project = out.path().join("project");
    assert_eq!(
        std::fs::read_to_string(project.join("model.py")).unwrap(),
        "fit()"
    );
    assert_eq!(std::fs::read_dir(&project).unwrap().count(), 1);
}

#[tokio::test]
async fn disconnect_mid_stream_detaches_and_job_finishes() {
    let backend = slow_bundle_backend(Duration::from_millis(300), 1).await;
    let out = tempfile::TempDir::new().unwrap();
    let destination = format!("{}/project/", out.path().display());
    let (app, state) = test_app(backend.uri());
    let (mut reader, endpoint) = open_session(&app).await;
    let session = state
        .sessions
        .iter()
        .next()
        .map(|entry| entry.value().clone())
        .unwrap();

    let (status, _) = request(app.clone(), "POST", &endpoint, Some(tool_call(3, &destination))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let first = reader.next_message().await;
    assert_eq!(first["method"], "mcp/event");
    assert_eq!(first["params"]["message"], "step1");
    drop(reader);

    assert!(state.sessions.is_empty());
    assert!(!session.events.is_bound());
    assert!(!session.cancel.is_cancelled());
    assert_eq!(
        session.events.publish("late").await,
        PublishOutcome::ChannelUnavailable
    );

    let (status, body) = request(app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");

    let model = out.path().join("project").join("model.py");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !model.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "detached job never unpacked the bundle"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(std::fs::read_to_string(&model).unwrap(), "fit()");
    backend.verify().await;
}

#[tokio::test]
async fn disconnect_mid_stream_cancels_job_under_cancel_policy() {
    // The download may or may not have started when the token fires.
    let backend = slow_bundle_backend(Duration::from_millis(300), 0..=1).await;
    let out = tempfile::TempDir::new().unwrap();
    let destination = format!("{}/project/", out.path().display());
    let (app, state) = test_app_with(backend.uri(), DisconnectPolicy::Cancel);
    let (mut reader, endpoint) = open_session(&app).await;
    let session = state
        .sessions
        .iter()
        .next()
        .map(|entry| entry.value().clone())
        .unwrap();

    let (status, _) = request(app, "POST", &endpoint, Some(tool_call(4, &destination))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let first = reader.next_message().await;
    assert_eq!(first["params"]["message"], "step1");
    drop(reader);

    assert!(state.sessions.is_empty());
    assert!(session.cancel.is_cancelled());

    // Past the download delay: a cancelled run never unpacks anything.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!out.path().join("project").join("model.py").exists());
}
