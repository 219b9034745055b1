// crates/relay/src/session.rs
//! SSE session endpoint and its companion message endpoint.
//!
//! - GET /sse — opens a session; first event names the POST endpoint
//! - POST /messages/?session_id=… — one JSON-RPC message from the client

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::{ApiError, ApiResult};
use crate::mcp;
use crate::protocol::JsonRpcMessage;
use crate::state::{AppState, SessionId};

pub const SSE_PATH: &str = "/sse";
pub const MESSAGES_PATH: &str = "/messages/";

const OUTBOUND_CAPACITY: usize = 256;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Closes its session when dropped, whichever way the stream ends.
struct SessionGuard {
    state: AppState,
    id: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.close_session(&self.id);
    }
}

/// GET /sse — open a session and stream its outbound messages.
pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<JsonRpcMessage>(OUTBOUND_CAPACITY);
    let session = state.open_session(tx);
    let endpoint = format!("{MESSAGES_PATH}?session_id={}", session.id);
    let guard = SessionGuard {
        state: state.clone(),
        id: session.id,
    };
    drop(session);

    let stream = async_stream::stream! {
        let _guard = guard;
        let mut rx = rx;
        yield Ok(Event::default().event("endpoint").data(endpoint));
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => yield Ok(Event::default().event("message").data(json)),
                Err(e) => tracing::error!(error = %e, "Failed to serialize outbound message"),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub session_id: Option<String>,
}

/// POST /messages/ — accept one message; any reply goes out on the SSE stream.
pub async fn messages_handler(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let raw_id = query
        .session_id
        .ok_or_else(|| ApiError::BadRequest("session_id is required".into()))?;
    let id: SessionId = raw_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid session_id: {raw_id}")))?;
    let session = state
        .session(&id)
        .ok_or_else(|| ApiError::SessionNotFound(raw_id.clone()))?;

    let message: JsonRpcMessage = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON-RPC message: {e}")))?;

    mcp::dispatch(state, session, message);
    Ok(StatusCode::ACCEPTED)
}
