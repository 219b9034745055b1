// crates/relay/src/mcp.rs
//! MCP request handling for a session.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR,
    INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION, METHOD_NOT_FOUND,
};
use crate::relay::JobRequest;
use crate::state::{AppState, Session};
use crate::tool;

pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "mlgen-relay";

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Handle a client message off the request path.
///
/// Each request runs on its own task so a long tool call does not hold up
/// `ping` or other requests from the same session.
pub fn dispatch(state: AppState, session: Arc<Session>, message: JsonRpcMessage) {
    match message {
        JsonRpcMessage::Response(response) => {
            tracing::debug!(session_id = %session.id, id = %response.id, "Ignoring client response");
        }
        JsonRpcMessage::Request(request) => {
            tokio::spawn(async move {
                if let Some(response) = handle_request(&state, &session, request).await {
                    session.send(response).await;
                }
            });
        }
    }
}

/// Produce the response for one request; `None` for notifications.
pub async fn handle_request(
    state: &AppState,
    session: &Arc<Session>,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    if request.is_notification() {
        tracing::debug!(session_id = %session.id, method = %request.method, "Notification received");
        return None;
    }
    let id = request.id.clone().unwrap_or(Value::Null);
    if request.jsonrpc != JSONRPC_VERSION {
        return Some(JsonRpcResponse::failure(
            id,
            JsonRpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
        ));
    }

    tracing::debug!(session_id = %session.id, method = %request.method, "Request received");
    let result = match request.method.as_str() {
        "initialize" => Ok(initialize_result(request.params.as_ref())),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": [tool::descriptor()] })),
        "tools/call" => call_tool(state, session, request.params).await,
        other => Err(JsonRpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    };

    Some(match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(error) => JsonRpcResponse::failure(id, error),
    })
}

fn initialize_result(params: Option<&Value>) -> Value {
    let protocol_version = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);
    json!({
        "protocolVersion": protocol_version,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

async fn call_tool(
    state: &AppState,
    session: &Arc<Session>,
    params: Option<Value>,
) -> Result<Value, JsonRpcError> {
    let params: ToolCallParams = serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| JsonRpcError::new(INVALID_PARAMS, format!("invalid tools/call params: {e}")))?;
    if params.name != tool::TOOL_NAME {
        return Err(JsonRpcError::new(
            INVALID_PARAMS,
            format!("Unknown tool: {}", params.name),
        ));
    }
    let request: JobRequest = serde_json::from_value(params.arguments).map_err(|e| {
        JsonRpcError::new(INVALID_PARAMS, format!("invalid arguments for {}: {e}", tool::TOOL_NAME))
    })?;

    tracing::info!(session_id = %session.id, tool = tool::TOOL_NAME, "Tool call started");
    let relay = Arc::clone(&state.relay);
    let session = Arc::clone(session);
    let task = tokio::spawn(async move {
        tool::generate_ml_project(&relay, &session.events, request, &session.cancel).await
    });

    match task.await {
        Ok(output) => Ok(output.to_call_result()),
        Err(e) => {
            tracing::error!(error = %e, "Tool task panicked");
            Err(JsonRpcError::new(INTERNAL_ERROR, format!("tool task failed: {e}")))
        }
    }
}
