// crates/relay/src/tool.rs
//! The `generate_ml_project` tool: the one operation clients can invoke.

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::channel::EventChannel;
use crate::error::ErrorKind;
use crate::relay::{JobRelay, JobRequest};

pub const TOOL_NAME: &str = "generate_ml_project";

const TOOL_DESCRIPTION: &str = "Generate an ML project on the backend, streaming progress \
events to this session, then download and unpack the resulting project bundle.";

/// Text result of a tool call, tagged with the failure kind when it failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ToolOutput {
    /// MCP `tools/call` result body.
    pub fn to_call_result(&self) -> Value {
        let mut result = json!({
            "content": [{ "type": "text", "text": self.text }],
            "isError": self.is_error,
        });
        if let Some(kind) = self.error_kind {
            result["_meta"] = json!({ "errorKind": kind });
        }
        result
    }
}

/// Run the job relay and render its outcome as text. Never fails.
pub async fn generate_ml_project(
    relay: &JobRelay,
    events: &EventChannel,
    request: JobRequest,
    cancel: &CancellationToken,
) -> ToolOutput {
    match relay.run(&request, events, cancel).await {
        Ok(success) => {
            let text = success.message();
            tracing::info!(destination = %success.destination, "ML project generation finished");
            ToolOutput {
                text,
                is_error: false,
                error_kind: None,
            }
        }
        Err(e) => {
            let text = format!("Error during ML project generation: {e}");
            tracing::error!(kind = ?e.kind(), error = %e, "ML project generation failed");
            ToolOutput {
                text,
                is_error: true,
                error_kind: Some(e.kind()),
            }
        }
    }
}

/// Tool descriptor advertised by `tools/list`.
pub fn descriptor() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": TOOL_DESCRIPTION,
        "inputSchema": {
            "type": "object",
            "properties": {
                "user_prompt": {
                    "type": "string",
                    "description": "Description of what the user wants to accomplish"
                },
                "target_variable": {
                    "type": "string",
                    "description": "Column name to use as target variable for prediction"
                },
                "file_path": {
                    "type": "string",
                    "description": "Path to the data file"
                },
                "download_location": {
                    "type": "string",
                    "description": "Where to place the generated project; a trailing '/' extracts into that directory"
                }
            },
            "required": ["user_prompt", "target_variable", "file_path"]
        }
    })
}
