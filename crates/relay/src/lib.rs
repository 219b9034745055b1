pub mod channel;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod mcp;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod tool;

use axum::{
    routing::{get, post},
    Router,
};
use state::AppState;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use channel::{EventChannel, PublishOutcome};
pub use config::{Config, DisconnectPolicy};
pub use relay::{JobRelay, JobRequest, RelaySettings};

pub fn app(state: AppState) -> Router {
    // Browser-based MCP inspectors connect cross-origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(session::SSE_PATH, get(session::sse_handler))
        .route(session::MESSAGES_PATH, post(session::messages_handler))
        .route("/messages", post(session::messages_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
