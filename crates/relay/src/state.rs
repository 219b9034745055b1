// crates/relay/src/state.rs
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{ChannelHandle, EventChannel};
use crate::config::DisconnectPolicy;
use crate::protocol::JsonRpcMessage;
use crate::relay::JobRelay;

pub type SessionId = Uuid;

/// One connected client.
pub struct Session {
    pub id: SessionId,
    /// Progress events published by jobs started from this session.
    pub events: EventChannel,
    /// Cancelled on disconnect under [`DisconnectPolicy::Cancel`].
    pub cancel: CancellationToken,
    pub opened_at: Instant,
    outbound: ChannelHandle,
}

impl Session {
    /// Queue a protocol message (typically a response) on the session stream.
    pub async fn send(&self, message: impl Into<JsonRpcMessage>) {
        if self.outbound.send(message.into()).await.is_err() {
            tracing::warn!(session_id = %self.id, "Session closed before message could be delivered");
        }
    }
}

/// Shared relay server state.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<JobRelay>,
    /// Live sessions, keyed by session id.
    pub sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    pub on_disconnect: DisconnectPolicy,
}

impl AppState {
    pub fn new(relay: JobRelay, on_disconnect: DisconnectPolicy) -> Self {
        Self {
            relay: Arc::new(relay),
            sessions: Arc::new(DashMap::new()),
            on_disconnect,
        }
    }

    /// Register a new session and bind `outbound` as its event sink.
    pub fn open_session(&self, outbound: ChannelHandle) -> Arc<Session> {
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            events: EventChannel::new(),
            cancel: CancellationToken::new(),
            opened_at: Instant::now(),
            outbound: outbound.clone(),
        });
        session.events.bind(outbound);
        self.sessions.insert(session.id, Arc::clone(&session));
        tracing::info!(session_id = %session.id, "Session opened");
        session
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Tear down a session. Idempotent.
    pub fn close_session(&self, id: &SessionId) {
        let Some((_, session)) = self.sessions.remove(id) else {
            return;
        };
        session.events.unbind();
        if self.on_disconnect == DisconnectPolicy::Cancel {
            session.cancel.cancel();
        }
        tracing::info!(
            session_id = %id,
            duration_secs = session.opened_at.elapsed().as_secs_f64(),
            "Session closed"
        );
    }
}
