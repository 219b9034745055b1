// crates/relay/src/channel.rs
//! Single-slot registry for a session's outbound event sink.
//!
//! The job relay never holds the transport directly. It publishes through an
//! [`EventChannel`], which forwards to whichever sink is currently bound and
//! silently drops events when nothing is bound.

use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::protocol::JsonRpcMessage;

/// Writable half of a session's event stream.
pub type ChannelHandle = mpsc::Sender<JsonRpcMessage>;

/// What happened to a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// No sink bound; the event was dropped.
    ChannelUnavailable,
    /// The sink rejected the write; the channel has been unbound.
    DeliveryFailure,
}

/// Holds at most one live [`ChannelHandle`]. Last bind wins.
#[derive(Debug, Default)]
pub struct EventChannel {
    slot: RwLock<Option<ChannelHandle>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the active sink, superseding any previous one.
    ///
    /// The previous handle is not closed; it simply stops receiving events.
    pub fn bind(&self, handle: ChannelHandle) {
        match self.slot.write() {
            Ok(mut slot) => {
                if slot.replace(handle).is_some() {
                    tracing::debug!("event channel rebound, previous sink superseded");
                }
            }
            Err(e) => tracing::error!("RwLock poisoned binding event channel: {e}"),
        }
    }

    /// Clear the active sink. Safe to call any number of times.
    pub fn unbind(&self) {
        match self.slot.write() {
            Ok(mut slot) => *slot = None,
            Err(e) => tracing::error!("RwLock poisoned unbinding event channel: {e}"),
        }
    }

    pub fn is_bound(&self) -> bool {
        match self.slot.read() {
            Ok(slot) => slot.is_some(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading event channel: {e}");
                false
            }
        }
    }

    /// Wrap `text` in an event envelope and deliver it to the bound sink.
    pub async fn publish(&self, text: &str) -> PublishOutcome {
        let Some(handle) = self.current() else {
            tracing::warn!("No active event channel, dropping message");
            return PublishOutcome::ChannelUnavailable;
        };

        tracing::info!(payload = %crate::telemetry::preview(text), "Sending event");
        match handle.send(JsonRpcMessage::event(text)).await {
            Ok(()) => PublishOutcome::Delivered,
            Err(e) => {
                tracing::error!(error = %e, "Failed to deliver event, unbinding channel");
                self.unbind_if_current(&handle);
                PublishOutcome::DeliveryFailure
            }
        }
    }

    fn current(&self) -> Option<ChannelHandle> {
        match self.slot.read() {
            Ok(slot) => slot.clone(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading event channel: {e}");
                None
            }
        }
    }

    // A sink bound while the failed send was in flight must survive.
    fn unbind_if_current(&self, dead: &ChannelHandle) {
        match self.slot.write() {
            Ok(mut slot) => {
                if slot.as_ref().is_some_and(|h| h.same_channel(dead)) {
                    *slot = None;
                }
            }
            Err(e) => tracing::error!("RwLock poisoned unbinding event channel: {e}"),
        }
    }
}
