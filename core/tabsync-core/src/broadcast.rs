//! Notifications for whatever presentation layer is listening.
//!
//! Delivery is best-effort: nobody listening, or a listener that went away,
//! is logged and otherwise ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::types::{BrowserTab, CanvasTab, ConnectionState, Context};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum UiEvent {
    #[serde(rename_all = "camelCase")]
    TabsUpdated {
        browser_to_canvas: Vec<BrowserTab>,
        canvas_to_browser: Vec<CanvasTab>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionChanged {
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ContextChanged {
        context: Context,
    },
    ContextsListed {
        contexts: Vec<Context>,
    },
    Notification {
        level: NotificationLevel,
        message: String,
        at: DateTime<Utc>,
    },
}

impl UiEvent {
    pub fn notification(level: NotificationLevel, message: impl Into<String>) -> Self {
        UiEvent::Notification {
            level,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UiEvent::TabsUpdated { .. } => "tabs-updated",
            UiEvent::ConnectionChanged { .. } => "connection-changed",
            UiEvent::ContextChanged { .. } => "context-changed",
            UiEvent::ContextsListed { .. } => "contexts-listed",
            UiEvent::Notification { .. } => "notification",
        }
    }
}

pub trait Broadcast: Send + Sync {
    fn broadcast(&self, event: UiEvent) -> Result<()>;
}

/// Sends an event and swallows delivery failures.
pub fn announce(broadcaster: &dyn Broadcast, event: UiEvent) {
    let kind = event.kind();
    if let Err(err) = broadcaster.broadcast(event) {
        debug!(event = kind, error = %err, "UI broadcast not delivered");
    }
}

/// In-process fan-out over a tokio broadcast channel.
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<UiEvent>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcast for ChannelBroadcaster {
    fn broadcast(&self, event: UiEvent) -> Result<()> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| SyncError::Broadcast("no listeners".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_without_listeners_is_non_fatal() {
        let broadcaster = ChannelBroadcaster::new();
        assert!(broadcaster
            .broadcast(UiEvent::notification(NotificationLevel::Info, "hello"))
            .is_err());
        announce(
            &broadcaster,
            UiEvent::notification(NotificationLevel::Info, "still fine"),
        );
    }

    #[test]
    fn subscribers_receive_events() {
        let broadcaster = ChannelBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        announce(
            &broadcaster,
            UiEvent::ConnectionChanged {
                state: ConnectionState::Connected,
                detail: None,
            },
        );
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind(), "connection-changed");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let value = serde_json::to_value(UiEvent::TabsUpdated {
            browser_to_canvas: vec![],
            canvas_to_browser: vec![],
        })
        .unwrap();
        assert_eq!(value["type"], "tabs-updated");
        assert!(value["payload"]["browserToCanvas"].is_array());
    }
}
