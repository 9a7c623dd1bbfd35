//! Collaborators backed by the extension on the other end of the pipe.
//!
//! Tab control is a request/response exchange: each call is sent as a
//! `request` message and parked until the extension answers with a matching
//! `response`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tabsync_core::{
    Broadcast, BrowserTab, CreateTab, Result, SyncError, TabControl, UiEvent, WindowInfo,
};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::native::OutgoingMessage;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Reply = std::result::Result<Value, String>;

pub struct NativeTabControl {
    outbound: mpsc::UnboundedSender<OutgoingMessage>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl NativeTabControl {
    pub fn new(outbound: mpsc::UnboundedSender<OutgoingMessage>) -> Self {
        Self::with_timeout(outbound, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(outbound: mpsc::UnboundedSender<OutgoingMessage>, timeout: Duration) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Completes the call waiting on `id`. Returns false for unknown ids.
    pub fn resolve(&self, id: u64, ok: bool, data: Value, error: Option<String>) -> bool {
        let Some(reply) = self.pending().remove(&id) else {
            debug!(id, "Response for unknown request");
            return false;
        };
        let outcome = if ok {
            Ok(data)
        } else {
            Err(error.unwrap_or_else(|| "extension reported failure".to_string()))
        };
        let _ = reply.send(outcome);
        true
    }

    /// Fails every parked call, e.g. once the extension has gone away.
    pub fn fail_pending(&self) {
        let dropped = {
            let mut pending = self.pending();
            let count = pending.len();
            pending.clear();
            count
        };
        if dropped > 0 {
            debug!(dropped, "Dropped pending tab requests");
        }
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        if self
            .outbound
            .send(OutgoingMessage::Request { id, method, params })
            .is_err()
        {
            self.pending().remove(&id);
            return Err(SyncError::TabControl(format!("{}: extension pipe closed", method)));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(message))) => Err(SyncError::TabControl(format!("{}: {}", method, message))),
            Ok(Err(_)) => Err(SyncError::TabControl(format!("{}: no response", method))),
            Err(_) => {
                self.pending().remove(&id);
                Err(SyncError::TabControl(format!(
                    "{}: timed out after {:?}",
                    method, self.timeout
                )))
            }
        }
    }

    async fn call_decoded<T: DeserializeOwned>(&self, method: &'static str, params: Value) -> Result<T> {
        let data = self.call(method, params).await?;
        serde_json::from_value(data).map_err(|source| SyncError::Json {
            context: format!("decoding {} response", method),
            source,
        })
    }
}

#[async_trait]
impl TabControl for NativeTabControl {
    async fn query_tabs(&self) -> Result<Vec<BrowserTab>> {
        self.call_decoded("tabs.query", json!({})).await
    }

    async fn create_tab(&self, request: CreateTab) -> Result<BrowserTab> {
        let params = serde_json::to_value(&request).map_err(|source| SyncError::Json {
            context: "encoding tabs.create".to_string(),
            source,
        })?;
        self.call_decoded("tabs.create", params).await
    }

    async fn remove_tabs(&self, tab_ids: &[i64]) -> Result<()> {
        if tab_ids.is_empty() {
            return Ok(());
        }
        self.call("tabs.remove", json!({ "tabIds": tab_ids }))
            .await
            .map(|_| ())
    }

    async fn list_windows(&self) -> Result<Vec<WindowInfo>> {
        self.call_decoded("windows.getAll", json!({})).await
    }

    async fn create_window(&self, urls: &[String]) -> Result<WindowInfo> {
        self.call_decoded("windows.create", json!({ "url": urls }))
            .await
    }
}

/// Forwards UI events to the extension as `event` messages.
pub struct NativeBroadcaster {
    outbound: mpsc::UnboundedSender<OutgoingMessage>,
}

impl NativeBroadcaster {
    pub fn new(outbound: mpsc::UnboundedSender<OutgoingMessage>) -> Self {
        Self { outbound }
    }
}

impl Broadcast for NativeBroadcaster {
    fn broadcast(&self, event: UiEvent) -> Result<()> {
        self.outbound
            .send(OutgoingMessage::Event { event })
            .map_err(|_| SyncError::Broadcast("extension pipe closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use tabsync_core::NotificationLevel;

    fn bridge(timeout: Duration) -> (Arc<NativeTabControl>, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(NativeTabControl::with_timeout(tx, timeout)), rx)
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<OutgoingMessage>) -> (u64, &'static str, Value) {
        match rx.recv().await {
            Some(OutgoingMessage::Request { id, method, params }) => (id, method, params),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn query_resolves_with_extension_response() {
        let (tabs, mut rx) = bridge(REQUEST_TIMEOUT);
        let call = {
            let tabs = tabs.clone();
            tokio::spawn(async move { tabs.query_tabs().await })
        };

        let (id, method, _) = next_request(&mut rx).await;
        assert_eq!(method, "tabs.query");
        assert!(tabs.resolve(
            id,
            true,
            json!([{"id": 4, "windowId": 1, "url": "https://a.com"}]),
            None
        ));

        let result = call.await.unwrap().unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, Some(4));
    }

    #[tokio::test]
    async fn failed_response_becomes_tab_control_error() {
        let (tabs, mut rx) = bridge(REQUEST_TIMEOUT);
        let call = {
            let tabs = tabs.clone();
            tokio::spawn(async move { tabs.remove_tabs(&[1, 2]).await })
        };

        let (id, method, params) = next_request(&mut rx).await;
        assert_eq!(method, "tabs.remove");
        assert_eq!(params, json!({"tabIds": [1, 2]}));
        tabs.resolve(id, false, Value::Null, Some("No tab with id: 2".to_string()));

        match call.await.unwrap() {
            Err(SyncError::TabControl(message)) => assert!(message.contains("No tab with id")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (tabs, _rx) = bridge(Duration::from_secs(2));

        let result = tabs.list_windows().await;

        assert!(matches!(result, Err(SyncError::TabControl(_))));
        assert!(!tabs.resolve(1, true, json!([]), None));
    }

    #[tokio::test]
    async fn closed_pipe_fails_fast() {
        let (tabs, rx) = bridge(REQUEST_TIMEOUT);
        drop(rx);
        assert!(matches!(
            tabs.query_tabs().await,
            Err(SyncError::TabControl(_))
        ));
    }

    #[tokio::test]
    async fn fail_pending_releases_waiters() {
        let (tabs, mut rx) = bridge(REQUEST_TIMEOUT);
        let call = {
            let tabs = tabs.clone();
            tokio::spawn(async move {
                tabs.create_window(&["https://a.com".to_string()]).await
            })
        };
        let (_, method, params) = next_request(&mut rx).await;
        assert_eq!(method, "windows.create");
        assert_eq!(params, json!({"url": ["https://a.com"]}));

        tabs.fail_pending();

        assert!(call.await.unwrap().is_err());
    }

    #[test]
    fn broadcaster_wraps_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let broadcaster = NativeBroadcaster::new(tx);

        broadcaster
            .broadcast(UiEvent::notification(NotificationLevel::Info, "hello"))
            .unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            OutgoingMessage::Event {
                event: UiEvent::Notification { .. }
            }
        ));
        drop(rx);
        assert!(broadcaster
            .broadcast(UiEvent::notification(NotificationLevel::Info, "gone"))
            .is_err());
    }
}
