//! Lifecycle of the one real-time connection to the remote service.
//!
//! ```text
//! Idle ──► Connecting ──► Connected ──► Disconnected | Error
//!  ▲                                          │
//!  │                          (auto-reconnect)▼
//!  └──── destroy ◄──────────────────────── Connecting
//! ```
//!
//! Every terminal event arms one fixed-delay reconnect timer unless
//! auto-reconnect is off. Arming never replaces a pending timer; starting a
//! connect attempt clears it.
//!
//! Push events are hints. A document event for the bound context triggers an
//! authoritative re-fetch of that context's documents; the payload body is
//! never applied directly.
//!
//! Each opened link gets an epoch number. Events from a link that has since
//! been torn down are ignored, so a late close from an old link cannot knock
//! over a fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tabsync_protocol::{
    event_context_id, event_context_url, same_context_id, DocumentAction, PushEvent, WireFrame,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{announce, Broadcast, NotificationLevel, UiEvent};
use crate::error::{Result, SyncError};
use crate::gateway::{bound_context, DocumentGateway};
use crate::registry::Notify;
use crate::settings::ConnectionSettings;
use crate::storage::{KeyValueStore, StoreKey};
use crate::transport::{Transport, TransportEvent, TransportLink};
use crate::types::{ConnectionState, Context};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONTEXT_UPDATE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_pending: bool,
    pub auto_reconnect: bool,
}

/// What a document push event led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEventOutcome {
    NoActiveContext,
    OtherContext { event_context: Option<String> },
    Synced { tabs: usize },
    Failed(String),
}

struct LinkState {
    state: ConnectionState,
    settings: ConnectionSettings,
    outbound: Option<mpsc::UnboundedSender<WireFrame>>,
    reader: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    auto_reconnect: bool,
    initializing: bool,
    pending_acks: HashMap<u64, oneshot::Sender<Value>>,
    next_request_id: u64,
    epoch: u64,
    /// Bumped by every `destroy`; a connect that started before the bump
    /// discards its link.
    teardowns: u64,
}

impl LinkState {
    fn timer_pending(&self) -> bool {
        self.reconnect_timer
            .as_ref()
            .map_or(false, |timer| !timer.is_finished())
    }

    fn clear_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    /// Forgets the current link. Pending acknowledgements fail with
    /// `ConnectionLost` once their senders drop.
    fn drop_link(&mut self) {
        self.epoch += 1;
        self.outbound = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.pending_acks.clear();
    }
}

pub struct ConnectionManager {
    inner: Mutex<LinkState>,
    transport: Arc<dyn Transport>,
    gateway: Arc<DocumentGateway>,
    store: Arc<dyn KeyValueStore>,
    broadcaster: Arc<dyn Broadcast>,
    context_updates: broadcast::Sender<Context>,
    reconnect_delay: Duration,
    weak_self: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        transport: Arc<dyn Transport>,
        gateway: Arc<DocumentGateway>,
        store: Arc<dyn KeyValueStore>,
        broadcaster: Arc<dyn Broadcast>,
    ) -> Arc<Self> {
        let (context_updates, _) = broadcast::channel(CONTEXT_UPDATE_CAPACITY);
        Arc::new_cyclic(|weak_self| Self {
            inner: Mutex::new(LinkState {
                state: ConnectionState::Idle,
                settings,
                outbound: None,
                reader: None,
                reconnect_timer: None,
                auto_reconnect: true,
                initializing: false,
                pending_acks: HashMap::new(),
                next_request_id: 0,
                epoch: 0,
                teardowns: 0,
            }),
            transport,
            gateway,
            store,
            broadcaster,
            context_updates,
            reconnect_delay: RECONNECT_DELAY,
            weak_self: weak_self.clone(),
        })
    }

    fn inner(&self) -> MutexGuard<'_, LinkState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// First connect. A call made while another is still in flight is
    /// logged and ignored.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut inner = self.inner();
            if inner.initializing {
                info!("Connection initialization already in progress; ignoring");
                return Ok(());
            }
            inner.settings.validate()?;
            inner.initializing = true;
        }

        let result = self.connect().await;
        self.inner().initializing = false;
        result
    }

    /// Opens a link unless a live one already exists. A `destroy` that lands
    /// while the link is opening wins: the link is dropped and the call fails
    /// with `NotConnected`.
    pub async fn connect(&self) -> Result<()> {
        let (settings, teardowns) = {
            let mut inner = self.inner();
            let live = inner.state == ConnectionState::Connected
                && inner
                    .outbound
                    .as_ref()
                    .map_or(false, |outbound| !outbound.is_closed());
            if live {
                debug!("Reusing live connection");
                return Ok(());
            }
            inner.settings.validate()?;
            inner.clear_timer();
            inner.state = ConnectionState::Connecting;
            (inner.settings.clone(), inner.teardowns)
        };
        self.announce_state(ConnectionState::Connecting, None);

        match self.transport.open(&settings).await {
            Ok(link) => self.on_connected(link, &settings, teardowns),
            Err(err) => {
                self.on_terminal(ConnectionState::Error, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Tears down whatever link exists and opens a new one.
    pub async fn reconnect(&self) -> Result<()> {
        {
            let mut inner = self.inner();
            inner.drop_link();
            if inner.state == ConnectionState::Connected {
                inner.state = ConnectionState::Disconnected;
            }
        }
        self.connect().await
    }

    /// Clears any pending timer and reconnects unconditionally.
    pub async fn force_reconnect(&self) -> Result<()> {
        self.inner().clear_timer();
        info!("Forced reconnect");
        self.reconnect().await
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        let mut inner = self.inner();
        inner.auto_reconnect = enabled;
        if !enabled {
            inner.clear_timer();
        }
        debug!(enabled, "Auto-reconnect toggled");
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.inner().timer_pending()
    }

    /// Full teardown: no timer, no link, no auto-reconnect.
    pub fn destroy(&self) {
        {
            let mut inner = self.inner();
            inner.auto_reconnect = false;
            inner.initializing = false;
            inner.clear_timer();
            inner.drop_link();
            inner.teardowns += 1;
            inner.state = ConnectionState::Idle;
        }
        info!("Connection destroyed");
        self.announce_state(ConnectionState::Idle, None);
    }

    /// Replaces the settings used by the next connect attempt.
    pub fn update_settings(&self, settings: ConnectionSettings) -> Result<()> {
        settings.validate()?;
        self.inner().settings = settings;
        Ok(())
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.inner().settings.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner().state
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.inner();
        ConnectionStatus {
            state: inner.state,
            reconnect_pending: inner.timer_pending(),
            auto_reconnect: inner.auto_reconnect,
        }
    }

    /// Contexts whose url changed remotely, or that hydration found out of
    /// date. The runtime feeds these into the context switch.
    pub fn subscribe_context_updates(&self) -> broadcast::Receiver<Context> {
        self.context_updates.subscribe()
    }

    fn on_connected(
        &self,
        link: TransportLink,
        settings: &ConnectionSettings,
        teardowns: u64,
    ) -> Result<()> {
        let TransportLink { outbound, inbound } = link;
        {
            let mut inner = self.inner();
            if inner.teardowns != teardowns {
                debug!("Destroyed while connecting; dropping new link");
                return Err(SyncError::NotConnected);
            }
            inner.clear_timer();
            inner.drop_link();
            inner.state = ConnectionState::Connected;
            inner.outbound = Some(outbound.clone());

            let epoch = inner.epoch;
            let manager = self.weak_self.clone();
            inner.reader = Some(tokio::spawn(read_loop(manager, epoch, inbound)));
        }

        if outbound
            .send(WireFrame::event(
                "authenticate",
                json!({ "token": settings.api_token.trim() }),
            ))
            .is_err()
        {
            debug!("Link closed before authenticate frame was sent");
        }

        info!(host = %settings.host, port = settings.port, "Connected");
        self.announce_state(ConnectionState::Connected, None);
        self.spawn_hydrate();
        Ok(())
    }

    /// Handles a close or failure reported by the link of `epoch`.
    fn on_link_lost(&self, epoch: u64, state: ConnectionState, detail: Option<String>) {
        {
            let mut inner = self.inner();
            if inner.epoch != epoch {
                return;
            }
            inner.epoch += 1;
            inner.outbound = None;
            // The reader is the caller; dropping the handle detaches it.
            inner.reader = None;
            inner.pending_acks.clear();
        }
        self.on_terminal(state, detail);
    }

    fn on_terminal(&self, state: ConnectionState, detail: Option<String>) {
        {
            let mut inner = self.inner();
            if inner.state == ConnectionState::Idle && !inner.auto_reconnect {
                // Destroyed while the attempt was in flight.
                return;
            }
            inner.state = state;
        }
        warn!(state = state.as_str(), detail = ?detail, "Connection ended");
        self.announce_state(state, detail);
        self.arm_reconnect_timer();
    }

    /// Arms the reconnect timer. Returns false when auto-reconnect is off or
    /// a timer is already pending.
    fn arm_reconnect_timer(&self) -> bool {
        let mut inner = self.inner();
        if !inner.auto_reconnect {
            debug!("Auto-reconnect disabled; not arming timer");
            return false;
        }
        if inner.timer_pending() {
            debug!("Reconnect timer already pending");
            return false;
        }

        let manager = self.weak_self.clone();
        let delay = self.reconnect_delay;
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            {
                let mut inner = manager.inner();
                // Release our own slot so the connect attempt does not abort us.
                inner.reconnect_timer = None;
                if !inner.auto_reconnect {
                    return;
                }
            }
            info!("Reconnecting");
            if let Err(err) = manager.reconnect().await {
                debug!(error = %err, "Reconnect attempt failed");
            }
        }));
        debug!(delay_ms = delay.as_millis() as u64, "Reconnect timer armed");
        true
    }

    fn announce_state(&self, state: ConnectionState, detail: Option<String>) {
        announce(
            self.broadcaster.as_ref(),
            UiEvent::ConnectionChanged { state, detail },
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Sends a request and waits for the matching acknowledgement. Fails
    /// fast with `NotConnected` instead of queuing.
    pub async fn emit(&self, event: &str, data: Value) -> Result<Value> {
        let reply = {
            let mut inner = self.inner();
            let outbound = match (&inner.outbound, inner.state) {
                (Some(outbound), ConnectionState::Connected) => outbound.clone(),
                _ => return Err(SyncError::NotConnected),
            };
            inner.next_request_id += 1;
            let id = inner.next_request_id;
            let (tx, rx) = oneshot::channel();
            inner.pending_acks.insert(id, tx);
            if outbound.send(WireFrame::request(id, event, data)).is_err() {
                inner.pending_acks.remove(&id);
                return Err(SyncError::NotConnected);
            }
            rx
        };

        reply
            .await
            .map_err(|_| SyncError::ConnectionLost(event.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound routing
    // ─────────────────────────────────────────────────────────────────────────

    fn handle_frame(self: &Arc<Self>, frame: WireFrame) {
        if let Some(ack) = frame.ack {
            match self.inner().pending_acks.remove(&ack) {
                Some(reply) => {
                    let _ = reply.send(frame.data);
                }
                None => debug!(ack, "Acknowledgement for unknown request"),
            }
            return;
        }

        let Some(name) = frame.event.as_deref() else {
            return;
        };
        let Some(event) = PushEvent::parse(name) else {
            debug!(event = name, "Ignoring unknown push event");
            return;
        };

        match event {
            PushEvent::Authenticated => {
                let manager = Arc::clone(self);
                tokio::spawn(async move { manager.on_authenticated().await });
            }
            PushEvent::AuthenticationFailed => {
                warn!("Remote service rejected the API token");
                announce(
                    self.broadcaster.as_ref(),
                    UiEvent::notification(
                        NotificationLevel::Error,
                        "Authentication failed; check the API token",
                    ),
                );
            }
            PushEvent::Document(action) => {
                let manager = Arc::clone(self);
                let data = frame.data;
                tokio::spawn(async move {
                    manager.handle_document_event(action, &data).await;
                });
            }
            PushEvent::ContextUrlChanged => self.handle_context_url(&frame.data),
        }
    }

    /// Identity confirmed: refresh the context list and subscribe to the
    /// bound context.
    async fn on_authenticated(&self) {
        info!("Session authenticated");
        if let Err(err) = self.gateway.list_contexts().await {
            warn!(error = %err, "Failed to list contexts after authentication");
        }

        let Some(bound) = bound_context(self.store.as_ref()) else {
            return;
        };
        match self
            .emit("context:subscribe", json!({ "contextId": bound.id }))
            .await
        {
            Ok(_) => debug!(context_id = %bound.id, "Subscribed to context"),
            Err(err) => warn!(context_id = %bound.id, error = %err, "Context subscription failed"),
        }
    }

    /// Re-fetches the bound context's documents when a push event names it.
    pub async fn handle_document_event(
        &self,
        action: DocumentAction,
        data: &Value,
    ) -> DocumentEventOutcome {
        let Some(bound) = bound_context(self.store.as_ref()) else {
            debug!(action = action.as_str(), "No bound context; ignoring document event");
            return DocumentEventOutcome::NoActiveContext;
        };

        let event_context = event_context_id(data);
        let matches = event_context
            .as_deref()
            .map_or(false, |id| same_context_id(id, &bound.id));
        if !matches {
            debug!(
                action = action.as_str(),
                event_context = ?event_context,
                bound = %bound.id,
                "Document event for another context"
            );
            return DocumentEventOutcome::OtherContext { event_context };
        }

        let registry = self.gateway.registry();
        match self
            .gateway
            .sync_context_tabs(&bound.id, Notify::Silent)
            .await
        {
            Ok(tabs) => {
                if let Err(err) = registry.refresh_browser_tabs().await {
                    warn!(error = %err, "Browser refresh after document event failed");
                    registry.broadcast_delta();
                }
                announce(
                    self.broadcaster.as_ref(),
                    UiEvent::notification(
                        NotificationLevel::Info,
                        format!("Context tabs changed remotely ({})", action.as_str()),
                    ),
                );
                DocumentEventOutcome::Synced { tabs }
            }
            Err(err) => {
                warn!(action = action.as_str(), error = %err, "Re-fetch after document event failed");
                announce(
                    self.broadcaster.as_ref(),
                    UiEvent::notification(
                        NotificationLevel::Error,
                        format!("Failed to refresh context tabs: {}", err),
                    ),
                );
                DocumentEventOutcome::Failed(err.to_string())
            }
        }
    }

    fn handle_context_url(&self, data: &Value) {
        let Some(bound) = bound_context(self.store.as_ref()) else {
            return;
        };
        let targets_bound = event_context_id(data)
            .map_or(false, |id| same_context_id(&id, &bound.id));
        if !targets_bound {
            debug!("Context url event for another context");
            return;
        }
        let Some(url) = event_context_url(data) else {
            debug!("Context url event without url");
            return;
        };
        if url == bound.url {
            return;
        }

        info!(context_id = %bound.id, from = %bound.url, to = %url, "Context url changed remotely");
        let mut updated = bound;
        updated.url = url;
        self.publish_context(updated);
    }

    /// Returns false when nothing is listening.
    fn publish_context(&self, context: Context) -> bool {
        match self.context_updates.send(context) {
            Ok(_) => true,
            Err(_) => {
                debug!("No context update listener");
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Hydration
    // ─────────────────────────────────────────────────────────────────────────

    fn spawn_hydrate(&self) {
        let manager = self.weak_self.clone();
        tokio::spawn(async move {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if let Err(err) = manager.hydrate().await {
                warn!(error = %err, "Hydration after connect failed");
            }
        });
    }

    /// Loads the bound context (or the configured default) and its documents.
    ///
    /// A server-side url that differs from the persisted one is handed to the
    /// context-switch path instead of being applied here.
    pub async fn hydrate(&self) -> Result<()> {
        let bound = bound_context(self.store.as_ref());
        let context_id = match &bound {
            Some(bound) => bound.id.clone(),
            None => self.settings().default_context_id,
        };
        let fetched = self.gateway.fetch_context(&context_id).await?;

        if let Some(bound) = &bound {
            if !bound.url.is_empty()
                && bound.url != fetched.url
                && self.publish_context(fetched.clone())
            {
                info!(context_id = %fetched.id, url = %fetched.url, "Bound context moved while offline");
                return Ok(());
            }
        }

        if let Err(err) = self.store.save(StoreKey::ActiveContext, &fetched) {
            warn!(error = %err, "Failed to persist active context");
        }
        announce(
            self.broadcaster.as_ref(),
            UiEvent::ContextChanged {
                context: fetched.clone(),
            },
        );

        let tabs = self
            .gateway
            .sync_context_tabs(&fetched.id, Notify::Silent)
            .await?;
        let registry = self.gateway.registry();
        if let Err(err) = registry.refresh_browser_tabs().await {
            warn!(error = %err, "Browser refresh after hydration failed");
            registry.broadcast_delta();
        }
        info!(context_id = %fetched.id, tabs, "Hydrated context");
        Ok(())
    }
}

async fn read_loop(
    manager: Weak<ConnectionManager>,
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = inbound.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Frame(frame) => manager.handle_frame(frame),
            TransportEvent::Closed { reason } => {
                manager.on_link_lost(epoch, ConnectionState::Disconnected, reason);
                return;
            }
            TransportEvent::Failed(message) => {
                manager.on_link_lost(epoch, ConnectionState::Error, Some(message));
                return;
            }
        }
    }

    if let Some(manager) = manager.upgrade() {
        manager.on_link_lost(epoch, ConnectionState::Disconnected, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TabRegistry;
    use crate::storage::MemoryStore;
    use crate::test_support::{
        browser_tab, context, ApiCall, ChannelTransport, FakeDocumentApi, FakeTabControl,
        RecordingBroadcaster, ServerEnd,
    };

    struct Harness {
        manager: Arc<ConnectionManager>,
        transport: Arc<ChannelTransport>,
        api: Arc<FakeDocumentApi>,
        tabs: Arc<FakeTabControl>,
        store: Arc<MemoryStore>,
        broadcaster: Arc<RecordingBroadcaster>,
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            api_token: "secret".to_string(),
            ..ConnectionSettings::default()
        }
    }

    fn harness() -> Harness {
        let transport = Arc::new(ChannelTransport::new());
        let api = Arc::new(FakeDocumentApi::new());
        let tabs = Arc::new(FakeTabControl::new());
        let store = Arc::new(MemoryStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let registry = TabRegistry::new(store.clone(), tabs.clone(), broadcaster.clone());
        let gateway = Arc::new(DocumentGateway::new(
            api.clone(),
            registry,
            store.clone(),
            broadcaster.clone(),
        ));
        let manager = ConnectionManager::new(
            settings(),
            transport.clone(),
            gateway,
            store.clone(),
            broadcaster.clone(),
        );
        Harness {
            manager,
            transport,
            api,
            tabs,
            store,
            broadcaster,
        }
    }

    fn bind(h: &Harness, ctx: &Context) {
        let store: &dyn KeyValueStore = h.store.as_ref();
        store.save(StoreKey::ActiveContext, ctx).unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn connected(h: &Harness) -> ServerEnd {
        h.manager.connect().await.unwrap();
        settle().await;
        h.transport.take_server().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_errors_arm_a_single_timer() {
        let h = harness();

        h.manager
            .on_terminal(ConnectionState::Error, Some("refused".to_string()));
        assert!(h.manager.has_pending_reconnect());

        tokio::time::sleep(Duration::from_secs(3)).await;
        h.manager
            .on_terminal(ConnectionState::Error, Some("refused again".to_string()));
        assert!(h.manager.has_pending_reconnect());

        // The first timer was kept, so it fires 5s after the first error.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert!(!h.manager.has_pending_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_auto_reconnect_arms_nothing() {
        let h = harness();
        h.manager.set_auto_reconnect(false);

        h.manager.on_terminal(ConnectionState::Error, None);

        assert!(!h.manager.has_pending_reconnect());
        tokio::time::sleep(RECONNECT_DELAY * 2).await;
        assert_eq!(h.transport.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_keeps_retrying_on_timer() {
        let h = harness();
        h.transport.fail_next_open("refused");
        h.transport.fail_next_open("refused");

        assert!(h.manager.connect().await.is_err());
        assert_eq!(h.manager.state(), ConnectionState::Error);
        assert!(h.manager.has_pending_reconnect());

        tokio::time::sleep(RECONNECT_DELAY + Duration::from_millis(10)).await;
        assert_eq!(h.transport.open_count(), 2);
        assert!(h.manager.has_pending_reconnect());

        tokio::time::sleep(RECONNECT_DELAY + Duration::from_millis(10)).await;
        assert_eq!(h.transport.open_count(), 3);
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn link_failure_arms_timer_and_reconnects() {
        let h = harness();
        let server = connected(&h).await;

        server.fail("reset by peer");
        settle().await;
        assert_eq!(h.manager.state(), ConnectionState::Error);
        assert!(h.manager.has_pending_reconnect());

        tokio::time::sleep(RECONNECT_DELAY + Duration::from_millis(10)).await;
        assert_eq!(h.transport.open_count(), 2);
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_initialize_is_a_no_op() {
        let h = harness();
        h.transport.set_open_delay(Duration::from_millis(50));

        let (first, second) = tokio::join!(h.manager.initialize(), h.manager.initialize());
        first.unwrap();
        second.unwrap();

        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn malformed_settings_fail_before_network() {
        let h = harness();
        h.manager.inner().settings.host = String::new();

        let err = h.manager.initialize().await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidSettings { field: "host", .. }));
        assert_eq!(h.transport.open_count(), 0);
        assert!(!h.manager.inner().initializing);
        assert!(h.manager.update_settings(settings()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reuses_live_link_and_reconnect_replaces_it() {
        let h = harness();
        let mut first = connected(&h).await;

        h.manager.connect().await.unwrap();
        assert_eq!(h.transport.open_count(), 1);

        h.manager.reconnect().await.unwrap();
        settle().await;
        assert_eq!(h.transport.open_count(), 2);
        // Old link's outbound sender is gone.
        first.drain();
        assert!(first.from_client.recv().await.is_none());

        // A late close from the old link is ignored.
        first.close();
        settle().await;
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert!(!h.manager.has_pending_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_sends_authenticate_frame_first() {
        let h = harness();
        let mut server = connected(&h).await;

        let frames = server.drain();
        assert_eq!(frames[0].event.as_deref(), Some("authenticate"));
        assert_eq!(frames[0].data["token"], "secret");
        assert!(h.broadcaster.kinds().contains(&"connection-changed"));
    }

    #[tokio::test(start_paused = true)]
    async fn emit_fails_fast_when_disconnected() {
        let h = harness();
        let err = h.manager.emit("context:subscribe", json!({})).await.unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn emit_resolves_with_matching_ack() {
        let h = harness();
        let mut server = connected(&h).await;
        server.drain();

        let manager = h.manager.clone();
        let call = tokio::spawn(async move {
            manager
                .emit("context:subscribe", json!({"contextId": "work"}))
                .await
        });
        settle().await;

        let request = server.drain().pop().unwrap();
        assert_eq!(request.event.as_deref(), Some("context:subscribe"));
        let id = request.id.unwrap();
        server.ack(id + 100, json!({"status": "stray"}));
        server.ack(id, json!({"status": "ok"}));

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply["status"], "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn pending_emit_fails_when_link_drops() {
        let h = harness();
        let server = connected(&h).await;

        let manager = h.manager.clone();
        let call = tokio::spawn(async move { manager.emit("context:subscribe", json!({})).await });
        settle().await;
        server.close();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::ConnectionLost(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn document_event_without_bound_context_is_ignored() {
        let h = harness();
        let outcome = h
            .manager
            .handle_document_event(DocumentAction::Insert, &json!({"contextId": "work"}))
            .await;
        assert_eq!(outcome, DocumentEventOutcome::NoActiveContext);
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn document_event_for_other_context_is_ignored() {
        let h = harness();
        bind(&h, &context("work", "/work"));

        let outcome = h
            .manager
            .handle_document_event(DocumentAction::Update, &json!({"contextId": "bob/play"}))
            .await;

        assert_eq!(
            outcome,
            DocumentEventOutcome::OtherContext {
                event_context: Some("bob/play".to_string())
            }
        );
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn document_event_refetches_instead_of_trusting_payload() {
        let h = harness();
        bind(&h, &context("work", "/work"));
        h.api.add_tab_document("work", "https://server.com", "5");
        h.tabs.open(browser_tab(1, "https://local.com"));

        let outcome = h
            .manager
            .handle_document_event(
                DocumentAction::Insert,
                &json!({
                    "contextId": "alice/work",
                    "documents": [{"id": 9, "data": {"url": "https://payload.com"}}]
                }),
            )
            .await;

        assert_eq!(outcome, DocumentEventOutcome::Synced { tabs: 1 });
        let registry = h.manager.gateway.registry();
        assert_eq!(
            registry.canvas_urls().into_iter().collect::<Vec<_>>(),
            vec!["https://server.com".to_string()]
        );
        assert_eq!(h.tabs.query_count(), 1);
        assert_eq!(h.broadcaster.tabs_updated_count(), 1);
        assert_eq!(h.broadcaster.notifications().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn push_events_route_through_the_link() {
        let h = harness();
        bind(&h, &context("work", "/work"));
        let server = connected(&h).await;
        h.api.clear_calls();

        server.push("documents:removed", json!({"contextId": "work"}));
        settle().await;

        assert!(h
            .api
            .calls()
            .contains(&ApiCall::ListDocuments("work".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn authenticated_lists_contexts_and_subscribes() {
        let h = harness();
        bind(&h, &context("work", "/work"));
        h.api.add_context(context("work", "/work"));
        let mut server = connected(&h).await;
        server.drain();
        h.api.clear_calls();

        server.push("authenticated", json!({}));
        settle().await;

        assert!(h.api.calls().contains(&ApiCall::ListContexts));
        let frames = server.drain();
        let subscribe = frames
            .iter()
            .find(|frame| frame.event.as_deref() == Some("context:subscribe"))
            .unwrap();
        assert_eq!(subscribe.data["contextId"], "work");
        assert!(subscribe.id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn context_url_push_publishes_update() {
        let h = harness();
        bind(&h, &context("work", "/work"));
        let mut updates = h.manager.subscribe_context_updates();
        let server = connected(&h).await;

        server.push(
            "context:url:set",
            json!({"contextId": "work", "url": "/work/reports"}),
        );
        settle().await;

        let updated = updates.try_recv().unwrap();
        assert_eq!(updated.id, "work");
        assert_eq!(updated.url, "/work/reports");
    }

    #[tokio::test(start_paused = true)]
    async fn hydration_binds_default_context_and_loads_tabs() {
        let h = harness();
        h.api.add_context(context("default", "/"));
        h.api.add_tab_document("default", "https://a.com", "1");

        let _server = connected(&h).await;

        let store: &dyn KeyValueStore = h.store.as_ref();
        let active: Context = store.load(StoreKey::ActiveContext).unwrap().unwrap();
        assert_eq!(active.id, "default");
        assert_eq!(
            h.manager.gateway.registry().doc_id_for_url("https://a.com").as_deref(),
            Some("1")
        );
        assert!(h.broadcaster.kinds().contains(&"context-changed"));
    }

    #[tokio::test(start_paused = true)]
    async fn hydration_hands_moved_context_to_switch_path() {
        let h = harness();
        bind(&h, &context("work", "/work"));
        h.api.add_context(context("work", "/work/elsewhere"));
        let mut updates = h.manager.subscribe_context_updates();

        let _server = connected(&h).await;

        assert_eq!(updates.try_recv().unwrap().url, "/work/elsewhere");
        assert!(!h
            .api
            .calls()
            .contains(&ApiCall::ListDocuments("work".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_resets_everything() {
        let h = harness();
        let mut server = connected(&h).await;
        h.manager.on_terminal(ConnectionState::Error, None);
        assert!(h.manager.has_pending_reconnect());

        h.manager.destroy();

        let status = h.manager.status();
        assert_eq!(status.state, ConnectionState::Idle);
        assert!(!status.reconnect_pending);
        assert!(!status.auto_reconnect);
        server.drain();
        assert!(server.from_client.recv().await.is_none());

        tokio::time::sleep(RECONNECT_DELAY * 2).await;
        assert_eq!(h.transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_discards_link_still_opening() {
        let h = harness();
        h.transport.set_open_delay(Duration::from_millis(50));

        let manager = h.manager.clone();
        let attempt = tokio::spawn(async move { manager.connect().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.manager.destroy();

        let result = attempt.await.unwrap();
        assert!(matches!(result, Err(SyncError::NotConnected)));
        settle().await;

        let status = h.manager.status();
        assert_eq!(status.state, ConnectionState::Idle);
        assert!(!status.auto_reconnect);
        assert!(!status.reconnect_pending);
        assert!(h.api.calls().is_empty());

        // No authenticate frame, and the client side of the link is gone.
        let mut server = h.transport.take_server().unwrap();
        assert!(server.from_client.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_runs_again_after_reusing_live_link() {
        let h = harness();
        let server = connected(&h).await;

        h.manager.initialize().await.unwrap();
        assert_eq!(h.transport.open_count(), 1);
        assert!(!h.manager.inner().initializing);

        h.manager.set_auto_reconnect(false);
        server.close();
        settle().await;
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);

        h.manager.initialize().await.unwrap();
        assert_eq!(h.transport.open_count(), 2);
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }
}
