//! Composition root: wires the registry, gateway, connection and context
//! switch together and exposes the user-facing operations.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{DocumentApi, RestDocumentApi};
use crate::broadcast::{announce, Broadcast, NotificationLevel, UiEvent};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::context_switch::{ContextSwitchCoordinator, SwitchReport};
use crate::error::{Result, SyncError};
use crate::gateway::{bound_context, DocumentGateway};
use crate::registry::TabRegistry;
use crate::settings::{
    load_connection_settings, load_sync_settings, pinned_urls, save_connection_settings,
    save_sync_settings, set_pinned, ConnectionSettings, SyncSettings,
};
use crate::storage::KeyValueStore;
use crate::tab_control::{CreateTab, TabControl, BLANK_TAB_URL};
use crate::tab_events::{BrowserTabEvent, TabEventHandler};
use crate::transport::{Transport, WebSocketTransport};
use crate::types::{CanvasTab, Context};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub connection: ConnectionStatus,
    pub active_context: Option<Context>,
    pub browser_tabs: usize,
    pub canvas_tabs: usize,
    pub browser_to_canvas: usize,
    pub canvas_to_browser: usize,
}

pub struct SyncRuntime {
    store: Arc<dyn KeyValueStore>,
    tabs: Arc<dyn TabControl>,
    broadcaster: Arc<dyn Broadcast>,
    registry: Arc<TabRegistry>,
    gateway: Arc<DocumentGateway>,
    connection: Arc<ConnectionManager>,
    coordinator: Arc<ContextSwitchCoordinator>,
    tab_events: TabEventHandler,
    context_listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncRuntime {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn DocumentApi>,
        transport: Arc<dyn Transport>,
        tabs: Arc<dyn TabControl>,
        broadcaster: Arc<dyn Broadcast>,
    ) -> Result<Self> {
        let settings = load_connection_settings(store.as_ref())?.unwrap_or_default();

        let registry = TabRegistry::new(store.clone(), tabs.clone(), broadcaster.clone());
        let gateway = Arc::new(DocumentGateway::new(
            api,
            registry.clone(),
            store.clone(),
            broadcaster.clone(),
        ));
        let connection = ConnectionManager::new(
            settings,
            transport,
            gateway.clone(),
            store.clone(),
            broadcaster.clone(),
        );
        let coordinator = Arc::new(ContextSwitchCoordinator::new(
            gateway.clone(),
            tabs.clone(),
            store.clone(),
            broadcaster.clone(),
        ));
        let tab_events = TabEventHandler::new(gateway.clone(), store.clone());

        Ok(Self {
            store,
            tabs,
            broadcaster,
            registry,
            gateway,
            connection,
            coordinator,
            tab_events,
            context_listener: Mutex::new(None),
        })
    }

    /// Runtime backed by the REST client and WebSocket transport, configured
    /// from the persisted connection settings.
    pub fn build(
        store: Arc<dyn KeyValueStore>,
        tabs: Arc<dyn TabControl>,
        broadcaster: Arc<dyn Broadcast>,
    ) -> Result<Self> {
        let settings = load_connection_settings(store.as_ref())?.unwrap_or_default();
        let api = Arc::new(RestDocumentApi::new(settings)?);
        Self::new(
            store,
            api,
            Arc::new(WebSocketTransport::new()),
            tabs,
            broadcaster,
        )
    }

    pub fn registry(&self) -> &Arc<TabRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<DocumentGateway> {
        &self.gateway
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Loads the local tab list and dials the service. Until connection
    /// settings have been saved once, nothing is dialed and auto-reconnect
    /// stays off.
    pub async fn start(&self) -> Result<()> {
        self.spawn_context_listener();

        if let Err(err) = self.registry.refresh_browser_tabs().await {
            warn!(error = %err, "Initial browser tab enumeration failed");
        }

        let configured = match load_connection_settings(self.store.as_ref()) {
            Ok(settings) => settings.is_some(),
            Err(err) => {
                warn!(error = %err, "Stored connection settings unreadable");
                false
            }
        };
        if !configured {
            info!("No connection settings saved; waiting for configuration");
            self.connection.set_auto_reconnect(false);
            announce(
                self.broadcaster.as_ref(),
                UiEvent::notification(
                    NotificationLevel::Info,
                    "Configure the server connection to start syncing",
                ),
            );
            return Ok(());
        }

        if let Err(err) = self.connection.initialize().await {
            warn!(error = %err, "Initial connection failed");
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(listener) = self
            .context_listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            listener.abort();
        }
        self.connection.destroy();
        info!("Sync runtime stopped");
    }

    /// Feeds contexts published by the connection into the context switch.
    fn spawn_context_listener(&self) {
        let mut slot = self
            .context_listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }

        let mut updates = self.connection.subscribe_context_updates();
        let coordinator = self.coordinator.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(context) => {
                        if let Err(err) = coordinator.apply_remote_update(context).await {
                            warn!(error = %err, "Context switch from remote update failed");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Context updates lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tabs
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn handle_tab_event(&self, event: BrowserTabEvent) -> Result<()> {
        self.tab_events.handle(event).await
    }

    pub async fn refresh_browser_tabs(&self) -> Result<()> {
        self.registry.refresh_browser_tabs().await
    }

    /// Inserts every local tab missing from the active context.
    pub async fn sync_all_browser_tabs(&self) -> Result<usize> {
        let context = self.gateway.active_context()?;
        let missing = self.registry.delta_browser_to_canvas();
        let inserted = self.gateway.insert_tabs(&context, &missing).await?;
        Ok(inserted.len())
    }

    /// Opens every context tab missing locally, except pinned urls.
    pub async fn open_all_canvas_tabs(&self) -> Result<usize> {
        let pinned = pinned_urls(self.store.as_ref());
        let missing: Vec<CanvasTab> = self
            .registry
            .delta_canvas_to_browser()
            .into_iter()
            .filter(|tab| !pinned.contains(&tab.url))
            .collect();

        let mut opened = 0;
        let mut failure = None;
        for tab in &missing {
            match self.tabs.create_tab(CreateTab::background(tab.url.clone())).await {
                Ok(_) => opened += 1,
                Err(err) => {
                    warn!(url = %tab.url, error = %err, "Failed to open canvas tab");
                    failure = Some(err);
                }
            }
        }
        self.registry.request_browser_refresh();

        match failure {
            Some(err) => Err(err),
            None => Ok(opened),
        }
    }

    pub async fn remove_canvas_tab(&self, url: &str) -> Result<()> {
        let (context, tab) = self.context_tab(url)?;
        self.gateway.remove_tab(&context.id, &tab).await
    }

    pub async fn delete_canvas_tab(&self, url: &str) -> Result<()> {
        let (context, tab) = self.context_tab(url)?;
        self.gateway.delete_tab(&context.id, &tab).await
    }

    /// Detaches several tabs in one call. Every url must resolve to a
    /// document id or nothing is sent.
    pub async fn remove_canvas_tabs(&self, urls: &[String]) -> Result<()> {
        let context = self.gateway.active_context()?;
        let tabs = self.canvas_tabs_for(urls);
        self.gateway.remove_tabs(&context.id, &tabs).await
    }

    pub async fn delete_canvas_tabs(&self, urls: &[String]) -> Result<()> {
        let context = self.gateway.active_context()?;
        let tabs = self.canvas_tabs_for(urls);
        self.gateway.delete_tabs(&context.id, &tabs).await
    }

    /// Writes edited tab metadata back to the tab's document.
    pub async fn update_canvas_tab(&self, tab: CanvasTab) -> Result<CanvasTab> {
        let context = self.gateway.active_context()?;
        self.gateway.update_tab(&context.id, &tab).await
    }

    /// Registry entries for `urls`; unknown urls are passed through without
    /// a document id so resolution rejects them.
    fn canvas_tabs_for(&self, urls: &[String]) -> Vec<CanvasTab> {
        urls.iter()
            .map(|url| {
                self.registry
                    .canvas_tab(url)
                    .unwrap_or_else(|| CanvasTab::new(url.as_str()))
            })
            .collect()
    }

    fn context_tab(&self, url: &str) -> Result<(Context, CanvasTab)> {
        let context = self.gateway.active_context()?;
        let tab = self
            .registry
            .canvas_tab(url)
            .ok_or_else(|| SyncError::UnresolvedDocument {
                url: url.to_string(),
            })?;
        Ok((context, tab))
    }

    /// Closes the local tab for `url`. The last open tab is replaced by a
    /// blank one instead of leaving the browser with none.
    pub async fn close_browser_tab(&self, url: &str) -> Result<()> {
        let tab = self
            .registry
            .browser_tab(url)
            .ok_or_else(|| SyncError::InvalidTab(format!("no open tab for {}", url)))?;
        let Some(tab_id) = tab.id else {
            return Err(SyncError::InvalidTab(format!("tab for {} has no id", url)));
        };

        let open = self.tabs.query_tabs().await?;
        if open.len() <= 1 {
            self.tabs
                .create_tab(CreateTab {
                    window_id: tab.window_id,
                    ..CreateTab::background(BLANK_TAB_URL)
                })
                .await?;
        }
        self.tabs.remove_tabs(&[tab_id]).await?;
        self.registry.remove_browser_tab(url);
        self.registry.request_browser_refresh();
        debug!(url, tab_id, "Closed browser tab");
        Ok(())
    }

    pub fn pin_url(&self, url: &str) -> Result<bool> {
        set_pinned(self.store.as_ref(), url, true)
    }

    pub fn unpin_url(&self, url: &str) -> Result<bool> {
        set_pinned(self.store.as_ref(), url, false)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Contexts
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn list_contexts(&self) -> Result<Vec<Context>> {
        self.gateway.list_contexts().await
    }

    pub async fn switch_context_url(&self, url: &str) -> Result<SwitchReport> {
        self.coordinator.switch_context_url(url).await
    }

    /// Tree of the bound context.
    pub async fn context_tree(&self) -> Result<Value> {
        let context = self.gateway.active_context()?;
        self.gateway.context_tree(&context.id).await
    }

    /// Binds an existing context by id.
    pub async fn switch_context(&self, context_id: &str) -> Result<SwitchReport> {
        let context = self.gateway.fetch_context(context_id).await?;
        self.coordinator.switch_context(context).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Settings
    // ─────────────────────────────────────────────────────────────────────────

    /// Persists new connection settings and reconnects with them.
    pub async fn update_connection_settings(&self, settings: ConnectionSettings) -> Result<()> {
        settings.validate()?;
        save_connection_settings(self.store.as_ref(), &settings)?;
        self.gateway.update_settings(settings.clone());
        self.connection.update_settings(settings)?;
        self.connection.set_auto_reconnect(true);
        info!("Connection settings updated");
        self.connection.force_reconnect().await
    }

    pub async fn verify_token(&self) -> Result<bool> {
        let valid = self.gateway.verify_token().await?;
        if !valid {
            warn!("Configured API token was rejected");
        }
        Ok(valid)
    }

    pub async fn create_token(&self, name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::invalid_settings("token name", "must not be empty"));
        }
        let token = self.gateway.create_token(name).await?;
        info!(name, "Created API token");
        Ok(token)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        self.connection.settings()
    }

    pub fn update_sync_settings(&self, settings: SyncSettings) -> Result<()> {
        save_sync_settings(self.store.as_ref(), &settings)?;
        info!(
            auto_sync = settings.auto_sync_browser_tabs,
            auto_open = settings.auto_open_canvas_tabs,
            behavior = ?settings.context_change_behavior,
            "Sync settings updated"
        );
        Ok(())
    }

    pub fn sync_settings(&self) -> SyncSettings {
        load_sync_settings(self.store.as_ref())
    }

    pub async fn force_reconnect(&self) -> Result<()> {
        self.connection.force_reconnect().await
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.connection.set_auto_reconnect(enabled);
    }

    pub fn status(&self) -> RuntimeStatus {
        let delta = self.registry.sync_delta();
        RuntimeStatus {
            connection: self.connection.status(),
            active_context: bound_context(self.store.as_ref()),
            browser_tabs: self.registry.browser_tabs().len(),
            canvas_tabs: self.registry.canvas_tabs().len(),
            browser_to_canvas: delta.browser_to_canvas.len(),
            canvas_to_browser: delta.canvas_to_browser.len(),
        }
    }
}

impl Drop for SyncRuntime {
    fn drop(&mut self) {
        if let Some(listener) = self
            .context_listener
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::registry::Notify;
    use crate::storage::{MemoryStore, StoreKey};
    use crate::test_support::{
        browser_tab, context, ApiCall, ChannelTransport, FakeDocumentApi, FakeTabControl,
        RecordingBroadcaster, TabCall,
    };
    use crate::types::ConnectionState;

    struct Harness {
        runtime: SyncRuntime,
        api: Arc<FakeDocumentApi>,
        transport: Arc<ChannelTransport>,
        tabs: Arc<FakeTabControl>,
        store: Arc<MemoryStore>,
        broadcaster: Arc<RecordingBroadcaster>,
    }

    fn harness_with(store: MemoryStore) -> Harness {
        let api = Arc::new(FakeDocumentApi::new());
        let transport = Arc::new(ChannelTransport::new());
        let tabs = Arc::new(FakeTabControl::new());
        let store = Arc::new(store);
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let runtime = SyncRuntime::new(
            store.clone(),
            api.clone(),
            transport.clone(),
            tabs.clone(),
            broadcaster.clone(),
        )
        .unwrap();
        Harness {
            runtime,
            api,
            transport,
            tabs,
            store,
            broadcaster,
        }
    }

    fn configured() -> Harness {
        let store = MemoryStore::new();
        save_connection_settings(
            &store,
            &ConnectionSettings {
                api_token: "secret".to_string(),
                ..ConnectionSettings::default()
            },
        )
        .unwrap();
        harness_with(store)
    }

    fn bind(h: &Harness, ctx: &Context) {
        let store: &dyn KeyValueStore = h.store.as_ref();
        store.save(StoreKey::ActiveContext, ctx).unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_run_waits_for_configuration() {
        let h = harness_with(MemoryStore::new());

        h.runtime.start().await.unwrap();

        assert_eq!(h.transport.open_count(), 0);
        let status = h.runtime.status();
        assert!(!status.connection.auto_reconnect);
        assert_eq!(status.connection.state, ConnectionState::Idle);
        assert_eq!(h.broadcaster.notifications().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_start_connects() {
        let h = configured();

        h.runtime.start().await.unwrap();

        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.runtime.status().connection.state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_url_change_runs_context_switch() {
        let h = configured();
        bind(&h, &context("work", "/work"));
        h.api.add_context(context("work", "/work"));
        h.runtime.start().await.unwrap();
        settle().await;
        let server = h.transport.take_server().unwrap();

        server.push("context.url.set", json!({"contextId": "work", "url": "/work/q3"}));
        settle().await;

        assert_eq!(bound_context(h.store.as_ref()).unwrap().url, "/work/q3");
        assert!(h
            .broadcaster
            .kinds()
            .contains(&"context-changed"));
    }

    #[tokio::test(start_paused = true)]
    async fn new_connection_settings_persist_and_reconnect() {
        let h = harness_with(MemoryStore::new());
        h.runtime.start().await.unwrap();

        let settings = ConnectionSettings {
            host: "canvas.local".to_string(),
            api_token: "fresh".to_string(),
            ..ConnectionSettings::default()
        };
        h.runtime
            .update_connection_settings(settings.clone())
            .await
            .unwrap();

        assert_eq!(
            load_connection_settings(h.store.as_ref()).unwrap(),
            Some(settings)
        );
        assert_eq!(h.transport.open_count(), 1);
        assert!(h.runtime.status().connection.auto_reconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_connection_settings_are_not_saved() {
        let h = harness_with(MemoryStore::new());

        let result = h
            .runtime
            .update_connection_settings(ConnectionSettings {
                port: 0,
                ..ConnectionSettings::default()
            })
            .await;

        assert!(matches!(result, Err(SyncError::InvalidSettings { .. })));
        assert_eq!(load_connection_settings(h.store.as_ref()).unwrap(), None);
        assert_eq!(h.transport.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_all_inserts_the_local_delta() {
        let h = harness_with(MemoryStore::new());
        bind(&h, &context("work", "/work"));
        h.tabs.open(browser_tab(1, "https://a.com"));
        h.tabs.open(browser_tab(2, "https://b.com"));
        h.runtime.refresh_browser_tabs().await.unwrap();

        let inserted = h.runtime.sync_all_browser_tabs().await.unwrap();

        assert_eq!(inserted, 2);
        assert!(h.runtime.registry().sync_delta().is_empty());
        assert_eq!(h.api.documents("work").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_all_requires_a_bound_context() {
        let h = harness_with(MemoryStore::new());
        assert!(matches!(
            h.runtime.sync_all_browser_tabs().await,
            Err(SyncError::NoActiveContext)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn open_all_skips_pinned_urls() {
        let h = harness_with(MemoryStore::new());
        h.runtime.pin_url("https://pinned.com").unwrap();
        h.runtime
            .registry()
            .bulk_replace_canvas_tabs(
                vec![CanvasTab::new("https://a.com"), CanvasTab::new("https://pinned.com")],
                true,
                Notify::Silent,
            )
            .unwrap();

        let opened = h.runtime.open_all_canvas_tabs().await.unwrap();

        assert_eq!(opened, 1);
        assert_eq!(
            h.tabs.mutations(),
            vec![TabCall::Create("https://a.com".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closing_last_tab_leaves_blank_tab() {
        let h = harness_with(MemoryStore::new());
        h.tabs.open(browser_tab(1, "https://a.com"));
        h.runtime.refresh_browser_tabs().await.unwrap();

        h.runtime.close_browser_tab("https://a.com").await.unwrap();

        assert_eq!(
            h.tabs.mutations(),
            vec![
                TabCall::Create(BLANK_TAB_URL.to_string()),
                TabCall::Remove(vec![1]),
            ]
        );
        assert!(h.runtime.registry().browser_tab("https://a.com").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn removing_unknown_canvas_tab_fails_without_remote_call() {
        let h = harness_with(MemoryStore::new());
        bind(&h, &context("work", "/work"));

        let result = h.runtime.remove_canvas_tab("https://nope.com").await;

        assert!(matches!(result, Err(SyncError::UnresolvedDocument { .. })));
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_canvas_tab_uses_stored_doc_id() {
        let h = harness_with(MemoryStore::new());
        bind(&h, &context("work", "/work"));
        h.runtime
            .registry()
            .upsert_canvas_tab(CanvasTab::new("https://a.com").with_doc_id("42"), Notify::Silent)
            .unwrap();

        h.runtime.delete_canvas_tab("https://a.com").await.unwrap();

        assert_eq!(
            h.api.calls(),
            vec![ApiCall::Delete {
                context_id: "work".to_string(),
                doc_ids: vec!["42".to_string()],
            }]
        );
        assert!(h.runtime.registry().canvas_tab("https://a.com").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_remove_rejects_unknown_url_before_calling_service() {
        let h = harness_with(MemoryStore::new());
        bind(&h, &context("work", "/work"));
        h.runtime
            .registry()
            .upsert_canvas_tab(CanvasTab::new("https://a.com").with_doc_id("1"), Notify::Silent)
            .unwrap();

        let result = h
            .runtime
            .remove_canvas_tabs(&["https://a.com".to_string(), "https://b.com".to_string()])
            .await;

        assert!(matches!(result, Err(SyncError::UnresolvedDocument { .. })));
        assert!(h.api.calls().is_empty());
        assert!(h.runtime.registry().canvas_tab("https://a.com").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn update_canvas_tab_writes_to_bound_context() {
        let h = harness_with(MemoryStore::new());
        bind(&h, &context("work", "/work"));
        h.runtime
            .registry()
            .upsert_canvas_tab(CanvasTab::new("https://a.com").with_doc_id("7"), Notify::Silent)
            .unwrap();

        let mut edited = CanvasTab::new("https://a.com");
        edited.pinned = true;
        let updated = h.runtime.update_canvas_tab(edited).await.unwrap();

        assert_eq!(updated.doc_id.as_deref(), Some("7"));
        assert_eq!(
            h.api.calls(),
            vec![ApiCall::Update {
                context_id: "work".to_string(),
                doc_id: "7".to_string(),
            }]
        );
        assert!(h.runtime.registry().canvas_tab("https://a.com").unwrap().pinned);
    }

    #[tokio::test]
    async fn context_tree_needs_bound_context() {
        let h = harness_with(MemoryStore::new());
        assert!(matches!(
            h.runtime.context_tree().await,
            Err(SyncError::NoActiveContext)
        ));

        bind(&h, &context("work", "/work"));
        h.runtime.context_tree().await.unwrap();
        assert_eq!(h.api.calls(), vec![ApiCall::ContextTree("work".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_delta_sizes() {
        let h = harness_with(MemoryStore::new());
        bind(&h, &context("work", "/work"));
        h.tabs.open(browser_tab(1, "https://a.com"));
        h.runtime.refresh_browser_tabs().await.unwrap();
        h.runtime
            .registry()
            .upsert_canvas_tab(CanvasTab::new("https://b.com"), Notify::Silent)
            .unwrap();

        let status = h.runtime.status();

        assert_eq!(status.active_context.unwrap().id, "work");
        assert_eq!((status.browser_tabs, status.canvas_tabs), (1, 1));
        assert_eq!((status.browser_to_canvas, status.canvas_to_browser), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_connection() {
        let h = configured();
        h.runtime.start().await.unwrap();

        h.runtime.shutdown();

        let status = h.runtime.status();
        assert_eq!(status.connection.state, ConnectionState::Idle);
        assert!(!status.connection.auto_reconnect);
    }
}
