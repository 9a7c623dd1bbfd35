//! Typed document and context operations layered over [`DocumentApi`].
//!
//! Every successful mutating call updates the registry from the service's
//! response, never from what was sent: the server-assigned document id is
//! what later update/remove/delete calls need. Batch inserts apply their
//! registry updates silently and finish with one consolidated refresh, so
//! observers see a single change instead of one per tab.

use std::sync::Arc;

use serde_json::Value;
use tabsync_protocol::DocumentInput;
use tracing::{debug, info, warn};

use crate::api::DocumentApi;
use crate::broadcast::{announce, Broadcast, UiEvent};
use crate::error::{Result, SyncError};
use crate::registry::{Notify, TabRegistry};
use crate::settings::ConnectionSettings;
use crate::storage::{KeyValueStore, StoreKey};
use crate::types::{BrowserTab, CanvasTab, Context};

/// The context currently bound, if any. Store read failures count as unbound.
pub fn bound_context(store: &dyn KeyValueStore) -> Option<Context> {
    match store.load::<Context>(StoreKey::ActiveContext) {
        Ok(context) => context.filter(|context| context.validate().is_ok()),
        Err(err) => {
            warn!(error = %err, "Failed to read active context");
            None
        }
    }
}

pub struct DocumentGateway {
    api: Arc<dyn DocumentApi>,
    registry: Arc<TabRegistry>,
    store: Arc<dyn KeyValueStore>,
    broadcaster: Arc<dyn Broadcast>,
}

impl DocumentGateway {
    pub fn new(
        api: Arc<dyn DocumentApi>,
        registry: Arc<TabRegistry>,
        store: Arc<dyn KeyValueStore>,
        broadcaster: Arc<dyn Broadcast>,
    ) -> Self {
        Self {
            api,
            registry,
            store,
            broadcaster,
        }
    }

    pub fn registry(&self) -> &Arc<TabRegistry> {
        &self.registry
    }

    pub fn active_context(&self) -> Result<Context> {
        bound_context(self.store.as_ref()).ok_or(SyncError::NoActiveContext)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Contexts
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn fetch_context(&self, context_id: &str) -> Result<Context> {
        self.api.get_context(context_id).await
    }

    /// Fetches the available contexts, caches them and tells listeners.
    pub async fn list_contexts(&self) -> Result<Vec<Context>> {
        let contexts = self.api.list_contexts().await?;
        if let Err(err) = self.store.save(StoreKey::Contexts, &contexts) {
            warn!(error = %err, "Failed to cache context list");
        }
        announce(
            self.broadcaster.as_ref(),
            UiEvent::ContextsListed {
                contexts: contexts.clone(),
            },
        );
        Ok(contexts)
    }

    pub fn cached_contexts(&self) -> Vec<Context> {
        match self.store.load(StoreKey::Contexts) {
            Ok(contexts) => contexts.unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "Failed to read cached context list");
                Vec::new()
            }
        }
    }

    pub async fn context_tree(&self, context_id: &str) -> Result<Value> {
        self.api.get_context_tree(context_id).await
    }

    pub async fn set_context_url(&self, context_id: &str, url: &str) -> Result<Context> {
        self.api.set_context_url(context_id, url).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Tab documents of a context. Documents of other schemas are skipped;
    /// tab documents without a usable url are logged and skipped.
    pub async fn fetch_context_tabs(&self, context_id: &str) -> Result<Vec<CanvasTab>> {
        let documents = self.api.list_documents(context_id).await?;
        let total = documents.len();

        let tabs: Vec<CanvasTab> = documents
            .into_iter()
            .filter(|document| document.is_tab())
            .filter_map(|document| match document.tab_data() {
                Ok(data) => Some(CanvasTab::from_tab_data(data, document.id)),
                Err(info) => {
                    warn!(
                        context_id,
                        doc_id = ?document.id,
                        code = %info.code,
                        message = %info.message,
                        "Skipping malformed tab document"
                    );
                    None
                }
            })
            .collect();

        debug!(context_id, documents = total, tabs = tabs.len(), "Fetched context tabs");
        Ok(tabs)
    }

    /// Replaces the canvas map with the context's authoritative document set.
    pub async fn sync_context_tabs(&self, context_id: &str, notify: Notify) -> Result<usize> {
        let tabs = self.fetch_context_tabs(context_id).await?;
        let count = tabs.len();
        self.registry.bulk_replace_canvas_tabs(tabs, true, notify)?;
        Ok(count)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inserts
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn insert_tab(&self, context: &Context, tab: &BrowserTab) -> Result<CanvasTab> {
        tab.validate()?;
        let documents = [DocumentInput::tab(tab.to_tab_data())];
        let ids = self
            .api
            .insert_documents(&context.id, &documents, &context.context_bitmap_array)
            .await?;
        let doc_id = single_id(ids, &tab.url)?;

        let canvas = CanvasTab::from_browser(tab).with_doc_id(doc_id);
        self.registry
            .upsert_canvas_tab(canvas.clone(), Notify::Debounced)?;
        debug!(url = %tab.url, doc_id = ?canvas.doc_id, "Inserted tab");
        Ok(canvas)
    }

    /// Inserts a batch and notifies observers once.
    pub async fn insert_tabs(&self, context: &Context, tabs: &[BrowserTab]) -> Result<Vec<CanvasTab>> {
        if tabs.is_empty() {
            return Ok(Vec::new());
        }
        for tab in tabs {
            tab.validate()?;
        }

        let documents: Vec<DocumentInput> = tabs
            .iter()
            .map(|tab| DocumentInput::tab(tab.to_tab_data()))
            .collect();
        let ids = self
            .api
            .insert_documents(&context.id, &documents, &context.context_bitmap_array)
            .await?;

        let inserted: Vec<CanvasTab> = tabs
            .iter()
            .zip(ids)
            .map(|(tab, doc_id)| CanvasTab::from_browser(tab).with_doc_id(doc_id))
            .collect();
        self.registry
            .upsert_canvas_tabs(inserted.clone(), Notify::Silent)?;
        info!(context_id = %context.id, tabs = inserted.len(), "Inserted tabs");

        if let Err(err) = self.registry.refresh_browser_tabs().await {
            warn!(error = %err, "Browser refresh after batch insert failed");
            self.registry.broadcast_delta();
        }
        Ok(inserted)
    }

    /// Files tabs under a context that is being left. The registry is not
    /// touched since the canvas map already belongs to the next context.
    pub async fn archive_tabs(&self, previous: &Context, tabs: &[BrowserTab]) -> Result<usize> {
        let documents: Vec<DocumentInput> = tabs
            .iter()
            .filter(|tab| tab.validate().is_ok())
            .map(|tab| DocumentInput::tab(tab.to_tab_data()))
            .collect();
        if documents.is_empty() {
            return Ok(0);
        }

        let ids = self
            .api
            .insert_documents(&previous.id, &documents, &previous.context_bitmap_array)
            .await?;
        info!(context_id = %previous.id, tabs = ids.len(), "Archived tabs into previous context");
        Ok(ids.len())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Updates and removals
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn update_tab(&self, context_id: &str, tab: &CanvasTab) -> Result<CanvasTab> {
        tab.validate()?;
        let doc_id = self.resolve_document_id(tab)?;
        self.api
            .update_document(context_id, &doc_id, &DocumentInput::tab(tab.to_tab_data()))
            .await?;

        let updated = tab.clone().with_doc_id(doc_id);
        self.registry
            .upsert_canvas_tab(updated.clone(), Notify::Debounced)?;
        Ok(updated)
    }

    /// Detaches the tab's document from the context.
    pub async fn remove_tab(&self, context_id: &str, tab: &CanvasTab) -> Result<()> {
        let doc_id = self.resolve_document_id(tab)?;
        self.api
            .remove_documents(context_id, std::slice::from_ref(&doc_id))
            .await?;
        self.registry.remove_canvas_tab(&tab.url, Notify::Debounced);
        debug!(url = %tab.url, doc_id = %doc_id, "Removed tab from context");
        Ok(())
    }

    /// Deletes the tab's document from the service.
    pub async fn delete_tab(&self, context_id: &str, tab: &CanvasTab) -> Result<()> {
        let doc_id = self.resolve_document_id(tab)?;
        self.api
            .delete_documents(context_id, std::slice::from_ref(&doc_id))
            .await?;
        self.registry.remove_canvas_tab(&tab.url, Notify::Debounced);
        debug!(url = %tab.url, doc_id = %doc_id, "Deleted tab");
        Ok(())
    }

    pub async fn remove_tabs(&self, context_id: &str, tabs: &[CanvasTab]) -> Result<()> {
        let doc_ids = self.resolve_document_ids(tabs)?;
        if doc_ids.is_empty() {
            return Ok(());
        }
        self.api.remove_documents(context_id, &doc_ids).await?;
        self.forget(tabs);
        Ok(())
    }

    pub async fn delete_tabs(&self, context_id: &str, tabs: &[CanvasTab]) -> Result<()> {
        let doc_ids = self.resolve_document_ids(tabs)?;
        if doc_ids.is_empty() {
            return Ok(());
        }
        self.api.delete_documents(context_id, &doc_ids).await?;
        self.forget(tabs);
        Ok(())
    }

    fn forget(&self, tabs: &[CanvasTab]) {
        for tab in tabs {
            self.registry.remove_canvas_tab(&tab.url, Notify::Silent);
        }
        self.registry.schedule_delta_broadcast();
    }

    /// The tab's own document id, else the one recorded for its url.
    pub fn resolve_document_id(&self, tab: &CanvasTab) -> Result<String> {
        tab.doc_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| self.registry.doc_id_for_url(&tab.url))
            .ok_or_else(|| SyncError::UnresolvedDocument {
                url: tab.url.clone(),
            })
    }

    fn resolve_document_ids(&self, tabs: &[CanvasTab]) -> Result<Vec<String>> {
        tabs.iter()
            .map(|tab| self.resolve_document_id(tab))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Auth
    // ─────────────────────────────────────────────────────────────────────────

    /// Points subsequent REST calls at new connection settings.
    pub fn update_settings(&self, settings: ConnectionSettings) {
        self.api.update_settings(settings);
    }

    pub async fn verify_token(&self) -> Result<bool> {
        self.api.verify_token().await
    }

    pub async fn create_token(&self, name: &str) -> Result<String> {
        self.api.create_token(name).await
    }
}

fn single_id(ids: Vec<String>, url: &str) -> Result<String> {
    let mut ids = ids.into_iter();
    match (ids.next(), ids.next()) {
        (Some(id), None) => Ok(id),
        _ => Err(SyncError::MalformedDocument(format!(
            "insert of {} did not return exactly one document id",
            url
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::test_support::{
        browser_tab, context, ApiCall, FakeDocumentApi, FakeTabControl, RecordingBroadcaster,
    };
    use crate::registry::CANVAS_NOTIFY_DELAY;

    struct Harness {
        gateway: DocumentGateway,
        api: Arc<FakeDocumentApi>,
        tabs: Arc<FakeTabControl>,
        store: Arc<MemoryStore>,
        broadcaster: Arc<RecordingBroadcaster>,
    }

    fn harness() -> Harness {
        let api = Arc::new(FakeDocumentApi::new());
        let tabs = Arc::new(FakeTabControl::new());
        let store = Arc::new(MemoryStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let registry = TabRegistry::new(store.clone(), tabs.clone(), broadcaster.clone());
        let gateway =
            DocumentGateway::new(api.clone(), registry, store.clone(), broadcaster.clone());
        Harness {
            gateway,
            api,
            tabs,
            store,
            broadcaster,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_insert_records_server_ids_with_one_notification() {
        let h = harness();
        let work = context("work", "/work");
        let local = vec![
            browser_tab(1, "https://a.com"),
            browser_tab(2, "https://b.com"),
            browser_tab(3, "https://c.com"),
        ];
        for tab in &local {
            h.tabs.open(tab.clone());
        }

        let inserted = h.gateway.insert_tabs(&work, &local).await.unwrap();
        tokio::time::sleep(CANVAS_NOTIFY_DELAY * 3).await;

        let canvas = h.gateway.registry().canvas_tabs();
        let pairs: Vec<(String, Option<String>)> = canvas
            .iter()
            .map(|tab| (tab.url.clone(), tab.doc_id.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("https://a.com".to_string(), Some("100".to_string())),
                ("https://b.com".to_string(), Some("101".to_string())),
                ("https://c.com".to_string(), Some("102".to_string())),
            ]
        );
        assert_eq!(inserted.len(), 3);
        assert_eq!(h.broadcaster.tabs_updated_count(), 1);
        assert!(h.gateway.registry().delta_browser_to_canvas().is_empty());
    }

    #[tokio::test]
    async fn insert_tags_documents_with_context_bitmap() {
        let h = harness();
        let work = context("work", "/work");
        h.gateway
            .insert_tab(&work, &browser_tab(1, "https://a.com"))
            .await
            .unwrap();

        assert_eq!(
            h.api.calls(),
            vec![ApiCall::Insert {
                context_id: "work".to_string(),
                urls: vec!["https://a.com".to_string()],
                bitmap: vec!["context/work".to_string()],
            }]
        );
        assert_eq!(
            h.gateway.registry().doc_id_for_url("https://a.com").as_deref(),
            Some("100")
        );
    }

    #[tokio::test]
    async fn insert_rejects_tab_without_id_before_calling_service() {
        let h = harness();
        let mut tab = browser_tab(1, "https://a.com");
        tab.id = None;

        let err = h
            .gateway
            .insert_tab(&context("work", "/work"), &tab)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidTab(_)));
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn remove_falls_back_to_url_lookup() {
        let h = harness();
        h.gateway
            .registry()
            .upsert_canvas_tab(CanvasTab::new("https://b.com").with_doc_id("42"), Notify::Silent)
            .unwrap();

        h.gateway
            .remove_tab("work", &CanvasTab::new("https://b.com"))
            .await
            .unwrap();

        assert_eq!(
            h.api.calls(),
            vec![ApiCall::Remove {
                context_id: "work".to_string(),
                doc_ids: vec!["42".to_string()],
            }]
        );
        assert!(h.gateway.registry().canvas_tab("https://b.com").is_none());
    }

    #[tokio::test]
    async fn unresolvable_remove_fails_without_mutation() {
        let h = harness();
        h.gateway
            .registry()
            .upsert_canvas_tab(CanvasTab::new("https://other.com").with_doc_id("7"), Notify::Silent)
            .unwrap();
        let before = h.gateway.registry().canvas_tabs();

        let err = h
            .gateway
            .delete_tab("work", &CanvasTab::new("https://b.com"))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::UnresolvedDocument { ref url } if url == "https://b.com"));
        assert!(h.api.calls().is_empty());
        assert_eq!(h.gateway.registry().canvas_tabs(), before);
    }

    #[tokio::test]
    async fn batch_remove_resolves_every_id_before_calling_service() {
        let h = harness();
        h.gateway
            .registry()
            .upsert_canvas_tab(CanvasTab::new("https://a.com").with_doc_id("1"), Notify::Silent)
            .unwrap();

        let result = h
            .gateway
            .remove_tabs(
                "work",
                &[CanvasTab::new("https://a.com"), CanvasTab::new("https://missing.com")],
            )
            .await;

        assert!(result.is_err());
        assert!(h.api.calls().is_empty());
        assert!(h.gateway.registry().canvas_tab("https://a.com").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn update_resolves_id_by_url_and_upserts() {
        let h = harness();
        h.api.add_tab_document("work", "https://a.com", "42");
        h.gateway
            .registry()
            .upsert_canvas_tab(CanvasTab::new("https://a.com").with_doc_id("42"), Notify::Silent)
            .unwrap();

        let mut edited = CanvasTab::new("https://a.com");
        edited.title = Some("Renamed".to_string());
        let updated = h.gateway.update_tab("work", &edited).await.unwrap();

        assert_eq!(updated.doc_id.as_deref(), Some("42"));
        assert_eq!(
            h.api.calls(),
            vec![ApiCall::Update {
                context_id: "work".to_string(),
                doc_id: "42".to_string(),
            }]
        );
        let stored = h.gateway.registry().canvas_tab("https://a.com").unwrap();
        assert_eq!(stored.title.as_deref(), Some("Renamed"));
        assert_eq!(h.api.documents("work")[0].data["title"], "Renamed");
    }

    #[tokio::test]
    async fn failed_update_leaves_registry_untouched() {
        let h = harness();
        h.gateway
            .registry()
            .upsert_canvas_tab(CanvasTab::new("https://a.com").with_doc_id("42"), Notify::Silent)
            .unwrap();
        h.api.fail("update");

        let mut edited = CanvasTab::new("https://a.com");
        edited.title = Some("Renamed".to_string());
        assert!(h.gateway.update_tab("work", &edited).await.is_err());

        let stored = h.gateway.registry().canvas_tab("https://a.com").unwrap();
        assert!(stored.title.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_delete_sends_every_resolved_id() {
        let h = harness();
        let registry = h.gateway.registry();
        registry
            .upsert_canvas_tab(CanvasTab::new("https://a.com").with_doc_id("1"), Notify::Silent)
            .unwrap();
        registry
            .upsert_canvas_tab(CanvasTab::new("https://b.com").with_doc_id("2"), Notify::Silent)
            .unwrap();

        h.gateway
            .delete_tabs(
                "work",
                &[CanvasTab::new("https://a.com"), CanvasTab::new("https://b.com")],
            )
            .await
            .unwrap();
        tokio::time::sleep(CANVAS_NOTIFY_DELAY * 3).await;

        assert_eq!(
            h.api.calls(),
            vec![ApiCall::Delete {
                context_id: "work".to_string(),
                doc_ids: vec!["1".to_string(), "2".to_string()],
            }]
        );
        assert!(registry.canvas_tabs().is_empty());
        assert_eq!(h.broadcaster.tabs_updated_count(), 1);
    }

    #[tokio::test]
    async fn batch_delete_with_unknown_url_sends_nothing() {
        let h = harness();
        h.gateway
            .registry()
            .upsert_canvas_tab(CanvasTab::new("https://a.com").with_doc_id("1"), Notify::Silent)
            .unwrap();

        let err = h
            .gateway
            .delete_tabs(
                "work",
                &[CanvasTab::new("https://a.com"), CanvasTab::new("https://missing.com")],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::UnresolvedDocument { ref url } if url == "https://missing.com"));
        assert!(h.api.calls().is_empty());
        assert!(h.gateway.registry().canvas_tab("https://a.com").is_some());
    }

    #[tokio::test]
    async fn token_calls_reach_the_service() {
        let h = harness();

        assert!(h.gateway.verify_token().await.unwrap());
        assert_eq!(h.gateway.create_token("laptop").await.unwrap(), "token-laptop");
        assert_eq!(
            h.api.calls(),
            vec![ApiCall::VerifyToken, ApiCall::CreateToken("laptop".to_string())]
        );

        h.api.fail("verify_token");
        assert!(h.gateway.verify_token().await.is_err());
    }

    #[tokio::test]
    async fn context_tree_is_fetched_for_context() {
        let h = harness();
        let tree = h.gateway.context_tree("work").await.unwrap();

        assert_eq!(tree["id"], "root");
        assert_eq!(h.api.calls(), vec![ApiCall::ContextTree("work".to_string())]);
    }

    #[tokio::test]
    async fn fetch_skips_foreign_and_malformed_documents() {
        let h = harness();
        h.api.add_tab_document("work", "https://a.com", "1");
        h.api.add_tab_document("work", "  ", "2");
        h.api.add_document(
            "work",
            tabsync_protocol::Document {
                id: Some("3".to_string()),
                schema: "data/abstraction/note".to_string(),
                data: serde_json::json!({"text": "hello"}),
            },
        );

        let tabs = h.gateway.fetch_context_tabs("work").await.unwrap();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].doc_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn failed_fetch_leaves_canvas_untouched() {
        let h = harness();
        h.gateway
            .registry()
            .upsert_canvas_tab(CanvasTab::new("https://a.com"), Notify::Silent)
            .unwrap();
        h.api.fail("list_documents");

        assert!(h.gateway.sync_context_tabs("work", Notify::Silent).await.is_err());
        assert_eq!(h.gateway.registry().canvas_tabs().len(), 1);
    }

    #[tokio::test]
    async fn archive_does_not_touch_registry() {
        let h = harness();
        let previous = context("home", "/home");

        let archived = h
            .gateway
            .archive_tabs(&previous, &[browser_tab(1, "https://a.com")])
            .await
            .unwrap();

        assert_eq!(archived, 1);
        assert!(h.gateway.registry().canvas_tabs().is_empty());
        assert_eq!(h.api.documents("home").len(), 1);
    }

    #[tokio::test]
    async fn list_contexts_caches_and_announces() {
        let h = harness();
        h.api.add_context(context("work", "/work"));
        h.api.add_context(context("home", "/home"));

        let contexts = h.gateway.list_contexts().await.unwrap();

        assert_eq!(contexts.len(), 2);
        assert_eq!(h.gateway.cached_contexts(), contexts);
        assert!(h.broadcaster.kinds().contains(&"contexts-listed"));
    }

    #[test]
    fn active_context_requires_bound_context() {
        let h = harness();
        assert!(matches!(
            h.gateway.active_context(),
            Err(SyncError::NoActiveContext)
        ));

        let store: &dyn KeyValueStore = h.store.as_ref();
        store
            .save(StoreKey::ActiveContext, &context("work", "/work"))
            .unwrap();
        assert_eq!(h.gateway.active_context().unwrap().id, "work");
    }
}
