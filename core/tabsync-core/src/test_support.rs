//! In-process fakes for the collaborator traits.
//!
//! Compiled for unit tests and behind the `test-helpers` feature for
//! integration tests. Every fake records the calls it receives so tests can
//! assert on ordering as well as outcome.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tabsync_protocol::{
    normalize_context_id, Document, DocumentInput, ErrorInfo, WireFrame, TAB_SCHEMA,
};
use tokio::sync::mpsc;

use crate::api::DocumentApi;
use crate::broadcast::{Broadcast, NotificationLevel, UiEvent};
use crate::error::{Result, SyncError};
use crate::settings::ConnectionSettings;
use crate::tab_control::{CreateTab, TabControl, WindowInfo};
use crate::transport::{Transport, TransportEvent, TransportLink};
use crate::types::{BrowserTab, CanvasTab, Context};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A syncable tab in window 1.
pub fn browser_tab(id: i64, url: &str) -> BrowserTab {
    BrowserTab {
        id: Some(id),
        window_id: Some(1),
        index: None,
        url: url.to_string(),
        title: None,
        fav_icon_url: None,
        pinned: false,
        active: false,
        highlighted: false,
        discarded: false,
        incognito: false,
        muted_info: None,
    }
}

pub fn context(id: &str, url: &str) -> Context {
    Context {
        id: id.to_string(),
        url: url.to_string(),
        context_bitmap_array: vec![format!("context/{}", id)],
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Broadcast
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UiEvent> {
        lock(&self.events).clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(UiEvent::kind).collect()
    }

    pub fn tabs_updated_count(&self) -> usize {
        lock(&self.events)
            .iter()
            .filter(|event| matches!(event, UiEvent::TabsUpdated { .. }))
            .count()
    }

    pub fn notifications(&self) -> Vec<(NotificationLevel, String)> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                UiEvent::Notification { level, message, .. } => Some((*level, message.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn last_tabs_update(&self) -> Option<(Vec<BrowserTab>, Vec<CanvasTab>)> {
        lock(&self.events).iter().rev().find_map(|event| match event {
            UiEvent::TabsUpdated {
                browser_to_canvas,
                canvas_to_browser,
            } => Some((browser_to_canvas.clone(), canvas_to_browser.clone())),
            _ => None,
        })
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl Broadcast for RecordingBroadcaster {
    fn broadcast(&self, event: UiEvent) -> Result<()> {
        lock(&self.events).push(event);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tab control
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabCall {
    Query,
    Create(String),
    Remove(Vec<i64>),
    ListWindows,
    CreateWindow(Vec<String>),
}

struct FakeTabState {
    tabs: Vec<BrowserTab>,
    windows: Vec<WindowInfo>,
    next_id: i64,
    calls: Vec<TabCall>,
    scripted: VecDeque<(Duration, Vec<BrowserTab>)>,
    fail_next_query: bool,
}

/// A browser whose tabs live in memory.
pub struct FakeTabControl {
    state: Mutex<FakeTabState>,
}

impl FakeTabControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeTabState {
                tabs: Vec::new(),
                windows: vec![WindowInfo {
                    id: 1,
                    focused: true,
                    incognito: false,
                }],
                next_id: 1000,
                calls: Vec::new(),
                scripted: VecDeque::new(),
                fail_next_query: false,
            }),
        }
    }

    pub fn open(&self, tab: BrowserTab) {
        lock(&self.state).tabs.push(tab);
    }

    pub fn tabs(&self) -> Vec<BrowserTab> {
        lock(&self.state).tabs.clone()
    }

    pub fn urls(&self) -> Vec<String> {
        lock(&self.state)
            .tabs
            .iter()
            .map(|tab| tab.url.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<TabCall> {
        lock(&self.state).calls.clone()
    }

    /// Calls other than enumerations, in order.
    pub fn mutations(&self) -> Vec<TabCall> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| !matches!(call, TabCall::Query | TabCall::ListWindows))
            .cloned()
            .collect()
    }

    pub fn query_count(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| matches!(call, TabCall::Query))
            .count()
    }

    pub fn set_windows(&self, windows: Vec<WindowInfo>) {
        lock(&self.state).windows = windows;
    }

    /// The next enumeration waits `delay` and returns `tabs` instead of the
    /// live tab list.
    pub fn script_query(&self, delay: Duration, tabs: Vec<BrowserTab>) {
        lock(&self.state).scripted.push_back((delay, tabs));
    }

    pub fn fail_next_query(&self) {
        lock(&self.state).fail_next_query = true;
    }
}

impl Default for FakeTabControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TabControl for FakeTabControl {
    async fn query_tabs(&self) -> Result<Vec<BrowserTab>> {
        let scripted = {
            let mut state = lock(&self.state);
            state.calls.push(TabCall::Query);
            if state.fail_next_query {
                state.fail_next_query = false;
                return Err(SyncError::TabControl("tabs.query failed".to_string()));
            }
            match state.scripted.pop_front() {
                Some(scripted) => scripted,
                None => return Ok(state.tabs.clone()),
            }
        };
        let (delay, tabs) = scripted;
        tokio::time::sleep(delay).await;
        Ok(tabs)
    }

    async fn create_tab(&self, request: CreateTab) -> Result<BrowserTab> {
        let mut state = lock(&self.state);
        state.calls.push(TabCall::Create(request.url.clone()));
        let id = state.next_id;
        state.next_id += 1;
        let window_id = request
            .window_id
            .or_else(|| state.windows.first().map(|window| window.id));
        let mut tab = browser_tab(id, &request.url);
        tab.window_id = window_id;
        tab.pinned = request.pinned;
        tab.active = request.active;
        state.tabs.push(tab.clone());
        Ok(tab)
    }

    async fn remove_tabs(&self, tab_ids: &[i64]) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(TabCall::Remove(tab_ids.to_vec()));
        state
            .tabs
            .retain(|tab| tab.id.map_or(true, |id| !tab_ids.contains(&id)));
        Ok(())
    }

    async fn list_windows(&self) -> Result<Vec<WindowInfo>> {
        let mut state = lock(&self.state);
        state.calls.push(TabCall::ListWindows);
        Ok(state.windows.clone())
    }

    async fn create_window(&self, urls: &[String]) -> Result<WindowInfo> {
        let mut state = lock(&self.state);
        state.calls.push(TabCall::CreateWindow(urls.to_vec()));
        let window = WindowInfo {
            id: state.windows.iter().map(|window| window.id).max().unwrap_or(0) + 1,
            focused: true,
            incognito: false,
        };
        for url in urls {
            let id = state.next_id;
            state.next_id += 1;
            let mut tab = browser_tab(id, url);
            tab.window_id = Some(window.id);
            state.tabs.push(tab);
        }
        state.windows.push(window.clone());
        Ok(window)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Document API
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    GetContext(String),
    ListContexts,
    ContextTree(String),
    SetContextUrl {
        context_id: String,
        url: String,
    },
    ListDocuments(String),
    Insert {
        context_id: String,
        urls: Vec<String>,
        bitmap: Vec<String>,
    },
    Update {
        context_id: String,
        doc_id: String,
    },
    Remove {
        context_id: String,
        doc_ids: Vec<String>,
    },
    Delete {
        context_id: String,
        doc_ids: Vec<String>,
    },
    VerifyToken,
    CreateToken(String),
}

#[derive(Default)]
struct FakeApiState {
    contexts: BTreeMap<String, Context>,
    documents: BTreeMap<String, Vec<Document>>,
    next_doc_id: u64,
    calls: Vec<ApiCall>,
    failing: HashSet<&'static str>,
    set_context_url_delay: Duration,
}

/// A document service that stores everything in memory.
///
/// Operations named in [`FakeDocumentApi::fail`] return a remote error:
/// `get_context`, `list_contexts`, `context_tree`, `set_context_url`,
/// `list_documents`, `insert`, `update`, `remove`, `delete`, `verify_token`,
/// `create_token`.
pub struct FakeDocumentApi {
    state: Mutex<FakeApiState>,
}

impl FakeDocumentApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeApiState {
                next_doc_id: 100,
                ..FakeApiState::default()
            }),
        }
    }

    pub fn add_context(&self, context: Context) {
        let key = normalize_context_id(&context.id).to_string();
        lock(&self.state).contexts.insert(key, context);
    }

    pub fn add_document(&self, context_id: &str, document: Document) {
        let key = normalize_context_id(context_id).to_string();
        lock(&self.state)
            .documents
            .entry(key)
            .or_default()
            .push(document);
    }

    pub fn add_tab_document(&self, context_id: &str, url: &str, doc_id: &str) {
        self.add_document(
            context_id,
            Document {
                id: Some(doc_id.to_string()),
                schema: TAB_SCHEMA.to_string(),
                data: json!({ "url": url, "title": url }),
            },
        );
    }

    pub fn documents(&self, context_id: &str) -> Vec<Document> {
        lock(&self.state)
            .documents
            .get(normalize_context_id(context_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn fail(&self, operation: &'static str) {
        lock(&self.state).failing.insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        lock(&self.state).failing.remove(operation);
    }

    /// Every `set_context_url` waits this long before answering.
    pub fn set_context_url_delay(&self, delay: Duration) {
        lock(&self.state).set_context_url_delay = delay;
    }

    fn begin(&self, operation: &'static str, call: ApiCall) -> Result<MutexGuard<'_, FakeApiState>> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if state.failing.contains(operation) {
            return Err(SyncError::remote(
                operation,
                ErrorInfo::new("request_failed", "injected failure"),
            ));
        }
        Ok(state)
    }
}

impl Default for FakeDocumentApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentApi for FakeDocumentApi {
    async fn get_context(&self, context_id: &str) -> Result<Context> {
        let state = self.begin("get_context", ApiCall::GetContext(context_id.to_string()))?;
        state
            .contexts
            .get(normalize_context_id(context_id))
            .cloned()
            .ok_or_else(|| {
                SyncError::remote(
                    "get_context",
                    ErrorInfo::new("not_found", format!("context {} not found", context_id)),
                )
            })
    }

    async fn list_contexts(&self) -> Result<Vec<Context>> {
        let state = self.begin("list_contexts", ApiCall::ListContexts)?;
        Ok(state.contexts.values().cloned().collect())
    }

    async fn get_context_tree(&self, context_id: &str) -> Result<Value> {
        let _state = self.begin("context_tree", ApiCall::ContextTree(context_id.to_string()))?;
        Ok(json!({ "id": "root", "children": [] }))
    }

    async fn set_context_url(&self, context_id: &str, url: &str) -> Result<Context> {
        let delay = lock(&self.state).set_context_url_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.begin(
            "set_context_url",
            ApiCall::SetContextUrl {
                context_id: context_id.to_string(),
                url: url.to_string(),
            },
        )?;
        let key = normalize_context_id(context_id).to_string();
        let entry = state
            .contexts
            .entry(key)
            .or_insert_with(|| context(context_id, url));
        entry.url = url.to_string();
        Ok(entry.clone())
    }

    async fn list_documents(&self, context_id: &str) -> Result<Vec<Document>> {
        let state = self.begin("list_documents", ApiCall::ListDocuments(context_id.to_string()))?;
        Ok(state
            .documents
            .get(normalize_context_id(context_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_documents(
        &self,
        context_id: &str,
        documents: &[DocumentInput],
        context_bitmap_array: &[String],
    ) -> Result<Vec<String>> {
        let mut state = self.begin(
            "insert",
            ApiCall::Insert {
                context_id: context_id.to_string(),
                urls: documents.iter().map(|doc| doc.data.url.clone()).collect(),
                bitmap: context_bitmap_array.to_vec(),
            },
        )?;

        let mut ids = Vec::with_capacity(documents.len());
        for document in documents {
            let id = state.next_doc_id.to_string();
            state.next_doc_id += 1;
            let data = serde_json::to_value(&document.data).map_err(|source| SyncError::Json {
                context: "fake insert".to_string(),
                source,
            })?;
            state
                .documents
                .entry(normalize_context_id(context_id).to_string())
                .or_default()
                .push(Document {
                    id: Some(id.clone()),
                    schema: document.schema.clone(),
                    data,
                });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn update_document(
        &self,
        context_id: &str,
        doc_id: &str,
        document: &DocumentInput,
    ) -> Result<()> {
        let mut state = self.begin(
            "update",
            ApiCall::Update {
                context_id: context_id.to_string(),
                doc_id: doc_id.to_string(),
            },
        )?;
        let data = serde_json::to_value(&document.data).map_err(|source| SyncError::Json {
            context: "fake update".to_string(),
            source,
        })?;
        if let Some(docs) = state.documents.get_mut(normalize_context_id(context_id)) {
            for doc in docs.iter_mut().filter(|doc| doc.id.as_deref() == Some(doc_id)) {
                doc.data = data.clone();
            }
        }
        Ok(())
    }

    async fn remove_documents(&self, context_id: &str, doc_ids: &[String]) -> Result<()> {
        let mut state = self.begin(
            "remove",
            ApiCall::Remove {
                context_id: context_id.to_string(),
                doc_ids: doc_ids.to_vec(),
            },
        )?;
        drop_documents(&mut state, context_id, doc_ids);
        Ok(())
    }

    async fn delete_documents(&self, context_id: &str, doc_ids: &[String]) -> Result<()> {
        let mut state = self.begin(
            "delete",
            ApiCall::Delete {
                context_id: context_id.to_string(),
                doc_ids: doc_ids.to_vec(),
            },
        )?;
        drop_documents(&mut state, context_id, doc_ids);
        Ok(())
    }

    async fn verify_token(&self) -> Result<bool> {
        let _state = self.begin("verify_token", ApiCall::VerifyToken)?;
        Ok(true)
    }

    async fn create_token(&self, name: &str) -> Result<String> {
        let _state = self.begin("create_token", ApiCall::CreateToken(name.to_string()))?;
        Ok(format!("token-{}", name))
    }
}

fn drop_documents(state: &mut FakeApiState, context_id: &str, doc_ids: &[String]) {
    if let Some(docs) = state.documents.get_mut(normalize_context_id(context_id)) {
        docs.retain(|doc| {
            doc.id
                .as_ref()
                .map_or(true, |id| !doc_ids.contains(id))
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Server side of one link opened through [`ChannelTransport`].
pub struct ServerEnd {
    pub from_client: mpsc::UnboundedReceiver<WireFrame>,
    pub to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerEnd {
    pub fn push(&self, event: &str, data: Value) {
        let _ = self
            .to_client
            .send(TransportEvent::Frame(WireFrame::event(event, data)));
    }

    pub fn ack(&self, id: u64, data: Value) {
        let _ = self
            .to_client
            .send(TransportEvent::Frame(WireFrame::ack(id, data)));
    }

    pub fn close(&self) {
        let _ = self.to_client.send(TransportEvent::Closed { reason: None });
    }

    pub fn fail(&self, message: &str) {
        let _ = self
            .to_client
            .send(TransportEvent::Failed(message.to_string()));
    }

    /// Frames the client has sent so far.
    pub fn drain(&mut self) -> Vec<WireFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

#[derive(Default)]
struct ChannelState {
    outcomes: VecDeque<std::result::Result<(), String>>,
    servers: VecDeque<ServerEnd>,
    opens: usize,
    open_delay: Duration,
}

/// Transport backed by in-memory channels. Opens succeed unless a failure
/// was queued with [`ChannelTransport::fail_next_open`].
#[derive(Default)]
pub struct ChannelTransport {
    state: Mutex<ChannelState>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_open(&self, message: &str) {
        lock(&self.state)
            .outcomes
            .push_back(Err(message.to_string()));
    }

    /// Every open waits this long before completing.
    pub fn set_open_delay(&self, delay: Duration) {
        lock(&self.state).open_delay = delay;
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }

    /// Oldest link not yet taken.
    pub fn take_server(&self) -> Option<ServerEnd> {
        lock(&self.state).servers.pop_front()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn open(&self, _settings: &ConnectionSettings) -> Result<TransportLink> {
        let delay = {
            let mut state = lock(&self.state);
            state.opens += 1;
            state.open_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if let Some(Err(message)) = state.outcomes.pop_front() {
            return Err(SyncError::ConnectionFailed(message));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        state.servers.push_back(ServerEnd {
            from_client,
            to_client,
        });
        Ok(TransportLink { outbound, inbound })
    }
}
