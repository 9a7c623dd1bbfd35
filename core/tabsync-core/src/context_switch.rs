//! Re-synchronization when the bound context changes.
//!
//! The switch persists the new context first so passive listeners see it
//! immediately, then reloads both sides of the registry and applies the
//! configured policy to open tabs. Failures after the context is persisted
//! are collected into the report and surfaced as a notification; nothing is
//! rolled back, the next refresh or reconnect corrects any leftovers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tabsync_protocol::same_context_id;
use tracing::{debug, info, warn};

use crate::broadcast::{announce, Broadcast, NotificationLevel, UiEvent};
use crate::error::{Result, SyncError};
use crate::gateway::{bound_context, DocumentGateway};
use crate::registry::{Notify, TabRegistry};
use crate::settings::{load_sync_settings, pinned_urls, ContextChangeBehavior, SyncSettings};
use crate::storage::{KeyValueStore, StoreKey};
use crate::tab_control::{CreateTab, TabControl, BLANK_TAB_URL};
use crate::types::{BrowserTab, Context};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchReport {
    pub context_id: String,
    /// Tab documents found in the new context.
    pub remote_tabs: usize,
    pub archived: usize,
    pub closed: Vec<String>,
    pub opened: Vec<String>,
    pub failures: Vec<String>,
}

impl SwitchReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ContextSwitchCoordinator {
    gateway: Arc<DocumentGateway>,
    tabs: Arc<dyn TabControl>,
    store: Arc<dyn KeyValueStore>,
    broadcaster: Arc<dyn Broadcast>,
    /// Context id and url of a url switch waiting on the service.
    pending_url: Mutex<Option<(String, String)>>,
}

impl ContextSwitchCoordinator {
    pub fn new(
        gateway: Arc<DocumentGateway>,
        tabs: Arc<dyn TabControl>,
        store: Arc<dyn KeyValueStore>,
        broadcaster: Arc<dyn Broadcast>,
    ) -> Self {
        Self {
            gateway,
            tabs,
            store,
            broadcaster,
            pending_url: Mutex::new(None),
        }
    }

    fn registry(&self) -> &Arc<TabRegistry> {
        self.gateway.registry()
    }

    fn pending_url(&self) -> MutexGuard<'_, Option<(String, String)>> {
        self.pending_url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Points the active context at `url` remotely, then switches to it.
    pub async fn switch_context_url(&self, url: &str) -> Result<SwitchReport> {
        let url = url.trim();
        if url.is_empty() {
            return Err(SyncError::InvalidTab("context url is empty".to_string()));
        }
        let active = self.gateway.active_context()?;
        *self.pending_url() = Some((active.id.clone(), url.to_string()));

        let result = match self.gateway.set_context_url(&active.id, url).await {
            Ok(updated) => self.switch_context(updated).await,
            Err(err) => Err(err),
        };
        *self.pending_url() = None;
        result
    }

    /// Switch driven by the service: a pushed url change or a context found
    /// moved on reconnect. Returns `None` when `next` is already bound at the
    /// same url, or is the target of a url switch still in flight here.
    pub async fn apply_remote_update(&self, next: Context) -> Result<Option<SwitchReport>> {
        if self.already_targeted(&next) {
            debug!(context_id = %next.id, url = %next.url, "Remote context update already applied");
            return Ok(None);
        }
        self.switch_context(next).await.map(Some)
    }

    fn already_targeted(&self, next: &Context) -> bool {
        let bound = bound_context(self.store.as_ref())
            .map_or(false, |bound| bound.same_scope(next) && bound.url == next.url);
        let pending = self.pending_url().as_ref().map_or(false, |(id, url)| {
            same_context_id(id, &next.id) && *url == next.url
        });
        bound || pending
    }

    /// Binds `next` and reconciles local tabs with its document set.
    ///
    /// Only a failure to persist the new context is returned as an error.
    pub async fn switch_context(&self, next: Context) -> Result<SwitchReport> {
        next.validate()?;
        let settings = load_sync_settings(self.store.as_ref());
        let mut report = SwitchReport {
            context_id: next.id.clone(),
            ..SwitchReport::default()
        };

        let previous = bound_context(self.store.as_ref());
        let previous_canvas = match settings.context_change_behavior {
            ContextChangeBehavior::SaveAndClose => self.registry().canvas_urls(),
            _ => BTreeSet::new(),
        };

        if let Some(previous) = &previous {
            if let Err(err) = self.store.save(StoreKey::PreviousContext, previous) {
                warn!(error = %err, "Failed to persist previous context");
            }
        }
        self.store.save(StoreKey::ActiveContext, &next)?;
        announce(
            self.broadcaster.as_ref(),
            UiEvent::ContextChanged {
                context: next.clone(),
            },
        );
        info!(
            from = previous.as_ref().map(|context| context.url.as_str()).unwrap_or(""),
            to = %next.url,
            context_id = %next.id,
            "Switching context"
        );

        if let Err(err) = self.registry().refresh_browser_tabs().await {
            warn!(error = %err, "Browser refresh before context switch failed");
            report.failures.push(format!("refresh browser tabs: {}", err));
        }

        self.load_remote_tabs(&next, &mut report).await;
        let pinned = pinned_urls(self.store.as_ref());
        self.apply_policy(&settings, previous.as_ref(), &previous_canvas, &pinned, &mut report)
            .await;
        if settings.auto_open_canvas_tabs {
            self.open_missing(&pinned, &mut report).await;
        }

        self.finish(&next, &report);
        Ok(report)
    }

    async fn load_remote_tabs(&self, next: &Context, report: &mut SwitchReport) {
        let registry = self.registry();
        match self.gateway.fetch_context_tabs(&next.id).await {
            Ok(tabs) if !tabs.is_empty() => {
                report.remote_tabs = tabs.len();
                if let Err(err) = registry.bulk_replace_canvas_tabs(tabs, true, Notify::Silent) {
                    warn!(error = %err, "Rejected context tab set");
                    report.failures.push(format!("load context tabs: {}", err));
                    registry.clear_canvas_tabs(Notify::Silent);
                }
            }
            Ok(_) => registry.clear_canvas_tabs(Notify::Silent),
            Err(err) => {
                warn!(context_id = %next.id, error = %err, "Failed to fetch context tabs");
                report.failures.push(format!("fetch context tabs: {}", err));
                registry.clear_canvas_tabs(Notify::Silent);
            }
        }

        if let Err(err) = registry.refresh_browser_tabs().await {
            warn!(error = %err, "Browser refresh after loading context tabs failed");
            report.failures.push(format!("refresh browser tabs: {}", err));
            registry.broadcast_delta();
        }
    }

    async fn apply_policy(
        &self,
        settings: &SyncSettings,
        previous: Option<&Context>,
        previous_canvas: &BTreeSet<String>,
        pinned: &BTreeSet<String>,
        report: &mut SwitchReport,
    ) {
        let behavior = settings.context_change_behavior;
        if behavior == ContextChangeBehavior::Keep {
            return;
        }

        let leaving: Vec<BrowserTab> = self
            .registry()
            .delta_browser_to_canvas()
            .into_iter()
            .filter(|tab| !pinned.contains(&tab.url))
            .collect();
        if leaving.is_empty() {
            return;
        }

        if behavior == ContextChangeBehavior::SaveAndClose {
            let Some(previous) = previous else {
                warn!("No previous context to archive into; leaving tabs open");
                report
                    .failures
                    .push("archive tabs: no previous context".to_string());
                return;
            };
            let unsaved: Vec<BrowserTab> = leaving
                .iter()
                .filter(|tab| !previous_canvas.contains(&tab.url))
                .cloned()
                .collect();
            match self.gateway.archive_tabs(previous, &unsaved).await {
                Ok(count) => report.archived = count,
                Err(err) => {
                    warn!(error = %err, "Archiving tabs failed; leaving them open");
                    report.failures.push(format!("archive tabs: {}", err));
                    return;
                }
            }
        }

        self.close_tabs(&leaving, report).await;
    }

    /// Closes `tabs`, opening a blank tab first in any window they would
    /// otherwise leave empty.
    async fn close_tabs(&self, tabs: &[BrowserTab], report: &mut SwitchReport) {
        let ids: BTreeSet<i64> = tabs.iter().filter_map(|tab| tab.id).collect();
        let open = match self.tabs.query_tabs().await {
            Ok(open) => open,
            Err(err) => {
                warn!(error = %err, "Cannot enumerate tabs; skipping close");
                report.failures.push(format!("close tabs: {}", err));
                return;
            }
        };

        for window_id in windows_emptied_by(&open, &ids) {
            let request = CreateTab {
                window_id,
                ..CreateTab::background(BLANK_TAB_URL)
            };
            if let Err(err) = self.tabs.create_tab(request).await {
                warn!(error = %err, "Failed to open placeholder tab; skipping close");
                report.failures.push(format!("open placeholder tab: {}", err));
                return;
            }
        }

        let ids: Vec<i64> = ids.into_iter().collect();
        match self.tabs.remove_tabs(&ids).await {
            Ok(()) => {
                for tab in tabs {
                    self.registry().remove_browser_tab(&tab.url);
                    report.closed.push(tab.url.clone());
                }
                debug!(closed = ids.len(), "Closed tabs outside the new context");
            }
            Err(err) => {
                warn!(error = %err, "Failed to close tabs");
                report.failures.push(format!("close tabs: {}", err));
            }
        }
    }

    async fn open_missing(&self, pinned: &BTreeSet<String>, report: &mut SwitchReport) {
        let urls: Vec<String> = self
            .registry()
            .delta_canvas_to_browser()
            .into_iter()
            .map(|tab| tab.url)
            .filter(|url| !pinned.contains(url))
            .collect();
        if urls.is_empty() {
            return;
        }

        let windows = match self.tabs.list_windows().await {
            Ok(windows) => windows,
            Err(err) => {
                report.failures.push(format!("list windows: {}", err));
                return;
            }
        };

        if windows.is_empty() {
            match self.tabs.create_window(&urls).await {
                Ok(_) => report.opened.extend(urls),
                Err(err) => report.failures.push(format!("open window: {}", err)),
            }
            return;
        }

        for url in urls {
            match self.tabs.create_tab(CreateTab::background(url.clone())).await {
                Ok(_) => report.opened.push(url),
                Err(err) => {
                    warn!(url = %url, error = %err, "Failed to open context tab");
                    report.failures.push(format!("open {}: {}", url, err));
                }
            }
        }
    }

    fn finish(&self, next: &Context, report: &SwitchReport) {
        let event = if report.succeeded() {
            info!(
                context_id = %next.id,
                remote_tabs = report.remote_tabs,
                closed = report.closed.len(),
                opened = report.opened.len(),
                archived = report.archived,
                "Context switch complete"
            );
            UiEvent::notification(
                NotificationLevel::Success,
                format!("Switched to {}", display_context(next)),
            )
        } else {
            warn!(context_id = %next.id, failures = ?report.failures, "Context switch completed with errors");
            UiEvent::notification(
                NotificationLevel::Error,
                format!(
                    "Switched to {} with errors: {}",
                    display_context(next),
                    report.failures.join("; ")
                ),
            )
        };
        announce(self.broadcaster.as_ref(), event);
        self.registry().request_browser_refresh();
    }
}

fn display_context(context: &Context) -> &str {
    if context.url.is_empty() {
        &context.id
    } else {
        &context.url
    }
}

/// Windows whose every tab is in `closing`. Tabs without a window id count as
/// one shared window.
fn windows_emptied_by(open: &[BrowserTab], closing: &BTreeSet<i64>) -> Vec<Option<i64>> {
    let mut windows: BTreeMap<Option<i64>, bool> = BTreeMap::new();
    for tab in open {
        let closes = tab.id.map_or(false, |id| closing.contains(&id));
        let emptied = windows.entry(tab.window_id).or_insert(true);
        *emptied &= closes;
    }
    windows
        .into_iter()
        .filter(|(_, emptied)| *emptied)
        .map(|(window_id, _)| window_id)
        .collect()
}
