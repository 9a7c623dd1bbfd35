//! In-memory dual index of browser and canvas tabs, keyed by url.
//!
//! The registry is the single source of truth for reconciliation. Deltas are
//! computed on demand by url set-difference and never stored.
//!
//! # Persistence
//!
//! The canvas map is hydrated from the durable store at construction and
//! rewritten in full after every canvas mutation, before the mutation
//! returns. Durability is best-effort: a failed write is logged and the
//! in-memory state stays authoritative until the next successful write.
//!
//! # Notifications
//!
//! Canvas mutations take an explicit [`Notify`] flag. `Debounced` coalesces
//! bursts into one `TabsUpdated` broadcast after a ~100ms quiet window;
//! `Silent` is for callers that follow up with a single consolidated
//! notification of their own (usually via [`TabRegistry::refresh_browser_tabs`]).
//!
//! # Overlapping refreshes
//!
//! Each enumeration takes a generation number when it is issued. An
//! enumeration that completes after a newer one has already been applied is
//! discarded instead of overwriting fresher data.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::broadcast::{announce, Broadcast, UiEvent};
use crate::debounce::Debouncer;
use crate::error::Result;
use crate::storage::{KeyValueStore, StoreKey};
use crate::tab_control::{normalize_browser_tab, TabControl};
use crate::types::{BrowserTab, CanvasTab, SyncDelta};

pub const CANVAS_NOTIFY_DELAY: Duration = Duration::from_millis(100);
pub const BROWSER_REFRESH_DELAY: Duration = Duration::from_millis(150);

/// Whether a canvas mutation schedules a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    Debounced,
    Silent,
}

#[derive(Default)]
struct TabMaps {
    browser: BTreeMap<String, BrowserTab>,
    canvas: BTreeMap<String, CanvasTab>,
    applied_refresh: u64,
}

pub struct TabRegistry {
    maps: Mutex<TabMaps>,
    store: Arc<dyn KeyValueStore>,
    tabs: Arc<dyn TabControl>,
    broadcaster: Arc<dyn Broadcast>,
    notify_debounce: Debouncer,
    refresh_debounce: Debouncer,
    issued_refresh: AtomicU64,
    weak_self: Weak<TabRegistry>,
}

impl TabRegistry {
    /// Builds the registry and hydrates the canvas map from the store.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        tabs: Arc<dyn TabControl>,
        broadcaster: Arc<dyn Broadcast>,
    ) -> Arc<Self> {
        let canvas = hydrate_canvas(store.as_ref());
        debug!(canvas_tabs = canvas.len(), "Hydrated canvas tabs from store");

        Arc::new_cyclic(|weak_self| Self {
            maps: Mutex::new(TabMaps {
                canvas,
                ..TabMaps::default()
            }),
            store,
            tabs,
            broadcaster,
            notify_debounce: Debouncer::new(CANVAS_NOTIFY_DELAY),
            refresh_debounce: Debouncer::new(BROWSER_REFRESH_DELAY),
            issued_refresh: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    fn maps(&self) -> MutexGuard<'_, TabMaps> {
        self.maps.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Browser side
    // ─────────────────────────────────────────────────────────────────────────

    pub fn upsert_browser_tab(&self, tab: BrowserTab) -> Result<()> {
        tab.validate()?;
        self.maps().browser.insert(tab.url.clone(), tab);
        Ok(())
    }

    pub fn remove_browser_tab(&self, url: &str) -> Option<BrowserTab> {
        self.maps().browser.remove(url)
    }

    /// Close events only carry the tab id, so removal can also go by id.
    pub fn remove_browser_tab_by_id(&self, tab_id: i64) -> Option<BrowserTab> {
        let mut maps = self.maps();
        let url = maps
            .browser
            .iter()
            .find(|(_, tab)| tab.id == Some(tab_id))
            .map(|(url, _)| url.clone())?;
        maps.browser.remove(&url)
    }

    /// Swaps in a whole new browser map. With `clear = false` the tabs are
    /// merged over the current map instead; either way the batch is validated
    /// up front and applied all-or-nothing.
    pub fn bulk_replace_browser_tabs(&self, tabs: Vec<BrowserTab>, clear: bool) -> Result<()> {
        for tab in &tabs {
            tab.validate()?;
        }
        let mut maps = self.maps();
        let mut next = if clear {
            BTreeMap::new()
        } else {
            maps.browser.clone()
        };
        next.extend(tabs.into_iter().map(|tab| (tab.url.clone(), tab)));
        maps.browser = next;
        Ok(())
    }

    /// Enumerates every open tab, keeps the syncable ones, swaps them in and
    /// broadcasts fresh deltas.
    ///
    /// A failed enumeration leaves the map untouched and is returned to the
    /// caller.
    pub async fn refresh_browser_tabs(&self) -> Result<()> {
        let generation = self.issued_refresh.fetch_add(1, Ordering::SeqCst) + 1;
        let enumerated = self.tabs.query_tabs().await?;
        let tabs: Vec<BrowserTab> = enumerated
            .into_iter()
            .filter_map(normalize_browser_tab)
            .collect();

        {
            let mut maps = self.maps();
            if generation < maps.applied_refresh {
                debug!(
                    generation,
                    applied = maps.applied_refresh,
                    "Discarding stale tab enumeration"
                );
            } else {
                maps.applied_refresh = generation;
                maps.browser = tabs.into_iter().map(|tab| (tab.url.clone(), tab)).collect();
            }
        }

        self.broadcast_delta();
        Ok(())
    }

    /// Coalesces bursts of refresh requests into one enumeration.
    pub fn request_browser_refresh(&self) {
        let weak = self.weak_self.clone();
        self.refresh_debounce.schedule(move || async move {
            if let Some(registry) = weak.upgrade() {
                if let Err(err) = registry.refresh_browser_tabs().await {
                    warn!(error = %err, "Debounced browser tab refresh failed");
                }
            }
        });
    }

    pub fn refresh_pending(&self) -> bool {
        self.refresh_debounce.is_pending()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Canvas side
    // ─────────────────────────────────────────────────────────────────────────

    pub fn upsert_canvas_tab(&self, tab: CanvasTab, notify: Notify) -> Result<()> {
        self.upsert_canvas_tabs(vec![tab], notify)
    }

    pub fn upsert_canvas_tabs(&self, tabs: Vec<CanvasTab>, notify: Notify) -> Result<()> {
        for tab in &tabs {
            tab.validate()?;
        }
        {
            let mut maps = self.maps();
            for tab in tabs {
                maps.canvas.insert(tab.url.clone(), tab);
            }
            self.persist_canvas(&maps.canvas);
        }
        self.after_canvas_change(notify);
        Ok(())
    }

    pub fn remove_canvas_tab(&self, url: &str, notify: Notify) -> Option<CanvasTab> {
        let removed = {
            let mut maps = self.maps();
            let removed = maps.canvas.remove(url);
            if removed.is_some() {
                self.persist_canvas(&maps.canvas);
            }
            removed
        };
        if removed.is_some() {
            self.after_canvas_change(notify);
        }
        removed
    }

    /// Swaps in a whole new canvas map (or merges over it when `clear` is
    /// false). Applying the same input twice yields the same map and the same
    /// persisted snapshot.
    pub fn bulk_replace_canvas_tabs(
        &self,
        tabs: Vec<CanvasTab>,
        clear: bool,
        notify: Notify,
    ) -> Result<()> {
        for tab in &tabs {
            tab.validate()?;
        }
        {
            let mut maps = self.maps();
            let mut next = if clear {
                BTreeMap::new()
            } else {
                maps.canvas.clone()
            };
            next.extend(tabs.into_iter().map(|tab| (tab.url.clone(), tab)));
            maps.canvas = next;
            self.persist_canvas(&maps.canvas);
        }
        self.after_canvas_change(notify);
        Ok(())
    }

    pub fn clear_canvas_tabs(&self, notify: Notify) {
        {
            let mut maps = self.maps();
            maps.canvas.clear();
            self.persist_canvas(&maps.canvas);
        }
        self.after_canvas_change(notify);
    }

    fn persist_canvas(&self, canvas: &BTreeMap<String, CanvasTab>) {
        let snapshot: Vec<&CanvasTab> = canvas.values().collect();
        if let Err(err) = self.store.save(StoreKey::CanvasTabs, &snapshot) {
            warn!(error = %err, tabs = snapshot.len(), "Failed to persist canvas tabs");
        }
    }

    fn after_canvas_change(&self, notify: Notify) {
        match notify {
            Notify::Debounced => self.schedule_delta_broadcast(),
            Notify::Silent => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    pub fn schedule_delta_broadcast(&self) {
        let weak = self.weak_self.clone();
        self.notify_debounce.schedule(move || async move {
            if let Some(registry) = weak.upgrade() {
                registry.broadcast_delta();
            }
        });
    }

    /// Broadcasts the current deltas right away.
    pub fn broadcast_delta(&self) {
        let delta = self.sync_delta();
        debug!(
            browser_to_canvas = delta.browser_to_canvas.len(),
            canvas_to_browser = delta.canvas_to_browser.len(),
            "Broadcasting tab deltas"
        );
        announce(
            self.broadcaster.as_ref(),
            UiEvent::TabsUpdated {
                browser_to_canvas: delta.browser_to_canvas,
                canvas_to_browser: delta.canvas_to_browser,
            },
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Local tabs with no canvas counterpart.
    pub fn delta_browser_to_canvas(&self) -> Vec<BrowserTab> {
        let maps = self.maps();
        url_difference(&maps.browser, &maps.canvas)
    }

    /// Canvas tabs not currently open locally.
    pub fn delta_canvas_to_browser(&self) -> Vec<CanvasTab> {
        let maps = self.maps();
        url_difference(&maps.canvas, &maps.browser)
    }

    pub fn sync_delta(&self) -> SyncDelta {
        let maps = self.maps();
        SyncDelta {
            browser_to_canvas: url_difference(&maps.browser, &maps.canvas),
            canvas_to_browser: url_difference(&maps.canvas, &maps.browser),
        }
    }

    /// Local tabs that already have a canvas counterpart.
    pub fn synced_browser_tabs(&self) -> Vec<BrowserTab> {
        let maps = self.maps();
        url_intersection(&maps.browser, &maps.canvas)
    }

    /// Canvas tabs that are currently open locally.
    pub fn opened_canvas_tabs(&self) -> Vec<CanvasTab> {
        let maps = self.maps();
        url_intersection(&maps.canvas, &maps.browser)
    }

    pub fn browser_tabs(&self) -> Vec<BrowserTab> {
        self.maps().browser.values().cloned().collect()
    }

    pub fn canvas_tabs(&self) -> Vec<CanvasTab> {
        self.maps().canvas.values().cloned().collect()
    }

    pub fn browser_tab(&self, url: &str) -> Option<BrowserTab> {
        self.maps().browser.get(url).cloned()
    }

    pub fn canvas_tab(&self, url: &str) -> Option<CanvasTab> {
        self.maps().canvas.get(url).cloned()
    }

    pub fn canvas_urls(&self) -> BTreeSet<String> {
        self.maps().canvas.keys().cloned().collect()
    }

    /// Reverse lookup used when a tab object does not carry its document id.
    pub fn doc_id_for_url(&self, url: &str) -> Option<String> {
        self.maps()
            .canvas
            .get(url)
            .and_then(|tab| tab.doc_id.clone())
    }
}

fn hydrate_canvas(store: &dyn KeyValueStore) -> BTreeMap<String, CanvasTab> {
    let stored: Vec<CanvasTab> = match store.load(StoreKey::CanvasTabs) {
        Ok(stored) => stored.unwrap_or_default(),
        Err(err) => {
            warn!(error = %err, "Failed to read cached canvas tabs; starting empty");
            Vec::new()
        }
    };

    stored
        .into_iter()
        .filter(|tab| match tab.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Dropping invalid cached canvas tab");
                false
            }
        })
        .map(|tab| (tab.url.clone(), tab))
        .collect()
}

/// Entries of `left` whose url is absent from `right`.
pub fn url_difference<L: Clone, R>(
    left: &BTreeMap<String, L>,
    right: &BTreeMap<String, R>,
) -> Vec<L> {
    left.iter()
        .filter(|(url, _)| !right.contains_key(*url))
        .map(|(_, tab)| tab.clone())
        .collect()
}

/// Entries of `left` whose url is present in `right`.
pub fn url_intersection<L: Clone, R>(
    left: &BTreeMap<String, L>,
    right: &BTreeMap<String, R>,
) -> Vec<L> {
    left.iter()
        .filter(|(url, _)| right.contains_key(*url))
        .map(|(_, tab)| tab.clone())
        .collect()
}
