//! Browser tab lifecycle events forwarded by the extension.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::gateway::{bound_context, DocumentGateway};
use crate::registry::TabRegistry;
use crate::settings::load_sync_settings;
use crate::storage::KeyValueStore;
use crate::tab_control::normalize_browser_tab;
use crate::types::BrowserTab;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BrowserTabEvent {
    Created { tab: BrowserTab },
    Updated { tab: BrowserTab },
    Removed { tab_id: i64 },
    Activated {
        tab_id: i64,
        #[serde(default)]
        window_id: Option<i64>,
    },
    Moved { tab_id: i64 },
    WindowFocusChanged { window_id: i64 },
}

impl BrowserTabEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BrowserTabEvent::Created { .. } => "created",
            BrowserTabEvent::Updated { .. } => "updated",
            BrowserTabEvent::Removed { .. } => "removed",
            BrowserTabEvent::Activated { .. } => "activated",
            BrowserTabEvent::Moved { .. } => "moved",
            BrowserTabEvent::WindowFocusChanged { .. } => "windowFocusChanged",
        }
    }
}

pub struct TabEventHandler {
    gateway: Arc<DocumentGateway>,
    store: Arc<dyn KeyValueStore>,
}

impl TabEventHandler {
    pub fn new(gateway: Arc<DocumentGateway>, store: Arc<dyn KeyValueStore>) -> Self {
        Self { gateway, store }
    }

    fn registry(&self) -> &Arc<TabRegistry> {
        self.gateway.registry()
    }

    /// Applies one event to the registry. Every event, failed or not, ends
    /// with a debounced refresh so the registry converges on the real tab
    /// list.
    pub async fn handle(&self, event: BrowserTabEvent) -> Result<()> {
        debug!(kind = event.kind(), "Browser tab event");
        let result = match event {
            BrowserTabEvent::Created { tab } | BrowserTabEvent::Updated { tab } => {
                self.track(tab).await
            }
            BrowserTabEvent::Removed { tab_id } => {
                self.registry().remove_browser_tab_by_id(tab_id);
                Ok(())
            }
            BrowserTabEvent::Activated { .. }
            | BrowserTabEvent::Moved { .. }
            | BrowserTabEvent::WindowFocusChanged { .. } => Ok(()),
        };
        self.registry().request_browser_refresh();
        result
    }

    async fn track(&self, tab: BrowserTab) -> Result<()> {
        let Some(tab_id) = tab.id else {
            debug!(url = %tab.url, "Ignoring tab event without tab id");
            return Ok(());
        };

        // A navigated tab keeps its id; drop the entry under its old url.
        self.registry().remove_browser_tab_by_id(tab_id);
        let Some(tab) = normalize_browser_tab(tab) else {
            return Ok(());
        };
        self.registry().upsert_browser_tab(tab.clone())?;

        if !load_sync_settings(self.store.as_ref()).auto_sync_browser_tabs {
            return Ok(());
        }
        if self.registry().canvas_tab(&tab.url).is_some() {
            return Ok(());
        }
        let Some(context) = bound_context(self.store.as_ref()) else {
            debug!(url = %tab.url, "No bound context; skipping auto-sync");
            return Ok(());
        };

        if let Err(err) = self.gateway.insert_tab(&context, &tab).await {
            warn!(url = %tab.url, error = %err, "Auto-sync of browser tab failed");
            return Err(err);
        }
        Ok(())
    }
}
