//! Local tab-control collaborator.
//!
//! The core never touches browser windows directly; it calls through
//! [`TabControl`], which the host implements over its extension channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::Result;
use crate::types::BrowserTab;

/// Url opened when closing tabs would otherwise leave no tab at all.
pub const BLANK_TAB_URL: &str = "about:blank";

/// Schemes that never leave the local browser.
const NON_SYNCABLE_SCHEMES: &[&str] = &[
    "about",
    "blob",
    "brave",
    "chrome",
    "chrome-extension",
    "chrome-search",
    "chrome-untrusted",
    "data",
    "devtools",
    "edge",
    "file",
    "javascript",
    "moz-extension",
    "opera",
    "vivaldi",
    "view-source",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTab {
    pub url: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<i64>,
}

impl CreateTab {
    pub fn background(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            active: false,
            pinned: false,
            window_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowInfo {
    pub id: i64,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub incognito: bool,
}

#[async_trait]
pub trait TabControl: Send + Sync {
    /// Every open tab in every window, including non-syncable ones.
    async fn query_tabs(&self) -> Result<Vec<BrowserTab>>;
    async fn create_tab(&self, request: CreateTab) -> Result<BrowserTab>;
    async fn remove_tabs(&self, tab_ids: &[i64]) -> Result<()>;
    async fn list_windows(&self) -> Result<Vec<WindowInfo>>;
    async fn create_window(&self, urls: &[String]) -> Result<WindowInfo>;
}

pub fn is_syncable_url(url: &str) -> bool {
    match Url::parse(url.trim()) {
        Ok(parsed) => !NON_SYNCABLE_SCHEMES.contains(&parsed.scheme()),
        Err(_) => false,
    }
}

/// Prepares an enumerated tab for the registry. Tabs that cannot be synced,
/// or lack an id, are dropped.
pub fn normalize_browser_tab(mut tab: BrowserTab) -> Option<BrowserTab> {
    tab.url = tab.url.trim().to_string();
    if !is_syncable_url(&tab.url) {
        return None;
    }
    if tab.id.is_none() {
        debug!(url = %tab.url, "Skipping enumerated tab without id");
        return None;
    }
    tab.title = tab
        .title
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty());
    tab.fav_icon_url = tab.fav_icon_url.filter(|icon| !icon.trim().is_empty());
    Some(tab)
}
