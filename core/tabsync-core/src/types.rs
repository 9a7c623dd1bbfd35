//! Tab projections shared by the registry, gateway and coordinator.
//!
//! Url is the only join key between the local and remote projections: local
//! tab ids do not survive a browser restart and document ids only exist once
//! the service has stored the tab.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub use tabsync_protocol::{Context, MutedInfo, TabData};

pub const UNTITLED_PLACEHOLDER: &str = "Untitled";
pub const FAVICON_PLACEHOLDER: &str = "icons/default-favicon.png";

/// A tab currently open in a local window.
///
/// Field names follow the browser's tab object so the extension can forward
/// tabs without reshaping them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserTab {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub window_id: Option<i64>,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub fav_icon_url: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub highlighted: bool,
    #[serde(default)]
    pub discarded: bool,
    #[serde(default)]
    pub incognito: bool,
    #[serde(default)]
    pub muted_info: Option<MutedInfo>,
}

impl BrowserTab {
    /// Rejects tabs that cannot be indexed: both the session id and the url
    /// are required.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_none() {
            return Err(SyncError::InvalidTab(format!(
                "tab for {} has no id",
                display_url(&self.url)
            )));
        }
        if self.url.trim().is_empty() {
            return Err(SyncError::InvalidTab(format!(
                "tab {} has no url",
                self.id.unwrap_or_default()
            )));
        }
        Ok(())
    }

    pub fn display_title(&self) -> &str {
        non_empty(self.title.as_deref()).unwrap_or(UNTITLED_PLACEHOLDER)
    }

    pub fn display_favicon(&self) -> &str {
        non_empty(self.fav_icon_url.as_deref()).unwrap_or(FAVICON_PLACEHOLDER)
    }

    /// Document payload describing this tab.
    pub fn to_tab_data(&self) -> TabData {
        TabData {
            url: self.url.clone(),
            title: non_empty(self.title.as_deref()).map(str::to_string),
            fav_icon_url: non_empty(self.fav_icon_url.as_deref()).map(str::to_string),
            pinned: self.pinned,
            discarded: self.discarded,
            muted_info: self.muted_info.clone(),
            id: self.id,
        }
    }
}

/// Local projection of a tab document stored by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasTab {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub fav_icon_url: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub discarded: bool,
    #[serde(default)]
    pub muted_info: Option<MutedInfo>,
    /// Browser tab id recorded when the document was written.
    #[serde(default)]
    pub id: Option<i64>,
    /// Server-assigned document id; absent until the service stores the tab.
    #[serde(default)]
    pub doc_id: Option<String>,
}

impl CanvasTab {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            fav_icon_url: None,
            pinned: false,
            discarded: false,
            muted_info: None,
            id: None,
            doc_id: None,
        }
    }

    pub fn with_doc_id(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    pub fn from_browser(tab: &BrowserTab) -> Self {
        Self::from_tab_data(tab.to_tab_data(), None)
    }

    pub fn from_tab_data(data: TabData, doc_id: Option<String>) -> Self {
        Self {
            url: data.url,
            title: data.title,
            fav_icon_url: data.fav_icon_url,
            pinned: data.pinned,
            discarded: data.discarded,
            muted_info: data.muted_info,
            id: data.id,
            doc_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(SyncError::InvalidTab(format!(
                "canvas tab {} has no url",
                self.doc_id.as_deref().unwrap_or("<unsaved>")
            )));
        }
        Ok(())
    }

    pub fn display_title(&self) -> &str {
        non_empty(self.title.as_deref()).unwrap_or(UNTITLED_PLACEHOLDER)
    }

    pub fn display_favicon(&self) -> &str {
        non_empty(self.fav_icon_url.as_deref()).unwrap_or(FAVICON_PLACEHOLDER)
    }

    pub fn to_tab_data(&self) -> TabData {
        TabData {
            url: self.url.clone(),
            title: self.title.clone(),
            fav_icon_url: self.fav_icon_url.clone(),
            pinned: self.pinned,
            discarded: self.discarded,
            muted_info: self.muted_info.clone(),
            id: self.id,
        }
    }
}

/// Url set-differences between the local and remote projections.
///
/// Derived on demand and never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDelta {
    /// Local tabs with no remote counterpart.
    pub browser_to_canvas: Vec<BrowserTab>,
    /// Remote tabs not currently open locally.
    pub canvas_to_browser: Vec<CanvasTab>,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.browser_to_canvas.is_empty() && self.canvas_to_browser.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn display_url(url: &str) -> &str {
    if url.trim().is_empty() {
        "<no url>"
    } else {
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: Option<i64>, url: &str) -> BrowserTab {
        BrowserTab {
            id,
            window_id: Some(1),
            index: None,
            url: url.to_string(),
            title: None,
            fav_icon_url: Some("   ".to_string()),
            pinned: false,
            active: false,
            highlighted: false,
            discarded: false,
            incognito: false,
            muted_info: None,
        }
    }

    #[test]
    fn browser_tab_requires_id_and_url() {
        assert!(tab(None, "https://a.com").validate().is_err());
        assert!(tab(Some(1), " ").validate().is_err());
        assert!(tab(Some(1), "https://a.com").validate().is_ok());
    }

    #[test]
    fn missing_display_fields_degrade_to_placeholders() {
        let tab = tab(Some(1), "https://a.com");
        assert_eq!(tab.display_title(), UNTITLED_PLACEHOLDER);
        assert_eq!(tab.display_favicon(), FAVICON_PLACEHOLDER);
        assert_eq!(tab.to_tab_data().fav_icon_url, None);
    }

    #[test]
    fn canvas_tab_keeps_browser_display_fields() {
        let mut browser = tab(Some(9), "https://a.com");
        browser.title = Some("A".to_string());
        browser.pinned = true;

        let canvas = CanvasTab::from_browser(&browser);
        assert_eq!(canvas.url, "https://a.com");
        assert_eq!(canvas.title.as_deref(), Some("A"));
        assert!(canvas.pinned);
        assert_eq!(canvas.id, Some(9));
        assert_eq!(canvas.doc_id, None);
    }

    #[test]
    fn browser_tab_deserializes_from_extension_shape() {
        let tab: BrowserTab = serde_json::from_value(serde_json::json!({
            "id": 12,
            "windowId": 3,
            "url": "https://a.com",
            "favIconUrl": "https://a.com/favicon.ico",
            "mutedInfo": {"muted": true, "reason": "user"}
        }))
        .unwrap();
        assert_eq!(tab.window_id, Some(3));
        assert_eq!(tab.muted_info.map(|info| info.muted), Some(true));
    }
}
