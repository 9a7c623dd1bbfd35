//! Connection and sync settings, pinned-tab preferences, and the optional
//! TOML seed file.
//!
//! Settings live in the durable store. The TOML file only seeds values the
//! store does not already hold, so edits made through the extension win.

use std::collections::BTreeSet;
use std::path::Path;

use fs_err as fs;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::error::{Result, SyncError};
use crate::storage::{KeyValueStore, StoreKey};

pub const DEFAULT_CONTEXT_ID: &str = "default";

/// Where and how to reach the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub api_base_path: String,
    pub api_token: String,
    /// Context bound when nothing has been persisted yet.
    pub default_context_id: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8001,
            api_base_path: "/rest/v2".to_string(),
            api_token: String::new(),
            default_context_id: DEFAULT_CONTEXT_ID.to_string(),
        }
    }
}

impl ConnectionSettings {
    /// Rejects malformed settings before any network attempt.
    pub fn validate(&self) -> Result<()> {
        match self.protocol.as_str() {
            "http" | "https" => {}
            other => {
                return Err(SyncError::invalid_settings(
                    "protocol",
                    format!("expected http or https, got {:?}", other),
                ))
            }
        }

        let host = self.host.trim();
        if host.is_empty() {
            return Err(SyncError::invalid_settings("host", "host is required"));
        }
        if host.contains("://") || host.contains('/') || host.contains(char::is_whitespace) {
            return Err(SyncError::invalid_settings(
                "host",
                "host must be a bare hostname without scheme or path",
            ));
        }

        if self.port == 0 {
            return Err(SyncError::invalid_settings("port", "port must be non-zero"));
        }

        if !self.api_base_path.starts_with('/') {
            return Err(SyncError::invalid_settings(
                "apiBasePath",
                "path must start with '/'",
            ));
        }

        if self.api_token.trim().is_empty() {
            return Err(SyncError::invalid_settings("apiToken", "token is required"));
        }

        if self.default_context_id.trim().is_empty() {
            return Err(SyncError::invalid_settings(
                "defaultContextId",
                "context id is required",
            ));
        }

        self.server_url().map(|_| ())
    }

    pub fn server_url(&self) -> Result<Url> {
        let raw = format!("{}://{}:{}", self.protocol, self.host.trim(), self.port);
        Url::parse(&raw).map_err(|err| SyncError::invalid_settings("host", err.to_string()))
    }

    /// Absolute REST endpoint for a path relative to the API base.
    pub fn api_url(&self, path: &str) -> Result<Url> {
        let mut url = self.server_url()?;
        let base = self.api_base_path.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        url.set_path(&format!("{}/{}", base, path));
        Ok(url)
    }

    /// WebSocket endpoint of the push channel.
    pub fn socket_url(&self) -> Result<Url> {
        let scheme = if self.protocol == "https" { "wss" } else { "ws" };
        let raw = format!("{}://{}:{}/ws", scheme, self.host.trim(), self.port);
        Url::parse(&raw).map_err(|err| SyncError::invalid_settings("host", err.to_string()))
    }
}

/// What happens to open tabs that are not part of the context being entered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextChangeBehavior {
    Close,
    SaveAndClose,
    #[default]
    Keep,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Insert newly opened local tabs into the active context.
    pub auto_sync_browser_tabs: bool,
    /// Open the new context's tabs after a context switch.
    pub auto_open_canvas_tabs: bool,
    pub context_change_behavior: ContextChangeBehavior,
}

pub fn load_connection_settings(store: &dyn KeyValueStore) -> Result<Option<ConnectionSettings>> {
    store.load(StoreKey::ConnectionSettings)
}

pub fn save_connection_settings(
    store: &dyn KeyValueStore,
    settings: &ConnectionSettings,
) -> Result<()> {
    settings.validate()?;
    store.save(StoreKey::ConnectionSettings, settings)
}

pub fn load_sync_settings(store: &dyn KeyValueStore) -> SyncSettings {
    store
        .load(StoreKey::SyncSettings)
        .ok()
        .flatten()
        .unwrap_or_default()
}

pub fn save_sync_settings(store: &dyn KeyValueStore, settings: &SyncSettings) -> Result<()> {
    store.save(StoreKey::SyncSettings, settings)
}

// ─────────────────────────────────────────────────────────────────────────────
// Pinned tabs
// ─────────────────────────────────────────────────────────────────────────────

/// Urls that survive context switches regardless of sync state.
pub fn pinned_urls(store: &dyn KeyValueStore) -> BTreeSet<String> {
    store
        .load(StoreKey::PinnedTabs)
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// Adds or removes a pinned url. Returns whether the set changed.
pub fn set_pinned(store: &dyn KeyValueStore, url: &str, pinned: bool) -> Result<bool> {
    let url = url.trim();
    if url.is_empty() {
        return Err(SyncError::InvalidTab("cannot pin an empty url".to_string()));
    }

    let mut urls = pinned_urls(store);
    let changed = if pinned {
        urls.insert(url.to_string())
    } else {
        urls.remove(url)
    };
    if changed {
        store.save(StoreKey::PinnedTabs, &urls)?;
    }
    Ok(changed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Seed file
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SettingsFile {
    pub connection: Option<ConnectionSettings>,
    pub sync: Option<SyncSettings>,
}

impl SettingsFile {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SyncError::Io {
                    context: format!("reading {}", path.display()),
                    source,
                })
            }
        };

        toml::from_str(&content)
            .map(Some)
            .map_err(|err| SyncError::SettingsFile {
                path: path.to_path_buf(),
                details: err.to_string(),
            })
    }

    /// Writes file values for keys the store does not hold yet.
    pub fn seed(&self, store: &dyn KeyValueStore) -> Result<()> {
        if let Some(connection) = &self.connection {
            if load_connection_settings(store)?.is_none() {
                connection.validate()?;
                store.save(StoreKey::ConnectionSettings, connection)?;
                info!(host = %connection.host, port = connection.port, "Seeded connection settings");
            }
        }
        if let Some(sync) = &self.sync {
            if store.read(StoreKey::SyncSettings)?.is_none() {
                save_sync_settings(store, sync)?;
                info!(behavior = ?sync.context_change_behavior, "Seeded sync settings");
            }
        }
        Ok(())
    }
}
