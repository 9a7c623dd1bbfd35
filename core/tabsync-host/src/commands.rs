//! User actions forwarded by the extension UI.

use serde::Deserialize;
use serde_json::{json, Value};
use tabsync_core::{CanvasTab, ConnectionSettings, Result, SyncError, SyncRuntime, SyncSettings};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostCommand {
    SyncAllBrowserTabs,
    OpenAllCanvasTabs,
    RemoveCanvasTab { url: String },
    DeleteCanvasTab { url: String },
    RemoveCanvasTabs { urls: Vec<String> },
    DeleteCanvasTabs { urls: Vec<String> },
    UpdateCanvasTab { tab: CanvasTab },
    CloseBrowserTab { url: String },
    SwitchContextUrl { url: String },
    SwitchContext { context_id: String },
    ListContexts,
    GetContextTree,
    VerifyToken,
    CreateToken { name: String },
    UpdateConnectionSettings { settings: ConnectionSettings },
    UpdateSyncSettings { settings: SyncSettings },
    PinUrl { url: String },
    UnpinUrl { url: String },
    ForceReconnect,
    SetAutoReconnect { enabled: bool },
    RefreshBrowserTabs,
    GetStatus,
    GetSettings,
}

impl HostCommand {
    pub fn name(&self) -> &'static str {
        match self {
            HostCommand::SyncAllBrowserTabs => "syncAllBrowserTabs",
            HostCommand::OpenAllCanvasTabs => "openAllCanvasTabs",
            HostCommand::RemoveCanvasTab { .. } => "removeCanvasTab",
            HostCommand::DeleteCanvasTab { .. } => "deleteCanvasTab",
            HostCommand::RemoveCanvasTabs { .. } => "removeCanvasTabs",
            HostCommand::DeleteCanvasTabs { .. } => "deleteCanvasTabs",
            HostCommand::UpdateCanvasTab { .. } => "updateCanvasTab",
            HostCommand::CloseBrowserTab { .. } => "closeBrowserTab",
            HostCommand::SwitchContextUrl { .. } => "switchContextUrl",
            HostCommand::SwitchContext { .. } => "switchContext",
            HostCommand::ListContexts => "listContexts",
            HostCommand::GetContextTree => "getContextTree",
            HostCommand::VerifyToken => "verifyToken",
            HostCommand::CreateToken { .. } => "createToken",
            HostCommand::UpdateConnectionSettings { .. } => "updateConnectionSettings",
            HostCommand::UpdateSyncSettings { .. } => "updateSyncSettings",
            HostCommand::PinUrl { .. } => "pinUrl",
            HostCommand::UnpinUrl { .. } => "unpinUrl",
            HostCommand::ForceReconnect => "forceReconnect",
            HostCommand::SetAutoReconnect { .. } => "setAutoReconnect",
            HostCommand::RefreshBrowserTabs => "refreshBrowserTabs",
            HostCommand::GetStatus => "getStatus",
            HostCommand::GetSettings => "getSettings",
        }
    }
}

/// Runs one command against the runtime and returns its JSON result.
pub async fn dispatch(runtime: &SyncRuntime, command: HostCommand) -> Result<Value> {
    info!(command = command.name(), "Host command");
    match command {
        HostCommand::SyncAllBrowserTabs => {
            let inserted = runtime.sync_all_browser_tabs().await?;
            Ok(json!({ "inserted": inserted }))
        }
        HostCommand::OpenAllCanvasTabs => {
            let opened = runtime.open_all_canvas_tabs().await?;
            Ok(json!({ "opened": opened }))
        }
        HostCommand::RemoveCanvasTab { url } => {
            runtime.remove_canvas_tab(&url).await?;
            Ok(Value::Null)
        }
        HostCommand::DeleteCanvasTab { url } => {
            runtime.delete_canvas_tab(&url).await?;
            Ok(Value::Null)
        }
        HostCommand::RemoveCanvasTabs { urls } => {
            runtime.remove_canvas_tabs(&urls).await?;
            Ok(Value::Null)
        }
        HostCommand::DeleteCanvasTabs { urls } => {
            runtime.delete_canvas_tabs(&urls).await?;
            Ok(Value::Null)
        }
        HostCommand::UpdateCanvasTab { tab } => to_json(&runtime.update_canvas_tab(tab).await?),
        HostCommand::CloseBrowserTab { url } => {
            runtime.close_browser_tab(&url).await?;
            Ok(Value::Null)
        }
        HostCommand::SwitchContextUrl { url } => {
            to_json(&runtime.switch_context_url(&url).await?)
        }
        HostCommand::SwitchContext { context_id } => {
            to_json(&runtime.switch_context(&context_id).await?)
        }
        HostCommand::ListContexts => to_json(&runtime.list_contexts().await?),
        HostCommand::GetContextTree => runtime.context_tree().await,
        HostCommand::VerifyToken => Ok(json!({ "valid": runtime.verify_token().await? })),
        HostCommand::CreateToken { name } => {
            Ok(json!({ "token": runtime.create_token(&name).await? }))
        }
        HostCommand::UpdateConnectionSettings { settings } => {
            runtime.update_connection_settings(settings).await?;
            Ok(Value::Null)
        }
        HostCommand::UpdateSyncSettings { settings } => {
            runtime.update_sync_settings(settings)?;
            Ok(Value::Null)
        }
        HostCommand::PinUrl { url } => Ok(json!({ "changed": runtime.pin_url(&url)? })),
        HostCommand::UnpinUrl { url } => Ok(json!({ "changed": runtime.unpin_url(&url)? })),
        HostCommand::ForceReconnect => {
            runtime.force_reconnect().await?;
            Ok(Value::Null)
        }
        HostCommand::SetAutoReconnect { enabled } => {
            runtime.set_auto_reconnect(enabled);
            Ok(Value::Null)
        }
        HostCommand::RefreshBrowserTabs => {
            runtime.refresh_browser_tabs().await?;
            Ok(Value::Null)
        }
        HostCommand::GetStatus => to_json(&runtime.status()),
        HostCommand::GetSettings => {
            let mut connection = runtime.connection_settings();
            // Never echo the token back to the page.
            connection.api_token = mask_token(&connection.api_token);
            Ok(json!({
                "connection": connection,
                "sync": runtime.sync_settings(),
            }))
        }
    }
}

/// Extra detail sent with a failed command so the page can offer a retry.
pub fn failure_data(err: &SyncError) -> Value {
    json!({ "retryable": err.is_transient() })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|source| SyncError::Json {
        context: "encoding command result".to_string(),
        source,
    })
}

fn mask_token(token: &str) -> String {
    if token.is_empty() {
        String::new()
    } else {
        "********".to_string()
    }
}
