//! # tabsync-core
//!
//! Keeps the tabs open in a browser in step with the tab documents stored in
//! a remote "context" on a document service.
//!
//! ## Design Principles
//!
//! - **Two maps, one registry**: local tabs and remote tab documents are both
//!   keyed by url; every delta is computed from the same locked snapshot.
//! - **Server is authoritative**: push events only trigger re-fetches, and
//!   mutations apply the server's response (document ids) to the registry.
//! - **Collaborators behind traits**: the browser ([`TabControl`]), the REST
//!   service ([`DocumentApi`]), the push channel ([`Transport`]), the UI
//!   ([`Broadcast`]) and persistence ([`KeyValueStore`]) can all be swapped.
//! - **One reconnect timer**: connection failures never stack retries.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tabsync_core::{ChannelBroadcaster, FileStore, StorageConfig, SyncRuntime};
//!
//! let storage = StorageConfig::discover().unwrap();
//! let store = Arc::new(FileStore::open(&storage)?);
//! let runtime = SyncRuntime::build(store, tabs, Arc::new(ChannelBroadcaster::new()))?;
//! runtime.start().await?;
//! ```

pub mod api;
pub mod broadcast;
pub mod connection;
pub mod context_switch;
pub mod debounce;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod runtime;
pub mod settings;
pub mod storage;
pub mod tab_control;
pub mod tab_events;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_support;

// Re-export commonly used items at crate root
pub use api::{DocumentApi, RestDocumentApi};
pub use broadcast::{announce, Broadcast, ChannelBroadcaster, NotificationLevel, UiEvent};
pub use connection::{ConnectionManager, ConnectionStatus, DocumentEventOutcome, RECONNECT_DELAY};
pub use context_switch::{ContextSwitchCoordinator, SwitchReport};
pub use error::{Result, SyncError};
pub use gateway::{bound_context, DocumentGateway};
pub use registry::{Notify, TabRegistry};
pub use runtime::{RuntimeStatus, SyncRuntime};
pub use settings::*;
pub use storage::*;
pub use tab_control::{
    is_syncable_url, normalize_browser_tab, CreateTab, TabControl, WindowInfo, BLANK_TAB_URL,
};
pub use tab_events::{BrowserTabEvent, TabEventHandler};
pub use transport::{Transport, TransportEvent, TransportLink, WebSocketTransport};
pub use types::*;
