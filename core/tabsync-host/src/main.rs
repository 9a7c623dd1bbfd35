//! tabsync-host: native messaging host for the tabsync browser extension.
//!
//! The browser starts this binary and talks to it over stdin/stdout. The
//! extension forwards tab events and user commands, and executes the tab
//! control requests the sync runtime issues. The host exits when the
//! extension closes the pipe.

mod bridge;
mod commands;
mod logging;
mod native;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tabsync_core::{FileStore, KeyValueStore, Result, SettingsFile, StorageConfig, SyncRuntime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use bridge::{NativeBroadcaster, NativeTabControl};
use native::{IncomingMessage, OutgoingMessage};

#[derive(Parser)]
#[command(name = "tabsync-host")]
#[command(about = "Native messaging host for tabsync")]
#[command(version)]
struct Cli {
    /// Data directory (defaults to $TABSYNC_HOME or the platform data dir)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Settings file seeding connection and sync settings on first run
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Arguments added by the browser (extension origin, parent window)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    browser_args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let storage = match cli.data_dir {
        Some(dir) => StorageConfig::with_root(dir),
        None => match StorageConfig::discover() {
            Some(storage) => storage,
            None => {
                eprintln!("tabsync-host: no data directory; pass --data-dir");
                std::process::exit(1);
            }
        },
    };
    let _logging_guard = logging::init(&storage.log_dir());
    debug!(args = ?cli.browser_args, "Ignoring browser-supplied arguments");

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to start async runtime");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(storage, cli.config)) {
        error!(error = %err, "tabsync-host failed");
        std::process::exit(1);
    }
}

async fn run(storage: StorageConfig, config: Option<PathBuf>) -> Result<()> {
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&storage)?);
    seed_settings(store.as_ref(), config.unwrap_or_else(|| storage.settings_file()));

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(native::write_loop(tokio::io::stdout(), outbound_rx));

    let tabs = Arc::new(NativeTabControl::new(outbound.clone()));
    let broadcaster = Arc::new(NativeBroadcaster::new(outbound.clone()));
    let runtime = Arc::new(SyncRuntime::build(store, tabs.clone(), broadcaster)?);
    info!(root = %storage.root().display(), "tabsync-host started");

    // Startup enumerates tabs through the extension, so it must not block
    // the read loop that delivers the answers.
    {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            if let Err(err) = runtime.start().await {
                warn!(error = %err, "Runtime start failed");
            }
        });
    }

    let mut stdin = tokio::io::stdin();
    loop {
        match native::read_message(&mut stdin).await {
            Ok(Some(Ok(message))) => route(message, &runtime, &tabs, &outbound),
            Ok(Some(Err(info))) => {
                warn!(code = %info.code, message = %info.message, "Skipping extension message");
            }
            Ok(None) => {
                info!("Extension closed the pipe");
                break;
            }
            Err(err) => {
                error!(error = %err, "Reading from extension failed");
                break;
            }
        }
    }

    tabs.fail_pending();
    runtime.shutdown();
    Ok(())
}

fn seed_settings(store: &dyn KeyValueStore, path: PathBuf) {
    match SettingsFile::load(&path) {
        Ok(Some(file)) => {
            if let Err(err) = file.seed(store) {
                warn!(path = %path.display(), error = %err, "Failed to seed settings");
            }
        }
        Ok(None) => debug!(path = %path.display(), "No settings file"),
        Err(err) => warn!(error = %err, "Ignoring settings file"),
    }
}

fn route(
    message: IncomingMessage,
    runtime: &Arc<SyncRuntime>,
    tabs: &Arc<NativeTabControl>,
    outbound: &mpsc::UnboundedSender<OutgoingMessage>,
) {
    match message {
        IncomingMessage::Response {
            id,
            ok,
            data,
            error,
        } => {
            tabs.resolve(id, ok, data, error);
        }
        IncomingMessage::TabEvent { event } => {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                if let Err(err) = runtime.handle_tab_event(event).await {
                    warn!(error = %err, "Tab event handling failed");
                }
            });
        }
        IncomingMessage::Command { id, command } => {
            let runtime = runtime.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let name = command.name();
                let reply = match commands::dispatch(&runtime, command).await {
                    Ok(data) => OutgoingMessage::CommandResult {
                        id,
                        ok: true,
                        data,
                        error: None,
                    },
                    Err(err) => {
                        warn!(command = name, retryable = err.is_transient(), error = %err, "Host command failed");
                        OutgoingMessage::CommandResult {
                            id,
                            ok: false,
                            data: commands::failure_data(&err),
                            error: Some(err.to_string()),
                        }
                    }
                };
                let _ = outbound.send(reply);
            });
        }
    }
}
