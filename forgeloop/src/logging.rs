//! Diagnostic tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`. Warnings go to
//!   stderr; with a log file, `info` and up are appended there as well.
//!
//! - **Product output**: menus, resume instructions and JSON envelopes are
//!   written through [`crate::io::terminal::Terminal`] and stdout, never
//!   through tracing. Per-task event logs live in
//!   `.forgeloop/workspaces/<ws>/tasks/<id>/log.jsonl`.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing::warn;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: OnceLock<()> = OnceLock::new();

/// Initialize the process-wide subscriber. Later calls are no-ops.
///
/// `RUST_LOG` overrides both filters. If `log_path` cannot be opened the
/// subscriber runs console-only and says so once.
///
/// # Example
/// ```bash
/// RUST_LOG=forgeloop=debug forgeloop resume my-feature
/// ```
pub fn init(log_path: Option<&Path>) {
    INIT.get_or_init(|| {
        let console_filter = env_filter("warn");
        let console = fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_filter(console_filter);

        let (file, failure) = match log_path.map(open_log_file) {
            Some(Ok(file)) => (Some(file), None),
            Some(Err(err)) => (None, Some(err)),
            None => (None, None),
        };
        let file_layer = file.map(|file| {
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(env_filter("info"))
        });

        let installed = tracing_subscriber::registry()
            .with(console)
            .with(file_layer)
            .try_init()
            .is_ok();
        if installed && let Some(err) = failure {
            warn!(err = %err, "log file unavailable; logging to console only");
        }
    });
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
