//! Tracing setup for embedding applications.
//!
//! The ledger only emits `tracing` events; a host that already runs its
//! own subscriber needs nothing from here. [`init`] is for hosts without
//! one: stderr output, plus an optional JSON line log on disk for
//! post-mortems of sync sessions.
//!
//! Filter precedence: an explicit directive from the host wins, then
//! `RUST_LOG`, then [`default_directive`].

use std::fs::File;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::{Mutex, Once};

use anyhow::Result;
use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// The level directive applied when the host passes none and `RUST_LOG`
/// is unset.
#[must_use]
pub fn default_directive() -> &'static str {
    if cfg!(debug_assertions) {
        "update_ledger=debug"
    } else {
        "update_ledger=info"
    }
}

fn level_filter(directive: Option<&str>) -> EnvFilter {
    directive.map_or_else(
        || match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(value) if !value.is_empty() => EnvFilter::new(value),
            _ => EnvFilter::new(default_directive()),
        },
        EnvFilter::new,
    )
}

/// Build the ledger's subscriber without installing it.
///
/// Split out from [`init`] so a host embedding several subsystems can
/// compose it, and so tests can scope it with
/// `tracing::subscriber::with_default`.
///
/// # Errors
///
/// Returns an error if the JSON log file cannot be created.
pub fn subscriber(
    directive: Option<&str>,
    json_log: Option<&Path>,
) -> Result<impl Subscriber + Send + Sync> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());

    // a JSON sink is only worth the handle when the host asked for one
    let json_layer = json_log
        .map(File::create)
        .transpose()?
        .map(|file| fmt::layer().json().with_ansi(false).with_writer(Mutex::new(file)));

    Ok(tracing_subscriber::registry()
        .with(level_filter(directive))
        .with(stderr_layer)
        .with(json_layer))
}

/// Install the ledger's subscriber as the global default.
///
/// # Errors
///
/// Returns an error if the JSON log file cannot be created or another
/// subscriber is already installed.
pub fn init(directive: Option<&str>, json_log: Option<&Path>) -> Result<()> {
    tracing::subscriber::set_global_default(subscriber(directive, json_log)?)?;
    Ok(())
}

/// Route events through the capture-aware test writer. Safe to call from
/// every test; only the first call installs anything.
pub fn init_test_logging() {
    static INSTALL: Once = Once::new();

    INSTALL.call_once(|| {
        let _ = fmt()
            .with_env_filter(EnvFilter::new("update_ledger=debug"))
            .with_test_writer()
            .try_init();
    });
}
