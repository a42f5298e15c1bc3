// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use redirfs_config::LogLevel;
use tracing_subscriber::prelude::*;

/// Overrides the log filter derived from the session settings
pub const REDIRFS_LOG: &str = "REDIRFS_LOG";

/// The filter used when nothing in the environment overrides it
pub fn default_filter(level: LogLevel, debug_mode: bool) -> String {
    if debug_mode {
        return "redirfs=trace,debug".to_string();
    }
    match level {
        LogLevel::Debug => "redirfs=debug,info",
        LogLevel::Info => "redirfs=info,warn",
        LogLevel::Warning => "warn",
        LogLevel::Error => "error",
    }
    .to_string()
}

/// Send log events of this process to stderr, filtered by the
/// session log level.
///
/// `REDIRFS_LOG` replaces the default filter and `RUST_LOG` is added
/// on top of either. The host application may already have its own
/// subscriber, in which case that one is kept and false is returned.
pub fn configure_logging(level: LogLevel, debug_mode: bool) -> bool {
    let mut config = match std::env::var(REDIRFS_LOG) {
        Ok(existing) => existing,
        Err(_) => default_filter(level, debug_mode),
    };
    if let Ok(overrides) = std::env::var("RUST_LOG") {
        config.push(',');
        config.push_str(&overrides);
    }
    let env_filter = tracing_subscriber::filter::EnvFilter::from(config);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_target(debug_mode);
    let sub = tracing_subscriber::registry().with(fmt_layer.with_filter(env_filter));
    match tracing::subscriber::set_global_default(sub) {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!("keeping existing log subscriber: {err}");
            false
        }
    }
}
