//! Tracing initialization.
//!
//! Log levels come from `QUIKNOW_LOG` or `RUST_LOG` when set
//! (e.g. `QUIKNOW_LOG=quiknow::sql=debug,info`), otherwise from
//! `[logging].level`. Output goes to stderr so stdout stays clean for the
//! JSON records printed by the CLI; a plain-text copy is appended to
//! `<dir>/quiknow.log` when `[logging].dir` is configured.

use std::fs::OpenOptions;
use std::sync::{Arc, Once};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

fn log_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env("QUIKNOW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Calling it more than once is a no-op.
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let file_layer = config.dir.as_ref().and_then(|dir| {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Failed to create log dir {}: {}", dir.display(), e);
                return None;
            }
            let path = dir.join("quiknow.log");
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(true)
                        .with_writer(Arc::new(file)),
                ),
                Err(e) => {
                    eprintln!("Failed to open log file {}: {}", path.display(), e);
                    None
                }
            }
        });

        tracing_subscriber::registry()
            .with(log_filter(config))
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(file_layer)
            .init();
    });
}
