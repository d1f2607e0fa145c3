//! One-way directory mirroring engine used by the `rmirror` tool
//!
//! A run makes a destination tree mirror a source tree:
//!
//! 1. [`lock`] takes an exclusive lock on the destination root.
//! 2. [`indexer`] walks the source while the destination [`tree`] is restored from its
//!    [`cache`] (or indexed as well when the cache is missing or stale).
//! 3. [`matcher`] merge-joins both trees into copy, update and delete queues.
//! 4. [`executor`] drains the queues (delete, then copy, then update), keeping the destination
//!    tree in sync as it goes.
//! 5. The cache is saved and the lock released.
//!
//! [`engine::Engine`] ties the steps together. Everything noteworthy that happens on the way
//! lands in a severity tagged [`messages::MessageLog`]; [`progress`] exposes the run state and
//! counters.
//!
//! # Example
//!
//! ```no_run
//! # async fn mirror() -> anyhow::Result<()> {
//! use std::sync::Arc;
//!
//! let mut settings = common::MirrorSettings::new("/home/me/photos", "/mnt/backup/photos");
//! settings.ignore = vec!["^.thumbnails$".to_string(), ".tmp$".to_string()];
//! let engine = common::Engine::new(settings, Arc::new(common::messages::MessageLog::new()));
//! let summary = engine.run().await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::EnvFilter;

pub mod cache;
pub mod config;
pub mod engine;
pub mod executor;
pub mod filecmp;
pub mod filter;
pub mod indexer;
pub mod lock;
pub mod matcher;
pub mod messages;
pub mod preserve;
pub mod progress;
pub mod tree;

mod copy;
mod rm;
mod update;

#[cfg(test)]
pub mod testutils;

pub use config::{BatchConfig, ConflictPolicy, MirrorSettings, OutputConfig, RuntimeConfig};
pub use engine::{Engine, RunError, RunSummary};
pub use progress::{ProgressSettings, ProgressType};

fn log_level(output: &OutputConfig) -> Option<Level> {
    if output.quiet {
        return None;
    }
    Some(match output.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    })
}

fn init_tracing(output: &OutputConfig) {
    let filter = match log_level(output) {
        Some(level) => EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy(),
        None => EnvFilter::new("off"),
    };
    // a second call (e.g. from tests) keeps the subscriber already installed
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Runs `func` on a fresh tokio runtime with logging set up according to `output`.
///
/// Returns the summary on success. Errors are printed to stderr (unless quiet) and turned into
/// `None`, so the caller only has to pick the exit code.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display + std::fmt::Debug,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("cannot start the tokio runtime: {error}");
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        let output = |quiet, verbose| OutputConfig {
            quiet,
            verbose,
            print_summary: false,
        };
        assert_eq!(log_level(&output(false, 0)), Some(Level::ERROR));
        assert_eq!(log_level(&output(false, 1)), Some(Level::INFO));
        assert_eq!(log_level(&output(false, 2)), Some(Level::DEBUG));
        assert_eq!(log_level(&output(false, 5)), Some(Level::TRACE));
        assert_eq!(log_level(&output(true, 3)), None);
    }

    #[test]
    fn run_reports_success_and_failure() {
        let output = OutputConfig {
            quiet: true,
            verbose: 0,
            print_summary: false,
        };
        let ok = run(output, RuntimeConfig::default(), || async {
            Ok::<_, anyhow::Error>(7)
        });
        assert_eq!(ok, Some(7));
        let failed = run(output, RuntimeConfig::default(), || async {
            Err::<u32, _>(anyhow::anyhow!("boom"))
        });
        assert_eq!(failed, None);
    }
}
