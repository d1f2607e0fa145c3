//! Configuration types for runtime, output and mirror settings

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// What to do with a destination-only entry that still exists in the live source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
pub enum ConflictPolicy {
    /// Report a consistency error and leave the destination entry alone
    #[default]
    Skip,
    /// Report a consistency error and delete the destination entry anyway
    Delete,
}

pub const DEFAULT_REINDEX_THRESHOLD: u64 = 10;
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(600);

/// ceil(75% of available processors), at least one
#[must_use]
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    (cpus * 3).div_ceil(4).max(1)
}

/// Everything the engine needs to mirror one source tree onto one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSettings {
    /// Label used in messages and the run summary
    pub title: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Ignore patterns applied to the source tree, see [`crate::filter`]
    pub ignore: Vec<String>,
    /// Number of cache reuses after which the destination is fully reindexed
    pub reindex_threshold: u64,
    /// Minimum time between background cache saves
    pub autosave_interval: Duration,
    /// Parallelism of matching and execution (0 = 75% of available processors)
    pub max_workers: usize,
    pub conflict_policy: ConflictPolicy,
    /// Cache save attempts before giving up
    pub save_attempts: usize,
    pub save_backoff: Duration,
}

impl MirrorSettings {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let destination = destination.into();
        Self {
            title: format!("{} -> {}", source.display(), destination.display()),
            source,
            destination,
            ignore: Vec::new(),
            reindex_threshold: DEFAULT_REINDEX_THRESHOLD,
            autosave_interval: DEFAULT_AUTOSAVE_INTERVAL,
            max_workers: 0,
            conflict_policy: ConflictPolicy::default(),
            save_attempts: 10,
            save_backoff: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        if self.max_workers == 0 {
            default_workers()
        } else {
            self.max_workers
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(untagged)]
enum IgnoreList {
    #[default]
    None,
    List(Vec<String>),
    /// patterns separated by `;` or `,`
    Joined(String),
}

impl IgnoreList {
    fn patterns(&self) -> Vec<String> {
        match self {
            IgnoreList::None => Vec::new(),
            IgnoreList::List(patterns) => patterns.clone(),
            IgnoreList::Joined(joined) => joined
                .split([';', ','])
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct MirrorEntry {
    title: Option<String>,
    source: PathBuf,
    destination: PathBuf,
    #[serde(default)]
    ignore: IgnoreList,
    /// reindex threshold
    reindex: Option<u64>,
    /// auto-save interval in seconds
    autosave: Option<u64>,
    conflict_policy: Option<ConflictPolicy>,
}

/// A batch of mirrors read from a JSON file:
///
/// ```json
/// { "mirrors": [ { "title": "docs", "source": "/data/docs", "destination": "/backup/docs",
///                  "ignore": "^tmp$;.cache", "reindex": 10, "autosave": 600 } ] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    mirrors: Vec<MirrorEntry>,
}

impl BatchConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text).context("failed parsing batch config")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read batch config {path:?}"))?;
        Self::from_json(&text).with_context(|| format!("invalid batch config {path:?}"))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    /// One [`MirrorSettings`] per configured mirror; fields a mirror leaves out come from
    /// `defaults`.
    #[must_use]
    pub fn settings(&self, defaults: &MirrorSettings) -> Vec<MirrorSettings> {
        self.mirrors
            .iter()
            .map(|entry| {
                let mut settings = MirrorSettings {
                    source: entry.source.clone(),
                    destination: entry.destination.clone(),
                    ..defaults.clone()
                };
                settings.title = entry.title.clone().unwrap_or_else(|| {
                    MirrorSettings::new(&entry.source, &entry.destination).title
                });
                let mut ignore = defaults.ignore.clone();
                ignore.extend(entry.ignore.patterns());
                settings.ignore = ignore;
                if let Some(reindex) = entry.reindex {
                    settings.reindex_threshold = reindex;
                }
                if let Some(autosave) = entry.autosave {
                    settings.autosave_interval = Duration::from_secs(autosave);
                }
                if let Some(policy) = entry.conflict_policy {
                    settings.conflict_policy = policy;
                }
                settings
            })
            .collect()
    }
}
