//! Run coordinator
//!
//! One [`Engine`] mirrors one source onto one destination. A run takes the destination lock,
//! builds both trees (the destination preferably from its cache), matches them, executes the
//! queued work and finally saves the cache and releases the lock, whatever happened in between.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{event, instrument, Level};

use crate::cache::{CacheError, CacheStore, LoadOutcome};
use crate::config::MirrorSettings;
use crate::executor::Executor;
use crate::filter::{FilterError, IgnoreFilter};
use crate::indexer::index_tree;
use crate::lock::{LockError, RunLock};
use crate::matcher::{Matcher, WorkQueues};
use crate::messages::{MessageLog, Severity};
use crate::progress::{Category, Progress, ProgressPrinter, RunState};
use crate::tree::TreeIndex;

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("{title}: invalid ignore pattern")]
    Filter {
        title: String,
        #[source]
        source: FilterError,
    },
    #[error("{title}: cannot create destination {path:?}")]
    Destination {
        title: String,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{title}: cannot lock destination")]
    Lock {
        title: String,
        #[source]
        source: LockError,
    },
    #[error("{title}: run failed")]
    Pipeline {
        title: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub source_files: u64,
    pub source_size: u64,
    pub destination_files: u64,
    pub destination_size: u64,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub directories_copied: u64,
    pub files_updated: u64,
    pub bytes_updated: u64,
    pub files_deleted: u64,
    pub bytes_deleted: u64,
    pub errors: usize,
}

impl std::ops::Add for RunSummary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            source_files: self.source_files + other.source_files,
            source_size: self.source_size + other.source_size,
            destination_files: self.destination_files + other.destination_files,
            destination_size: self.destination_size + other.destination_size,
            files_copied: self.files_copied + other.files_copied,
            bytes_copied: self.bytes_copied + other.bytes_copied,
            directories_copied: self.directories_copied + other.directories_copied,
            files_updated: self.files_updated + other.files_updated,
            bytes_updated: self.bytes_updated + other.bytes_updated,
            files_deleted: self.files_deleted + other.files_deleted,
            bytes_deleted: self.bytes_deleted + other.bytes_deleted,
            errors: self.errors + other.errors,
        }
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "source: {} files, {}\n\
            destination: {} files, {}\n\
            files copied: {} ({})\n\
            directories copied: {}\n\
            files updated: {} ({})\n\
            files deleted: {} ({})\n\
            errors: {}",
            self.source_files,
            bytesize::ByteSize(self.source_size),
            self.destination_files,
            bytesize::ByteSize(self.destination_size),
            self.files_copied,
            bytesize::ByteSize(self.bytes_copied),
            self.directories_copied,
            self.files_updated,
            bytesize::ByteSize(self.bytes_updated),
            self.files_deleted,
            bytesize::ByteSize(self.bytes_deleted),
            self.errors,
        )
    }
}

#[derive(Debug)]
pub struct Engine {
    settings: MirrorSettings,
    source: Arc<TreeIndex>,
    destination: Arc<TreeIndex>,
    progress: Arc<Progress>,
    messages: Arc<MessageLog>,
    queues: Arc<WorkQueues>,
    cache: Arc<CacheStore>,
    // set once the destination tree is complete, before that saving would clobber the cache
    destination_ready: AtomicBool,
}

impl Engine {
    pub fn new(settings: MirrorSettings, messages: Arc<MessageLog>) -> Self {
        let cache = CacheStore::new(
            &settings.destination,
            settings.save_attempts,
            settings.save_backoff,
        );
        Self {
            source: Arc::new(TreeIndex::new(&settings.source)),
            destination: Arc::new(TreeIndex::new(&settings.destination)),
            progress: Arc::new(Progress::new()),
            queues: Arc::new(WorkQueues::default()),
            cache: Arc::new(cache),
            destination_ready: AtomicBool::new(false),
            messages,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &MirrorSettings {
        &self.settings
    }

    #[must_use]
    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    #[must_use]
    pub fn messages(&self) -> &Arc<MessageLog> {
        &self.messages
    }

    #[must_use]
    pub fn queues(&self) -> &Arc<WorkQueues> {
        &self.queues
    }

    #[must_use]
    pub fn source(&self) -> &Arc<TreeIndex> {
        &self.source
    }

    #[must_use]
    pub fn destination(&self) -> &Arc<TreeIndex> {
        &self.destination
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    #[must_use]
    pub fn printer(&self) -> ProgressPrinter {
        ProgressPrinter::new(
            self.progress.clone(),
            self.source.clone(),
            self.destination.clone(),
        )
    }

    fn filter(&self) -> Result<Option<Arc<IgnoreFilter>>, RunError> {
        if self.settings.ignore.is_empty() {
            return Ok(None);
        }
        let filter = IgnoreFilter::new(&self.settings.ignore).map_err(|source| RunError::Filter {
            title: self.settings.title.clone(),
            source,
        })?;
        Ok(Some(Arc::new(filter)))
    }

    /// Saves the destination cache right away, blocking. Does nothing until the destination
    /// tree has been fully built.
    pub fn save_cache_now(&self) -> Result<bool, CacheError> {
        if !self.destination_ready.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.cache.save(&self.destination)
    }

    async fn save_cache(&self) {
        if !self.destination_ready.load(Ordering::Acquire) {
            event!(Level::DEBUG, "destination tree incomplete, cache not saved");
            return;
        }
        let cache = self.cache.clone();
        let destination = self.destination.clone();
        match tokio::task::spawn_blocking(move || cache.save(&destination)).await {
            Ok(Ok(true)) => self
                .messages
                .verbose(format!("saved cache {:?}", self.cache.primary())),
            Ok(Ok(false)) => {}
            Ok(Err(error)) => self.messages.error(format!(
                "cannot save cache: {:#}",
                anyhow::Error::from(error)
            )),
            Err(error) => self
                .messages
                .error(format!("cache save task failed: {}", error)),
        }
    }

    /// Restores the destination tree from its cache, reindexing when there is no usable
    /// cache or it was reused too often.
    async fn load_destination(&self) -> Result<()> {
        let cache = self.cache.clone();
        let index = self.destination.clone();
        let messages = self.messages.clone();
        let threshold = self.settings.reindex_threshold;
        let outcome =
            tokio::task::spawn_blocking(move || cache.load(&index, threshold, &messages)).await?;
        match outcome {
            LoadOutcome::Loaded { reuse_count } => {
                event!(Level::DEBUG, "destination cache reused {} times", reuse_count);
            }
            LoadOutcome::Stale { .. } | LoadOutcome::Missing => {
                index_tree(
                    &self.settings.destination,
                    self.destination.clone(),
                    None,
                    self.messages.clone(),
                    self.settings.workers(),
                )
                .await?;
            }
        }
        self.destination_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn build_trees(&self, filter: Option<Arc<IgnoreFilter>>) -> Result<()> {
        let source = index_tree(
            &self.settings.source,
            self.source.clone(),
            filter,
            self.messages.clone(),
            self.settings.workers(),
        );
        let (source, destination) = tokio::join!(source, self.load_destination());
        source.with_context(|| format!("indexing source {:?} failed", self.settings.source))?;
        destination.with_context(|| {
            format!(
                "building destination tree {:?} failed",
                self.settings.destination
            )
        })?;
        Ok(())
    }

    async fn pipeline(&self, filter: Option<Arc<IgnoreFilter>>) -> Result<()> {
        self.progress.advance(RunState::Scan);
        self.build_trees(filter.clone()).await?;
        self.save_cache().await;
        self.progress.advance(RunState::Match);
        let matcher = Arc::new(Matcher::new(
            &self.settings.source,
            filter,
            self.settings.conflict_policy,
            self.queues.clone(),
            self.progress.clone(),
            self.messages.clone(),
            self.settings.workers(),
        ));
        matcher
            .run(
                &self.settings.source,
                self.source.root(),
                &self.settings.destination,
                self.destination.root(),
            )
            .await
            .context("matching failed")?;
        let (copy, update, delete) = self.queues.lens();
        self.messages.info(format!(
            "{}: {} to copy, {} to update, {} to delete",
            self.settings.title, copy, update, delete
        ));
        let executor = Arc::new(
            Executor::new(
                &self.settings.source,
                &self.settings.destination,
                self.destination.clone(),
                self.queues.clone(),
                self.progress.clone(),
                self.messages.clone(),
                self.settings.workers(),
            )
            .with_autosave(self.cache.clone(), self.settings.autosave_interval),
        );
        executor.run().await
    }

    #[must_use]
    pub fn summary(&self) -> RunSummary {
        let copy = self.progress.category(Category::Copy).get();
        let update = self.progress.category(Category::Update).get();
        let delete = self.progress.category(Category::Delete).get();
        RunSummary {
            source_files: self.source.files(),
            source_size: self.source.size().max(0) as u64,
            destination_files: self.destination.files(),
            destination_size: self.destination.size().max(0) as u64,
            files_copied: copy.files_done,
            bytes_copied: copy.bytes_done,
            directories_copied: self.progress.directories_copied.load(Ordering::Relaxed),
            files_updated: update.files_done,
            bytes_updated: update.bytes_done,
            files_deleted: delete.files_done,
            bytes_deleted: delete.bytes_done,
            errors: self.messages.count(Severity::Error) + self.messages.count(Severity::Critical),
        }
    }

    async fn finish(&self, lock: RunLock) -> RunSummary {
        let summary = self.summary();
        self.messages.info(format!("{} finished", self.settings.title));
        self.messages.info(format!(
            "source: {} files, {}",
            summary.source_files,
            bytesize::ByteSize(summary.source_size)
        ));
        self.messages.info(format!(
            "destination: {} files, {}",
            summary.destination_files,
            bytesize::ByteSize(summary.destination_size)
        ));
        self.messages.info(format!(
            "copied: {}, updated: {}, deleted: {}",
            summary.files_copied, summary.files_updated, summary.files_deleted
        ));
        self.cache.wait_autosave().await;
        self.save_cache().await;
        drop(lock);
        self.destination.set_current_entity(String::new());
        self.progress.advance(RunState::Done);
        summary
    }

    /// Runs the whole pipeline once.
    ///
    /// Fails without touching anything if the destination cannot be locked. Any later failure
    /// is logged, the cache is still saved and the lock released before the error is returned.
    #[instrument(skip(self), fields(title = %self.settings.title))]
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let title = self.settings.title.clone();
        let filter = self.filter()?;
        let destination = &self.settings.destination;
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|source| RunError::Destination {
                title: title.clone(),
                path: destination.clone(),
                source,
            })?;
        let lock = match RunLock::acquire(destination) {
            Ok(lock) => lock,
            Err(source) => {
                self.messages.critical(format!("{}: {}", title, source));
                return Err(RunError::Lock { title, source });
            }
        };
        self.messages.info(format!("{} started", title));
        let result = self.pipeline(filter).await;
        if let Err(error) = &result {
            self.messages.error(format!("{}: {:#}", title, error));
        }
        let summary = self.finish(lock).await;
        match result {
            Ok(()) => Ok(summary),
            Err(error) => Err(RunError::Pipeline {
                title,
                source: error.into(),
            }),
        }
    }
}
