//! Applies the queued work to the destination
//!
//! The three phases run strictly one after another (delete, copy, update), each one fully
//! drained before the next starts. Within a phase items run concurrently, bounded by the worker
//! count. Every item is removed from its queue once handled, successfully or not; per-item
//! failures go to the message log and never stop the phase.

use anyhow::Result;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{event, Level};

use crate::cache::CacheStore;
use crate::messages::MessageLog;
use crate::matcher::WorkQueues;
use crate::preserve;
use crate::progress::{Progress, RunState};
use crate::tree::TreeIndex;

pub const DELETE_ATTEMPTS: usize = 5;
pub const METADATA_ATTEMPTS: usize = 10;
pub const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Runs `op` up to `attempts` times, sleeping `delay` between failed attempts.
pub async fn retry<T, E, F, Fut>(attempts: usize, delay: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts => {
                tracing::debug!("attempt {}/{} failed: {}", attempt, attempts, error);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

fn normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            other => normalized.push(other),
        }
    }
    Some(normalized)
}

/// The path of `path` relative to `root` if, after resolving `.` and `..` lexically, it lies
/// strictly below `root`.
#[must_use]
pub fn lexically_within(root: &Path, path: &Path) -> Option<PathBuf> {
    let root = normalize(root)?;
    let path = normalize(path)?;
    let relative = path.strip_prefix(&root).ok()?;
    if relative.as_os_str().is_empty() {
        return None;
    }
    Some(relative.to_owned())
}

#[derive(Debug)]
struct Autosave {
    store: Arc<CacheStore>,
    interval: Duration,
}

#[derive(Debug)]
pub struct Executor {
    pub(crate) source_root: PathBuf,
    pub(crate) destination_root: PathBuf,
    pub(crate) destination: Arc<TreeIndex>,
    pub(crate) queues: Arc<WorkQueues>,
    pub(crate) progress: Arc<Progress>,
    pub(crate) messages: Arc<MessageLog>,
    max_width: usize,
    autosave: Option<Autosave>,
    // relative paths of destination directories whose times must match the source again
    stale_times: Mutex<BTreeSet<PathBuf>>,
}

impl Executor {
    pub fn new(
        source_root: &Path,
        destination_root: &Path,
        destination: Arc<TreeIndex>,
        queues: Arc<WorkQueues>,
        progress: Arc<Progress>,
        messages: Arc<MessageLog>,
        max_width: usize,
    ) -> Self {
        Self {
            source_root: source_root.to_owned(),
            destination_root: destination_root.to_owned(),
            destination,
            queues,
            progress,
            messages,
            max_width: max_width.max(1),
            autosave: None,
            stale_times: Mutex::new(BTreeSet::new()),
        }
    }

    /// Checks for a due background cache save after every handled item.
    #[must_use]
    pub fn with_autosave(mut self, store: Arc<CacheStore>, interval: Duration) -> Self {
        self.autosave = Some(Autosave { store, interval });
        self
    }

    /// Path of a destination entry relative to the destination root, if it is inside it.
    pub(crate) fn relative(&self, dst: &Path) -> Option<PathBuf> {
        lexically_within(&self.destination_root, dst)
    }

    /// Drops a destination entry (and its sub-tree) from the tree and its counters.
    pub(crate) fn forget(&self, relative: &Path) {
        if let Some(removed) = self.destination.remove(relative) {
            self.destination.subtract(&removed);
        }
    }

    /// Marks a destination directory (relative path, empty for the root) for a times refresh
    /// once the copy phase is done.
    pub(crate) fn times_changed(&self, relative: &Path) {
        self.stale_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(relative.to_owned());
    }

    /// Sets the times of every marked directory from its source counterpart, deepest first.
    ///
    /// Creating or removing entries bumps a directory's modification time, so this only runs
    /// once nothing is created or removed concurrently any more.
    pub async fn restore_directory_times(&self) {
        let mut directories: Vec<PathBuf> =
            std::mem::take(&mut *self.stale_times.lock().unwrap_or_else(PoisonError::into_inner))
                .into_iter()
                .collect();
        directories.sort_by_key(|relative| std::cmp::Reverse(relative.components().count()));
        for relative in directories {
            let (src, dst) = (
                self.source_root.join(&relative),
                self.destination_root.join(&relative),
            );
            let src_metadata = match tokio::fs::metadata(&src).await {
                Ok(metadata) if metadata.is_dir() => metadata,
                Ok(_) => continue,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    event!(Level::DEBUG, "{:?} is gone, times of {:?} left as is", src, dst);
                    continue;
                }
                Err(error) => {
                    self.messages
                        .warning(format!("cannot read metadata of {:?}: {}", src, error));
                    continue;
                }
            };
            if let Err(error) = preserve::set_dir_times(&src_metadata, &dst).await {
                self.messages.warning(format!("{:#}", error));
            }
        }
    }

    fn checkpoint(&self) {
        if let Some(autosave) = &self.autosave {
            autosave
                .store
                .autosave_check(&self.destination, autosave.interval, &self.messages);
        }
    }

    async fn drain<T, F, Fut>(self: &Arc<Self>, items: Vec<T>, work: F) -> Result<()>
    where
        F: Fn(Arc<Self>, T) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut join_set = tokio::task::JoinSet::new();
        for item in items {
            if join_set.len() >= self.max_width
                && let Some(res) = join_set.join_next().await
            {
                res?;
            }
            join_set.spawn(work(self.clone(), item));
        }
        while let Some(res) = join_set.join_next().await {
            res?;
        }
        Ok(())
    }

    pub async fn delete_phase(self: &Arc<Self>) -> Result<()> {
        let items = self.queues.delete_items();
        self.drain(items, |executor, item| async move {
            if let Err(error) = executor.delete_entry(&item).await {
                executor.messages.error(format!("{:#}", error));
            }
            executor.queues.remove_delete(&item.path);
            executor.checkpoint();
        })
        .await
    }

    pub async fn copy_phase(self: &Arc<Self>) -> Result<()> {
        let items = self.queues.copy_items();
        self.drain(items, |executor, (src, dst)| async move {
            if let Err(error) = executor.copy_entry(&src, &dst).await {
                executor.messages.error(format!("{:#}", error));
            }
            executor.queues.remove_copy(&src);
            executor.checkpoint();
        })
        .await?;
        self.restore_directory_times().await;
        Ok(())
    }

    pub async fn update_phase(self: &Arc<Self>) -> Result<()> {
        let items = self.queues.update_items();
        self.drain(items, |executor, (src, dst)| async move {
            if let Err(error) = executor.update_entry(&src, &dst).await {
                executor.messages.error(format!("{:#}", error));
            }
            executor.queues.remove_update(&src);
            executor.checkpoint();
        })
        .await
    }

    /// Runs delete, copy and update, advancing the run state before each.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.progress.advance(RunState::Delete);
        self.delete_phase().await?;
        self.progress.advance(RunState::Copy);
        self.copy_phase().await?;
        self.progress.advance(RunState::Update);
        self.update_phase().await?;
        self.destination.set_current_entity(String::new());
        Ok(())
    }
}
