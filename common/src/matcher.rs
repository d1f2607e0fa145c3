//! Merge-diff of a source tree against a destination tree
//!
//! Both trees keep their children sorted by name, so each directory level is compared with a
//! single linear merge-join. Every name found on either side gets exactly one
//! [`Classification`]; the resulting work lands in the shared [`WorkQueues`]. Sibling
//! directories present on both sides are compared concurrently once their parent level is done.

use anyhow::Result;
use async_recursion::async_recursion;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{event, instrument, Level};

use crate::config::ConflictPolicy;
use crate::filter::IgnoreFilter;
use crate::messages::MessageLog;
use crate::progress::{Category, Progress};
use crate::tree::{Node, NodeType};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Classification {
    /// only in the source
    Copy,
    /// only in the destination
    Delete,
    /// files on both sides with different length or last change
    Update,
    /// directories on both sides
    Recurse,
    /// different types on both sides, or special files that changed
    Replace,
    Unchanged,
}

#[must_use]
pub fn classify(source: Option<&Node>, destination: Option<&Node>) -> Classification {
    match (source, destination) {
        (Some(_), None) => Classification::Copy,
        (None, Some(_)) => Classification::Delete,
        (Some(src), Some(dst)) => {
            if src.node_type != dst.node_type {
                return Classification::Replace;
            }
            let changed = src.last_change != dst.last_change || src.length != dst.length;
            match src.node_type {
                NodeType::Directory => Classification::Recurse,
                NodeType::File if changed => Classification::Update,
                NodeType::Special if changed => Classification::Replace,
                _ => Classification::Unchanged,
            }
        }
        (None, None) => Classification::Unchanged,
    }
}

pub type Pair<'a> = (Option<&'a Arc<Node>>, Option<&'a Arc<Node>>);

/// Pairs up two name-sorted child lists; names present on one side only are paired with `None`.
#[must_use]
pub fn merge_join<'a>(source: &'a [Arc<Node>], destination: &'a [Arc<Node>]) -> Vec<Pair<'a>> {
    let mut pairs = Vec::with_capacity(source.len().max(destination.len()));
    let (mut src_pos, mut dst_pos) = (0, 0);
    while src_pos < source.len() || dst_pos < destination.len() {
        match (source.get(src_pos), destination.get(dst_pos)) {
            (Some(src), Some(dst)) => match src.name.cmp(&dst.name) {
                std::cmp::Ordering::Less => {
                    pairs.push((Some(src), None));
                    src_pos += 1;
                }
                std::cmp::Ordering::Greater => {
                    pairs.push((None, Some(dst)));
                    dst_pos += 1;
                }
                std::cmp::Ordering::Equal => {
                    pairs.push((Some(src), Some(dst)));
                    src_pos += 1;
                    dst_pos += 1;
                }
            },
            (Some(src), None) => {
                pairs.push((Some(src), None));
                src_pos += 1;
            }
            (None, Some(dst)) => {
                pairs.push((None, Some(dst)));
                dst_pos += 1;
            }
            (None, None) => break,
        }
    }
    pairs
}

/// A destination entry to delete, together with its resolved path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteItem {
    pub path: PathBuf,
    pub node: Arc<Node>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Work produced by matching and consumed by execution.
///
/// Copy and update map source paths to destination paths. Items are removed by the executor
/// once handled.
#[derive(Debug, Default)]
pub struct WorkQueues {
    copy: Mutex<BTreeMap<PathBuf, PathBuf>>,
    update: Mutex<BTreeMap<PathBuf, PathBuf>>,
    delete: Mutex<Vec<DeleteItem>>,
}

impl WorkQueues {
    pub fn push_copy(&self, src: PathBuf, dst: PathBuf) {
        lock(&self.copy).insert(src, dst);
    }

    pub fn push_update(&self, src: PathBuf, dst: PathBuf) {
        lock(&self.update).insert(src, dst);
    }

    pub fn push_delete(&self, item: DeleteItem) {
        lock(&self.delete).push(item);
    }

    #[must_use]
    pub fn copy_items(&self) -> Vec<(PathBuf, PathBuf)> {
        lock(&self.copy)
            .iter()
            .map(|(src, dst)| (src.clone(), dst.clone()))
            .collect()
    }

    #[must_use]
    pub fn update_items(&self) -> Vec<(PathBuf, PathBuf)> {
        lock(&self.update)
            .iter()
            .map(|(src, dst)| (src.clone(), dst.clone()))
            .collect()
    }

    #[must_use]
    pub fn delete_items(&self) -> Vec<DeleteItem> {
        lock(&self.delete).clone()
    }

    pub fn remove_copy(&self, src: &Path) {
        lock(&self.copy).remove(src);
    }

    pub fn remove_update(&self, src: &Path) {
        lock(&self.update).remove(src);
    }

    pub fn remove_delete(&self, path: &Path) {
        lock(&self.delete).retain(|item| item.path != path);
    }

    /// Number of queued (copy, update, delete) items.
    #[must_use]
    pub fn lens(&self) -> (usize, usize, usize) {
        (
            lock(&self.copy).len(),
            lock(&self.update).len(),
            lock(&self.delete).len(),
        )
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lens() == (0, 0, 0)
    }
}

type DirectoryPair = (PathBuf, Arc<Node>, PathBuf, Arc<Node>);

#[derive(Debug)]
pub struct Matcher {
    source_root: PathBuf,
    filter: Option<Arc<IgnoreFilter>>,
    conflict_policy: ConflictPolicy,
    queues: Arc<WorkQueues>,
    progress: Arc<Progress>,
    messages: Arc<MessageLog>,
    permits: Arc<tokio::sync::Semaphore>,
    max_width: usize,
}

impl Matcher {
    pub fn new(
        source_root: &Path,
        filter: Option<Arc<IgnoreFilter>>,
        conflict_policy: ConflictPolicy,
        queues: Arc<WorkQueues>,
        progress: Arc<Progress>,
        messages: Arc<MessageLog>,
        max_width: usize,
    ) -> Self {
        let max_width = max_width.max(1);
        Self {
            source_root: source_root.to_owned(),
            filter,
            conflict_policy,
            queues,
            progress,
            messages,
            permits: Arc::new(tokio::sync::Semaphore::new(max_width)),
            max_width,
        }
    }

    /// Queues a copy of `node`; directories are expanded into their full contents so that
    /// empty directories get created too.
    fn enqueue_copy(&self, src: PathBuf, dst: PathBuf, node: &Node) {
        if node.is_dir() {
            self.progress
                .directories_to_copy
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            for child in node.children() {
                self.enqueue_copy(src.join(&child.name), dst.join(&child.name), child);
            }
        } else {
            self.progress.category(Category::Copy).queue(1, node.length);
        }
        self.queues.push_copy(src, dst);
    }

    fn enqueue_delete(&self, path: PathBuf, node: &Arc<Node>) {
        self.progress
            .category(Category::Delete)
            .queue(node.files_recursive(), node.size_recursive());
        self.queues.push_delete(DeleteItem {
            path,
            node: node.clone(),
        });
    }

    /// True if the live source still has an entry the source tree does not know about.
    fn still_in_source(&self, src: &Path) -> bool {
        match std::fs::symlink_metadata(src) {
            Ok(metadata) => !self.filter.as_ref().is_some_and(|filter| {
                filter.is_ignored(&self.source_root, src, metadata.is_dir())
            }),
            Err(_) => false,
        }
    }

    /// Classifies one directory level, returning the sub-directory pairs still to compare.
    fn merge_level(
        &self,
        src_path: &Path,
        source: &Node,
        dst_path: &Path,
        destination: &Node,
    ) -> Vec<DirectoryPair> {
        let mut subdirs = Vec::new();
        for (src, dst) in merge_join(source.children(), destination.children()) {
            let classification = classify(src.map(|n| n.as_ref()), dst.map(|n| n.as_ref()));
            match (classification, src, dst) {
                (Classification::Copy, Some(src), _) => {
                    self.enqueue_copy(src_path.join(&src.name), dst_path.join(&src.name), src);
                }
                (Classification::Delete, _, Some(dst)) => {
                    let live_src = src_path.join(&dst.name);
                    let target = dst_path.join(&dst.name);
                    if self.still_in_source(&live_src) {
                        self.messages.error(format!(
                            "consistency check failed: {:?} would be deleted, but {:?} still exists in source",
                            &target, &live_src
                        ));
                        if self.conflict_policy == ConflictPolicy::Skip {
                            continue;
                        }
                    }
                    self.enqueue_delete(target, dst);
                }
                (Classification::Update, Some(src), Some(_)) => {
                    self.progress.category(Category::Update).queue(1, src.length);
                    self.queues
                        .push_update(src_path.join(&src.name), dst_path.join(&src.name));
                }
                (Classification::Replace, Some(src), Some(dst)) => {
                    event!(Level::DEBUG, "replacing {:?} in {:?}", &dst.name, dst_path);
                    self.enqueue_delete(dst_path.join(&dst.name), dst);
                    self.enqueue_copy(src_path.join(&src.name), dst_path.join(&src.name), src);
                }
                (Classification::Recurse, Some(src), Some(dst)) => subdirs.push((
                    src_path.join(&src.name),
                    src.clone(),
                    dst_path.join(&dst.name),
                    dst.clone(),
                )),
                _ => {}
            }
        }
        subdirs
    }

    #[async_recursion]
    async fn match_directory(
        matcher: Arc<Self>,
        src_path: PathBuf,
        source: Arc<Node>,
        dst_path: PathBuf,
        destination: Arc<Node>,
    ) -> Result<()> {
        let permit = matcher.permits.clone().acquire_owned().await?;
        let subdirs = {
            let matcher = matcher.clone();
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                matcher.merge_level(&src_path, &source, &dst_path, &destination)
            })
            .await?
        };
        let mut join_set = tokio::task::JoinSet::new();
        for (src_path, source, dst_path, destination) in subdirs {
            if join_set.len() >= matcher.max_width
                && let Some(res) = join_set.join_next().await
            {
                res??;
            }
            let matcher = matcher.clone();
            let do_match = || async move {
                Self::match_directory(matcher, src_path, source, dst_path, destination).await
            };
            join_set.spawn(do_match());
        }
        while let Some(res) = join_set.join_next().await {
            res??;
        }
        Ok(())
    }

    /// Compares the two trees rooted at `source` and `destination`, filling the queues.
    #[instrument(skip(self, source, destination))]
    pub async fn run(
        self: &Arc<Self>,
        src_path: &Path,
        source: Arc<Node>,
        dst_path: &Path,
        destination: Arc<Node>,
    ) -> Result<()> {
        Self::match_directory(
            self.clone(),
            src_path.to_owned(),
            source,
            dst_path.to_owned(),
            destination,
        )
        .await
    }
}
