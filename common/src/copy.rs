use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::{event, instrument, Level};

use crate::executor::{lexically_within, retry, Executor, METADATA_ATTEMPTS, RETRY_DELAY};
use crate::indexer::last_change;
use crate::preserve;
use crate::progress::Category;
use crate::tree::NodeType;

/// Removes whatever `path` is (file, symlink or directory tree); absent is fine.
pub(crate) async fn remove_existing(path: &Path) -> std::io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

impl Executor {
    /// Copies one queued source entry to its destination path.
    #[instrument(skip(self))]
    pub(crate) async fn copy_entry(&self, src: &Path, dst: &Path) -> Result<()> {
        if lexically_within(&self.source_root, src).is_none() {
            return Err(anyhow!(
                "{:?} is not inside the source {:?}",
                src,
                self.source_root
            ));
        }
        let src_metadata = match tokio::fs::symlink_metadata(src).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                self.messages
                    .warning(format!("{:?} vanished before it could be copied", src));
                return Ok(());
            }
            Err(error) => {
                return Err(error).with_context(|| format!("cannot read metadata of {:?}", src));
            }
        };
        self.destination
            .set_current_entity(dst.to_string_lossy().into_owned());
        let file_type = src_metadata.file_type();
        if file_type.is_dir() {
            self.copy_directory(dst, &src_metadata).await
        } else if file_type.is_file() {
            self.copy_file(src, dst, &src_metadata).await
        } else if file_type.is_symlink() {
            self.copy_symlink(src, dst, &src_metadata).await
        } else {
            self.messages.warning(format!(
                "{:?} is a special file, copying it is not supported",
                src
            ));
            Ok(())
        }
    }

    async fn copy_directory(&self, dst: &Path, src_metadata: &std::fs::Metadata) -> Result<()> {
        match tokio::fs::symlink_metadata(dst).await {
            Ok(metadata) if metadata.is_dir() => {
                event!(Level::DEBUG, "directory {:?} already exists", dst);
            }
            Ok(_) => {
                return Err(anyhow!(
                    "cannot create directory {:?}: a file with that name already exists",
                    dst
                ));
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(dst)
                    .await
                    .with_context(|| format!("cannot create directory {:?}", dst))?;
                if let Err(error) = preserve::set_dir_times(src_metadata, dst).await {
                    self.messages.warning(format!("{:#}", error));
                }
            }
            Err(error) => {
                return Err(error).with_context(|| format!("cannot read metadata of {:?}", dst));
            }
        }
        if let Some(relative) = self.relative(dst) {
            // later copies below (and next to) it bump the times set above
            self.times_changed(&relative);
            if let Some(parent) = relative.parent() {
                self.times_changed(parent);
            }
            if self.destination.upsert(
                &relative,
                NodeType::Directory,
                0,
                last_change(src_metadata),
            ) {
                self.destination.add_directory();
            }
        }
        self.progress
            .directories_copied
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Refreshes the destination parent directory's times from the source parent.
    async fn refresh_parent_times(&self, src: &Path, dst: &Path) {
        let (Some(src_parent), Some(dst_parent)) = (src.parent(), dst.parent()) else {
            return;
        };
        let result = match tokio::fs::metadata(src_parent).await {
            Ok(metadata) => preserve::set_dir_times(&metadata, dst_parent).await,
            Err(error) => Err(error.into()),
        };
        if let Err(error) = result {
            event!(
                Level::DEBUG,
                "cannot refresh times of {:?}: {:#}",
                dst_parent,
                error
            );
        }
    }

    /// Replaces `dst` with a copy of the regular file `src`, then restores its metadata.
    /// Returns the number of bytes copied.
    ///
    /// If this fails after the old `dst` was removed, `dst` is dropped from the destination tree
    /// so the next run copies it again.
    pub(crate) async fn write_file(
        &self,
        src: &Path,
        dst: &Path,
        src_metadata: &std::fs::Metadata,
    ) -> Result<u64> {
        let result = self.replace_file(src, dst, src_metadata).await;
        if result.is_err()
            && let Err(error) = tokio::fs::symlink_metadata(dst).await
            && error.kind() == std::io::ErrorKind::NotFound
            && let Some(relative) = self.relative(dst)
        {
            event!(Level::DEBUG, "{:?} is gone after a failed write", dst);
            self.forget(&relative);
        }
        result
    }

    async fn replace_file(
        &self,
        src: &Path,
        dst: &Path,
        src_metadata: &std::fs::Metadata,
    ) -> Result<u64> {
        remove_existing(dst)
            .await
            .with_context(|| format!("cannot remove existing {:?}", dst))?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {:?}", parent))?;
        }
        let copied = tokio::fs::copy(src, dst)
            .await
            .with_context(|| format!("failed copying data from {:?} to {:?}", src, dst))?;
        self.restore_metadata(dst, src_metadata).await;
        self.refresh_parent_times(src, dst).await;
        Ok(copied)
    }

    /// Restores permissions and times on `dst`, retrying; failures are only logged.
    pub(crate) async fn restore_metadata(&self, dst: &Path, src_metadata: &std::fs::Metadata) {
        if let Err(error) = retry(METADATA_ATTEMPTS, RETRY_DELAY, || {
            preserve::set_file_metadata(src_metadata, dst)
        })
        .await
        {
            self.messages.error(format!("{:#}", error));
        }
    }

    /// Puts a freshly written non-directory entry into the destination tree. Whatever the tree
    /// still had at that path (a replacement whose delete failed) is dropped first.
    pub(crate) fn record_file(
        &self,
        dst: &Path,
        node_type: NodeType,
        length: u64,
        last_change: i64,
    ) {
        let Some(relative) = self.relative(dst) else {
            return;
        };
        self.forget(&relative);
        if self
            .destination
            .upsert(&relative, node_type, length, last_change)
        {
            self.destination.add_file(length);
        }
    }

    async fn copy_file(&self, src: &Path, dst: &Path, src_metadata: &std::fs::Metadata) -> Result<()> {
        let copied = self.write_file(src, dst, src_metadata).await?;
        self.record_file(dst, NodeType::File, src_metadata.len(), last_change(src_metadata));
        self.progress.category(Category::Copy).complete(1, copied);
        Ok(())
    }

    async fn copy_symlink(
        &self,
        src: &Path,
        dst: &Path,
        src_metadata: &std::fs::Metadata,
    ) -> Result<()> {
        let target = tokio::fs::read_link(src)
            .await
            .with_context(|| format!("cannot read symlink {:?}", src))?;
        remove_existing(dst)
            .await
            .with_context(|| format!("cannot remove existing {:?}", dst))?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {:?}", parent))?;
        }
        tokio::fs::symlink(&target, dst)
            .await
            .with_context(|| format!("cannot create symlink {:?} -> {:?}", dst, target))?;
        if let Err(error) = preserve::set_symlink_times(src_metadata, dst).await {
            self.messages.warning(format!("{:#}", error));
        }
        self.refresh_parent_times(src, dst).await;
        self.record_file(dst, NodeType::Special, 0, last_change(src_metadata));
        self.progress.category(Category::Copy).complete(1, 0);
        Ok(())
    }
}
