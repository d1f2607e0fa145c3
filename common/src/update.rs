use anyhow::{Context, Result};
use std::path::Path;
use tracing::{event, instrument, Level};

use crate::executor::Executor;
use crate::filecmp;
use crate::indexer::last_change;
use crate::progress::Category;
use crate::tree::NodeType;

async fn regular_file(path: &Path) -> Result<Option<std::fs::Metadata>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error).with_context(|| format!("cannot read metadata of {:?}", path)),
    }
}

impl Executor {
    /// Brings an existing destination file in line with its source.
    ///
    /// Content is only rewritten when it actually differs (sizes first, then digests);
    /// otherwise just permissions and times are restored.
    #[instrument(skip(self))]
    pub(crate) async fn update_entry(&self, src: &Path, dst: &Path) -> Result<()> {
        let Some(src_metadata) = regular_file(src).await? else {
            self.messages
                .warning(format!("{:?} vanished before it could be updated", src));
            return Ok(());
        };
        let Some(dst_metadata) = regular_file(dst).await? else {
            if src_metadata.is_file() {
                return self.recreate(src, dst, &src_metadata).await;
            }
            self.messages
                .warning(format!("{:?} vanished before it could be updated", dst));
            return Ok(());
        };
        if !src_metadata.is_file() || !dst_metadata.is_file() {
            self.messages.warning(format!(
                "{:?} and {:?} are no longer both regular files, update skipped",
                src, dst
            ));
            return Ok(());
        }
        self.destination
            .set_current_entity(dst.to_string_lossy().into_owned());
        let differs = if src_metadata.len() == dst_metadata.len() {
            match filecmp::content_differs(src, dst).await {
                Ok(differs) => differs,
                Err(error) => {
                    self.messages.error(format!(
                        "cannot compare {:?} with {:?}: {:#}",
                        src, dst, error
                    ));
                    return Ok(());
                }
            }
        } else {
            true
        };
        let written = if differs {
            self.write_file(src, dst, &src_metadata).await?
        } else {
            event!(Level::DEBUG, "{:?} content is unchanged", dst);
            self.restore_metadata(dst, &src_metadata).await;
            0
        };
        let delta = i64::try_from(src_metadata.len()).unwrap_or(i64::MAX)
            - i64::try_from(dst_metadata.len()).unwrap_or(i64::MAX);
        self.destination.adjust_size(delta);
        if let Some(relative) = self.relative(dst) {
            self.destination.upsert(
                &relative,
                NodeType::File,
                src_metadata.len(),
                last_change(&src_metadata),
            );
        }
        self.progress
            .category(Category::Update)
            .complete(1, src_metadata.len().max(written));
        Ok(())
    }

    /// The destination file is gone although the tree still lists it: copy it again.
    async fn recreate(
        &self,
        src: &Path,
        dst: &Path,
        src_metadata: &std::fs::Metadata,
    ) -> Result<()> {
        self.messages.warning(format!(
            "{:?} vanished from the destination, copying it again",
            dst
        ));
        self.destination
            .set_current_entity(dst.to_string_lossy().into_owned());
        let written = self.write_file(src, dst, src_metadata).await?;
        self.record_file(dst, NodeType::File, src_metadata.len(), last_change(src_metadata));
        self.progress
            .category(Category::Update)
            .complete(1, src_metadata.len().max(written));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::WorkQueues;
    use crate::messages::{MessageLog, Severity};
    use crate::progress::Progress;
    use crate::testutils;
    use crate::tree::{Node, TreeIndex};
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn executor(src: &Path, dst: &Path) -> Arc<Executor> {
        let index = TreeIndex::new(dst);
        index.set_root(Node::directory(dst.as_os_str()).with_children(vec![Node::file(
            "a.txt", 3, 10,
        )]));
        index.add_file(3);
        Arc::new(Executor::new(
            src,
            dst,
            Arc::new(index),
            Arc::new(WorkQueues::default()),
            Arc::new(Progress::new()),
            Arc::new(MessageLog::new()),
            4,
        ))
    }

    async fn fixture() -> Result<(std::path::PathBuf, std::path::PathBuf)> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let (src, dst) = (tmp_dir.join("src"), tmp_dir.join("dst"));
        tokio::fs::create_dir(&src).await?;
        tokio::fs::create_dir(&dst).await?;
        Ok((src, dst))
    }

    #[tokio::test]
    #[traced_test]
    async fn rewrites_changed_content() -> Result<()> {
        let (src, dst) = fixture().await?;
        tokio::fs::write(src.join("a.txt"), "new content").await?;
        tokio::fs::write(dst.join("a.txt"), "old").await?;
        testutils::set_mtime(&src.join("a.txt"), 20)?;
        let executor = executor(&src, &dst);
        executor.queues.push_update(src.join("a.txt"), dst.join("a.txt"));
        executor.update_phase().await?;
        assert_eq!(tokio::fs::read_to_string(dst.join("a.txt")).await?, "new content");
        assert_eq!(last_change(&tokio::fs::metadata(dst.join("a.txt")).await?), 20);
        let node = executor.destination.root();
        let node = node.get_path(Path::new("a.txt")).map(|n| (n.length, n.last_change));
        assert_eq!(node, Some((11, 20)));
        assert_eq!(executor.destination.size(), 11);
        assert_eq!(executor.destination.files(), 1);
        assert_eq!(executor.progress.category(Category::Update).get().files_done, 1);
        assert!(executor.queues.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn identical_content_only_touches_metadata() -> Result<()> {
        let (src, dst) = fixture().await?;
        tokio::fs::write(src.join("a.txt"), "abc").await?;
        tokio::fs::write(dst.join("a.txt"), "abc").await?;
        testutils::set_mtime(&src.join("a.txt"), 30)?;
        let inode = |path: &Path| -> Result<u64> {
            use std::os::unix::fs::MetadataExt;
            Ok(std::fs::metadata(path)?.ino())
        };
        let before = inode(&dst.join("a.txt"))?;
        let executor = executor(&src, &dst);
        executor.update_entry(&src.join("a.txt"), &dst.join("a.txt")).await?;
        assert_eq!(inode(&dst.join("a.txt"))?, before);
        assert_eq!(last_change(&tokio::fs::metadata(dst.join("a.txt")).await?), 30);
        assert_eq!(executor.destination.size(), 3);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn vanished_side_is_skipped() -> Result<()> {
        let (src, dst) = fixture().await?;
        tokio::fs::write(dst.join("a.txt"), "abc").await?;
        let executor = executor(&src, &dst);
        executor.update_entry(&src.join("a.txt"), &dst.join("a.txt")).await?;
        assert_eq!(executor.messages.count(Severity::Warning), 1);
        assert_eq!(tokio::fs::read_to_string(dst.join("a.txt")).await?, "abc");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_destination_is_copied_again() -> Result<()> {
        let (src, dst) = fixture().await?;
        tokio::fs::write(src.join("a.txt"), "hello!").await?;
        testutils::set_mtime(&src.join("a.txt"), 40)?;
        let executor = executor(&src, &dst);
        executor.queues.push_update(src.join("a.txt"), dst.join("a.txt"));
        executor.update_phase().await?;
        assert_eq!(tokio::fs::read_to_string(dst.join("a.txt")).await?, "hello!");
        let node = executor.destination.root();
        let node = node.get_path(Path::new("a.txt")).map(|n| (n.length, n.last_change));
        assert_eq!(node, Some((6, 40)));
        assert_eq!(executor.destination.files(), 1);
        assert_eq!(executor.destination.size(), 6);
        assert_eq!(executor.messages.count(Severity::Warning), 1);
        assert_eq!(executor.messages.count(Severity::Error), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_rewrite_drops_the_entry_from_the_tree() -> Result<()> {
        let (src, dst) = fixture().await?;
        tokio::fs::write(dst.join("a.txt"), "abc").await?;
        let metadata = tokio::fs::metadata(dst.join("a.txt")).await?;
        let executor = executor(&src, &dst);
        // the old file is removed before the copy from a missing source fails
        let result = executor
            .write_file(&src.join("gone.txt"), &dst.join("a.txt"), &metadata)
            .await;
        assert!(result.is_err());
        assert!(!dst.join("a.txt").exists());
        assert!(executor.destination.root().get_path(Path::new("a.txt")).is_none());
        assert_eq!(executor.destination.files(), 0);
        assert_eq!(executor.destination.size(), 0);
        Ok(())
    }
}
