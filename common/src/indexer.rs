use anyhow::{anyhow, Context, Result};
use async_recursion::async_recursion;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

use crate::filter::IgnoreFilter;
use crate::messages::MessageLog;
use crate::tree::{Node, NodeType, TreeIndex};

#[derive(Debug)]
struct IndexContext {
    root: PathBuf,
    index: Arc<TreeIndex>,
    filter: Option<Arc<IgnoreFilter>>,
    messages: Arc<MessageLog>,
    max_width: usize,
}

/// Last modification time of an entry in whole seconds since the unix epoch.
#[must_use]
pub fn last_change(metadata: &std::fs::Metadata) -> i64 {
    filetime::FileTime::from_last_modification_time(metadata).unix_seconds()
}

#[async_recursion]
async fn index_directory(
    ctx: Arc<IndexContext>,
    path: PathBuf,
    level: usize,
) -> Result<Vec<Node>> {
    let mut entries = tokio::fs::read_dir(&path)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", &path))?;
    let mut nodes = Vec::new();
    let mut join_set = tokio::task::JoinSet::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &path))?
    {
        let name = entry.file_name();
        if level == 0 && crate::cache::is_artifact(&name) {
            continue;
        }
        let entry_path = entry.path();
        let metadata = match tokio::fs::symlink_metadata(&entry_path).await {
            Ok(metadata) => metadata,
            Err(error) => {
                ctx.messages.warning(format!(
                    "cannot read metadata of {:?}, skipping: {}",
                    &entry_path, error
                ));
                continue;
            }
        };
        let node_type = NodeType::from_file_type(&metadata.file_type());
        if let Some(filter) = &ctx.filter
            && filter.is_ignored(&ctx.root, &entry_path, node_type == NodeType::Directory)
        {
            continue;
        }
        let last_change = last_change(&metadata);
        ctx.index
            .set_current_entity(entry_path.to_string_lossy().into_owned());
        if node_type == NodeType::Directory {
            ctx.index.add_directory();
            if join_set.len() >= ctx.max_width
                && let Some(res) = join_set.join_next().await
            {
                nodes.extend(res?);
            }
            let ctx = ctx.clone();
            let index_subdir = || async move {
                match index_directory(ctx.clone(), entry_path, level + 1).await {
                    Ok(children) => Some(
                        Node::new(name, NodeType::Directory, 0, last_change).with_children(children),
                    ),
                    Err(error) => {
                        ctx.messages
                            .warning(format!("{:#}, subtree skipped", error));
                        None
                    }
                }
            };
            join_set.spawn(index_subdir());
        } else {
            let length = if node_type == NodeType::File {
                metadata.len()
            } else {
                0
            };
            ctx.index.add_file(length);
            nodes.push(Node::new(name, node_type, length, last_change));
        }
    }
    while let Some(res) = join_set.join_next().await {
        nodes.extend(res?);
    }
    Ok(nodes)
}

/// Rebuilds `index` from the live tree under `root`.
///
/// Entries matching `filter` are left out, as are the tool's own cache and lock files directly
/// under `root`. Unreadable subdirectories are reported to `messages` and left out of the tree;
/// an unreadable root is an error.
#[instrument(skip(index, filter, messages))]
pub async fn index_tree(
    root: &Path,
    index: Arc<TreeIndex>,
    filter: Option<Arc<IgnoreFilter>>,
    messages: Arc<MessageLog>,
    max_width: usize,
) -> Result<()> {
    let metadata = tokio::fs::metadata(root)
        .await
        .with_context(|| format!("cannot access {:?}", root))?;
    if !metadata.is_dir() {
        return Err(anyhow!("{:?} is not a directory", root));
    }
    index.reset(root);
    let ctx = Arc::new(IndexContext {
        root: root.to_owned(),
        index: index.clone(),
        filter: filter.filter(|filter| !filter.is_empty()),
        messages: messages.clone(),
        max_width: max_width.max(1),
    });
    let started = std::time::Instant::now();
    let children = index_directory(ctx, root.to_owned(), 0).await?;
    let root_node = Node::new(
        root.as_os_str(),
        NodeType::Directory,
        0,
        last_change(&metadata),
    )
    .with_children(children);
    index.set_root(root_node);
    index.set_current_entity(String::new());
    messages.info(format!(
        "indexed {:?}: {} directories, {} files, {} in {:.1?}",
        root,
        index.directories(),
        index.files(),
        bytesize::ByteSize(index.size().max(0) as u64),
        started.elapsed()
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use std::ffi::OsStr;
    use std::os::unix::fs::PermissionsExt;
    use tracing_test::traced_test;

    async fn index(
        root: &Path,
        filter: Option<IgnoreFilter>,
    ) -> Result<(Arc<TreeIndex>, Arc<MessageLog>)> {
        let index = Arc::new(TreeIndex::new(root));
        let messages = Arc::new(MessageLog::new());
        index_tree(
            root,
            index.clone(),
            filter.map(Arc::new),
            messages.clone(),
            2,
        )
        .await?;
        Ok((index, messages))
    }

    #[tokio::test]
    #[traced_test]
    async fn builds_tree_and_counters() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let root = tmp_dir.join("foo");
        let (index, _) = index(&root, None).await?;
        let tree = index.root();
        assert_eq!(tree.name.as_os_str(), root.as_os_str());
        let names: Vec<_> = tree.children().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["0.txt", "bar", "baz"]);
        let baz = tree.child(OsStr::new("baz"))?;
        assert_eq!(
            baz.child(OsStr::new("5.txt"))?.node_type,
            NodeType::Special
        );
        assert_eq!(baz.child(OsStr::new("4.txt"))?.length, 1);
        assert_eq!(index.directories(), 2);
        assert_eq!(index.files(), 7);
        assert_eq!(index.size(), 5);
        assert_eq!(tree.files_recursive(), 7);
        assert!(index.is_dirty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn filter_and_root_artifacts_are_skipped() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let root = tmp_dir.join("foo");
        tokio::fs::write(root.join(crate::cache::CACHE_FILE), "x").await?;
        tokio::fs::write(root.join("bar").join(crate::cache::CACHE_FILE), "x").await?;
        let filter = IgnoreFilter::new(["^baz$", "2.txt"])?;
        let (index, _) = index(&root, Some(filter)).await?;
        let tree = index.root();
        assert!(tree.find(OsStr::new("baz")).is_none());
        assert!(tree.find(OsStr::new(crate::cache::CACHE_FILE)).is_none());
        let bar = tree.child(OsStr::new("bar"))?;
        assert!(bar.find(OsStr::new(crate::cache::CACHE_FILE)).is_some());
        assert!(bar.find(OsStr::new("2.txt")).is_none());
        assert_eq!(index.files(), 4);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_root_is_an_error() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        assert!(index(&tmp_dir.join("nope"), None).await.is_err());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unreadable_subdirectory_is_omitted() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let root = tmp_dir.join("foo");
        let bar = root.join("bar");
        tokio::fs::set_permissions(&bar, std::fs::Permissions::from_mode(0o000)).await?;
        if std::fs::read_dir(&bar).is_ok() {
            // running with privileges that ignore permission bits
            tokio::fs::set_permissions(&bar, std::fs::Permissions::from_mode(0o755)).await?;
            return Ok(());
        }
        let result = index(&root, None).await;
        tokio::fs::set_permissions(&bar, std::fs::Permissions::from_mode(0o755)).await?;
        let (index, messages) = result?;
        assert!(index.root().find(OsStr::new("bar")).is_none());
        assert!(index.root().find(OsStr::new("baz")).is_some());
        assert_eq!(messages.count(crate::messages::Severity::Warning), 1);
        Ok(())
    }
}
