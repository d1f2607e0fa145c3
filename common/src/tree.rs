//! In-memory model of an indexed directory tree
//!
//! A [`Node`] is one filesystem entry together with its sub-tree. Children are kept sorted by
//! name (ordinal byte order, no case folding) and are unique within their parent. Sub-trees sit
//! behind `Arc` so the matcher can hold cheap read-only handles into a tree while the executor
//! mutates the destination tree copy-on-write.
//!
//! A [`TreeIndex`] wraps a root node with the aggregate counters collected while indexing, the
//! cache reuse counter and the bookkeeping the cache store needs (dirty flag, last save time).

use std::ffi::{OsStr, OsString};
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, enum_map::Enum,
)]
pub enum NodeType {
    Directory,
    File,
    Special,
}

impl NodeType {
    #[must_use]
    pub fn from_file_type(file_type: &std::fs::FileType) -> Self {
        if file_type.is_dir() {
            NodeType::Directory
        } else if file_type.is_file() {
            NodeType::File
        } else {
            NodeType::Special
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("no entry named {name:?} in {parent:?}")]
    NotFound { parent: OsString, name: OsString },
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Node {
    pub name: OsString,
    pub node_type: NodeType,
    /// size in bytes, meaningless for directories
    pub length: u64,
    /// last modification time in seconds since the unix epoch
    pub last_change: i64,
    children: Vec<Arc<Node>>,
}

fn normal_components(path: &Path) -> impl Iterator<Item = &OsStr> {
    path.components().filter_map(|component| match component {
        Component::Normal(name) => Some(name),
        _ => None,
    })
}

impl Node {
    pub fn new(
        name: impl Into<OsString>,
        node_type: NodeType,
        length: u64,
        last_change: i64,
    ) -> Self {
        Self {
            name: name.into(),
            node_type,
            length,
            last_change,
            children: Vec::new(),
        }
    }

    pub fn directory(name: impl Into<OsString>) -> Self {
        Self::new(name, NodeType::Directory, 0, 0)
    }

    pub fn file(name: impl Into<OsString>, length: u64, last_change: i64) -> Self {
        Self::new(name, NodeType::File, length, last_change)
    }

    /// Builder style helper, mostly useful in tests.
    #[must_use]
    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.set_children(children);
        self
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    /// Children in their canonical order: ascending by name, byte-wise.
    #[must_use]
    pub fn children(&self) -> &[Arc<Node>] {
        &self.children
    }

    fn position(&self, name: &OsStr) -> Result<usize, usize> {
        self.children
            .binary_search_by(|child| child.name.as_os_str().cmp(name))
    }

    pub fn child(&self, name: &OsStr) -> Result<&Arc<Node>, TreeError> {
        self.find(name).ok_or_else(|| TreeError::NotFound {
            parent: self.name.clone(),
            name: name.to_owned(),
        })
    }

    #[must_use]
    pub fn find(&self, name: &OsStr) -> Option<&Arc<Node>> {
        self.position(name).ok().map(|idx| &self.children[idx])
    }

    /// Mutable access to a child, cloning it first if the sub-tree is shared.
    pub fn child_mut(&mut self, name: &OsStr) -> Option<&mut Node> {
        let idx = self.position(name).ok()?;
        Some(Arc::make_mut(&mut self.children[idx]))
    }

    /// Replaces all children. Later entries win over earlier ones with the same name.
    pub fn set_children(&mut self, children: Vec<Node>) {
        let mut children: Vec<Arc<Node>> = children.into_iter().map(Arc::new).collect();
        // stable sort keeps insertion order among duplicates, dedup keeps the first, so reverse
        children.reverse();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children.dedup_by(|a, b| a.name == b.name);
        self.children = children;
    }

    /// Inserts a child, returning the entry it replaced.
    pub fn insert_child(&mut self, node: Node) -> Option<Arc<Node>> {
        match self.position(&node.name) {
            Ok(idx) => Some(std::mem::replace(&mut self.children[idx], Arc::new(node))),
            Err(idx) => {
                self.children.insert(idx, Arc::new(node));
                None
            }
        }
    }

    pub fn remove_child(&mut self, name: &OsStr) -> Option<Arc<Node>> {
        let idx = self.position(name).ok()?;
        Some(self.children.remove(idx))
    }

    /// Total bytes of all non-directory entries in this sub-tree.
    #[must_use]
    pub fn size_recursive(&self) -> u64 {
        if self.is_dir() {
            self.children.iter().map(|c| c.size_recursive()).sum()
        } else {
            self.length
        }
    }

    /// Number of non-directory entries in this sub-tree; a non-directory counts as one.
    #[must_use]
    pub fn files_recursive(&self) -> u64 {
        if self.is_dir() {
            self.children.iter().map(|c| c.files_recursive()).sum()
        } else {
            1
        }
    }

    /// Number of directories in this sub-tree, including this node.
    #[must_use]
    pub fn directories_recursive(&self) -> u64 {
        if self.is_dir() {
            1 + self
                .children
                .iter()
                .map(|c| c.directories_recursive())
                .sum::<u64>()
        } else {
            0
        }
    }

    #[must_use]
    pub fn get_path(&self, relative: &Path) -> Option<&Node> {
        let mut node = self;
        for name in normal_components(relative) {
            node = node.find(name)?;
        }
        Some(node)
    }

    /// Sets type, length and last change of the entry at `relative`, creating it and any
    /// missing intermediate directories. Returns true if the entry did not exist before.
    pub fn upsert_path(
        &mut self,
        relative: &Path,
        node_type: NodeType,
        length: u64,
        last_change: i64,
    ) -> bool {
        let mut directories_created = 0;
        self.upsert_counting(relative, node_type, length, last_change, &mut directories_created)
    }

    fn upsert_counting(
        &mut self,
        relative: &Path,
        node_type: NodeType,
        length: u64,
        last_change: i64,
        directories_created: &mut u64,
    ) -> bool {
        let names: Vec<&OsStr> = normal_components(relative).collect();
        let Some((last, parents)) = names.split_last() else {
            return false;
        };
        let mut node = self;
        for name in parents {
            if node.find(name).is_none() {
                node.insert_child(Node::directory(*name));
                *directories_created += 1;
            }
            node = match node.child_mut(name) {
                Some(next) => next,
                None => return false,
            };
            if !node.is_dir() {
                // a file is in the way of a directory we know exists on disk
                node.node_type = NodeType::Directory;
                node.length = 0;
            }
        }
        match node.child_mut(last) {
            Some(entry) => {
                if entry.node_type != node_type {
                    entry.children.clear();
                }
                entry.node_type = node_type;
                entry.length = length;
                entry.last_change = last_change;
                false
            }
            None => {
                node.insert_child(Node::new(*last, node_type, length, last_change));
                true
            }
        }
    }

    /// Removes the entry at `relative` together with its sub-tree.
    pub fn remove_path(&mut self, relative: &Path) -> Option<Arc<Node>> {
        let names: Vec<&OsStr> = normal_components(relative).collect();
        let (last, parents) = names.split_last()?;
        let mut node = self;
        for name in parents {
            node = node.child_mut(name)?;
        }
        node.remove_child(last)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serializable state of a [`TreeIndex`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexSnapshot {
    pub root: Arc<Node>,
    pub directories: u64,
    pub files: u64,
    pub size: i64,
    pub reuse_count: u64,
}

#[derive(Debug)]
pub struct TreeIndex {
    root: Mutex<Arc<Node>>,
    directories: AtomicU64,
    files: AtomicU64,
    size: AtomicI64,
    reuse_count: AtomicU64,
    current_entity: Mutex<String>,
    dirty: AtomicBool,
    last_save: Mutex<std::time::Instant>,
}

impl TreeIndex {
    pub fn new(root_path: &Path) -> Self {
        Self {
            root: Mutex::new(Arc::new(Node::directory(root_path.as_os_str()))),
            directories: AtomicU64::new(0),
            files: AtomicU64::new(0),
            size: AtomicI64::new(0),
            reuse_count: AtomicU64::new(0),
            current_entity: Mutex::new(String::new()),
            dirty: AtomicBool::new(false),
            last_save: Mutex::new(std::time::Instant::now()),
        }
    }

    /// Drops everything and starts over with an empty root.
    pub fn reset(&self, root_path: &Path) {
        *lock(&self.root) = Arc::new(Node::directory(root_path.as_os_str()));
        self.directories.store(0, Ordering::Relaxed);
        self.files.store(0, Ordering::Relaxed);
        self.size.store(0, Ordering::Relaxed);
        self.reuse_count.store(0, Ordering::Relaxed);
        self.mark_dirty();
    }

    /// Replaces the whole state with one restored from the cache. The root takes the name of
    /// `root_path` since the cache may have been written under a different mount point.
    pub fn restore(&self, root_path: &Path, snapshot: IndexSnapshot) {
        let mut root = snapshot.root;
        Arc::make_mut(&mut root).name = root_path.as_os_str().to_owned();
        *lock(&self.root) = root;
        self.directories
            .store(snapshot.directories, Ordering::Relaxed);
        self.files.store(snapshot.files, Ordering::Relaxed);
        self.size.store(snapshot.size, Ordering::Relaxed);
        self.reuse_count
            .store(snapshot.reuse_count, Ordering::Relaxed);
        self.dirty.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            root: self.root(),
            directories: self.directories(),
            files: self.files(),
            size: self.size(),
            reuse_count: self.reuse_count(),
        }
    }

    /// Read-only handle to the current root.
    #[must_use]
    pub fn root(&self) -> Arc<Node> {
        lock(&self.root).clone()
    }

    pub fn set_root(&self, root: Node) {
        *lock(&self.root) = Arc::new(root);
        self.mark_dirty();
    }

    /// Creates or refreshes the entry at `relative` (see [`Node::upsert_path`]). Intermediate
    /// directories created on the way are counted here; the entry itself is left to the caller.
    pub fn upsert(
        &self,
        relative: &Path,
        node_type: NodeType,
        length: u64,
        last_change: i64,
    ) -> bool {
        let mut directories_created = 0;
        let mut root = lock(&self.root);
        let created = Arc::make_mut(&mut root).upsert_counting(
            relative,
            node_type,
            length,
            last_change,
            &mut directories_created,
        );
        self.directories
            .fetch_add(directories_created, Ordering::Relaxed);
        self.mark_dirty();
        created
    }

    pub fn remove(&self, relative: &Path) -> Option<Arc<Node>> {
        let mut root = lock(&self.root);
        let removed = Arc::make_mut(&mut root).remove_path(relative);
        self.mark_dirty();
        removed
    }

    #[must_use]
    pub fn directories(&self) -> u64 {
        self.directories.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn files(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn add_directory(&self) {
        self.directories.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_file(&self, length: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.adjust_size(i64::try_from(length).unwrap_or(i64::MAX));
    }

    pub fn adjust_size(&self, delta: i64) {
        self.size.fetch_add(delta, Ordering::Relaxed);
    }

    /// Takes a removed sub-tree out of the aggregate counters.
    pub fn subtract(&self, removed: &Node) {
        self.directories
            .fetch_sub(removed.directories_recursive().min(self.directories()), Ordering::Relaxed);
        self.files
            .fetch_sub(removed.files_recursive().min(self.files()), Ordering::Relaxed);
        self.adjust_size(-i64::try_from(removed.size_recursive()).unwrap_or(i64::MAX));
    }

    /// Recomputes the aggregate size from the tree itself.
    pub fn recompute_size(&self) {
        let size = self.root().size_recursive();
        self.size
            .store(i64::try_from(size).unwrap_or(i64::MAX), Ordering::Relaxed);
    }

    #[must_use]
    pub fn reuse_count(&self) -> u64 {
        self.reuse_count.load(Ordering::Relaxed)
    }

    pub fn increment_reuse_count(&self) -> u64 {
        self.mark_dirty();
        self.reuse_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn current_entity(&self) -> String {
        lock(&self.current_entity).clone()
    }

    pub fn set_current_entity(&self, entity: impl Into<String>) {
        *lock(&self.current_entity) = entity.into();
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clears the dirty flag, returning its previous value.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn since_last_save(&self) -> std::time::Duration {
        lock(&self.last_save).elapsed()
    }

    pub fn touch_saved(&self) {
        *lock(&self.last_save) = std::time::Instant::now();
    }
}

#[cfg(test)]
mod tree_tests {
    use super::*;

    fn sample() -> Node {
        Node::directory("root").with_children(vec![
            Node::file("b.txt", 10, 100),
            Node::directory("sub").with_children(vec![
                Node::file("x", 5, 1),
                Node::file("y", 7, 2),
                Node::directory("empty"),
            ]),
            Node::file("a.txt", 3, 100),
        ])
    }

    #[test]
    fn children_are_sorted_by_name() {
        let root = sample();
        let names: Vec<_> = root.children().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
    }

    #[test]
    fn ordering_is_ordinal() {
        let root = Node::directory("r").with_children(vec![
            Node::file("b", 0, 0),
            Node::file("B", 0, 0),
            Node::file("a", 0, 0),
            Node::file("_", 0, 0),
        ]);
        let names: Vec<_> = root.children().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["B", "_", "a", "b"]);
    }

    #[test]
    fn duplicate_names_keep_the_last_entry() {
        let root = Node::directory("r")
            .with_children(vec![Node::file("a", 1, 0), Node::file("a", 2, 0)]);
        assert_eq!(root.children().len(), 1);
        assert_eq!(root.children()[0].length, 2);
    }

    #[test]
    fn recursive_queries() {
        let root = sample();
        assert_eq!(root.size_recursive(), 25);
        assert_eq!(root.files_recursive(), 4);
        assert_eq!(root.directories_recursive(), 3);
        let file = Node::file("f", 42, 0);
        assert_eq!(file.size_recursive(), 42);
        assert_eq!(file.files_recursive(), 1);
        assert_eq!(Node::directory("d").files_recursive(), 0);
    }

    #[test]
    fn child_lookup() {
        let root = sample();
        assert_eq!(root.child(OsStr::new("b.txt")).unwrap().length, 10);
        match root.child(OsStr::new("missing")) {
            Err(TreeError::NotFound { name, .. }) => assert_eq!(name, "missing"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn upsert_creates_intermediate_directories() {
        let mut root = sample();
        assert!(root.upsert_path(Path::new("new/deep/file"), NodeType::File, 9, 5));
        let node = root.get_path(Path::new("new/deep/file")).unwrap();
        assert_eq!(node.length, 9);
        assert!(root.get_path(Path::new("new/deep")).unwrap().is_dir());
        assert!(!root.upsert_path(Path::new("new/deep/file"), NodeType::File, 11, 6));
        let node = root.get_path(Path::new("new/deep/file")).unwrap();
        assert_eq!((node.length, node.last_change), (11, 6));
    }

    #[test]
    fn remove_prunes_subtree() {
        let mut root = sample();
        let removed = root.remove_path(Path::new("sub")).unwrap();
        assert_eq!(removed.files_recursive(), 2);
        assert!(root.get_path(Path::new("sub/x")).is_none());
        assert!(root.remove_path(Path::new("does/not/exist")).is_none());
    }

    #[test]
    fn copy_on_write_leaves_snapshots_untouched() {
        let index = TreeIndex::new(Path::new("/dst"));
        index.set_root(sample());
        let before = index.root();
        index.upsert(Path::new("sub/x"), NodeType::File, 500, 9);
        assert_eq!(before.get_path(Path::new("sub/x")).unwrap().length, 5);
        assert_eq!(index.root().get_path(Path::new("sub/x")).unwrap().length, 500);
    }

    #[test]
    fn upsert_counts_intermediate_directories() {
        let index = TreeIndex::new(Path::new("/dst"));
        assert!(index.upsert(Path::new("a/b/c"), NodeType::File, 1, 1));
        assert_eq!(index.directories(), 2);
        assert!(!index.upsert(Path::new("a/b"), NodeType::Directory, 0, 1));
        assert_eq!(index.directories(), 2);
    }

    #[test]
    fn restore_renames_root_and_clears_dirty() {
        let index = TreeIndex::new(Path::new("/old"));
        index.set_root(sample());
        index.add_file(25);
        let snapshot = index.snapshot();
        let restored = TreeIndex::new(Path::new("/new"));
        restored.restore(Path::new("/new"), snapshot);
        assert_eq!(restored.root().name, "/new");
        assert_eq!(restored.files(), 1);
        assert_eq!(restored.size(), 25);
        assert!(!restored.is_dirty());
    }

    #[test]
    fn subtract_never_underflows_counters() {
        let index = TreeIndex::new(Path::new("/dst"));
        index.add_file(3);
        index.subtract(&sample());
        assert_eq!(index.files(), 0);
        assert_eq!(index.size(), 3 - 25);
    }
}
