//! Persistent destination index
//!
//! The cache is kept as three files in the destination root: the primary, a backup of the
//! previous primary and a transient "new" file. A save writes the new file first and only then
//! rotates it into place, so a crash at any point leaves at least one readable cache behind.
//!
//! File layout: 8 byte magic, little-endian `u32` format version, then a gzip stream holding
//! the bincode encoding of an [`IndexSnapshot`].

use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{event, instrument, Level};

use crate::lock::LOCK_FILE;
use crate::messages::MessageLog;
use crate::tree::{IndexSnapshot, TreeIndex};

pub const CACHE_FILE: &str = ".rmirror_cache.bin";
pub const CACHE_BACKUP_FILE: &str = ".rmirror_cache_bak.bin";
pub const CACHE_NEW_FILE: &str = ".rmirror_cache_new.bin";

const MAGIC: &[u8; 8] = b"RMIRRCH\0";
const FORMAT_VERSION: u32 = 1;

/// True for the files the tool itself keeps in a destination root.
#[must_use]
pub fn is_artifact(name: &OsStr) -> bool {
    [CACHE_FILE, CACHE_BACKUP_FILE, CACHE_NEW_FILE, LOCK_FILE]
        .iter()
        .any(|artifact| name == OsStr::new(artifact))
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cannot access cache file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path:?} is not a cache file")]
    BadMagic { path: PathBuf },
    #[error("{path:?} has unsupported cache format version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
    #[error("cannot encode cache file {path:?}")]
    Encode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
    #[error("cannot decode cache file {path:?}")]
    Decode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_owned(),
        source,
    }
}

pub fn write_snapshot(path: &Path, snapshot: &IndexSnapshot) -> Result<(), CacheError> {
    let file = std::fs::File::create(path).map_err(io_error(path))?;
    let mut writer = std::io::BufWriter::new(file);
    writer.write_all(MAGIC).map_err(io_error(path))?;
    writer
        .write_all(&FORMAT_VERSION.to_le_bytes())
        .map_err(io_error(path))?;
    let mut encoder = flate2::write::GzEncoder::new(writer, flate2::Compression::default());
    bincode::serialize_into(&mut encoder, snapshot).map_err(|source| CacheError::Encode {
        path: path.to_owned(),
        source,
    })?;
    let writer = encoder.finish().map_err(io_error(path))?;
    let file = writer
        .into_inner()
        .map_err(|err| io_error(path)(err.into_error()))?;
    file.sync_all().map_err(io_error(path))?;
    Ok(())
}

pub fn read_snapshot(path: &Path) -> Result<IndexSnapshot, CacheError> {
    let file = std::fs::File::open(path).map_err(io_error(path))?;
    let mut reader = std::io::BufReader::new(file);
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).map_err(io_error(path))?;
    if &magic != MAGIC {
        return Err(CacheError::BadMagic {
            path: path.to_owned(),
        });
    }
    let mut version = [0u8; 4];
    reader.read_exact(&mut version).map_err(io_error(path))?;
    let version = u32::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(CacheError::UnsupportedVersion {
            path: path.to_owned(),
            version,
        });
    }
    let decoder = flate2::read::GzDecoder::new(reader);
    bincode::deserialize_from(decoder).map_err(|source| CacheError::Decode {
        path: path.to_owned(),
        source,
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The cache was restored and may be used, it has now been reused this many times
    Loaded { reuse_count: u64 },
    /// The cache was reused too often and must be replaced by a full reindex
    Stale { reuse_count: u64 },
    /// Neither the primary nor the backup file could be read
    Missing,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    attempts: usize,
    backoff: std::time::Duration,
    saving: Mutex<()>,
    autosave_running: AtomicBool,
    autosave: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CacheStore {
    pub fn new(root: &Path, attempts: usize, backoff: std::time::Duration) -> Self {
        Self {
            root: root.to_owned(),
            attempts: attempts.max(1),
            backoff,
            saving: Mutex::new(()),
            autosave_running: AtomicBool::new(false),
            autosave: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn primary(&self) -> PathBuf {
        self.root.join(CACHE_FILE)
    }

    #[must_use]
    pub fn backup(&self) -> PathBuf {
        self.root.join(CACHE_BACKUP_FILE)
    }

    #[must_use]
    pub fn pending(&self) -> PathBuf {
        self.root.join(CACHE_NEW_FILE)
    }

    /// Restores `index` from the primary file, falling back to the backup.
    ///
    /// Every successful load counts as one more reuse; past `reindex_threshold` reuses the
    /// outcome is [`LoadOutcome::Stale`] and the caller is expected to reindex.
    #[instrument(skip(self, index, messages))]
    pub fn load(
        &self,
        index: &TreeIndex,
        reindex_threshold: u64,
        messages: &MessageLog,
    ) -> LoadOutcome {
        let mut snapshot = None;
        for path in [self.primary(), self.backup()] {
            match read_snapshot(&path) {
                Ok(loaded) => {
                    event!(Level::DEBUG, "loaded cache from {:?}", path);
                    snapshot = Some(loaded);
                    break;
                }
                Err(CacheError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    event!(Level::DEBUG, "no cache file {:?}", path);
                }
                Err(error) => messages.warning(format!("{:#}", anyhow::Error::from(error))),
            }
        }
        let Some(snapshot) = snapshot else {
            messages.info(format!("no usable cache in {:?}", self.root));
            return LoadOutcome::Missing;
        };
        index.restore(&self.root, snapshot);
        let reuse_count = index.increment_reuse_count();
        if reuse_count > reindex_threshold {
            messages.info(format!(
                "cache in {:?} was reused {} times, reindexing",
                self.root,
                reuse_count - 1
            ));
            return LoadOutcome::Stale { reuse_count };
        }
        if reindex_threshold / 2 > 0 && reuse_count == reindex_threshold / 2 {
            index.recompute_size();
            messages.verbose(format!("recomputed indexed size of {:?}", self.root));
        }
        messages.info(format!(
            "using cache for {:?} ({} files, {})",
            self.root,
            index.files(),
            bytesize::ByteSize(index.size().max(0) as u64)
        ));
        LoadOutcome::Loaded { reuse_count }
    }

    fn rotate(&self, snapshot: &IndexSnapshot) -> Result<(), CacheError> {
        let (primary, backup, pending) = (self.primary(), self.backup(), self.pending());
        write_snapshot(&pending, snapshot)?;
        match std::fs::remove_file(&backup) {
            Err(error) if error.kind() != std::io::ErrorKind::NotFound => {
                return Err(io_error(&backup)(error));
            }
            _ => {}
        }
        if primary.exists() {
            std::fs::rename(&primary, &backup).map_err(io_error(&primary))?;
        }
        std::fs::rename(&pending, &primary).map_err(io_error(&pending))?;
        Ok(())
    }

    /// Persists `index` unless nothing changed since the last save and a primary file exists.
    /// Returns whether a file was written. Blocks, including between retries.
    #[instrument(skip(self, index))]
    pub fn save(&self, index: &TreeIndex) -> Result<bool, CacheError> {
        let _saving = lock(&self.saving);
        if !index.take_dirty() && self.primary().exists() {
            index.touch_saved();
            return Ok(false);
        }
        let snapshot = index.snapshot();
        let mut attempt = 1;
        loop {
            match self.rotate(&snapshot) {
                Ok(()) => {
                    index.touch_saved();
                    event!(Level::DEBUG, "saved cache {:?}", self.primary());
                    return Ok(true);
                }
                Err(error) if attempt < self.attempts => {
                    tracing::warn!(
                        "saving cache failed (attempt {}/{}): {:#}",
                        attempt,
                        self.attempts,
                        anyhow::Error::from(error)
                    );
                    std::thread::sleep(self.backoff);
                    attempt += 1;
                }
                Err(error) => {
                    index.mark_dirty();
                    return Err(error);
                }
            }
        }
    }

    /// Starts a background save if `interval` has passed since the last save and no other
    /// background save is running. Returns whether one was started.
    pub fn autosave_check(
        self: &Arc<Self>,
        index: &Arc<TreeIndex>,
        interval: std::time::Duration,
        messages: &Arc<MessageLog>,
    ) -> bool {
        if index.since_last_save() < interval {
            return false;
        }
        if self.autosave_running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let store = self.clone();
        let index = index.clone();
        let messages = messages.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _running = FlagGuard(&store.autosave_running);
            match store.save(&index) {
                Ok(true) => messages.verbose(format!("auto-saved cache {:?}", store.primary())),
                Ok(false) => {}
                Err(error) => messages.error(format!(
                    "auto-save failed: {:#}",
                    anyhow::Error::from(error)
                )),
            }
        });
        *lock(&self.autosave) = Some(handle);
        true
    }

    /// Waits for a running background save, if any.
    pub async fn wait_autosave(&self) {
        let handle = lock(&self.autosave).take();
        if let Some(handle) = handle
            && let Err(error) = handle.await
        {
            tracing::error!("auto-save task failed: {}", error);
        }
    }
}
