//! Cross-process run lock kept in the destination root

use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = ".rmirror.lock";

const LOCK_ATTEMPTS: usize = 5;

/// True if `file` is still the marker at `path` (not one unlinked and replaced meanwhile).
fn is_current(file: &std::fs::File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let locked = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(current.dev() == locked.dev() && current.ino() == locked.ino()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{0:?} is locked by another run")]
    AlreadyLocked(PathBuf),
    #[error("cannot clear stale lock marker {path:?}")]
    Stale {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot lock {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive lock on a destination root, released (and its marker removed) on drop.
///
/// The marker is unlinked before it is unlocked. A competing run that still locks the unlinked
/// marker notices it is no longer the file at the marker path and retries.
#[derive(Debug)]
pub struct RunLock {
    file: std::fs::File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(root: &Path) -> Result<Self, LockError> {
        let path = root.join(LOCK_FILE);
        if let Ok(metadata) = std::fs::symlink_metadata(&path)
            && !metadata.is_file()
        {
            // not something we could have left behind as a lock, clear it
            let cleared = if metadata.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            cleared.map_err(|source| LockError::Stale {
                path: path.clone(),
                source,
            })?;
        }
        let mut file = Self::lock_marker(root, &path)?;
        // a marker left by a process that died is simply taken over
        let stamp = format!("{}\n", std::process::id());
        file.set_len(0)
            .and_then(|()| file.write_all(stamp.as_bytes()))
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        tracing::debug!("acquired run lock {:?}", path);
        Ok(Self { file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // A holder unlinks the marker before unlocking it, so a lock taken on a marker that is no
    // longer at `path` is worthless: drop it and try again with a fresh one.
    fn lock_marker(root: &Path, path: &Path) -> Result<std::fs::File, LockError> {
        use fs2::FileExt;
        let io_error = |source: std::io::Error| LockError::Io {
            path: path.to_owned(),
            source,
        };
        for attempt in 1..=LOCK_ATTEMPTS {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(io_error)?;
            if let Err(error) = file.try_lock_exclusive() {
                if error.kind() == std::io::ErrorKind::WouldBlock
                    || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
                {
                    return Err(LockError::AlreadyLocked(root.to_owned()));
                }
                return Err(io_error(error));
            }
            if is_current(&file, path).map_err(io_error)? {
                return Ok(file);
            }
            tracing::debug!("lock marker {:?} was replaced (attempt {})", path, attempt);
        }
        Err(LockError::AlreadyLocked(root.to_owned()))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            tracing::warn!("cannot remove lock marker {:?}: {}", self.path, error);
        }
        if let Err(error) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!("cannot unlock {:?}: {}", self.path, error);
        }
        tracing::debug!("released run lock {:?}", self.path);
    }
}
