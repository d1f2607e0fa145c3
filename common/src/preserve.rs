use anyhow::{Context, Result};
use filetime::FileTime;
use tracing::{event, instrument, Level};

fn times(metadata: &std::fs::Metadata) -> (FileTime, FileTime) {
    (
        FileTime::from_last_access_time(metadata),
        FileTime::from_last_modification_time(metadata),
    )
}

/// Copies permission bits and access/modification times of a regular file.
#[instrument(skip(metadata))]
pub async fn set_file_metadata(metadata: &std::fs::Metadata, dst: &std::path::Path) -> Result<()> {
    let permissions = metadata.permissions();
    let (atime, mtime) = times(metadata);
    let dst = dst.to_owned();
    tokio::task::spawn_blocking(move || -> Result<()> {
        event!(Level::DEBUG, "setting permissions");
        std::fs::set_permissions(&dst, permissions.clone())
            .with_context(|| format!("cannot set {:?} permissions to {:?}", &dst, &permissions))?;
        // timestamps last, setting permissions does not touch them
        event!(Level::DEBUG, "setting timestamps");
        filetime::set_file_times(&dst, atime, mtime)
            .with_context(|| format!("failed setting timestamps for {:?}", &dst))?;
        Ok(())
    })
    .await?
}

/// Copies access/modification times of a directory.
#[instrument(skip(metadata))]
pub async fn set_dir_times(metadata: &std::fs::Metadata, dst: &std::path::Path) -> Result<()> {
    let (atime, mtime) = times(metadata);
    let dst = dst.to_owned();
    tokio::task::spawn_blocking(move || -> Result<()> {
        filetime::set_file_times(&dst, atime, mtime)
            .with_context(|| format!("failed setting timestamps for directory {:?}", &dst))
    })
    .await?
}

/// Copies access/modification times of a symlink itself (not its target).
#[instrument(skip(metadata))]
pub async fn set_symlink_times(
    metadata: &std::fs::Metadata,
    dst: &std::path::Path,
) -> Result<()> {
    let (atime, mtime) = times(metadata);
    let dst = dst.to_owned();
    tokio::task::spawn_blocking(move || -> Result<()> {
        filetime::set_symlink_file_times(&dst, atime, mtime)
            .with_context(|| format!("failed setting timestamps for symlink {:?}", &dst))
    })
    .await?
}
