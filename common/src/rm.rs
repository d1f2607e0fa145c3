use anyhow::{Context, Result};
use tracing::{event, instrument, Level};

use crate::executor::{lexically_within, retry, Executor, DELETE_ATTEMPTS, RETRY_DELAY};
use crate::matcher::DeleteItem;
use crate::progress::Category;

async fn remove(path: &std::path::Path) -> Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            event!(Level::DEBUG, "{:?} is already gone", path);
            return Ok(());
        }
        Err(error) => {
            return Err(error).with_context(|| format!("failed reading metadata from {:?}", path))
        }
    };
    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => {
            Err(error).with_context(|| format!("failed removing {:?}", path))
        }
        _ => Ok(()),
    }
}

impl Executor {
    /// Deletes one destination entry (a whole sub-tree for directories), retrying on failure.
    ///
    /// Paths that do not resolve to something strictly below the destination root are refused.
    #[instrument(skip(self))]
    pub(crate) async fn delete_entry(&self, item: &DeleteItem) -> Result<()> {
        let Some(relative) = lexically_within(&self.destination_root, &item.path) else {
            self.messages.critical(format!(
                "refusing to delete {:?}: it is not inside {:?}",
                item.path, self.destination_root
            ));
            return Ok(());
        };
        self.destination
            .set_current_entity(item.path.to_string_lossy().into_owned());
        retry(DELETE_ATTEMPTS, RETRY_DELAY, || remove(&item.path)).await?;
        event!(Level::DEBUG, "removed {:?}", item.path);
        if let Some(parent) = relative.parent() {
            self.times_changed(parent);
        }
        let removed = self.destination.remove(&relative);
        let removed = removed.as_deref().unwrap_or(&item.node);
        self.destination.subtract(removed);
        self.progress
            .category(Category::Delete)
            .complete(removed.files_recursive(), removed.size_recursive());
        Ok(())
    }
}
