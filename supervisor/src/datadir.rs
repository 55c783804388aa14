//! Local data directory lifecycle (spec §3, §6).
//!
//! The directory's existence is the tiebreaker between `cluster_state=new`
//! and `cluster_state=existing` during bootstrap; it is owned exclusively
//! by this node.

use std::path::Path;
use tracing::{error, info};

/// Whether the data directory currently holds data.
pub async fn data_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Wipe the data directory: unlink if a symlink, remove if a plain file,
/// recursively remove if a directory. Best-effort — failures are logged
/// and swallowed (spec §7 "Local filesystem errors").
pub async fn wipe(path: &Path) {
    info!(path = %path.display(), "Removing data directory");

    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Cannot stat data directory");
            return;
        }
    };

    let result = if metadata.is_symlink() {
        tokio::fs::remove_file(path).await
    } else if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    if let Err(e) = result {
        error!(path = %path.display(), error = %e, "Cannot remove data directory");
    }
}
