//! # IO Utilities
//!
//! File system operations for the `.dossier` runtime directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Get the runtime directory path (.dossier)
///
/// Holds the run database, persisted config, stored artifacts and, unless
/// configured otherwise, the written reports.
pub fn get_runtime_path() -> PathBuf {
    if let Ok(path) = std::env::var("DOSSIER_RUNTIME_PATH") {
        return PathBuf::from(path);
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".dossier")
}

/// Ensure the runtime directory exists
pub async fn ensure_runtime_dir() -> Result<PathBuf> {
    let path = get_runtime_path();
    fs::create_dir_all(&path)
        .await
        .with_context(|| format!("Failed to create runtime directory: {:?}", path))?;
    Ok(path)
}

/// Replace `path` with `content` atomically.
///
/// Writes a sibling temp file, syncs it, then renames over the target. A crash
/// leaves either the old file or the new one, never a torn write, so the call
/// can be repeated freely.
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create directory: {:?}", parent))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid target path: {:?}", path))?;
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let result = async {
        let mut file = fs::File::create(&tmp)
            .await
            .with_context(|| format!("Failed to create temp file: {:?}", tmp))?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move {:?} into place", path))
    }
    .await;

    if result.is_err() {
        fs::remove_file(&tmp).await.ok();
    }
    result
}
