//! # Artifact Store
//!
//! Content-addressed storage for generated assets. Files live at
//! `<root>/<sha256>.<ext>` and are indexed in the `artifacts` table, so any
//! worker holding the hash can find the bytes.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::db::ResearchDb;
use super::io::write_atomic;
use crate::artifacts::AssetRef;

pub struct ArtifactStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(db: &ResearchDb, root: impl Into<PathBuf>) -> Self {
        Self {
            conn: db.connection(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `bytes`; storing the same content twice yields the same reference.
    pub async fn put(&self, bytes: &[u8], mime_type: &str) -> Result<AssetRef> {
        let hash = hex::encode(Sha256::digest(bytes));
        let path = self
            .root
            .join(format!("{}.{}", hash, extension_for(mime_type)));

        if tokio::fs::metadata(&path).await.is_err() {
            write_atomic(&path, bytes).await?;
        }

        let asset = AssetRef {
            hash,
            mime_type: mime_type.to_string(),
            path,
            size: bytes.len() as u64,
        };

        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO artifacts (hash, mime_type, path, size)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                asset.hash,
                asset.mime_type,
                asset.path.to_string_lossy(),
                asset.size as i64
            ],
        )
        .context("Failed to index artifact")?;

        tracing::debug!(hash = %asset.hash, size = asset.size, "Artifact stored");
        Ok(asset)
    }

    /// Look up an artifact by hash
    pub fn get(&self, hash: &str) -> Result<Option<AssetRef>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let row = conn
            .query_row(
                "SELECT hash, mime_type, path, size FROM artifacts WHERE hash = ?1",
                params![hash],
                |row| {
                    let hash: String = row.get(0)?;
                    let mime_type: String = row.get(1)?;
                    let path: String = row.get(2)?;
                    let size: i64 = row.get(3)?;
                    Ok(AssetRef {
                        hash,
                        mime_type,
                        path: PathBuf::from(path),
                        size: size.max(0) as u64,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }

    /// Read the bytes behind a reference, verifying the content hash
    pub async fn read(&self, asset: &AssetRef) -> Result<Vec<u8>> {
        let bytes = tokio::fs::read(&asset.path)
            .await
            .with_context(|| format!("Failed to read artifact {:?}", asset.path))?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != asset.hash {
            anyhow::bail!("Artifact {} is corrupt (hash {})", asset.hash, actual);
        }
        Ok(bytes)
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}
