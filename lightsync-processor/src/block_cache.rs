//! SQLite compact block cache.

use crate::model::{BlockHeight, CompactBlock};
use crate::repository::CompactBlockRepository;
use crate::{Error, Result};
use async_trait::async_trait;
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "LIGHTSYNC_CACHE_DIR";

/// Block cache stored in one SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteBlockRepository {
    path: PathBuf,
}

impl SqliteBlockRepository {
    /// Cache file for `endpoint` under the default cache directory.
    pub fn for_endpoint(endpoint: &str) -> Result<Self> {
        let path = cache_path_for_endpoint(endpoint)?;
        Self::open(path)
    }

    /// Open or create the cache at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
            }
        }
        let cache = Self { path };
        cache.create_schema()?;
        Ok(cache)
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored blocks in `[start, end]`, ascending.
    pub fn load_range(&self, start: BlockHeight, end: BlockHeight) -> Result<Vec<CompactBlock>> {
        if start > end {
            return Ok(Vec::new());
        }

        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT height, data FROM blocks WHERE height BETWEEN ?1 AND ?2 ORDER BY height ASC",
            )
            .map_err(|e| Error::Storage(e.to_string()))?;

        let rows = stmt
            .query_map(params![to_sql_height(start)?, to_sql_height(end)?], |row| {
                let height: i64 = row.get(0)?;
                let data: Vec<u8> = row.get(1)?;
                Ok((height, data))
            })
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut blocks = Vec::new();
        for row in rows {
            let (height, data) = row.map_err(|e| Error::Storage(e.to_string()))?;
            blocks.push(CompactBlock {
                height: height as BlockHeight,
                data,
            });
        }
        Ok(blocks)
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (
                height INTEGER PRIMARY KEY,
                data BLOB NOT NULL
             );",
        )
        .map_err(|e| Error::Storage(e.to_string()))
    }

    fn open_conn(&self) -> Result<Connection> {
        Connection::open(&self.path).map_err(|e| Error::Storage(e.to_string()))
    }

    fn max_height(&self) -> Result<Option<BlockHeight>> {
        let conn = self.open_conn()?;
        let height: Option<i64> = conn
            .query_row("SELECT MAX(height) FROM blocks", [], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Storage(e.to_string()))?
            .flatten();
        Ok(height.map(|h| h as BlockHeight))
    }

    fn store_blocks(&self, blocks: &[CompactBlock]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut expected = self.max_height()?.map(|h| h + 1);
        for block in blocks {
            if let Some(next) = expected {
                if block.height != next {
                    return Err(Error::Storage(format!(
                        "non-contiguous block {} (expected {})",
                        block.height, next
                    )));
                }
            }
            expected = Some(block.height + 1);
        }

        let conn = self.open_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::Storage(e.to_string()))?;
        {
            let mut stmt = tx
                .prepare("INSERT OR REPLACE INTO blocks (height, data) VALUES (?1, ?2)")
                .map_err(|e| Error::Storage(e.to_string()))?;
            for block in blocks {
                stmt.execute(params![to_sql_height(block.height)?, block.data])
                    .map_err(|e| Error::Storage(e.to_string()))?;
            }
        }
        tx.commit().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    fn delete_where(&self, sql: &str, height: BlockHeight) -> Result<usize> {
        let conn = self.open_conn()?;
        conn.execute(sql, params![to_sql_height(height)?])
            .map_err(|e| Error::Storage(e.to_string()))
    }
}

#[async_trait]
impl CompactBlockRepository for SqliteBlockRepository {
    async fn create(&self) -> Result<()> {
        self.create_schema()
    }

    async fn latest_height(&self) -> Result<Option<BlockHeight>> {
        self.max_height()
    }

    async fn write(&self, blocks: &[CompactBlock]) -> Result<()> {
        self.store_blocks(blocks)
    }

    async fn rewind(&self, height: BlockHeight) -> Result<()> {
        let removed = self.delete_where("DELETE FROM blocks WHERE height >= ?1", height)?;
        tracing::debug!("Rewound block cache to below {} ({} removed)", height, removed);
        Ok(())
    }

    async fn clear_up_to(&self, height: BlockHeight) -> Result<()> {
        let removed = self.delete_where("DELETE FROM blocks WHERE height <= ?1", height)?;
        tracing::debug!("Pruned {} cached blocks up to {}", removed, height);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute("DELETE FROM blocks", [])
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}

fn to_sql_height(height: BlockHeight) -> Result<i64> {
    i64::try_from(height).map_err(|_| Error::Storage(format!("height {} out of range", height)))
}

fn cache_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    ProjectDirs::from("org", "Lightsync", "Lightsync")
        .map(|dirs| dirs.data_local_dir().join("cache"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Cache file path for `endpoint`: `block_cache_<sha256 prefix>.db`.
pub fn cache_path_for_endpoint(endpoint: &str) -> Result<PathBuf> {
    let hash = Sha256::digest(endpoint.as_bytes());
    let short = hex::encode(&hash[..8]);
    Ok(cache_base_dir().join(format!("block_cache_{}.db", short)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn blocks(range: std::ops::RangeInclusive<u64>) -> Vec<CompactBlock> {
        range
            .map(|height| CompactBlock {
                height,
                data: vec![height as u8; 4],
            })
            .collect()
    }

    #[tokio::test]
    async fn test_write_and_latest_height() {
        let dir = TempDir::new().unwrap();
        let repo = SqliteBlockRepository::open(dir.path().join("cache.db")).unwrap();
        assert_eq!(repo.latest_height().await.unwrap(), None);

        repo.write(&blocks(100..=149)).await.unwrap();
        assert_eq!(repo.latest_height().await.unwrap(), Some(149));

        let loaded = repo.load_range(110, 112).unwrap();
        assert_eq!(loaded, blocks(110..=112));
    }

    #[tokio::test]
    async fn test_rewind_and_clear_up_to() {
        let dir = TempDir::new().unwrap();
        let repo = SqliteBlockRepository::open(dir.path().join("cache.db")).unwrap();
        repo.write(&blocks(1..=20)).await.unwrap();

        repo.rewind(11).await.unwrap();
        assert_eq!(repo.latest_height().await.unwrap(), Some(10));

        repo.clear_up_to(5).await.unwrap();
        let remaining = repo.load_range(0, 100).unwrap();
        assert_eq!(remaining.first().map(|b| b.height), Some(6));
        assert_eq!(remaining.len(), 5);

        repo.clear().await.unwrap();
        assert_eq!(repo.latest_height().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_contiguous_write_rejected() {
        let dir = TempDir::new().unwrap();
        let repo = SqliteBlockRepository::open(dir.path().join("cache.db")).unwrap();
        repo.write(&blocks(1..=5)).await.unwrap();
        assert!(repo.write(&blocks(7..=8)).await.is_err());
        assert_eq!(repo.latest_height().await.unwrap(), Some(5));
    }

    #[test]
    fn test_cache_path_is_stable_per_endpoint() {
        let a = cache_path_for_endpoint("https://lightd.example:443").unwrap();
        let b = cache_path_for_endpoint("https://lightd.example:443").unwrap();
        let c = cache_path_for_endpoint("https://other.example:443").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("block_cache_") && name.ends_with(".db"));
        assert_eq!(name.len(), "block_cache_".len() + 16 + ".db".len());
    }
}
