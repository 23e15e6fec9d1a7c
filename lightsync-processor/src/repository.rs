//! Storage seams used by the pipeline.

use crate::model::{
    BlockHeight, CompactBlock, CompactBlockRange, ScannedBlock, TransactionKind,
    TransactionOverview,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Append-only cache of compact blocks.
#[async_trait]
pub trait CompactBlockRepository: Send + Sync {
    /// Create backing storage if missing.
    async fn create(&self) -> Result<()>;

    /// Highest stored height, `None` when empty.
    async fn latest_height(&self) -> Result<Option<BlockHeight>>;

    /// Append `blocks` atomically. Heights must continue the stored chain.
    async fn write(&self, blocks: &[CompactBlock]) -> Result<()>;

    /// Remove every block at or above `height`.
    async fn rewind(&self, height: BlockHeight) -> Result<()>;

    /// Remove every block at or below `height`.
    async fn clear_up_to(&self, height: BlockHeight) -> Result<()>;

    /// Remove everything.
    async fn clear(&self) -> Result<()>;
}

/// Read access to scanned wallet transactions.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Last height committed by the scanner
    async fn last_scanned_height(&self) -> Result<Option<BlockHeight>>;

    /// Last block committed by the scanner, with its time
    async fn last_scanned_block(&self) -> Result<Option<ScannedBlock>>;

    /// Transaction by wire-order id
    async fn find_by_raw_id(&self, raw_id: &[u8]) -> Result<Option<TransactionOverview>>;

    /// Transactions mined in `range`, at most `limit`, in repository order.
    async fn find_in_range(
        &self,
        range: CompactBlockRange,
        limit: usize,
        kind: TransactionKind,
    ) -> Result<Vec<TransactionOverview>>;

    /// Sent transactions that should be broadcast again, expiring after `up_to`.
    async fn find_for_resubmission(&self, up_to: BlockHeight) -> Result<Vec<TransactionOverview>>;
}

/// In-memory block repository.
#[derive(Debug, Default)]
pub struct MemoryBlockRepository {
    blocks: RwLock<BTreeMap<BlockHeight, Vec<u8>>>,
}

impl MemoryBlockRepository {
    /// Create empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Stored heights in ascending order
    pub fn heights(&self) -> Vec<BlockHeight> {
        self.blocks.read().keys().copied().collect()
    }
}

#[async_trait]
impl CompactBlockRepository for MemoryBlockRepository {
    async fn create(&self) -> Result<()> {
        Ok(())
    }

    async fn latest_height(&self) -> Result<Option<BlockHeight>> {
        Ok(self.blocks.read().keys().next_back().copied())
    }

    async fn write(&self, blocks: &[CompactBlock]) -> Result<()> {
        let mut stored = self.blocks.write();
        let mut expected = stored.keys().next_back().map(|h| h + 1);
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
        for block in blocks {
            stored.insert(block.height, block.data.clone());
        }
        Ok(())
    }

    async fn rewind(&self, height: BlockHeight) -> Result<()> {
        self.blocks.write().split_off(&height);
        Ok(())
    }

    async fn clear_up_to(&self, height: BlockHeight) -> Result<()> {
        let mut stored = self.blocks.write();
        let keep = stored.split_off(&height.saturating_add(1));
        *stored = keep;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.blocks.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(range: std::ops::RangeInclusive<u64>) -> Vec<CompactBlock> {
        range
            .map(|height| CompactBlock {
                height,
                data: height.to_le_bytes().to_vec(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_memory_write_rewind_clear() {
        let repo = MemoryBlockRepository::new();
        assert_eq!(repo.latest_height().await.unwrap(), None);

        repo.write(&blocks(1..=10)).await.unwrap();
        assert_eq!(repo.latest_height().await.unwrap(), Some(10));

        repo.rewind(6).await.unwrap();
        assert_eq!(repo.latest_height().await.unwrap(), Some(5));

        repo.clear_up_to(3).await.unwrap();
        assert_eq!(repo.heights(), vec![4, 5]);

        repo.clear().await.unwrap();
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_memory_rejects_gap() {
        let repo = MemoryBlockRepository::new();
        repo.write(&blocks(1..=3)).await.unwrap();
        assert!(repo.write(&blocks(5..=6)).await.is_err());
        assert_eq!(repo.len(), 3);
    }
}
