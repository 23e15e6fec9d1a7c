//! Shared cache of the latest known heights.

use crate::model::BlockHeight;
use crate::repository::TransactionRepository;
use crate::source::{BlockSource, ServiceMode};
use crate::Result;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Snapshot of the latest heights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatestBlocksData {
    /// Last height committed by the scanner
    pub latest_scanned_height: Option<BlockHeight>,
    /// Block time of `latest_scanned_height`
    pub latest_scanned_time: Option<i64>,
    /// Chain tip as last reported by the server
    pub latest_block_height: BlockHeight,
    /// Wallet birthday
    pub wallet_birthday: BlockHeight,
}

/// Concurrency-safe holder of [`LatestBlocksData`].
///
/// Only `latest_block_height` is protected against moving backwards; the
/// scanned height follows rewinds.
#[derive(Debug, Clone, Default)]
pub struct LatestBlocksDataProvider {
    data: Arc<RwLock<LatestBlocksData>>,
}

impl LatestBlocksDataProvider {
    /// Create with the given wallet birthday.
    pub fn new(wallet_birthday: BlockHeight) -> Self {
        Self {
            data: Arc::new(RwLock::new(LatestBlocksData {
                wallet_birthday,
                ..Default::default()
            })),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> LatestBlocksData {
        *self.data.read()
    }

    /// Last scanned height, if any
    pub fn latest_scanned_height(&self) -> Option<BlockHeight> {
        self.data.read().latest_scanned_height
    }

    /// Chain tip as last observed
    pub fn latest_block_height(&self) -> BlockHeight {
        self.data.read().latest_block_height
    }

    /// Wallet birthday height
    pub fn wallet_birthday(&self) -> BlockHeight {
        self.data.read().wallet_birthday
    }

    /// Reload the scanned height and time from the repository.
    pub async fn update_scanned_data<R>(&self, repository: &R) -> Result<()>
    where
        R: TransactionRepository + ?Sized,
    {
        let block = repository.last_scanned_block().await?;
        let mut data = self.data.write();
        data.latest_scanned_height = block.map(|b| b.height);
        data.latest_scanned_time = block.map(|b| b.time);
        Ok(())
    }

    /// Query the chain tip and store it.
    pub async fn update_block_height<S>(&self, source: &S, mode: &ServiceMode) -> Result<BlockHeight>
    where
        S: BlockSource + ?Sized,
    {
        let height = source.latest_height(mode).await?;
        self.update_latest_block_height(height);
        Ok(self.latest_block_height())
    }

    /// Store `height` as the tip unless a higher tip is already known.
    pub fn update_latest_block_height(&self, height: BlockHeight) {
        let mut data = self.data.write();
        if height > data.latest_block_height {
            data.latest_block_height = height;
        }
    }

    /// Set the scanned height after a scan batch.
    pub fn set_latest_scanned(&self, height: BlockHeight, time: Option<i64>) {
        let mut data = self.data.write();
        data.latest_scanned_height = Some(height);
        if time.is_some() {
            data.latest_scanned_time = time;
        }
    }

    /// Lower the scanned height after a rewind.
    pub fn rewind_scanned(&self, height: BlockHeight) {
        let mut data = self.data.write();
        if data.latest_scanned_height.is_some_and(|h| h > height) {
            data.latest_scanned_height = Some(height);
            data.latest_scanned_time = None;
        }
    }

    /// Replace the wallet birthday.
    pub fn set_wallet_birthday(&self, height: BlockHeight) {
        self.data.write().wallet_birthday = height;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_block_height_never_regresses() {
        let provider = LatestBlocksDataProvider::new(1);
        provider.update_latest_block_height(2_000);
        provider.update_latest_block_height(1_500);
        assert_eq!(provider.latest_block_height(), 2_000);
        provider.update_latest_block_height(2_001);
        assert_eq!(provider.latest_block_height(), 2_001);
    }

    #[test]
    fn test_scanned_height_follows_rewind() {
        let provider = LatestBlocksDataProvider::new(1);
        provider.set_latest_scanned(900, Some(1_700_000_000));
        provider.rewind_scanned(800);
        let snapshot = provider.snapshot();
        assert_eq!(snapshot.latest_scanned_height, Some(800));
        assert_eq!(snapshot.latest_scanned_time, None);
        assert_eq!(snapshot.wallet_birthday, 1);
    }
}
