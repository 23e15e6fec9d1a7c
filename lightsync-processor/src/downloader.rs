//! Compact block download stage.

use crate::cancel::CancelToken;
use crate::markers::SyncMarkers;
use crate::model::{BlockHeight, CompactBlockRange};
use crate::repository::CompactBlockRepository;
use crate::source::{BlockSource, ServiceMode};
use crate::{Error, Result};
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::debug;

/// Streams blocks from the source into the block cache.
pub struct Downloader {
    source: Arc<dyn BlockSource>,
    repository: Arc<dyn CompactBlockRepository>,
    markers: SyncMarkers,
    mode: ServiceMode,
}

impl Downloader {
    /// Downloader writing into `repository`.
    pub fn new(
        source: Arc<dyn BlockSource>,
        repository: Arc<dyn CompactBlockRepository>,
        markers: SyncMarkers,
        mode: ServiceMode,
    ) -> Self {
        Self {
            source,
            repository,
            markers,
            mode,
        }
    }

    /// Download every block of `range` and store them in one write.
    ///
    /// Nothing is written when the stream fails or `cancel` fires.
    pub async fn download_range(&self, range: CompactBlockRange, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let mut stream = self.source.block_range(range, &self.mode).await?;

        let mut blocks = Vec::with_capacity(range.count().min(10_000) as usize);
        let mut expected = range.lower();
        while let Some(block) = stream.next().await {
            cancel.check()?;
            let block = block?;
            if block.height != expected {
                return Err(Error::Network(format!(
                    "Server returned block {} while {} was expected",
                    block.height, expected
                )));
            }
            expected += 1;
            blocks.push(block);
        }
        cancel.check()?;

        if blocks.len() as u64 != range.count() {
            return Err(Error::Network(format!(
                "Block stream for {} ended after {} blocks",
                range,
                blocks.len()
            )));
        }

        self.repository.write(&blocks).await?;
        self.markers.set_downloaded(Some(range.upper()));
        debug!("Downloaded {} blocks ({})", blocks.len(), range);
        Ok(())
    }

    /// Remove cached blocks at or above `height`.
    pub async fn rewind(&self, height: BlockHeight) -> Result<()> {
        self.repository.rewind(height).await?;
        let below = height.checked_sub(1);
        match (self.markers.latest_downloaded_height(), below) {
            (Some(current), Some(below)) if current > below => {
                self.markers.set_downloaded(Some(below))
            }
            (Some(_), None) => self.markers.set_downloaded(None),
            _ => {}
        }
        Ok(())
    }

    /// Highest height in the block cache
    pub async fn last_downloaded_height(&self) -> Result<Option<BlockHeight>> {
        self.repository.latest_height().await
    }
}
