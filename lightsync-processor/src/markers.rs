//! In-memory stage markers.

use crate::model::BlockHeight;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct MarkerValues {
    downloaded: Option<BlockHeight>,
    enhanced: Option<BlockHeight>,
    utxo_fetched: Option<BlockHeight>,
}

/// Highest heights reached by the stages without repository counterparts.
#[derive(Debug, Clone, Default)]
pub struct SyncMarkers {
    inner: Arc<Mutex<MarkerValues>>,
}

impl SyncMarkers {
    /// Create with every marker unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest downloaded height
    pub fn latest_downloaded_height(&self) -> Option<BlockHeight> {
        self.inner.lock().downloaded
    }

    /// Highest enhanced height
    pub fn latest_enhanced_height(&self) -> Option<BlockHeight> {
        self.inner.lock().enhanced
    }

    /// Tip height at the last UTXO fetch
    pub fn latest_utxo_fetched_height(&self) -> Option<BlockHeight> {
        self.inner.lock().utxo_fetched
    }

    /// Set the downloaded height; `None` clears it.
    pub fn set_downloaded(&self, height: Option<BlockHeight>) {
        self.inner.lock().downloaded = height;
    }

    /// Set the enhanced height.
    pub fn set_enhanced(&self, height: BlockHeight) {
        self.inner.lock().enhanced = Some(height);
    }

    /// Raise the enhanced marker to `height` if it is lower.
    pub fn advance_enhanced(&self, height: BlockHeight) {
        let mut values = self.inner.lock();
        if values.enhanced.map_or(true, |current| current < height) {
            values.enhanced = Some(height);
        }
    }

    /// Set the height UTXOs were last fetched at.
    pub fn set_utxo_fetched(&self, height: BlockHeight) {
        self.inner.lock().utxo_fetched = Some(height);
    }

    /// Lower every marker above `height` to `height`.
    pub fn rewind_to(&self, height: BlockHeight) {
        let mut guard = self.inner.lock();
        let values = &mut *guard;
        for marker in [
            &mut values.downloaded,
            &mut values.enhanced,
            &mut values.utxo_fetched,
        ] {
            if let Some(current) = *marker {
                if current > height {
                    *marker = Some(height);
                }
            }
        }
    }

    /// Unset every marker.
    pub fn reset(&self) {
        *self.inner.lock() = MarkerValues::default();
    }
}
