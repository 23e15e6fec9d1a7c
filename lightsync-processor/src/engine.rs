//! Native crypto engine seam.

use crate::model::{AccountId, BlockHeight, UnspentOutput};
use crate::Result;
use async_trait::async_trait;

/// Outcome of a failed chain validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainValidationError {
    /// Validation could not run (I/O, database, engine failure)
    #[error("validation machinery failed: {0}")]
    Machinery(String),
    /// Chain continuity broken; `height` is the highest valid block
    #[error("invalid chain at height {height}")]
    InvalidChain {
        /// Highest height still believed valid
        height: BlockHeight,
    },
}

/// Wallet-side scanning, validation and persistence.
///
/// Implementations own the wallet database. Every call may suspend.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Scan up to `limit` cached blocks past the last scanned height.
    async fn scan_blocks(&self, limit: u32) -> Result<()>;

    /// Validate continuity of up to `limit` cached blocks.
    async fn validate_chain(&self, limit: u32) -> std::result::Result<(), ChainValidationError>;

    /// Decrypt `raw` and store it against the wallet.
    async fn decrypt_and_store_transaction(
        &self,
        raw: &[u8],
        mined_height: Option<BlockHeight>,
    ) -> Result<()>;

    /// Accounts known to the wallet
    async fn list_accounts(&self) -> Result<Vec<AccountId>>;

    /// Transparent receiving addresses of `account`
    async fn list_transparent_receivers(&self, account: AccountId) -> Result<Vec<String>>;

    /// Store an unspent output. `Ok(false)` if it was already stored.
    async fn put_unspent_output(&self, output: &UnspentOutput) -> Result<bool>;

    /// Drop wallet state above `height`.
    async fn rewind_to_height(&self, height: BlockHeight) -> Result<()>;
}
