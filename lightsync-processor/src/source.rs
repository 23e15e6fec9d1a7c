//! Block source abstraction.
//!
//! The pipeline talks to lightwalletd only through [`BlockSource`], which
//! keeps stages testable against in-memory sources.

use crate::model::{
    BlockHeight, CompactBlock, CompactBlockRange, FetchedTransaction, ServerInfo, SubmitResponse,
    TransactionStatus, TreeState, UnspentOutput,
};
use crate::Result;
use async_trait::async_trait;
use futures_util::Stream;
use lightsync_net::CircuitKind;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Ordered stream of compact blocks.
pub type BlockStream = Pin<Box<dyn Stream<Item = Result<CompactBlock>> + Send>>;

/// Stream of unspent transparent outputs.
pub type UtxoStream = Pin<Box<dyn Stream<Item = Result<UnspentOutput>> + Send>>;

/// How a call reaches the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServiceMode {
    /// Plain connection
    #[default]
    Direct,
    /// Process-wide shared Tor circuit
    DefaultTor,
    /// Tor circuit shared by calls in the named group
    TorInGroup(String),
    /// Fresh Tor circuit for this call only
    UniqueTor,
}

impl ServiceMode {
    /// Tor circuit used by this mode, `None` for direct calls.
    pub fn circuit(&self) -> Option<CircuitKind> {
        match self {
            Self::Direct => None,
            Self::DefaultTor => Some(CircuitKind::Default),
            Self::TorInGroup(name) => Some(CircuitKind::Group(name.clone())),
            Self::UniqueTor => Some(CircuitKind::Unique),
        }
    }

    /// Check if this mode preserves privacy
    pub fn is_private(&self) -> bool {
        !matches!(self, Self::Direct)
    }
}

/// Remote source of chain data.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Current chain tip height.
    async fn latest_height(&self, mode: &ServiceMode) -> Result<BlockHeight>;

    /// Blocks of `range` in ascending height order.
    async fn block_range(&self, range: CompactBlockRange, mode: &ServiceMode)
        -> Result<BlockStream>;

    /// Full transaction by id. A transaction unknown to the node is
    /// `(None, TxidNotRecognized)`, not an error.
    async fn fetch_transaction(
        &self,
        raw_id: &[u8],
        mode: &ServiceMode,
    ) -> Result<(Option<FetchedTransaction>, TransactionStatus)>;

    /// Unspent outputs of `addresses` mined at or above `from_height`.
    async fn fetch_utxos(
        &self,
        addresses: &[String],
        from_height: BlockHeight,
        mode: &ServiceMode,
    ) -> Result<UtxoStream>;

    /// Broadcast a signed transaction.
    async fn submit(&self, raw_tx: &[u8], mode: &ServiceMode) -> Result<SubmitResponse>;

    /// Commitment tree state at `height`.
    async fn tree_state(&self, height: BlockHeight, mode: &ServiceMode) -> Result<TreeState>;

    /// Server information.
    async fn server_info(&self, mode: &ServiceMode) -> Result<ServerInfo>;

    /// Drop every open connection.
    async fn close_connection(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_mode_circuits() {
        assert_eq!(ServiceMode::Direct.circuit(), None);
        assert_eq!(ServiceMode::DefaultTor.circuit(), Some(CircuitKind::Default));
        assert_eq!(
            ServiceMode::TorInGroup("enhance".into()).circuit(),
            Some(CircuitKind::Group("enhance".into()))
        );
        assert!(ServiceMode::UniqueTor.is_private());
        assert!(!ServiceMode::default().is_private());
    }
}
