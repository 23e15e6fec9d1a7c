//! Domain types shared by the pipeline stages.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a block in the chain. "Unknown" is expressed as `Option::None`.
pub type BlockHeight = u64;

/// Account identifier assigned by the native engine.
pub type AccountId = u32;

/// Closed interval `[lower, upper]` of block heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompactBlockRange {
    lower: BlockHeight,
    upper: BlockHeight,
}

impl CompactBlockRange {
    /// Create a range; fails when `lower > upper`.
    pub fn new(lower: BlockHeight, upper: BlockHeight) -> Result<Self> {
        if lower > upper {
            return Err(Error::Config(format!(
                "invalid block range {}..={}",
                lower, upper
            )));
        }
        Ok(Self { lower, upper })
    }

    /// Range if `lower <= upper`, otherwise `None`.
    pub fn checked(lower: BlockHeight, upper: BlockHeight) -> Option<Self> {
        (lower <= upper).then_some(Self { lower, upper })
    }

    /// Lower bound (inclusive)
    pub fn lower(&self) -> BlockHeight {
        self.lower
    }

    /// Upper bound (inclusive)
    pub fn upper(&self) -> BlockHeight {
        self.upper
    }

    /// Number of heights covered
    pub fn count(&self) -> u64 {
        self.upper - self.lower + 1
    }

    /// Whether `height` lies in the range
    pub fn contains(&self, height: BlockHeight) -> bool {
        self.lower <= height && height <= self.upper
    }

    /// Same range with the upper bound lowered to `upper`, if still non-empty.
    pub fn clamp_upper(&self, upper: BlockHeight) -> Option<Self> {
        Self::checked(self.lower, self.upper.min(upper))
    }

    /// Split into consecutive sub-ranges of at most `size` heights.
    pub fn batches(&self, size: u64) -> Vec<CompactBlockRange> {
        let size = size.max(1);
        let mut out = Vec::new();
        let mut start = self.lower;
        loop {
            let end = start.saturating_add(size - 1).min(self.upper);
            out.push(Self {
                lower: start,
                upper: end,
            });
            if end >= self.upper {
                break;
            }
            start = end + 1;
        }
        out
    }
}

impl fmt::Display for CompactBlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.lower, self.upper)
    }
}

/// Block summary as stored in the cache. `data` is the encoded compact block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactBlock {
    /// Block height
    pub height: BlockHeight,
    /// Serialized compact block
    pub data: Vec<u8>,
}

/// Transaction filter for repository queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Any transaction
    All,
    /// Sent by the wallet
    Sent,
    /// Received by the wallet
    Received,
}

/// Wallet-relevant transaction as known to the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOverview {
    /// Transaction id in wire byte order
    pub raw_id: Vec<u8>,
    /// Height the transaction was mined at, if known
    pub mined_height: Option<BlockHeight>,
    /// Full transaction bytes; absent until enhanced
    pub raw: Option<Vec<u8>>,
    /// Block time (unix seconds)
    pub block_time: Option<i64>,
    /// Index within the block
    pub index: Option<u32>,
    /// Sent by this wallet
    pub is_sent: bool,
    /// Net value in zatoshi
    pub value: i64,
    /// Fee in zatoshi
    pub fee: Option<u64>,
    /// Number of memos
    pub memo_count: u32,
    /// Expiry height
    pub expiry_height: Option<BlockHeight>,
}

impl TransactionOverview {
    /// Summary-only overview as produced by a scan.
    pub fn scanned(raw_id: Vec<u8>, mined_height: Option<BlockHeight>) -> Self {
        Self {
            raw_id,
            mined_height,
            raw: None,
            block_time: None,
            index: None,
            is_sent: false,
            value: 0,
            fee: None,
            memo_count: 0,
            expiry_height: None,
        }
    }

    /// Whether full transaction data is present.
    pub fn is_enhanced(&self) -> bool {
        self.raw.is_some()
    }

    /// Hex id in display (reversed) byte order.
    pub fn txid_hex(&self) -> String {
        txid_hex(&self.raw_id)
    }
}

/// Display-order hex of a wire-order transaction id.
pub fn txid_hex(raw_id: &[u8]) -> String {
    let mut bytes = raw_id.to_vec();
    bytes.reverse();
    hex::encode(bytes)
}

/// Unspent transparent output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnspentOutput {
    /// Receiving address
    pub address: String,
    /// Transaction id
    pub txid: Vec<u8>,
    /// Output index
    pub index: u32,
    /// Locking script
    pub script: Vec<u8>,
    /// Value in zatoshi
    pub value_zat: i64,
    /// Mined height
    pub height: BlockHeight,
}

/// Last block the engine committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedBlock {
    /// Height
    pub height: BlockHeight,
    /// Block time (unix seconds)
    pub time: i64,
}

/// Chain status of a fetched transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Node does not know the id
    TxidNotRecognized,
    /// Known but not in the main chain
    NotInMainChain,
    /// Mined at the given height
    Mined(BlockHeight),
}

/// Full transaction returned by the block source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTransaction {
    /// Transaction id
    pub raw_id: Vec<u8>,
    /// Mined height, if mined
    pub mined_height: Option<BlockHeight>,
    /// Raw bytes
    pub raw: Vec<u8>,
}

/// Commitment tree state at a height.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeState {
    /// Chain name
    pub network: String,
    /// Height
    pub height: BlockHeight,
    /// Block hash (hex)
    pub hash: String,
    /// Block time
    pub time: u32,
    /// Sapling tree (hex)
    pub sapling_tree: String,
    /// Orchard tree (hex)
    pub orchard_tree: String,
}

/// Lightwalletd server information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server version
    pub version: String,
    /// Vendor
    pub vendor: String,
    /// Transparent address support
    pub taddr_support: bool,
    /// "main" or "test"
    pub chain_name: String,
    /// Sapling activation height
    pub sapling_activation_height: BlockHeight,
    /// Consensus branch id
    pub consensus_branch_id: String,
    /// Best chain height
    pub block_height: BlockHeight,
    /// Estimated height while the node syncs
    pub estimated_height: BlockHeight,
}

/// Response to a transaction submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitResponse {
    /// 0 on success
    pub error_code: i32,
    /// Node message
    pub error_message: String,
}

impl SubmitResponse {
    /// Whether the node accepted the transaction.
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

/// Progress of one enhancement call. Recomputed per transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancementProgress {
    /// Transactions selected for enhancement
    pub total_transactions: usize,
    /// Transactions enhanced so far
    pub enhanced_transactions: usize,
    /// Most recently enhanced transaction
    pub last_found_transaction: Option<TransactionOverview>,
    /// Range being enhanced
    pub range: CompactBlockRange,
}

impl EnhancementProgress {
    /// Fraction completed, 0 when nothing is pending.
    pub fn progress(&self) -> f32 {
        if self.total_transactions == 0 {
            return 0.0;
        }
        self.enhanced_transactions as f32 / self.total_transactions as f32
    }
}

/// Result of one UTXO fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoFetchResult {
    /// Newly stored outputs
    pub inserted: Vec<UnspentOutput>,
    /// Outputs already stored or failing to persist
    pub skipped: Vec<UnspentOutput>,
}
