//! In-memory collaborators for pipeline tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream;
use lightsync_processor::{
    AccountId, BlockHeight, BlockSource, BlockStream, CancelToken, ChainValidationError, CompactBlock,
    CompactBlockRange, CryptoEngine, Error, FetchedTransaction, MemoryBlockRepository, Result,
    ScannedBlock, ServerInfo, ServiceMode, SubmitResponse, TransactionKind, TransactionOverview,
    TransactionRepository, TransactionStatus, TreeState, UnspentOutput, UtxoStream,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Block time of `height` in the mock chain.
pub fn block_time(height: BlockHeight) -> i64 {
    1_600_000_000 + height as i64 * 75
}

/// Transaction id used for the wallet transaction mined at `height`.
pub fn txid_at(height: BlockHeight, n: u8) -> Vec<u8> {
    let mut id = vec![n; 32];
    id[..8].copy_from_slice(&height.to_le_bytes());
    id
}

/// Raw transaction bytes the mock source serves for `raw_id`.
pub fn raw_tx_for(raw_id: &[u8]) -> Vec<u8> {
    let mut raw = b"raw:".to_vec();
    raw.extend_from_slice(raw_id);
    raw
}

pub fn utxo(address: &str, n: u8, height: BlockHeight) -> UnspentOutput {
    UnspentOutput {
        address: address.to_string(),
        txid: vec![n; 32],
        index: u32::from(n),
        script: vec![0x76, 0xa9, n],
        value_zat: 10_000 * i64::from(n),
        height,
    }
}

// ============================================================================
// Block source
// ============================================================================

#[derive(Default)]
struct SourceState {
    transactions: HashMap<Vec<u8>, FetchedTransaction>,
    failures: HashMap<Vec<u8>, u32>,
    utxos: Vec<UnspentOutput>,
    utxo_delay: Option<Duration>,
    truncate_stream_at: Option<BlockHeight>,
    cancel_on_fetch: Option<CancelToken>,
    submitted: Vec<Vec<u8>>,
    reject_submit: bool,
}

/// Mock lightwalletd.
#[derive(Default)]
pub struct MockSource {
    tip: AtomicU64,
    fail_latest: AtomicBool,
    state: Mutex<SourceState>,
    pub fetch_calls: AtomicUsize,
    pub utxo_calls: AtomicUsize,
    pub range_calls: AtomicUsize,
}

impl MockSource {
    pub fn new(tip: BlockHeight) -> Self {
        let source = Self::default();
        source.tip.store(tip, Ordering::SeqCst);
        source
    }

    pub fn set_tip(&self, tip: BlockHeight) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    pub fn set_fail_latest(&self, fail: bool) {
        self.fail_latest.store(fail, Ordering::SeqCst);
    }

    /// Serve the full transaction for `raw_id`.
    pub fn add_transaction(&self, raw_id: &[u8], mined_height: BlockHeight) {
        self.state.lock().transactions.insert(
            raw_id.to_vec(),
            FetchedTransaction {
                raw_id: raw_id.to_vec(),
                mined_height: Some(mined_height),
                raw: raw_tx_for(raw_id),
            },
        );
    }

    /// Fail the next `times` fetches of `raw_id`.
    pub fn fail_fetch(&self, raw_id: &[u8], times: u32) {
        self.state.lock().failures.insert(raw_id.to_vec(), times);
    }

    pub fn add_utxo(&self, output: UnspentOutput) {
        self.state.lock().utxos.push(output);
    }

    /// Delay UTXO streams by `delay` of real time.
    pub fn set_utxo_delay(&self, delay: Duration) {
        self.state.lock().utxo_delay = Some(delay);
    }

    /// Cancel `token` on the next transaction fetch.
    pub fn cancel_on_fetch(&self, token: CancelToken) {
        self.state.lock().cancel_on_fetch = Some(token);
    }

    /// Answer submissions with a rejection.
    pub fn set_reject_submit(&self, reject: bool) {
        self.state.lock().reject_submit = reject;
    }

    /// Raw transactions submitted so far, including rejected ones.
    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.state.lock().submitted.clone()
    }

    /// End block streams early after `height`.
    pub fn truncate_streams_at(&self, height: Option<BlockHeight>) {
        self.state.lock().truncate_stream_at = height;
    }
}

#[async_trait]
impl BlockSource for MockSource {
    async fn latest_height(&self, _mode: &ServiceMode) -> Result<BlockHeight> {
        if self.fail_latest.load(Ordering::SeqCst) {
            return Err(Error::Network("injected latest height failure".into()));
        }
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn block_range(&self, range: CompactBlockRange, _mode: &ServiceMode) -> Result<BlockStream> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        let upper = match self.state.lock().truncate_stream_at {
            Some(limit) => range.upper().min(limit),
            None => range.upper(),
        };
        let blocks: Vec<Result<CompactBlock>> = (range.lower()..=upper)
            .map(|height| {
                Ok(CompactBlock {
                    height,
                    data: format!("block-{}", height).into_bytes(),
                })
            })
            .collect();
        Ok(Box::pin(stream::iter(blocks)))
    }

    async fn fetch_transaction(
        &self,
        raw_id: &[u8],
        _mode: &ServiceMode,
    ) -> Result<(Option<FetchedTransaction>, TransactionStatus)> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(token) = state.cancel_on_fetch.take() {
            token.cancel();
        }
        if let Some(remaining) = state.failures.get_mut(raw_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Network("injected fetch failure".into()));
            }
        }
        match state.transactions.get(raw_id) {
            Some(tx) => {
                let status = tx
                    .mined_height
                    .map_or(TransactionStatus::NotInMainChain, TransactionStatus::Mined);
                Ok((Some(tx.clone()), status))
            }
            None => Ok((None, TransactionStatus::TxidNotRecognized)),
        }
    }

    async fn fetch_utxos(
        &self,
        addresses: &[String],
        from_height: BlockHeight,
        _mode: &ServiceMode,
    ) -> Result<UtxoStream> {
        self.utxo_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().utxo_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let outputs: Vec<Result<UnspentOutput>> = self
            .state
            .lock()
            .utxos
            .iter()
            .filter(|o| addresses.contains(&o.address) && o.height >= from_height)
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(stream::iter(outputs)))
    }

    async fn submit(&self, raw_tx: &[u8], _mode: &ServiceMode) -> Result<SubmitResponse> {
        let mut state = self.state.lock();
        state.submitted.push(raw_tx.to_vec());
        if state.reject_submit {
            return Ok(SubmitResponse {
                error_code: -26,
                error_message: "txn-mempool-conflict".into(),
            });
        }
        Ok(SubmitResponse::default())
    }

    async fn tree_state(&self, height: BlockHeight, _mode: &ServiceMode) -> Result<TreeState> {
        Ok(TreeState {
            height,
            ..Default::default()
        })
    }

    async fn server_info(&self, _mode: &ServiceMode) -> Result<ServerInfo> {
        Ok(ServerInfo {
            block_height: self.tip.load(Ordering::SeqCst),
            ..Default::default()
        })
    }

    async fn close_connection(&self) {}
}

// ============================================================================
// Wallet (engine + transaction repository)
// ============================================================================

#[derive(Default)]
struct WalletState {
    last_scanned: Option<BlockHeight>,
    transactions: Vec<TransactionOverview>,
    stored_utxos: HashSet<(Vec<u8>, u32)>,
    invalid_chain: Vec<BlockHeight>,
    validation_machinery_error: Option<String>,
    decrypt_failures: HashMap<Vec<u8>, u32>,
    rewinds: Vec<BlockHeight>,
    validate_calls: Vec<u32>,
}

/// Mock wallet engine scanning the shared block cache.
pub struct MockWallet {
    cache: Arc<MemoryBlockRepository>,
    birthday: BlockHeight,
    wallet_tx_heights: Mutex<Vec<BlockHeight>>,
    addresses: Mutex<Vec<String>>,
    failing_outputs: Mutex<HashSet<(Vec<u8>, u32)>>,
    state: Mutex<WalletState>,
}

impl MockWallet {
    pub fn new(cache: Arc<MemoryBlockRepository>, birthday: BlockHeight) -> Self {
        Self {
            cache,
            birthday,
            wallet_tx_heights: Mutex::new(Vec::new()),
            addresses: Mutex::new(Vec::new()),
            failing_outputs: Mutex::new(HashSet::new()),
            state: Mutex::new(WalletState::default()),
        }
    }

    /// Report a wallet transaction when `height` is scanned.
    pub fn add_wallet_tx_at(&self, height: BlockHeight) {
        self.wallet_tx_heights.lock().push(height);
    }

    /// Insert a scanned, not yet enhanced transaction.
    pub fn insert_scanned(&self, raw_id: Vec<u8>, height: BlockHeight) {
        self.state
            .lock()
            .transactions
            .push(TransactionOverview::scanned(raw_id, Some(height)));
    }

    /// Insert a sent transaction that has not been mined.
    pub fn insert_pending_sent(&self, raw_id: Vec<u8>, raw: Vec<u8>) {
        let mut tx = TransactionOverview::scanned(raw_id, None);
        tx.is_sent = true;
        tx.raw = Some(raw);
        self.state.lock().transactions.push(tx);
    }

    /// Fail the next `times` decryptions of `raw_id`.
    pub fn fail_decrypt(&self, raw_id: &[u8], times: u32) {
        self.state
            .lock()
            .decrypt_failures
            .insert(raw_id.to_vec(), times);
    }

    pub fn set_addresses(&self, addresses: &[&str]) {
        *self.addresses.lock() = addresses.iter().map(|a| a.to_string()).collect();
    }

    pub fn fail_output(&self, output: &UnspentOutput) {
        self.failing_outputs
            .lock()
            .insert((output.txid.clone(), output.index));
    }

    /// Report an invalid chain at each of `heights` on successive validations.
    pub fn queue_invalid_chain(&self, heights: &[BlockHeight]) {
        self.state.lock().invalid_chain.extend_from_slice(heights);
    }

    pub fn set_validation_machinery_error(&self, reason: Option<&str>) {
        self.state.lock().validation_machinery_error = reason.map(str::to_string);
    }

    pub fn set_last_scanned(&self, height: Option<BlockHeight>) {
        self.state.lock().last_scanned = height;
    }

    pub fn last_scanned(&self) -> Option<BlockHeight> {
        self.state.lock().last_scanned
    }

    pub fn rewinds(&self) -> Vec<BlockHeight> {
        self.state.lock().rewinds.clone()
    }

    pub fn validate_calls(&self) -> Vec<u32> {
        self.state.lock().validate_calls.clone()
    }

    pub fn transactions(&self) -> Vec<TransactionOverview> {
        self.state.lock().transactions.clone()
    }

    pub fn stored_utxo_count(&self) -> usize {
        self.state.lock().stored_utxos.len()
    }
}

#[async_trait]
impl CryptoEngine for MockWallet {
    async fn scan_blocks(&self, limit: u32) -> Result<()> {
        let cached: HashSet<BlockHeight> = self.cache.heights().into_iter().collect();
        let tx_heights = self.wallet_tx_heights.lock().clone();
        let mut state = self.state.lock();
        let mut next = state.last_scanned.map_or(self.birthday, |h| h + 1);
        for _ in 0..limit {
            if !cached.contains(&next) {
                break;
            }
            for (n, _) in tx_heights.iter().filter(|h| **h == next).enumerate() {
                let raw_id = txid_at(next, n as u8 + 1);
                if !state.transactions.iter().any(|t| t.raw_id == raw_id) {
                    state
                        .transactions
                        .push(TransactionOverview::scanned(raw_id, Some(next)));
                }
            }
            state.last_scanned = Some(next);
            next += 1;
        }
        Ok(())
    }

    async fn validate_chain(&self, limit: u32) -> std::result::Result<(), ChainValidationError> {
        let mut state = self.state.lock();
        state.validate_calls.push(limit);
        if let Some(reason) = &state.validation_machinery_error {
            return Err(ChainValidationError::Machinery(reason.clone()));
        }
        if !state.invalid_chain.is_empty() {
            let height = state.invalid_chain.remove(0);
            return Err(ChainValidationError::InvalidChain { height });
        }
        Ok(())
    }

    async fn decrypt_and_store_transaction(
        &self,
        raw: &[u8],
        mined_height: Option<BlockHeight>,
    ) -> Result<()> {
        let raw_id = raw
            .strip_prefix(b"raw:")
            .ok_or_else(|| Error::Engine("undecodable transaction".into()))?;
        let mut state = self.state.lock();
        if let Some(remaining) = state.decrypt_failures.get_mut(raw_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Engine("injected decryption failure".into()));
            }
        }
        let tx = state
            .transactions
            .iter_mut()
            .find(|t| t.raw_id == raw_id)
            .ok_or_else(|| Error::Engine("transaction not in wallet".into()))?;
        tx.raw = Some(raw.to_vec());
        tx.mined_height = mined_height.or(tx.mined_height);
        tx.block_time = tx.mined_height.map(block_time);
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<AccountId>> {
        Ok(vec![0])
    }

    async fn list_transparent_receivers(&self, _account: AccountId) -> Result<Vec<String>> {
        Ok(self.addresses.lock().clone())
    }

    async fn put_unspent_output(&self, output: &UnspentOutput) -> Result<bool> {
        let key = (output.txid.clone(), output.index);
        if self.failing_outputs.lock().contains(&key) {
            return Err(Error::Storage("injected output failure".into()));
        }
        Ok(self.state.lock().stored_utxos.insert(key))
    }

    async fn rewind_to_height(&self, height: BlockHeight) -> Result<()> {
        let mut state = self.state.lock();
        state.rewinds.push(height);
        if state.last_scanned.is_some_and(|h| h > height) {
            state.last_scanned = Some(height);
        }
        state
            .transactions
            .retain(|t| t.mined_height.map_or(true, |h| h <= height));
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for MockWallet {
    async fn last_scanned_height(&self) -> Result<Option<BlockHeight>> {
        Ok(self.state.lock().last_scanned)
    }

    async fn last_scanned_block(&self) -> Result<Option<ScannedBlock>> {
        Ok(self.state.lock().last_scanned.map(|height| ScannedBlock {
            height,
            time: block_time(height),
        }))
    }

    async fn find_by_raw_id(&self, raw_id: &[u8]) -> Result<Option<TransactionOverview>> {
        Ok(self
            .state
            .lock()
            .transactions
            .iter()
            .find(|t| t.raw_id == raw_id)
            .cloned())
    }

    async fn find_in_range(
        &self,
        range: CompactBlockRange,
        limit: usize,
        kind: TransactionKind,
    ) -> Result<Vec<TransactionOverview>> {
        Ok(self
            .state
            .lock()
            .transactions
            .iter()
            .filter(|t| t.mined_height.is_some_and(|h| range.contains(h)))
            .filter(|t| match kind {
                TransactionKind::All => true,
                TransactionKind::Sent => t.is_sent,
                TransactionKind::Received => !t.is_sent,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_for_resubmission(&self, up_to: BlockHeight) -> Result<Vec<TransactionOverview>> {
        Ok(self
            .state
            .lock()
            .transactions
            .iter()
            .filter(|t| t.is_sent && t.mined_height.is_none())
            .filter(|t| t.expiry_height.map_or(true, |h| h > up_to))
            .cloned()
            .collect())
    }
}

/// Source, cache and wallet wired together.
pub struct Fixture {
    pub source: Arc<MockSource>,
    pub cache: Arc<MemoryBlockRepository>,
    pub wallet: Arc<MockWallet>,
}

impl Fixture {
    pub fn new(tip: BlockHeight, birthday: BlockHeight) -> Self {
        let cache = Arc::new(MemoryBlockRepository::new());
        Self {
            source: Arc::new(MockSource::new(tip)),
            wallet: Arc::new(MockWallet::new(Arc::clone(&cache), birthday)),
            cache,
        }
    }
}
