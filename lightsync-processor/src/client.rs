//! Lightwalletd gRPC client
//!
//! Implements [`BlockSource`] over a direct channel or Tor circuits from the
//! shared circuit pool. Calls made over Tor fall back to the direct channel
//! once, after a short random delay, when the Tor path fails.

use crate::model::{
    BlockHeight, CompactBlock, CompactBlockRange, FetchedTransaction, ServerInfo, SubmitResponse,
    TransactionStatus, TreeState, UnspentOutput,
};
use crate::proto_types::compact_tx_streamer_client::CompactTxStreamerClient;
use crate::proto_types::{
    self as proto, BlockId, BlockRange, ChainSpec, Empty, GetAddressUtxosArg, RawTransaction,
    TxFilter,
};
use crate::source::{BlockSource, BlockStream, ServiceMode, UtxoStream};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::Stream;
use lightsync_net::{
    connect_direct_channel, shared_tor_client, CircuitPool, TorCircuitConnector, TorConfig,
};
use prost::Message;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, warn};

/// Default lightwalletd endpoint
pub const DEFAULT_LIGHTD_URL: &str = "https://zec.rocks:443";

/// Environment variable overriding the endpoint.
pub const ENDPOINT_ENV: &str = "LIGHTSYNC_ENDPOINT";

type StreamerClient = CompactTxStreamerClient<Channel>;

/// TLS configuration for gRPC connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Enable TLS
    pub enabled: bool,
    /// Server name for TLS verification (uses endpoint host if None)
    pub server_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_name: None,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct LightClientConfig {
    /// Endpoint URL (e.g. "https://lightd.example:443")
    pub endpoint: String,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Deadline for unary calls
    pub single_call_timeout: Duration,
    /// Deadline for the whole of a streaming call
    pub streaming_call_timeout: Duration,
    /// Tor data directories
    pub tor: TorConfig,
    /// Retry failed Tor calls over the direct channel
    pub fallback_to_direct: bool,
}

impl Default for LightClientConfig {
    fn default() -> Self {
        Self::direct(DEFAULT_LIGHTD_URL)
    }
}

impl LightClientConfig {
    fn infer_tls_enabled(endpoint: &str) -> bool {
        !endpoint.trim_start().starts_with("http://")
    }

    /// Config for `endpoint`, TLS inferred from the scheme.
    pub fn direct(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            tls: TlsConfig {
                enabled: Self::infer_tls_enabled(endpoint),
                server_name: None,
            },
            connect_timeout: Duration::from_secs(30),
            single_call_timeout: Duration::from_secs(10),
            streaming_call_timeout: Duration::from_secs(90),
            tor: TorConfig::default(),
            fallback_to_direct: true,
        }
    }

    /// Default config with `LIGHTSYNC_ENDPOINT` applied when set.
    pub fn from_env() -> Self {
        match std::env::var(ENDPOINT_ENV) {
            Ok(endpoint) if !endpoint.trim().is_empty() => Self::direct(endpoint.trim()),
            _ => Self::default(),
        }
    }
}

/// Lightwalletd client
#[derive(Clone)]
pub struct LightClient {
    config: LightClientConfig,
    direct: Arc<Mutex<Option<Channel>>>,
    circuits: Arc<Mutex<Option<Arc<CircuitPool<TorCircuitConnector>>>>>,
}

impl LightClient {
    /// Create client with default timeouts for `endpoint`.
    pub fn new(endpoint: &str) -> Self {
        Self::with_config(LightClientConfig::direct(endpoint))
    }

    /// Create client with custom config
    pub fn with_config(config: LightClientConfig) -> Self {
        Self {
            config,
            direct: Arc::new(Mutex::new(None)),
            circuits: Arc::new(Mutex::new(None)),
        }
    }

    /// Endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Active configuration
    pub fn config(&self) -> &LightClientConfig {
        &self.config
    }

    fn build_endpoint(&self) -> Result<Endpoint> {
        let url = &self.config.endpoint;
        let mut endpoint = Endpoint::from_shared(url.clone())
            .map_err(|e| {
                Error::Connection(format!(
                    "Invalid endpoint URL format '{}': {}. Expected format: https://host:port",
                    url, e
                ))
            })?
            .connect_timeout(self.config.connect_timeout);

        if self.config.tls.enabled {
            let mut tls_config = ClientTlsConfig::new().with_webpki_roots();
            let server_name = self
                .config
                .tls
                .server_name
                .clone()
                .or_else(|| extract_host(url));
            if let Some(name) = server_name {
                debug!("Using server name for TLS SNI: {}", name);
                tls_config = tls_config.domain_name(name);
            }
            endpoint = endpoint
                .tls_config(tls_config)
                .map_err(|e| Error::Connection(format!("TLS configuration failed: {}", e)))?;
        }
        Ok(endpoint)
    }

    async fn direct_channel(&self) -> Result<Channel> {
        let mut guard = self.direct.lock().await;
        if let Some(channel) = guard.as_ref() {
            return Ok(channel.clone());
        }
        let channel = connect_direct_channel(self.build_endpoint()?).await?;
        info!("Connected to lightwalletd at {}", self.config.endpoint);
        *guard = Some(channel.clone());
        Ok(channel)
    }

    async fn circuit_pool(&self) -> Result<Arc<CircuitPool<TorCircuitConnector>>> {
        let mut guard = self.circuits.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let tor = shared_tor_client(&self.config.tor).await;
        let pool = Arc::new(CircuitPool::new(TorCircuitConnector::new(
            tor,
            self.build_endpoint()?,
        )));
        *guard = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Run `op` over the transport selected by `mode`, bounded by `limit`.
    async fn call<T, F, Fut>(&self, mode: &ServiceMode, limit: Duration, op: F) -> Result<T>
    where
        F: Fn(StreamerClient) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if let Some(kind) = mode.circuit() {
            let pool = self.circuit_pool().await?;
            let failure = match pool.channel(&kind).await {
                Ok(channel) => match timed(limit, op(StreamerClient::new(channel))).await {
                    Ok(value) => return Ok(value),
                    Err(e) => e,
                },
                Err(e) => Error::from(e),
            };

            pool.invalidate(&kind).await;
            if !self.config.fallback_to_direct {
                return Err(failure);
            }
            let delay = fallback_delay();
            warn!(
                "Tor call ({:?}) failed, retrying direct in {:?}: {}",
                mode, delay, failure
            );
            tokio::time::sleep(delay).await;
        }

        let channel = self.direct_channel().await?;
        let result = timed(limit, op(StreamerClient::new(channel))).await;
        if let Err(e) = &result {
            if matches!(
                e,
                Error::Transport(_) | Error::Connection(_) | Error::Network(_)
            ) {
                *self.direct.lock().await = None;
            }
        }
        result
    }
}

#[async_trait]
impl BlockSource for LightClient {
    async fn latest_height(&self, mode: &ServiceMode) -> Result<BlockHeight> {
        self.call(mode, self.config.single_call_timeout, |mut client| async move {
            let block_id = client.get_latest_block(ChainSpec {}).await?.into_inner();
            debug!(
                "Latest block: height={}, hash={}",
                block_id.height,
                hex::encode(&block_id.hash)
            );
            Ok(block_id.height)
        })
        .await
    }

    async fn block_range(
        &self,
        range: CompactBlockRange,
        mode: &ServiceMode,
    ) -> Result<BlockStream> {
        let request = BlockRange {
            start: Some(BlockId {
                height: range.lower(),
                hash: Vec::new(),
            }),
            end: Some(BlockId {
                height: range.upper(),
                hash: Vec::new(),
            }),
        };
        let limit = self.config.streaming_call_timeout;
        let streaming = self
            .call(mode, limit, move |mut client| {
                let request = request.clone();
                async move { Ok(client.get_block_range(request).await?.into_inner()) }
            })
            .await?;

        Ok(deadline_stream(streaming, limit, |block: proto::CompactBlock| {
            Ok(CompactBlock {
                height: block.height,
                data: block.encode_to_vec(),
            })
        }))
    }

    async fn fetch_transaction(
        &self,
        raw_id: &[u8],
        mode: &ServiceMode,
    ) -> Result<(Option<FetchedTransaction>, TransactionStatus)> {
        let hash = raw_id.to_vec();
        self.call(mode, self.config.single_call_timeout, move |mut client| {
            let hash = hash.clone();
            async move {
                let filter = TxFilter {
                    block: None,
                    index: 0,
                    hash: hash.clone(),
                };
                match client.get_transaction(filter).await {
                    Ok(response) => {
                        let raw = response.into_inner();
                        let status = mined_status(raw.height);
                        if raw.data.is_empty() {
                            return Ok((None, status));
                        }
                        debug!("Received full transaction ({} bytes)", raw.data.len());
                        let mined_height = match status {
                            TransactionStatus::Mined(height) => Some(height),
                            _ => None,
                        };
                        Ok((
                            Some(FetchedTransaction {
                                raw_id: hash,
                                mined_height,
                                raw: raw.data,
                            }),
                            status,
                        ))
                    }
                    Err(status) if is_unknown_txid(&status) => {
                        Ok((None, TransactionStatus::TxidNotRecognized))
                    }
                    Err(status) => Err(status.into()),
                }
            }
        })
        .await
    }

    async fn fetch_utxos(
        &self,
        addresses: &[String],
        from_height: BlockHeight,
        mode: &ServiceMode,
    ) -> Result<UtxoStream> {
        let request = GetAddressUtxosArg {
            addresses: addresses.to_vec(),
            start_height: from_height,
            max_entries: 0,
        };
        let limit = self.config.streaming_call_timeout;
        let streaming = self
            .call(mode, limit, move |mut client| {
                let request = request.clone();
                async move { Ok(client.get_address_utxos_stream(request).await?.into_inner()) }
            })
            .await?;

        Ok(deadline_stream(
            streaming,
            limit,
            |reply: proto::GetAddressUtxosReply| {
                let index = u32::try_from(reply.index).map_err(|_| {
                    Error::Network(format!("Invalid output index {}", reply.index))
                })?;
                Ok(UnspentOutput {
                    address: reply.address,
                    txid: reply.txid,
                    index,
                    script: reply.script,
                    value_zat: reply.value_zat,
                    height: reply.height,
                })
            },
        ))
    }

    async fn submit(&self, raw_tx: &[u8], mode: &ServiceMode) -> Result<SubmitResponse> {
        info!("Broadcasting transaction ({} bytes)", raw_tx.len());
        let data = raw_tx.to_vec();
        let response = self
            .call(mode, self.config.single_call_timeout, move |mut client| {
                let request = RawTransaction {
                    data: data.clone(),
                    height: 0,
                };
                async move { Ok(client.send_transaction(request).await?.into_inner()) }
            })
            .await?;

        if response.error_code != 0 {
            warn!(
                "Transaction broadcast rejected: code={}, message={}",
                response.error_code, response.error_message
            );
        }
        Ok(SubmitResponse {
            error_code: response.error_code,
            error_message: response.error_message,
        })
    }

    async fn tree_state(&self, height: BlockHeight, mode: &ServiceMode) -> Result<TreeState> {
        let state = self
            .call(mode, self.config.single_call_timeout, move |mut client| async move {
                let request = BlockId {
                    height,
                    hash: Vec::new(),
                };
                Ok(client.get_tree_state(request).await?.into_inner())
            })
            .await?;

        debug!(
            "Tree state at height {}: network={}, hash={}",
            state.height, state.network, state.hash
        );
        Ok(TreeState {
            network: state.network,
            height: state.height,
            hash: state.hash,
            time: state.time,
            sapling_tree: state.sapling_tree,
            orchard_tree: state.orchard_tree,
        })
    }

    async fn server_info(&self, mode: &ServiceMode) -> Result<ServerInfo> {
        let info = self
            .call(mode, self.config.single_call_timeout, |mut client| async move {
                Ok(client.get_lightd_info(Empty {}).await?.into_inner())
            })
            .await?;

        Ok(ServerInfo {
            version: info.version,
            vendor: info.vendor,
            taddr_support: info.taddr_support,
            chain_name: info.chain_name,
            sapling_activation_height: info.sapling_activation_height,
            consensus_branch_id: info.consensus_branch_id,
            block_height: info.block_height,
            estimated_height: info.estimated_height,
        })
    }

    async fn close_connection(&self) {
        *self.direct.lock().await = None;
        if let Some(pool) = self.circuits.lock().await.as_ref() {
            pool.close_all().await;
        }
        info!("Disconnected from lightwalletd");
    }
}

async fn timed<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(limit))?
}

fn fallback_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(1_000..=3_000))
}

/// Adapt a gRPC stream so the whole stream must finish within `limit`.
fn deadline_stream<M, T>(
    inner: tonic::codec::Streaming<M>,
    limit: Duration,
    map: fn(M) -> Result<T>,
) -> Pin<Box<dyn Stream<Item = Result<T>> + Send>>
where
    M: Send + 'static,
    T: Send + 'static,
{
    let deadline = Instant::now() + limit;
    let stream = futures_util::stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout_at(deadline, inner.message()).await {
            Ok(Ok(Some(message))) => Some((map(message), Some(inner))),
            Ok(Ok(None)) => None,
            Ok(Err(status)) => Some((Err(Error::Status(status)), None)),
            Err(_) => Some((Err(Error::Timeout(limit)), None)),
        }
    });
    Box::pin(stream)
}

/// Chain status from the height lightwalletd reports for a transaction.
fn mined_status(height: u64) -> TransactionStatus {
    if height == 0 || height > u64::from(u32::MAX) {
        TransactionStatus::NotInMainChain
    } else {
        TransactionStatus::Mined(height)
    }
}

fn is_unknown_txid(status: &tonic::Status) -> bool {
    if status.code() == tonic::Code::NotFound {
        return true;
    }
    let message = status.message();
    message.contains("Transaction not found") || message.contains("No such mempool")
}

/// Extract hostname from URL
fn extract_host(url: &str) -> Option<String> {
    let without_proto = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    without_proto
        .split([':', '/'])
        .next()
        .filter(|host| !host.is_empty())
        .map(|s| s.to_string())
}
