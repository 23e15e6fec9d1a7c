//! Light-client compact block processor
//!
//! Keeps a local view of chain state in sync with a lightwalletd server:
//! downloads compact blocks, validates chain continuity, scans through the
//! native engine, enhances wallet transactions with full data, re-broadcasts
//! unmined sent transactions and refreshes transparent UTXOs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod background;
pub mod block_cache;
pub mod cancel;
pub mod client;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod enhancer;
pub mod error;
pub mod latest_blocks;
pub mod logging;
pub mod markers;
pub mod metrics;
pub mod model;
pub mod processor;
pub mod progress;
pub mod proto_types;
pub mod repository;
pub mod resubmission;
pub mod scanner;
pub mod source;
pub mod utxo;
pub mod validator;

pub use background::{SyncRunner, SyncRunnerHandle};
pub use block_cache::{cache_path_for_endpoint, SqliteBlockRepository, CACHE_DIR_ENV};
pub use cancel::CancelToken;
pub use client::{LightClient, LightClientConfig, TlsConfig, DEFAULT_LIGHTD_URL, ENDPOINT_ENV};
pub use config::{NetworkType, ProcessorConfig};
pub use downloader::Downloader;
pub use engine::{ChainValidationError, CryptoEngine};
pub use enhancer::{Enhancer, MAX_ENHANCE_ATTEMPTS};
pub use error::{Error, FailureReason, Result, SyncFailure};
pub use latest_blocks::{LatestBlocksData, LatestBlocksDataProvider};
pub use logging::{init_logging, SyncLogEntry, SyncLogger};
pub use markers::SyncMarkers;
pub use metrics::{
    BlockMetricReport, BlockProgress, CbpStateMetricReport, CumulativeSummary, MetricOperation,
    ReportSummary, SdkMetrics, SyncReport,
};
pub use model::{
    AccountId, BlockHeight, CompactBlock, CompactBlockRange, EnhancementProgress,
    FetchedTransaction, ScannedBlock, ServerInfo, SubmitResponse, TransactionKind,
    TransactionOverview, TransactionStatus, TreeState, UnspentOutput, UtxoFetchResult,
};
pub use processor::{determine_lower_bound, CompactBlockProcessor, CycleReport};
pub use progress::{ProcessorState, SyncEvent, SyncProgress, SyncStage};
pub use repository::{CompactBlockRepository, MemoryBlockRepository, TransactionRepository};
pub use resubmission::TxResubmitter;
pub use scanner::Scanner;
pub use source::{BlockStream, BlockSource, ServiceMode, UtxoStream};
pub use utxo::UtxoFetcher;
pub use validator::Validator;
