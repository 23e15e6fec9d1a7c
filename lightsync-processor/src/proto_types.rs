//! Lightwalletd gRPC message and client definitions
//!
//! Hand-written prost messages mirroring the subset of
//! `cash.z.wallet.sdk.rpc.CompactTxStreamer` the processor calls, so the
//! build needs no protoc.

#![allow(missing_docs)] // Proto fields don't need individual docs

use prost::Message;

/// Compact block as served by `GetBlockRange`.
#[derive(Clone, PartialEq, Message)]
pub struct CompactBlock {
    #[prost(uint32, tag = "1")]
    pub proto_version: u32,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub prev_hash: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub time: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub header: Vec<u8>,
    #[prost(message, repeated, tag = "7")]
    pub vtx: Vec<CompactTx>,
}

/// Compact transaction: shielded parts only.
#[derive(Clone, PartialEq, Message)]
pub struct CompactTx {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub hash: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub fee: u32,
    #[prost(message, repeated, tag = "4")]
    pub spends: Vec<CompactSaplingSpend>,
    #[prost(message, repeated, tag = "5")]
    pub outputs: Vec<CompactSaplingOutput>,
    #[prost(message, repeated, tag = "6")]
    pub actions: Vec<CompactOrchardAction>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CompactSaplingSpend {
    #[prost(bytes = "vec", tag = "1")]
    pub nf: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CompactSaplingOutput {
    #[prost(bytes = "vec", tag = "1")]
    pub cmu: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub ephemeral_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CompactOrchardAction {
    #[prost(bytes = "vec", tag = "1")]
    pub nullifier: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub cmx: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub ephemeral_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BlockId {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub hash: Vec<u8>,
}

/// Inclusive on both ends.
#[derive(Clone, PartialEq, Message)]
pub struct BlockRange {
    #[prost(message, optional, tag = "1")]
    pub start: Option<BlockId>,
    #[prost(message, optional, tag = "2")]
    pub end: Option<BlockId>,
}

/// Either `hash` or `block` + `index` identifies the transaction.
#[derive(Clone, PartialEq, Message)]
pub struct TxFilter {
    #[prost(message, optional, tag = "1")]
    pub block: Option<BlockId>,
    #[prost(uint64, tag = "2")]
    pub index: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub hash: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, Message)]
pub struct ChainSpec {}

/// `height` is 0 for mempool transactions.
#[derive(Clone, PartialEq, Message)]
pub struct RawTransaction {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub height: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct SendResponse {
    #[prost(int32, tag = "1")]
    pub error_code: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct LightdInfo {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(string, tag = "2")]
    pub vendor: String,
    #[prost(bool, tag = "3")]
    pub taddr_support: bool,
    #[prost(string, tag = "4")]
    pub chain_name: String,
    #[prost(uint64, tag = "5")]
    pub sapling_activation_height: u64,
    #[prost(string, tag = "6")]
    pub consensus_branch_id: String,
    #[prost(uint64, tag = "7")]
    pub block_height: u64,
    #[prost(string, tag = "8")]
    pub git_commit: String,
    #[prost(string, tag = "9")]
    pub branch: String,
    #[prost(string, tag = "10")]
    pub build_date: String,
    #[prost(string, tag = "11")]
    pub build_user: String,
    #[prost(uint64, tag = "12")]
    pub estimated_height: u64,
    #[prost(string, tag = "13")]
    pub zcashd_build: String,
    #[prost(string, tag = "14")]
    pub zcashd_subversion: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct TreeState {
    #[prost(string, tag = "1")]
    pub network: String,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(string, tag = "3")]
    pub hash: String,
    #[prost(uint32, tag = "4")]
    pub time: u32,
    #[prost(string, tag = "5")]
    pub sapling_tree: String,
    #[prost(string, tag = "6")]
    pub orchard_tree: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetAddressUtxosArg {
    #[prost(string, repeated, tag = "1")]
    pub addresses: Vec<String>,
    #[prost(uint64, tag = "2")]
    pub start_height: u64,
    /// 0 means no limit
    #[prost(uint32, tag = "3")]
    pub max_entries: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetAddressUtxosReply {
    #[prost(bytes = "vec", tag = "1")]
    pub txid: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub index: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub script: Vec<u8>,
    #[prost(int64, tag = "4")]
    pub value_zat: i64,
    #[prost(uint64, tag = "5")]
    pub height: u64,
    #[prost(string, tag = "6")]
    pub address: String,
}

// ============================================================================
// gRPC Client Implementation
// ============================================================================

/// Client for the CompactTxStreamer service.
pub mod compact_tx_streamer_client {
    #![allow(clippy::wildcard_imports)]

    use super::*;
    use tonic::codegen::*;

    const SERVICE: &str = "cash.z.wallet.sdk.rpc.CompactTxStreamer";

    /// CompactTxStreamer gRPC client.
    #[derive(Debug, Clone)]
    pub struct CompactTxStreamerClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl CompactTxStreamerClient<tonic::transport::Channel> {
        /// Create a new client from a channel.
        pub fn new(channel: tonic::transport::Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(channel),
            }
        }
    }

    fn tagged<R>(request: impl tonic::IntoRequest<R>, method: &'static str) -> tonic::Request<R> {
        let mut req = request.into_request();
        req.extensions_mut().insert(GrpcMethod::new(SERVICE, method));
        req
    }

    impl<T> CompactTxStreamerClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        async fn ready(&mut self) -> std::result::Result<(), tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })
        }

        /// Chain tip (height + hash).
        pub async fn get_latest_block(
            &mut self,
            request: impl tonic::IntoRequest<ChainSpec>,
        ) -> std::result::Result<tonic::Response<BlockId>, tonic::Status> {
            self.ready().await?;
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetLatestBlock",
            );
            let req = tagged(request, "GetLatestBlock");
            self.inner
                .unary(req, path, tonic::codec::ProstCodec::default())
                .await
        }

        /// Stream compact blocks in a range (inclusive on both ends).
        pub async fn get_block_range(
            &mut self,
            request: impl tonic::IntoRequest<BlockRange>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<CompactBlock>>,
            tonic::Status,
        > {
            self.ready().await?;
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetBlockRange",
            );
            let req = tagged(request, "GetBlockRange");
            self.inner
                .server_streaming(req, path, tonic::codec::ProstCodec::default())
                .await
        }

        /// Full transaction by hash.
        pub async fn get_transaction(
            &mut self,
            request: impl tonic::IntoRequest<TxFilter>,
        ) -> std::result::Result<tonic::Response<RawTransaction>, tonic::Status> {
            self.ready().await?;
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetTransaction",
            );
            let req = tagged(request, "GetTransaction");
            self.inner
                .unary(req, path, tonic::codec::ProstCodec::default())
                .await
        }

        /// Broadcast a raw transaction. `error_code == 0` on success.
        pub async fn send_transaction(
            &mut self,
            request: impl tonic::IntoRequest<RawTransaction>,
        ) -> std::result::Result<tonic::Response<SendResponse>, tonic::Status> {
            self.ready().await?;
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/SendTransaction",
            );
            let req = tagged(request, "SendTransaction");
            self.inner
                .unary(req, path, tonic::codec::ProstCodec::default())
                .await
        }

        pub async fn get_lightd_info(
            &mut self,
            request: impl tonic::IntoRequest<Empty>,
        ) -> std::result::Result<tonic::Response<LightdInfo>, tonic::Status> {
            self.ready().await?;
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetLightdInfo",
            );
            let req = tagged(request, "GetLightdInfo");
            self.inner
                .unary(req, path, tonic::codec::ProstCodec::default())
                .await
        }

        /// Note commitment tree state at a height.
        pub async fn get_tree_state(
            &mut self,
            request: impl tonic::IntoRequest<BlockId>,
        ) -> std::result::Result<tonic::Response<TreeState>, tonic::Status> {
            self.ready().await?;
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetTreeState",
            );
            let req = tagged(request, "GetTreeState");
            self.inner
                .unary(req, path, tonic::codec::ProstCodec::default())
                .await
        }

        /// Stream unspent transparent outputs for a set of addresses.
        pub async fn get_address_utxos_stream(
            &mut self,
            request: impl tonic::IntoRequest<GetAddressUtxosArg>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<GetAddressUtxosReply>>,
            tonic::Status,
        > {
            self.ready().await?;
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetAddressUtxosStream",
            );
            let req = tagged(request, "GetAddressUtxosStream");
            self.inner
                .server_streaming(req, path, tonic::codec::ProstCodec::default())
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utxo_reply_wire_tags() {
        let reply = GetAddressUtxosReply {
            txid: vec![7u8; 32],
            index: 3,
            script: vec![0x76, 0xa9],
            value_zat: 50_000,
            height: 1_000_000,
            address: "t1example".to_string(),
        };
        let encoded = reply.encode_to_vec();
        // field 6, wire type 2, length 9
        assert!(encoded.windows(2).any(|w| w == [0x32, 9]));
        assert_eq!(GetAddressUtxosReply::decode(&encoded[..]).unwrap(), reply);
    }
}
