//! Integration tests for LightClient
//!
//! Run live tests with:
//!   cargo test --package lightsync-processor --features live_lightd -- --ignored

use lightsync_processor::{LightClient, LightClientConfig, ServiceMode, DEFAULT_LIGHTD_URL};
use std::time::Duration;

// ============================================================================
// Unit tests (no network required)
// ============================================================================

#[test]
fn test_light_client_config_defaults() {
    let config = LightClientConfig::default();

    assert_eq!(config.endpoint, DEFAULT_LIGHTD_URL);
    assert!(config.tls.enabled);
    assert!(config.tls.server_name.is_none());
    assert_eq!(config.single_call_timeout, Duration::from_secs(10));
    assert_eq!(config.streaming_call_timeout, Duration::from_secs(90));
    assert!(config.fallback_to_direct);
}

#[test]
fn test_light_client_config_direct() {
    let config = LightClientConfig::direct("http://127.0.0.1:9067");

    assert_eq!(config.endpoint, "http://127.0.0.1:9067");
    assert!(!config.tls.enabled);
}

#[test]
fn test_client_keeps_endpoint() {
    let client = LightClient::new("https://lightd.example:443");
    assert_eq!(client.endpoint(), "https://lightd.example:443");
    assert!(!ServiceMode::Direct.is_private());
}

// ============================================================================
// Feature-gated live integration tests
// ============================================================================

#[cfg(feature = "live_lightd")]
mod live_tests {
    use super::*;
    use futures_util::StreamExt;
    use lightsync_processor::{BlockSource, CompactBlockRange};

    #[tokio::test]
    #[ignore = "Requires live network"]
    async fn test_live_latest_height() {
        let client = LightClient::with_config(LightClientConfig::from_env());

        let height = client
            .latest_height(&ServiceMode::Direct)
            .await
            .expect("Failed to get latest block");
        assert!(height > 1_000_000, "Height {} too low for mainnet", height);
    }

    #[tokio::test]
    #[ignore = "Requires live network"]
    async fn test_live_block_range() {
        let client = LightClient::with_config(LightClientConfig::from_env());
        let latest = client
            .latest_height(&ServiceMode::Direct)
            .await
            .expect("Failed to get latest");

        let range = CompactBlockRange::new(latest - 9, latest).unwrap();
        let mut stream = client
            .block_range(range, &ServiceMode::Direct)
            .await
            .expect("Failed to open block stream");

        let mut heights = Vec::new();
        while let Some(block) = stream.next().await {
            heights.push(block.expect("stream item").height);
        }
        assert_eq!(heights, (latest - 9..=latest).collect::<Vec<_>>());
    }

    #[tokio::test]
    #[ignore = "Requires live network"]
    async fn test_live_server_info_over_tor() {
        let client = LightClient::with_config(LightClientConfig::from_env());

        let info = client
            .server_info(&ServiceMode::TorInGroup("live-test".into()))
            .await
            .expect("Failed to get server info");
        assert!(info.block_height > 0);

        client.close_connection().await;
    }
}
