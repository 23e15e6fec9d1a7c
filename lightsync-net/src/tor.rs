//! Tor integration via Arti
//!
//! Provides the embedded Tor client used for onion-routed lightwalletd
//! connections.

use crate::{Error, Result};
use arti_client::config::TorClientConfigBuilder;
use arti_client::{DataStream, TorClient as ArtiClient};
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tor_rtcompat::PreferredRuntime;
use tracing::{debug, error, info};

/// Tor bootstrap status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorStatus {
    /// Not started
    NotStarted,
    /// Bootstrapping (0-100%)
    Bootstrapping(u8),
    /// Ready for connections
    Ready,
    /// Error state
    Error,
}

/// Tor client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorConfig {
    /// Directory for persistent Tor state
    pub state_dir: PathBuf,
    /// Directory for the consensus/descriptor cache
    pub cache_dir: PathBuf,
}

impl Default for TorConfig {
    fn default() -> Self {
        let base = ProjectDirs::from("org", "Lightsync", "Lightsync")
            .map(|dirs| dirs.data_local_dir().join("tor"))
            .unwrap_or_else(|| PathBuf::from("tor_data"));
        Self {
            state_dir: base.join("state"),
            cache_dir: base.join("cache"),
        }
    }
}

/// Tor client wrapper using Arti
#[derive(Clone)]
pub struct TorClient {
    client: Arc<RwLock<Option<ArtiClient<PreferredRuntime>>>>,
    config: TorConfig,
    status: Arc<RwLock<TorStatus>>,
}

static SHARED_TOR: Lazy<Mutex<Option<TorClient>>> = Lazy::new(|| Mutex::new(None));

/// Process-wide Tor client.
///
/// Created on first call; later calls return the same client regardless of
/// the config they pass.
pub async fn shared_tor_client(config: &TorConfig) -> TorClient {
    let mut guard = SHARED_TOR.lock().await;
    if let Some(client) = guard.as_ref() {
        return client.clone();
    }
    let client = TorClient::new(config.clone());
    *guard = Some(client.clone());
    client
}

impl TorClient {
    /// Create new Tor client (not bootstrapped)
    pub fn new(config: TorConfig) -> Self {
        debug!("Creating Tor client with config: {:?}", config);

        Self {
            client: Arc::new(RwLock::new(None)),
            config,
            status: Arc::new(RwLock::new(TorStatus::NotStarted)),
        }
    }

    /// Bootstrap the Tor connection. No-op when already ready.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut slot = self.client.write().await;
        if slot.is_some() {
            return Ok(());
        }

        info!("Starting Tor bootstrap...");
        *self.status.write().await = TorStatus::Bootstrapping(0);

        let arti_config =
            TorClientConfigBuilder::from_directories(&self.config.state_dir, &self.config.cache_dir)
                .build()
                .map_err(|e| {
                    Error::Tor(format!("Invalid Tor configuration: {}", e))
                })?;

        let runtime = PreferredRuntime::create()?;
        *self.status.write().await = TorStatus::Bootstrapping(25);

        let client = match ArtiClient::with_runtime(runtime)
            .config(arti_config)
            .create_unbootstrapped()
        {
            Ok(client) => client,
            Err(e) => {
                error!("Tor client creation failed: {}", e);
                *self.status.write().await = TorStatus::Error;
                return Err(Error::Tor(format!("Failed to create Tor client: {}", e)));
            }
        };

        *self.status.write().await = TorStatus::Bootstrapping(50);
        if let Err(e) = client.bootstrap().await {
            error!("Tor bootstrap failed: {}", e);
            *self.status.write().await = TorStatus::Error;
            return Err(Error::Tor(format!("Tor bootstrap failed: {}", e)));
        }

        *slot = Some(client);
        *self.status.write().await = TorStatus::Ready;
        info!("Tor bootstrap complete");
        Ok(())
    }

    /// Get bootstrap status
    pub async fn status(&self) -> TorStatus {
        *self.status.read().await
    }

    /// Check if Tor is ready
    pub async fn is_ready(&self) -> bool {
        matches!(*self.status.read().await, TorStatus::Ready)
    }

    /// Open an anonymized stream to `host:port`, bootstrapping first if needed.
    pub async fn connect_stream(&self, host: &str, port: u16) -> Result<DataStream> {
        self.bootstrap().await?;
        let client = self.arti().await?;
        client
            .connect((host, port))
            .await
            .map_err(|e| Error::Tor(format!("Tor connect to {}:{} failed: {}", host, port, e)))
    }

    /// Derive a client whose streams never share circuits with this one.
    pub async fn isolated(&self) -> Result<TorClient> {
        self.bootstrap().await?;
        let client = self.arti().await?.isolated_client();
        Ok(Self {
            client: Arc::new(RwLock::new(Some(client))),
            config: self.config.clone(),
            status: Arc::new(RwLock::new(TorStatus::Ready)),
        })
    }

    /// Shutdown Tor client
    pub async fn shutdown(&self) {
        info!("Shutting down Tor client...");
        *self.client.write().await = None;
        *self.status.write().await = TorStatus::NotStarted;
    }

    async fn arti(&self) -> Result<ArtiClient<PreferredRuntime>> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Tor("Tor client not bootstrapped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tor_config_default() {
        let config = TorConfig::default();
        assert!(config.state_dir.ends_with("state"));
        assert!(config.cache_dir.ends_with("cache"));
    }

    #[tokio::test]
    async fn test_tor_status() {
        let client = TorClient::new(TorConfig::default());
        assert_eq!(client.status().await, TorStatus::NotStarted);
        assert!(!client.is_ready().await);
    }

    #[tokio::test]
    async fn test_shared_client_is_singleton() {
        let first = shared_tor_client(&TorConfig::default()).await;
        let second = shared_tor_client(&TorConfig {
            state_dir: PathBuf::from("/tmp/other-state"),
            cache_dir: PathBuf::from("/tmp/other-cache"),
        })
        .await;
        assert!(Arc::ptr_eq(&first.client, &second.client));
    }
}
