//! Tor circuit pool.
//!
//! Keeps one channel for the shared default circuit and one per named
//! group. Group channels are created on first use and reused afterwards. A
//! failed call drops the cached channel so the next call builds a fresh one.

use crate::{connect_tor_channel, Result, TorClient};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

/// Which circuit a call should travel over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CircuitKind {
    /// Process-wide shared circuit
    Default,
    /// Circuit shared by every call in the named group
    Group(String),
    /// Fresh isolated circuit, never cached
    Unique,
}

/// Opens channels for a circuit kind.
#[async_trait]
pub trait CircuitConnector: Send + Sync {
    /// Build a new channel for `kind`.
    async fn open(&self, kind: &CircuitKind) -> Result<Channel>;
}

/// Connector backed by the embedded Arti client.
pub struct TorCircuitConnector {
    tor: TorClient,
    endpoint: Endpoint,
}

impl TorCircuitConnector {
    /// Create connector for `endpoint` using `tor` as the shared client.
    pub fn new(tor: TorClient, endpoint: Endpoint) -> Self {
        Self { tor, endpoint }
    }
}

#[async_trait]
impl CircuitConnector for TorCircuitConnector {
    async fn open(&self, kind: &CircuitKind) -> Result<Channel> {
        let client = match kind {
            CircuitKind::Default => self.tor.clone(),
            CircuitKind::Group(_) | CircuitKind::Unique => self.tor.isolated().await?,
        };
        Ok(connect_tor_channel(client, self.endpoint.clone()))
    }
}

/// Cache of Tor channels keyed by circuit kind.
pub struct CircuitPool<C: CircuitConnector> {
    connector: C,
    default: Mutex<Option<Channel>>,
    groups: Mutex<HashMap<String, Channel>>,
}

impl<C: CircuitConnector> CircuitPool<C> {
    /// Create an empty pool.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            default: Mutex::new(None),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Channel for `kind`, creating and caching it when needed.
    pub async fn channel(&self, kind: &CircuitKind) -> Result<Channel> {
        match kind {
            CircuitKind::Unique => self.connector.open(kind).await,
            CircuitKind::Default => {
                let mut slot = self.default.lock().await;
                if let Some(channel) = slot.as_ref() {
                    return Ok(channel.clone());
                }
                info!("Opening default Tor circuit");
                let channel = self.connector.open(kind).await?;
                *slot = Some(channel.clone());
                Ok(channel)
            }
            CircuitKind::Group(name) => {
                let mut groups = self.groups.lock().await;
                if let Some(channel) = groups.get(name) {
                    return Ok(channel.clone());
                }
                info!("Opening Tor circuit for group '{}'", name);
                let channel = self.connector.open(kind).await?;
                groups.insert(name.clone(), channel.clone());
                Ok(channel)
            }
        }
    }

    /// Drop the cached channel for `kind` after a failure.
    pub async fn invalidate(&self, kind: &CircuitKind) {
        match kind {
            CircuitKind::Default => {
                debug!("Dropping default Tor circuit");
                *self.default.lock().await = None;
            }
            CircuitKind::Group(name) => {
                debug!("Dropping Tor circuit for group '{}'", name);
                self.groups.lock().await.remove(name);
            }
            CircuitKind::Unique => {}
        }
    }

    /// Drop every cached channel.
    pub async fn close_all(&self) {
        *self.default.lock().await = None;
        self.groups.lock().await.clear();
    }

    /// Names of groups with a cached channel.
    pub async fn cached_groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether the default circuit is currently cached.
    pub async fn has_default(&self) -> bool {
        self.default.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingConnector {
        opened: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CircuitConnector for CountingConnector {
        async fn open(&self, _kind: &CircuitKind) -> Result<Channel> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Endpoint::from_static("http://127.0.0.1:9067").connect_lazy())
        }
    }

    fn pool() -> (CircuitPool<CountingConnector>, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let pool = CircuitPool::new(CountingConnector {
            opened: Arc::clone(&opened),
        });
        (pool, opened)
    }

    #[tokio::test]
    async fn test_group_circuit_created_once() {
        let (pool, opened) = pool();
        let group = CircuitKind::Group("enhancement".to_string());

        pool.channel(&group).await.unwrap();
        pool.channel(&group).await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        pool.channel(&CircuitKind::Group("utxo".to_string()))
            .await
            .unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.cached_groups().await, vec!["enhancement", "utxo"]);
    }

    #[tokio::test]
    async fn test_invalidate_drops_cached_channel() {
        let (pool, opened) = pool();
        pool.channel(&CircuitKind::Default).await.unwrap();
        assert!(pool.has_default().await);

        pool.invalidate(&CircuitKind::Default).await;
        assert!(!pool.has_default().await);

        pool.channel(&CircuitKind::Default).await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unique_is_never_cached() {
        let (pool, opened) = pool();
        pool.channel(&CircuitKind::Unique).await.unwrap();
        pool.channel(&CircuitKind::Unique).await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert!(pool.cached_groups().await.is_empty());
        assert!(!pool.has_default().await);
    }
}
