//! Routing service: a thin wrapper over the host's Kademlia behaviour.
//!
//! The DHT runs under the project protocol prefix so WES nodes never
//! intermix with public DHT networks. Rendezvous is implemented over
//! provider records: advertising a namespace provides `sha256(namespace)`,
//! discovery reads the providers of the same key.
//!
//! When the DHT is disabled the service is *offline*: every operation is a
//! safe no-op or returns [`NetworkError::Offline`] so calling loops
//! terminate instead of spinning.

use crate::config::DhtMode;
use crate::host::HostHandle;
use crate::peerstore::Peerstore;
use crate::types::{AddrInfo, NetworkError};
use async_trait::async_trait;
use libp2p::PeerId;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Rendezvous-routing capability consumed by Discovery and the Address
/// Manager. Implemented by [`RoutingService`]; tests substitute mocks.
#[async_trait]
pub trait RendezvousRouting: Send + Sync + 'static {
    /// DHT lookup of one peer's addresses.
    async fn find_peer(&self, peer: PeerId, timeout: Duration) -> Result<AddrInfo, NetworkError>;
    /// Advertise under a namespace and stream discovered peers until the
    /// receiver is dropped or the round completes.
    async fn advertise_and_find_peers(
        &self,
        namespace: &str,
    ) -> Result<mpsc::Receiver<AddrInfo>, NetworkError>;
    /// Current routing-table size.
    fn routing_table_size(&self) -> usize;
    /// Whether the DHT is offline.
    fn offline(&self) -> bool;
}

/// Hash a rendezvous namespace into its DHT key.
pub fn namespace_key(namespace: &str) -> Vec<u8> {
    Sha256::digest(namespace.as_bytes()).to_vec()
}

/// Kademlia-backed routing service.
pub struct RoutingService {
    handle: HostHandle,
    peerstore: Arc<Peerstore>,
    mode: DhtMode,
    bootstrap_peer_count: usize,
}

impl RoutingService {
    /// Wrap the host's DHT.
    pub fn new(
        handle: HostHandle,
        peerstore: Arc<Peerstore>,
        mode: DhtMode,
        bootstrap_peer_count: usize,
    ) -> Self {
        Self {
            handle,
            peerstore,
            mode,
            bootstrap_peer_count,
        }
    }

    /// Configured DHT mode.
    pub fn mode(&self) -> DhtMode {
        self.mode
    }

    /// Number of configured bootstrap peers, for diagnostics.
    pub fn bootstrap_peer_count(&self) -> usize {
        self.bootstrap_peer_count
    }

    /// Kick a DHT bootstrap. No-op when offline.
    pub async fn bootstrap(&self) -> Result<(), NetworkError> {
        if self.offline() {
            return Ok(());
        }
        self.handle.kad_bootstrap().await
    }

    /// Closest peers to a key, resolved to dialing info. The stream is
    /// finite and not restartable.
    pub async fn find_closest_peers(
        &self,
        key: Vec<u8>,
        limit: usize,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<AddrInfo>, NetworkError> {
        if self.offline() {
            return Err(NetworkError::Offline);
        }
        let peers = self.handle.find_closest_peers(key, timeout).await?;
        let (tx, rx) = mpsc::channel(limit.max(1));
        let peerstore = Arc::clone(&self.peerstore);
        tokio::spawn(async move {
            for peer in peers.into_iter().take(limit) {
                let info = AddrInfo::new(peer, peerstore.addrs(&peer));
                if tx.send(info).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl RendezvousRouting for RoutingService {
    async fn find_peer(&self, peer: PeerId, timeout: Duration) -> Result<AddrInfo, NetworkError> {
        if self.offline() {
            return Err(NetworkError::Offline);
        }
        self.handle.find_peer(peer, timeout).await
    }

    async fn advertise_and_find_peers(
        &self,
        namespace: &str,
    ) -> Result<mpsc::Receiver<AddrInfo>, NetworkError> {
        if self.offline() {
            return Err(NetworkError::Offline);
        }
        debug!(namespace, "rendezvous round");
        self.handle
            .advertise_and_find(namespace_key(namespace))
            .await
    }

    fn routing_table_size(&self) -> usize {
        self.handle.routing_table_size()
    }

    fn offline(&self) -> bool {
        self.handle.dht_offline()
    }
}

/// Always-offline routing, used when the DHT is disabled and as a test
/// double.
pub struct OfflineRouting;

#[async_trait]
impl RendezvousRouting for OfflineRouting {
    async fn find_peer(&self, _peer: PeerId, _timeout: Duration) -> Result<AddrInfo, NetworkError> {
        Err(NetworkError::Offline)
    }

    async fn advertise_and_find_peers(
        &self,
        _namespace: &str,
    ) -> Result<mpsc::Receiver<AddrInfo>, NetworkError> {
        Err(NetworkError::Offline)
    }

    fn routing_table_size(&self) -> usize {
        0
    }

    fn offline(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_keys_are_stable_and_distinct() {
        let a = namespace_key("weisyn-prod-public-wesnet-1001-abcdef01");
        let b = namespace_key("weisyn-prod-public-wesnet-1001-abcdef01");
        let c = namespace_key("weisyn-test-public-wesnet-1001-abcdef01");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn offline_routing_refuses_cleanly() {
        let routing = OfflineRouting;
        assert!(routing.offline());
        assert_eq!(routing.routing_table_size(), 0);
        assert!(matches!(
            routing.find_peer(PeerId::random(), Duration::from_secs(1)).await,
            Err(NetworkError::Offline)
        ));
        assert!(matches!(
            routing.advertise_and_find_peers("ns").await,
            Err(NetworkError::Offline)
        ));
    }
}
