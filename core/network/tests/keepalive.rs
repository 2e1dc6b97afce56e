//! Key-peer repair chain end to end: recovery through FindPeer and reset
//! publication on exhaustion.

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use weisyn_network::config::{AddrManagerOptions, KeepaliveOptions};
use weisyn_network::{
    AddrInfo, AddressManager, Dialer, EventBus, KeyPeerMonitor, KeyPeerSet, NetworkError,
    NetworkEvent, OfflineRouting, Peerstore, RendezvousRouting, ResetReason, ResetTrigger,
};

fn ma(port: u16) -> Multiaddr {
    format!("/ip4/10.44.0.9/tcp/{port}").parse().unwrap()
}

/// Connects only when offered the single accepted address.
struct GatekeeperDialer {
    accepts: Option<Multiaddr>,
    connected: Mutex<HashSet<PeerId>>,
}

#[async_trait]
impl Dialer for GatekeeperDialer {
    fn local_peer_id(&self) -> PeerId {
        PeerId::random()
    }
    async fn connect(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        _timeout: Duration,
    ) -> Result<(), NetworkError> {
        match &self.accepts {
            Some(accepted) if addrs.contains(accepted) => {
                self.connected.lock().insert(peer);
                Ok(())
            }
            _ => Err(NetworkError::Transient("connection refused".into())),
        }
    }
    async fn disconnect(&self, _peer: PeerId) -> Result<(), NetworkError> {
        Ok(())
    }
    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.lock().contains(peer)
    }
    fn connected_peers(&self) -> Vec<PeerId> {
        self.connected.lock().iter().copied().collect()
    }
}

struct LookupRouting {
    result: Result<Multiaddr, ()>,
}

#[async_trait]
impl RendezvousRouting for LookupRouting {
    async fn find_peer(&self, peer: PeerId, _timeout: Duration) -> Result<AddrInfo, NetworkError> {
        match &self.result {
            Ok(addr) => Ok(AddrInfo::new(peer, vec![addr.clone()])),
            Err(()) => Err(NetworkError::Transient("not found".into())),
        }
    }
    async fn advertise_and_find_peers(
        &self,
        _namespace: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<AddrInfo>, NetworkError> {
        Err(NetworkError::Offline)
    }
    fn routing_table_size(&self) -> usize {
        0
    }
    fn offline(&self) -> bool {
        false
    }
}

fn assemble(
    dialer: Arc<GatekeeperDialer>,
    routing: Arc<dyn RendezvousRouting>,
) -> (Arc<KeyPeerMonitor>, Arc<AddressManager>, EventBus) {
    let bus = EventBus::default();
    let peerstore = Arc::new(Peerstore::new(8));
    let addr_manager = Arc::new(AddressManager::new(
        AddrManagerOptions::default(),
        peerstore,
        Arc::new(OfflineRouting),
        dialer.clone() as Arc<dyn Dialer>,
        None,
    ));
    let options = KeepaliveOptions {
        fail_threshold: 3,
        per_peer_min_interval: Duration::from_millis(0),
        ..KeepaliveOptions::default()
    };
    let key_peers = Arc::new(KeyPeerSet::new(options.max_size, options.useful_window));
    let monitor = KeyPeerMonitor::new(
        options,
        key_peers,
        dialer,
        routing,
        Arc::clone(&addr_manager),
        bus.clone(),
    );
    (monitor, addr_manager, bus)
}

#[tokio::test]
async fn repair_restores_peer_after_three_failures() {
    let fresh = ma(2);
    let dialer = Arc::new(GatekeeperDialer {
        accepts: Some(fresh.clone()),
        connected: Mutex::new(HashSet::new()),
    });
    let routing = Arc::new(LookupRouting {
        result: Ok(fresh),
    });
    let (monitor, addr_manager, bus) = assemble(dialer.clone(), routing);
    let mut rx = bus.subscribe();

    let peer = PeerId::random();
    addr_manager.add_dht_addr(&peer, &[ma(1)]);
    monitor.key_peer_set().add_business_critical(peer);

    monitor.probe_cycle().await;
    monitor.probe_cycle().await;
    assert_eq!(monitor.failure_count(&peer), 2);
    monitor.probe_cycle().await;

    assert!(dialer.is_connected(&peer));
    assert_eq!(monitor.failure_count(&peer), 0);
    assert_eq!(monitor.stats.repairs_succeeded.load(Ordering::Relaxed), 1);
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, NetworkEvent::DiscoveryIntervalReset { .. }),
            "successful repair must not publish a reset"
        );
    }
}

#[tokio::test]
async fn exhausted_repair_publishes_one_reset() {
    let dialer = Arc::new(GatekeeperDialer {
        accepts: None,
        connected: Mutex::new(HashSet::new()),
    });
    let routing = Arc::new(LookupRouting { result: Err(()) });
    let (monitor, addr_manager, bus) = assemble(dialer, routing);
    let mut rx = bus.subscribe();

    let peer = PeerId::random();
    addr_manager.add_dht_addr(&peer, &[ma(1)]);
    monitor.key_peer_set().add_business_critical(peer);

    for _ in 0..3 {
        monitor.probe_cycle().await;
    }

    let mut resets = 0;
    while let Ok(event) = rx.try_recv() {
        if let NetworkEvent::DiscoveryIntervalReset {
            reason,
            trigger,
            peer_id,
            ..
        } = event
        {
            assert_eq!(reason, ResetReason::PeerDisconnected);
            assert_eq!(trigger, ResetTrigger::KeypeerMonitor);
            assert_eq!(peer_id, Some(peer));
            resets += 1;
        }
    }
    assert_eq!(resets, 1);
    assert_eq!(monitor.stats.repairs_failed.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn key_peer_set_respects_max_size() {
    let set = KeyPeerSet::new(128, Duration::from_secs(600));
    for _ in 0..200 {
        set.mark_recently_useful(PeerId::random());
        set.add_business_critical(PeerId::random());
    }
    assert!(set.get_all_key_peers().len() <= 128);
}
