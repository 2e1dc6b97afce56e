//! Discovery scheduler acceleration and the peer-ID-mismatch self-heal.

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use weisyn_network::config::AddrManagerOptions;
use weisyn_network::{
    AddrClass, AddressManager, Dialer, DiscoveryConfig, DiscoveryOptions, DiscoveryService,
    EventBus, NetworkError, OfflineRouting, Peerstore, ResetReason, ResetTrigger,
};

#[derive(Default)]
struct CountingDialer {
    local: Mutex<Option<PeerId>>,
    connected: Mutex<Vec<PeerId>>,
    dial_times: Mutex<Vec<Instant>>,
}

impl CountingDialer {
    fn dial_count(&self) -> usize {
        self.dial_times.lock().len()
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    fn local_peer_id(&self) -> PeerId {
        *self.local.lock().get_or_insert_with(PeerId::random)
    }
    async fn connect(
        &self,
        peer: PeerId,
        _addrs: Vec<Multiaddr>,
        _timeout: Duration,
    ) -> Result<(), NetworkError> {
        self.dial_times.lock().push(Instant::now());
        let mut connected = self.connected.lock();
        if !connected.contains(&peer) {
            connected.push(peer);
        }
        Ok(())
    }
    async fn disconnect(&self, _peer: PeerId) -> Result<(), NetworkError> {
        Ok(())
    }
    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.lock().contains(peer)
    }
    fn connected_peers(&self) -> Vec<PeerId> {
        self.connected.lock().clone()
    }
}

fn build_service(
    dialer: Arc<CountingDialer>,
    options: DiscoveryOptions,
    bootstrap_peers: Vec<Multiaddr>,
) -> (Arc<DiscoveryService>, EventBus, Arc<Peerstore>) {
    let bus = EventBus::default();
    let peerstore = Arc::new(Peerstore::new(8));
    let addr_manager = Arc::new(AddressManager::new(
        AddrManagerOptions::default(),
        Arc::clone(&peerstore),
        Arc::new(OfflineRouting),
        dialer.clone() as Arc<dyn Dialer>,
        None,
    ));
    let service = DiscoveryService::new(
        DiscoveryConfig {
            options,
            namespace: "weisyn-test-ns".into(),
            bootstrap_peers,
            min_peers: 1,
            lan_like: false,
            mdns_enabled: false,
        },
        dialer,
        Arc::new(OfflineRouting),
        addr_manager,
        Arc::clone(&peerstore),
        bus.clone(),
    );
    (service, bus, peerstore)
}

async fn wait_for_dials(dialer: &CountingDialer, at_least: usize, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if dialer.dial_count() >= at_least {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Scaled-down rendition of the NAT-like reset acceleration scenario: the
/// scheduler has backed off to its interval cap; one reset event triggers
/// a prompt round and rewinds the interval to base.
#[tokio::test(flavor = "multi_thread")]
async fn reset_event_accelerates_backed_off_scheduler() {
    let dialer = Arc::new(CountingDialer::default());
    let options = DiscoveryOptions {
        discovery_interval: Duration::from_millis(100),
        max_interval_cap: Duration::from_millis(1600),
        reset_cooldown: Duration::from_millis(50),
        fast_attempts: 1,
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(20),
        bootstrap_dial_timeout: Duration::from_secs(1),
        ..DiscoveryOptions::default()
    };
    let bootstrap: Multiaddr = format!("/ip4/203.0.113.77/tcp/28683/p2p/{}", PeerId::random())
        .parse()
        .unwrap();
    let (service, bus, _peerstore) = build_service(dialer.clone(), options, vec![bootstrap]);
    service.start();

    // Let the dynamic phase run long enough to double its interval to the
    // cap (three healthy cycles, then doubling toward 1.6 s).
    tokio::time::sleep(Duration::from_secs(3)).await;

    // Sync to the next scheduled round, then confirm the scheduler is
    // slow: the following round is at least a second away.
    let observed = dialer.dial_count();
    assert!(
        wait_for_dials(&dialer, observed + 1, Duration::from_secs(2)).await,
        "scheduler stopped dialing entirely"
    );
    let at_cap = dialer.dial_count();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(
        dialer.dial_count(),
        at_cap,
        "scheduler should be at its interval cap"
    );

    // One reset: a prompt round well before the capped interval elapses.
    bus.publish_reset(ResetReason::PeerDisconnected, ResetTrigger::KeypeerMonitor, None);
    assert!(
        wait_for_dials(&dialer, at_cap + 1, Duration::from_millis(400)).await,
        "reset did not trigger a prompt dial round"
    );

    // And the interval is back at base: another round follows quickly.
    let after_reset = dialer.dial_count();
    assert!(
        wait_for_dials(&dialer, after_reset + 1, Duration::from_millis(500)).await,
        "interval was not rewound to base"
    );
    assert_eq!(
        service
            .stats
            .resets_accepted
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    service.stop().await;
}

/// Peer-ID mismatch self-heal: the address moves from the expected peer to
/// the actual one under the temporary TTL, and only the first occurrence
/// per (expected, addr) pair counts as a new combination.
#[tokio::test]
async fn mismatch_self_heal_rehomes_address() {
    let dialer = Arc::new(CountingDialer::default());
    let (service, _bus, peerstore) =
        build_service(dialer, DiscoveryOptions::default(), Vec::new());

    let expected = PeerId::random();
    let actual = PeerId::random();
    let addr: Multiaddr = "/ip4/1.2.3.4/tcp/28683".parse().unwrap();
    peerstore.add_addrs(&expected, std::slice::from_ref(&addr), AddrClass::Dht);

    service.heal_peer_id_mismatch(expected, std::slice::from_ref(&addr), actual);

    assert!(peerstore.addrs(&expected).is_empty());
    let entries = peerstore.entries(&actual);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].addr, addr);
    assert_eq!(entries[0].class, AddrClass::Temporary);

    // Repeat within the hour: healed again, same combination.
    service.heal_peer_id_mismatch(expected, std::slice::from_ref(&addr), actual);
    let stats = service.mismatch_stats();
    assert_eq!(stats.total_healed, 2);
    assert_eq!(stats.unique_combinations, 1);
}
