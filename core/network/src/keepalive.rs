//! Key-peer keepalive: maintain the set of peers the node cannot afford to
//! lose and actively probe it.
//!
//! A probe is a reconnect attempt against the peer's current addresses.
//! When a peer crosses the failure threshold the repair chain runs: fast
//! reconnect, then a DHT lookup for fresh addresses, then a second
//! reconnect. Exhausted repairs publish a discovery reset on the bus.

use crate::addr_manager::AddressManager;
use crate::config::KeepaliveOptions;
use crate::events::{EventBus, NetworkEvent, ResetReason, ResetTrigger};
use crate::host::Dialer;
use crate::routing::RendezvousRouting;
use crate::types::NetworkError;
use libp2p::PeerId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Role buckets of the key-peer set.
#[derive(Debug, Default)]
struct KeyPeerBuckets {
    bootstrap: HashSet<PeerId>,
    kbucket_core: HashSet<PeerId>,
    recently_useful: HashMap<PeerId, Instant>,
    business_critical: HashSet<PeerId>,
}

/// Bounded union of four role buckets.
pub struct KeyPeerSet {
    max_size: usize,
    useful_window: Duration,
    buckets: Mutex<KeyPeerBuckets>,
}

impl KeyPeerSet {
    /// Create a set bounded to `max_size` with the given useful-window.
    pub fn new(max_size: usize, useful_window: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            useful_window,
            buckets: Mutex::new(KeyPeerBuckets::default()),
        }
    }

    /// Add a bootstrap peer.
    pub fn add_bootstrap(&self, peer: PeerId) {
        self.buckets.lock().bootstrap.insert(peer);
    }

    /// Replace the routing-table-core bucket.
    pub fn set_kbucket_core(&self, peers: impl IntoIterator<Item = PeerId>) {
        self.buckets.lock().kbucket_core = peers.into_iter().collect();
    }

    /// Note a peer as recently useful; it expires after the window.
    pub fn mark_recently_useful(&self, peer: PeerId) {
        self.buckets.lock().recently_useful.insert(peer, Instant::now());
    }

    /// Add a business-critical peer.
    pub fn add_business_critical(&self, peer: PeerId) {
        self.buckets.lock().business_critical.insert(peer);
    }

    /// Drop expired recently-useful entries.
    pub fn cleanup(&self) {
        let window = self.useful_window;
        self.buckets
            .lock()
            .recently_useful
            .retain(|_, at| at.elapsed() < window);
    }

    /// De-duplicated union of all buckets, truncated to the bound.
    /// Bootstrap and business-critical peers come first so truncation
    /// never drops them ahead of the transient buckets.
    pub fn get_all_key_peers(&self) -> Vec<PeerId> {
        let buckets = self.buckets.lock();
        let mut out: Vec<PeerId> = Vec::new();
        let mut seen: HashSet<PeerId> = HashSet::new();
        let ordered = buckets
            .bootstrap
            .iter()
            .chain(buckets.business_critical.iter())
            .chain(buckets.kbucket_core.iter())
            .chain(buckets.recently_useful.keys());
        for peer in ordered {
            if out.len() >= self.max_size {
                break;
            }
            if seen.insert(*peer) {
                out.push(*peer);
            }
        }
        out
    }
}

/// Keepalive counters, read by diagnostics.
#[derive(Debug, Default)]
pub struct KeepaliveStats {
    /// Probes attempted.
    pub probe_attempts: AtomicU64,
    /// Probes that reconnected.
    pub probe_successes: AtomicU64,
    /// Probes that failed.
    pub probe_failures: AtomicU64,
    /// Probes that timed out.
    pub probe_timeouts: AtomicU64,
    /// Reconnects attempted during repair.
    pub reconnect_attempts: AtomicU64,
    /// Reconnects that succeeded during repair.
    pub reconnect_successes: AtomicU64,
    /// Reconnects that failed during repair.
    pub reconnect_failures: AtomicU64,
    /// Repair FindPeer lookups attempted.
    pub findpeer_attempts: AtomicU64,
    /// Repair FindPeer lookups that returned addresses.
    pub findpeer_successes: AtomicU64,
    /// Repair FindPeer lookups that failed.
    pub findpeer_failures: AtomicU64,
    /// Repairs triggered.
    pub repairs_triggered: AtomicU64,
    /// Repairs that restored the connection.
    pub repairs_succeeded: AtomicU64,
    /// Repairs that exhausted their options.
    pub repairs_failed: AtomicU64,
    /// Reset events published.
    pub resets_published: AtomicU64,
}

#[derive(Default)]
struct ProbeState {
    probe_failures: HashMap<PeerId, u32>,
    last_probe_at: HashMap<PeerId, Instant>,
}

/// The key-peer monitor.
pub struct KeyPeerMonitor {
    options: KeepaliveOptions,
    key_peers: Arc<KeyPeerSet>,
    dialer: Arc<dyn Dialer>,
    routing: Arc<dyn RendezvousRouting>,
    addr_manager: Arc<AddressManager>,
    bus: EventBus,
    state: Mutex<ProbeState>,
    semaphore: Arc<Semaphore>,
    /// Public counters.
    pub stats: KeepaliveStats,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl KeyPeerMonitor {
    /// Create a monitor probing the given key-peer set.
    pub fn new(
        options: KeepaliveOptions,
        key_peers: Arc<KeyPeerSet>,
        dialer: Arc<dyn Dialer>,
        routing: Arc<dyn RendezvousRouting>,
        addr_manager: Arc<AddressManager>,
        bus: EventBus,
    ) -> Arc<Self> {
        let workers = options.max_concurrent.max(1);
        Arc::new(Self {
            options,
            key_peers,
            dialer,
            routing,
            addr_manager,
            bus,
            state: Mutex::new(ProbeState::default()),
            semaphore: Arc::new(Semaphore::new(workers)),
            stats: KeepaliveStats::default(),
            stop_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The set this monitor probes; collaborators add peers through it.
    pub fn key_peer_set(&self) -> Arc<KeyPeerSet> {
        Arc::clone(&self.key_peers)
    }

    /// Consecutive probe failures for a peer.
    pub fn failure_count(&self, peer: &PeerId) -> u32 {
        self.state
            .lock()
            .probe_failures
            .get(peer)
            .copied()
            .unwrap_or(0)
    }

    /// Start the probe loop and the bus listener.
    pub fn start(self: &Arc<Self>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(stop_tx);
        let mut tasks = self.tasks.lock();

        {
            let this = Arc::clone(self);
            let mut stop = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.options.probe_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => this.probe_cycle().await,
                        _ = stop.changed() => if *stop.borrow() { break },
                    }
                }
            }));
        }

        // Connected peers that talked to us are recently useful.
        {
            let this = Arc::clone(self);
            let mut rx = this.bus.subscribe();
            let mut stop = stop_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Ok(NetworkEvent::PeerConnected { peer_id, .. }) => {
                                this.key_peers.mark_recently_useful(peer_id);
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(_) => break,
                        },
                        _ = stop.changed() => if *stop.borrow() { break },
                    }
                }
            }));
        }
    }

    /// Stop the loops.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// One probe pass over the key-peer set. Waits for every spawned probe
    /// so callers observe a consistent state afterwards.
    pub async fn probe_cycle(self: &Arc<Self>) {
        self.key_peers.cleanup();
        let peers = self.key_peers.get_all_key_peers();
        let now = Instant::now();
        let mut due: Vec<PeerId> = Vec::new();
        {
            let mut state = self.state.lock();
            for peer in peers {
                if let Some(last) = state.last_probe_at.get(&peer) {
                    if now.duration_since(*last) < self.options.per_peer_min_interval {
                        continue;
                    }
                }
                if self.dialer.is_connected(&peer) {
                    state.probe_failures.remove(&peer);
                    continue;
                }
                state.last_probe_at.insert(peer, now);
                due.push(peer);
            }
        }

        let probes = due.into_iter().map(|peer| {
            let this = Arc::clone(self);
            async move {
                let Ok(_permit) = this.semaphore.acquire().await else {
                    return;
                };
                this.probe_one(peer).await;
            }
        });
        futures::future::join_all(probes).await;
    }

    async fn probe_one(self: &Arc<Self>, peer: PeerId) {
        self.stats.probe_attempts.fetch_add(1, Ordering::Relaxed);
        let addrs = self.addr_manager.get_addrs(&peer);
        let result = self
            .dialer
            .connect(peer, addrs, self.options.probe_timeout)
            .await;
        match result {
            Ok(()) => {
                self.stats.probe_successes.fetch_add(1, Ordering::Relaxed);
                self.state.lock().probe_failures.remove(&peer);
            }
            Err(e) => {
                if matches!(e, NetworkError::Timeout(_)) {
                    self.stats.probe_timeouts.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.probe_failures.fetch_add(1, Ordering::Relaxed);
                }
                let failures = {
                    let mut state = self.state.lock();
                    let failures = state.probe_failures.entry(peer).or_insert(0);
                    *failures += 1;
                    *failures
                };
                debug!(peer = %peer, failures, "key peer probe failed");
                if failures >= self.options.fail_threshold {
                    self.repair(peer).await;
                    self.state.lock().probe_failures.remove(&peer);
                }
            }
        }
    }

    /// The repair chain. Returns whether the peer was restored.
    pub async fn repair(self: &Arc<Self>, peer: PeerId) -> bool {
        self.stats.repairs_triggered.fetch_add(1, Ordering::Relaxed);
        info!(peer = %peer, "key peer unreachable, starting repair");

        // 1. Fast reconnect with whatever addresses we still hold.
        let current = self.addr_manager.get_addrs(&peer);
        if !current.is_empty() && self.try_reconnect(peer, current).await {
            self.stats.repairs_succeeded.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        // 2. Fresh addresses from the DHT.
        self.stats.findpeer_attempts.fetch_add(1, Ordering::Relaxed);
        match self
            .routing
            .find_peer(peer, self.options.repair_lookup_timeout)
            .await
        {
            Ok(info) if !info.addrs.is_empty() => {
                self.stats.findpeer_successes.fetch_add(1, Ordering::Relaxed);
                self.addr_manager.add_dht_addr(&peer, &info.addrs);
                // 3. Second reconnect with the fresh addresses.
                if self.try_reconnect(peer, info.addrs).await {
                    self.stats.repairs_succeeded.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            }
            Ok(_) | Err(_) => {
                self.stats.findpeer_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        // 4. Out of options: ask discovery to accelerate.
        warn!(peer = %peer, "key peer repair exhausted, publishing discovery reset");
        self.stats.repairs_failed.fetch_add(1, Ordering::Relaxed);
        self.stats.resets_published.fetch_add(1, Ordering::Relaxed);
        self.bus.publish_reset(
            ResetReason::PeerDisconnected,
            ResetTrigger::KeypeerMonitor,
            Some(peer),
        );
        false
    }

    async fn try_reconnect(&self, peer: PeerId, addrs: Vec<libp2p::Multiaddr>) -> bool {
        self.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        match self
            .dialer
            .connect(peer, addrs, self.options.probe_timeout)
            .await
        {
            Ok(()) => {
                self.stats.reconnect_successes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "repair reconnect failed");
                self.stats.reconnect_failures.fetch_add(1, Ordering::Relaxed);
                self.addr_manager.mark_addr_failed(&peer);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddrManagerOptions;
    use crate::peerstore::Peerstore;
    use crate::routing::OfflineRouting;
    use crate::types::AddrInfo;
    use async_trait::async_trait;
    use libp2p::Multiaddr;
    use parking_lot::Mutex as PlMutex;

    fn ma(port: u16) -> Multiaddr {
        format!("/ip4/10.3.3.3/tcp/{port}").parse().unwrap()
    }

    /// Dialer that only connects when offered the configured address.
    struct PickyDialer {
        accepts: PlMutex<Option<Multiaddr>>,
        connected: PlMutex<HashSet<PeerId>>,
    }

    impl PickyDialer {
        fn refusing_everything() -> Self {
            Self {
                accepts: PlMutex::new(None),
                connected: PlMutex::new(HashSet::new()),
            }
        }

        fn accepting(addr: Multiaddr) -> Self {
            Self {
                accepts: PlMutex::new(Some(addr)),
                connected: PlMutex::new(HashSet::new()),
            }
        }
    }

    #[async_trait]
    impl Dialer for PickyDialer {
        fn local_peer_id(&self) -> PeerId {
            PeerId::random()
        }
        async fn connect(
            &self,
            peer: PeerId,
            addrs: Vec<Multiaddr>,
            _timeout: Duration,
        ) -> Result<(), NetworkError> {
            let accepts = self.accepts.lock().clone();
            match accepts {
                Some(accepted) if addrs.contains(&accepted) => {
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

    struct FreshAddrRouting {
        addr: Multiaddr,
        fail: bool,
    }

    #[async_trait]
    impl RendezvousRouting for FreshAddrRouting {
        async fn find_peer(
            &self,
            peer: PeerId,
            _timeout: Duration,
        ) -> Result<AddrInfo, NetworkError> {
            if self.fail {
                Err(NetworkError::Transient("lookup failed".into()))
            } else {
                Ok(AddrInfo::new(peer, vec![self.addr.clone()]))
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

    fn monitor_with(
        dialer: Arc<dyn Dialer>,
        routing: Arc<dyn RendezvousRouting>,
        options: KeepaliveOptions,
    ) -> (Arc<KeyPeerMonitor>, EventBus) {
        let bus = EventBus::default();
        let peerstore = Arc::new(Peerstore::new(8));
        let addr_manager = Arc::new(AddressManager::new(
            AddrManagerOptions::default(),
            peerstore,
            Arc::new(OfflineRouting),
            Arc::clone(&dialer),
            None,
        ));
        let key_peers = Arc::new(KeyPeerSet::new(options.max_size, options.useful_window));
        let monitor = KeyPeerMonitor::new(options, key_peers, dialer, routing, addr_manager, bus.clone());
        (monitor, bus)
    }

    #[test]
    fn key_peer_set_is_bounded_union() {
        let set = KeyPeerSet::new(4, Duration::from_secs(600));
        let shared = PeerId::random();
        set.add_bootstrap(shared);
        set.add_business_critical(shared);
        for _ in 0..5 {
            set.mark_recently_useful(PeerId::random());
        }
        let peers = set.get_all_key_peers();
        assert!(peers.len() <= 4);
        assert!(peers.contains(&shared));
        assert_eq!(peers.iter().filter(|p| **p == shared).count(), 1);
    }

    #[test]
    fn cleanup_expires_recently_useful() {
        let set = KeyPeerSet::new(8, Duration::from_millis(0));
        set.mark_recently_useful(PeerId::random());
        set.cleanup();
        assert!(set.get_all_key_peers().is_empty());
    }

    #[tokio::test]
    async fn repair_succeeds_with_fresh_addrs_after_threshold() {
        let fresh = ma(2);
        let dialer = Arc::new(PickyDialer::accepting(fresh.clone()));
        let routing = Arc::new(FreshAddrRouting {
            addr: fresh,
            fail: false,
        });
        let options = KeepaliveOptions {
            fail_threshold: 3,
            per_peer_min_interval: Duration::from_millis(0),
            ..KeepaliveOptions::default()
        };
        let (monitor, bus) = monitor_with(dialer, routing, options);
        let mut rx = bus.subscribe();

        let peer = PeerId::random();
        // Stale address on record: probes against it keep failing.
        monitor.addr_manager.add_dht_addr(&peer, &[ma(1)]);
        monitor.key_peers.add_business_critical(peer);

        monitor.probe_cycle().await;
        assert_eq!(monitor.failure_count(&peer), 1);
        monitor.probe_cycle().await;
        assert_eq!(monitor.failure_count(&peer), 2);
        // Third failure crosses the threshold and repairs via FindPeer.
        monitor.probe_cycle().await;

        assert_eq!(monitor.failure_count(&peer), 0);
        assert_eq!(monitor.stats.repairs_succeeded.load(Ordering::Relaxed), 1);
        assert_eq!(monitor.stats.findpeer_successes.load(Ordering::Relaxed), 1);
        assert!(monitor.dialer.is_connected(&peer));
        // No reset event was published.
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, NetworkEvent::DiscoveryIntervalReset { .. }));
        }
    }

    #[tokio::test]
    async fn repair_exhaustion_publishes_exactly_one_reset() {
        let dialer = Arc::new(PickyDialer::refusing_everything());
        let routing = Arc::new(FreshAddrRouting {
            addr: ma(9),
            fail: true,
        });
        let options = KeepaliveOptions {
            fail_threshold: 3,
            per_peer_min_interval: Duration::from_millis(0),
            ..KeepaliveOptions::default()
        };
        let (monitor, bus) = monitor_with(dialer, routing, options);
        let mut rx = bus.subscribe();

        let peer = PeerId::random();
        monitor.addr_manager.add_dht_addr(&peer, &[ma(1)]);
        monitor.key_peers.add_business_critical(peer);

        for _ in 0..3 {
            monitor.probe_cycle().await;
        }

        let mut resets = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let NetworkEvent::DiscoveryIntervalReset {
                reason,
                trigger,
                peer_id,
                ..
            } = event
            {
                resets.push((reason, trigger, peer_id));
            }
        }
        assert_eq!(
            resets,
            vec![(
                ResetReason::PeerDisconnected,
                ResetTrigger::KeypeerMonitor,
                Some(peer)
            )]
        );
        assert_eq!(monitor.stats.repairs_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn connected_key_peers_are_not_probed() {
        let fresh = ma(5);
        let dialer = Arc::new(PickyDialer::accepting(fresh.clone()));
        let peer = PeerId::random();
        dialer.connected.lock().insert(peer);
        let (monitor, _bus) = monitor_with(
            dialer,
            Arc::new(OfflineRouting),
            KeepaliveOptions {
                per_peer_min_interval: Duration::from_millis(0),
                ..KeepaliveOptions::default()
            },
        );
        monitor.key_peers.add_bootstrap(peer);
        monitor.probe_cycle().await;
        assert_eq!(monitor.stats.probe_attempts.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn per_peer_min_interval_skips_recent_probes() {
        let dialer = Arc::new(PickyDialer::refusing_everything());
        let (monitor, _bus) = monitor_with(
            dialer,
            Arc::new(OfflineRouting),
            KeepaliveOptions {
                per_peer_min_interval: Duration::from_secs(3600),
                ..KeepaliveOptions::default()
            },
        );
        let peer = PeerId::random();
        monitor.key_peers.add_bootstrap(peer);
        monitor.probe_cycle().await;
        monitor.probe_cycle().await;
        assert_eq!(monitor.stats.probe_attempts.load(Ordering::Relaxed), 1);
    }
}
