//! Discovery service: bootstrap dial scheduler, mDNS connect policy and the
//! per-namespace DHT rendezvous loop, coupled to the rest of the runtime
//! through bus events only.
//!
//! All loops are infinite-resilient: errors inside a round are logged and
//! counted, never terminal. The only loop exits are the stop signal and a
//! routing layer that reports offline.

use crate::addr_manager::AddressManager;
use crate::addrs::{order_by_transport, partition_private};
use crate::config::DiscoveryOptions;
use crate::events::{
    ConnectSource, EventBus, NetworkEvent, ResetCooldown, ResetReason, ResetTrigger,
};
use crate::host::{peer_id_of, strip_p2p, Dialer};
use crate::metrics;
use crate::peerstore::Peerstore;
use crate::routing::RendezvousRouting;
use crate::types::{
    parse_peer_id_mismatch, unix_now, AddrClass, AddrInfo, DiscoveryPhase, NetworkError,
};
use libp2p::{Multiaddr, PeerId};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Per-address dial timeout for LAN-style individual attempts.
const PER_ADDR_DIAL_TIMEOUT: Duration = Duration::from_secs(4);
/// Combined connect timeout for rendezvous-discovered peers.
const DHT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Bootstrap-phase bailout: no success for this long moves to Isolated.
const BOOTSTRAP_PHASE_LIMIT: Duration = Duration::from_secs(300);
/// Rendezvous round timeouts per phase.
const ROUND_TIMEOUT_BOOTSTRAP: Duration = Duration::from_secs(60);
const ROUND_TIMEOUT_STEADY: Duration = Duration::from_secs(60);
const ROUND_TIMEOUT_ISOLATED: Duration = Duration::from_secs(30);
/// Inter-round base while in Bootstrap phase.
const BOOTSTRAP_ROUND_INTERVAL: Duration = Duration::from_secs(5);
/// Isolated-phase backoff bounds.
const ISOLATED_BACKOFF_BASE: Duration = Duration::from_secs(5);
const ISOLATED_BACKOFF_CAP: Duration = Duration::from_secs(600);
/// Mismatch-cache entries older than this are evicted.
const MISMATCH_CACHE_TTL: Duration = Duration::from_secs(3600);
/// Mismatch-cache cleaner cadence.
const MISMATCH_CLEAN_INTERVAL: Duration = Duration::from_secs(3600);
/// Mismatch-cache capacity; least-recently-seen combinations fall out
/// between TTL cleans.
const MISMATCH_CACHE_CAPACITY: usize = 1024;

/// Apply ±`fraction` jitter to a duration.
pub fn jittered(duration: Duration, fraction: f64) -> Duration {
    let base = duration.as_secs_f64();
    let spread = base * fraction;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((base + offset).max(0.0))
}

/// Discovery counters, read by diagnostics.
#[derive(Debug, Default)]
pub struct DiscoveryStats {
    /// Bootstrap dial rounds.
    pub bootstrap_rounds: AtomicU64,
    /// Bootstrap rounds with at least one success.
    pub bootstrap_successes: AtomicU64,
    /// mDNS peers seen.
    pub mdns_found: AtomicU64,
    /// mDNS-driven connects that succeeded.
    pub mdns_connect_success: AtomicU64,
    /// mDNS-driven connects that failed.
    pub mdns_connect_fail: AtomicU64,
    /// Rendezvous rounds completed.
    pub dht_rounds: AtomicU64,
    /// Valid peers seen by rendezvous.
    pub peers_discovered: AtomicU64,
    /// Peer-ID mismatches healed (total occurrences).
    pub mismatches_healed: AtomicU64,
    /// Distinct (expected, addr) mismatch combinations seen.
    pub mismatch_combinations: AtomicU64,
    /// Reset signals accepted (outside cooldown).
    pub resets_accepted: AtomicU64,
}

/// Snapshot of the mismatch cache for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MismatchCacheStats {
    /// Live cache entries.
    pub entries: usize,
    /// Total healed occurrences.
    pub total_healed: u64,
    /// Distinct combinations.
    pub unique_combinations: u64,
}

/// Everything the discovery service needs at construction.
pub struct DiscoveryConfig {
    /// Scheduler timers.
    pub options: DiscoveryOptions,
    /// Rendezvous namespace.
    pub namespace: String,
    /// Validated bootstrap multiaddrs (each with `/p2p/`).
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Scheduler keeps its base interval below this connected-peer count.
    pub min_peers: usize,
    /// LAN-like deployment: prefer private addresses.
    pub lan_like: bool,
    /// mDNS enabled (affects the empty-bootstrap warning).
    pub mdns_enabled: bool,
}

/// The discovery service.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    dialer: Arc<dyn Dialer>,
    routing: Arc<dyn RendezvousRouting>,
    addr_manager: Arc<AddressManager>,
    peerstore: Arc<Peerstore>,
    bus: EventBus,
    phase: RwLock<DiscoveryPhase>,
    mismatch_cache: Mutex<LruCache<(PeerId, Multiaddr), Instant>>,
    /// Public counters.
    pub stats: DiscoveryStats,
    reset_cooldown: ResetCooldown,
    bootstrap_reset_tx: mpsc::Sender<()>,
    bootstrap_reset_rx: Mutex<Option<mpsc::Receiver<()>>>,
    dht_reset_tx: mpsc::Sender<()>,
    dht_reset_rx: Mutex<Option<mpsc::Receiver<()>>>,
    hint_tx: mpsc::Sender<()>,
    hint_rx: Mutex<Option<mpsc::Receiver<()>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DiscoveryService {
    /// Create the service. Bootstrap peers are registered with the address
    /// manager as protected records.
    pub fn new(
        config: DiscoveryConfig,
        dialer: Arc<dyn Dialer>,
        routing: Arc<dyn RendezvousRouting>,
        addr_manager: Arc<AddressManager>,
        peerstore: Arc<Peerstore>,
        bus: EventBus,
    ) -> Arc<Self> {
        let (bootstrap_reset_tx, bootstrap_reset_rx) = mpsc::channel(1);
        let (dht_reset_tx, dht_reset_rx) = mpsc::channel(1);
        let (hint_tx, hint_rx) = mpsc::channel(1);
        let cooldown = config.options.reset_cooldown;
        let service = Arc::new(Self {
            config,
            dialer,
            routing,
            addr_manager: Arc::clone(&addr_manager),
            peerstore,
            bus,
            phase: RwLock::new(DiscoveryPhase::Bootstrap),
            mismatch_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(MISMATCH_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            stats: DiscoveryStats::default(),
            reset_cooldown: ResetCooldown::new(cooldown),
            bootstrap_reset_tx,
            bootstrap_reset_rx: Mutex::new(Some(bootstrap_reset_rx)),
            dht_reset_tx,
            dht_reset_rx: Mutex::new(Some(dht_reset_rx)),
            hint_tx,
            hint_rx: Mutex::new(Some(hint_rx)),
            stop_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        for addr in &service.config.bootstrap_peers {
            if let Some(peer) = peer_id_of(addr) {
                addr_manager.add_bootstrap_addr(&peer, &[strip_p2p(addr)]);
            }
        }
        service
    }

    /// Current rendezvous phase.
    pub fn phase(&self) -> DiscoveryPhase {
        *self.phase.read()
    }

    /// Mismatch cache statistics.
    pub fn mismatch_stats(&self) -> MismatchCacheStats {
        MismatchCacheStats {
            entries: self.mismatch_cache.lock().len(),
            total_healed: self.stats.mismatches_healed.load(Ordering::Relaxed),
            unique_combinations: self.stats.mismatch_combinations.load(Ordering::Relaxed),
        }
    }

    /// Start every discovery loop.
    pub fn start(self: &Arc<Self>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(stop_tx);
        let mut tasks = self.tasks.lock();

        // Bootstrap dial scheduler.
        if let Some(reset_rx) = self.bootstrap_reset_rx.lock().take() {
            let this = Arc::clone(self);
            let stop = stop_rx.clone();
            let hint_rx = self.hint_rx.lock().take();
            tasks.push(tokio::spawn(async move {
                this.bootstrap_scheduler(stop, reset_rx, hint_rx).await;
            }));
        }

        // DHT rendezvous loop.
        if let Some(reset_rx) = self.dht_reset_rx.lock().take() {
            let this = Arc::clone(self);
            let stop = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                this.rendezvous_loop(stop, reset_rx).await;
            }));
        }

        // Bus listener: reset events (cooldown-guarded), quality hints and
        // mDNS notifications.
        {
            let this = Arc::clone(self);
            let mut rx = this.bus.subscribe();
            let mut stop = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Ok(NetworkEvent::DiscoveryIntervalReset { reason, trigger, .. }) => {
                                this.on_reset_event(reason, trigger);
                            }
                            Ok(NetworkEvent::NetworkQualityChanged { .. }) => {
                                let _ = this.hint_tx.try_send(());
                            }
                            Ok(NetworkEvent::MdnsPeerFound { peer_id, addrs }) => {
                                this.stats.mdns_found.fetch_add(1, Ordering::Relaxed);
                                this.handle_mdns_peer(peer_id, addrs).await;
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!(skipped, "discovery bus listener lagged");
                            }
                            Err(_) => break,
                        },
                        _ = stop.changed() => if *stop.borrow() { break },
                    }
                }
            }));
        }

        // Mismatch cache cleaner.
        {
            let this = Arc::clone(self);
            let mut stop = stop_rx;
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(MISMATCH_CLEAN_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => this.clean_mismatch_cache(),
                        _ = stop.changed() => if *stop.borrow() { break },
                    }
                }
            }));
        }
    }

    /// Stop all loops.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    fn on_reset_event(&self, reason: ResetReason, trigger: ResetTrigger) {
        if !self.reset_cooldown.accept() {
            debug!(
                reason = reason.as_str(),
                trigger = trigger.as_str(),
                "reset ignored inside cooldown"
            );
            return;
        }
        self.stats.resets_accepted.fetch_add(1, Ordering::Relaxed);
        info!(
            reason = reason.as_str(),
            trigger = trigger.as_str(),
            "accelerating discovery after reset event"
        );
        let _ = self.bootstrap_reset_tx.try_send(());
        let _ = self.dht_reset_tx.try_send(());
    }

    // ---- bootstrap scheduler ---------------------------------------------

    async fn bootstrap_scheduler(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
        mut reset_rx: mpsc::Receiver<()>,
        hint_rx: Option<mpsc::Receiver<()>>,
    ) {
        if self.config.bootstrap_peers.is_empty() {
            if !self.config.mdns_enabled {
                warn!(
                    "no valid bootstrap peers and mDNS is disabled; the node \
                     cannot join the network - configure p2p.bootstrap_peers"
                );
            }
            return;
        }
        let mut hint_rx = match hint_rx {
            Some(rx) => rx,
            None => {
                // Keep a sender alive so the channel never reports closed.
                let (tx, rx) = mpsc::channel(1);
                std::mem::forget(tx);
                rx
            }
        };

        // Fast phase: bounded attempts with exponential backoff.
        let mut delay = self.config.options.backoff_base;
        for attempt in 1..=self.config.options.fast_attempts {
            let successes = self.dial_all_bootstrap().await;
            if successes > 0 {
                break;
            }
            debug!(attempt, next_delay = ?delay, "bootstrap fast phase round failed");
            tokio::select! {
                _ = tokio::time::sleep(jittered(delay, 0.10)) => {}
                _ = reset_rx.recv() => { delay = self.config.options.backoff_base; continue; }
                _ = stop.changed() => if *stop.borrow() { return },
            }
            delay = delay
                .mul_f64(self.config.options.backoff_factor)
                .min(self.config.options.backoff_cap);
        }

        // Dynamic phase.
        let base = self.config.options.discovery_interval;
        let cap = self.config.options.max_interval_cap;
        let mut interval = base;
        let mut healthy_cycles = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(jittered(interval, 0.10)) => {}
                received = reset_rx.recv() => {
                    if received.is_none() { return; }
                    interval = base;
                    healthy_cycles = 0;
                }
                received = hint_rx.recv() => {
                    // Quality hint: one extra round, interval untouched.
                    if received.is_none() { return; }
                }
                _ = stop.changed() => if *stop.borrow() { return },
            }
            self.dial_all_bootstrap().await;
            let connected = self.dialer.connected_peers().len();
            if connected >= self.config.min_peers {
                healthy_cycles += 1;
                if healthy_cycles >= 3 {
                    interval = (interval * 2).min(cap);
                }
            } else {
                healthy_cycles = 0;
                interval = base;
            }
        }
    }

    /// Dial every valid bootstrap peer once; returns the success count.
    pub async fn dial_all_bootstrap(&self) -> usize {
        let round = self.stats.bootstrap_rounds.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::bump(metrics::DISCOVERY_BOOTSTRAP_ATTEMPT);
        self.bus.publish(NetworkEvent::BootstrapAttempt { round });

        let timeout = self.config.options.bootstrap_dial_timeout;
        let dials = self.config.bootstrap_peers.iter().filter_map(|addr| {
            let peer = peer_id_of(addr)?;
            if peer == self.dialer.local_peer_id() {
                return None;
            }
            let dialer = Arc::clone(&self.dialer);
            let addr = strip_p2p(addr);
            Some(async move { dialer.connect(peer, vec![addr], timeout).await.is_ok() })
        });
        let results = futures::future::join_all(dials).await;
        let successes = results.into_iter().filter(|ok| *ok).count();

        if successes > 0 {
            self.stats
                .bootstrap_successes
                .fetch_add(1, Ordering::Relaxed);
            metrics::bump(metrics::DISCOVERY_BOOTSTRAP_SUCCESS);
            metrics::set_gauge(metrics::DISCOVERY_LAST_BOOTSTRAP, unix_now() as f64);
            let connected = self.dialer.connected_peers().len();
            self.bus
                .publish(NetworkEvent::BootstrapSuccess { connected });
            for addr in &self.config.bootstrap_peers {
                if let Some(peer) = peer_id_of(addr) {
                    if self.dialer.is_connected(&peer) {
                        self.bus.publish(NetworkEvent::PeerConnected {
                            peer_id: peer,
                            source: ConnectSource::Bootstrap,
                        });
                    }
                }
            }
        }
        successes
    }

    // ---- mDNS -------------------------------------------------------------

    /// Dial an mDNS-discovered peer with private-address preference and
    /// TCP > QUIC ordering, one address at a time.
    pub async fn handle_mdns_peer(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        if peer == self.dialer.local_peer_id() || self.dialer.is_connected(&peer) {
            return;
        }
        let (private, all) = partition_private(&addrs);
        let mut candidates = if self.config.lan_like && !private.is_empty() {
            private
        } else {
            all
        };
        order_by_transport(&mut candidates);
        self.addr_manager.add_dht_addr(&peer, &candidates);

        for addr in candidates {
            match self
                .dialer
                .connect(peer, vec![addr.clone()], PER_ADDR_DIAL_TIMEOUT)
                .await
            {
                Ok(()) => {
                    self.stats
                        .mdns_connect_success
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::bump(metrics::DISCOVERY_MDNS_CONNECT_SUCCESS);
                    self.bus.publish(NetworkEvent::PeerConnected {
                        peer_id: peer,
                        source: ConnectSource::Mdns,
                    });
                    return;
                }
                Err(e) => {
                    debug!(peer = %peer, addr = %addr, error = %e, "mDNS dial failed");
                }
            }
        }
        self.stats.mdns_connect_fail.fetch_add(1, Ordering::Relaxed);
        metrics::bump(metrics::DISCOVERY_MDNS_CONNECT_FAIL);
    }

    // ---- DHT rendezvous ---------------------------------------------------

    async fn rendezvous_loop(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
        mut reset_rx: mpsc::Receiver<()>,
    ) {
        if self.routing.offline() {
            info!("routing offline, rendezvous loop not started");
            return;
        }
        let mut phase_entered = Instant::now();
        let mut bootstrap_successes = 0u64;
        let mut isolated_backoff = ISOLATED_BACKOFF_BASE;

        loop {
            let phase = *self.phase.read();
            let round_timeout = match phase {
                DiscoveryPhase::Bootstrap => ROUND_TIMEOUT_BOOTSTRAP,
                DiscoveryPhase::Steady => ROUND_TIMEOUT_STEADY,
                DiscoveryPhase::Isolated => ROUND_TIMEOUT_ISOLATED,
            };

            let valid = match self.run_rendezvous_round(round_timeout).await {
                Ok(valid) => valid,
                Err(NetworkError::Offline) => {
                    info!("routing went offline, rendezvous loop terminating");
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "rendezvous round failed");
                    0
                }
            };

            let table_size = self.routing.routing_table_size();
            let next_phase = match phase {
                DiscoveryPhase::Bootstrap => {
                    if valid > 0 {
                        bootstrap_successes += 1;
                    }
                    if valid > 0 && table_size >= self.config.options.expected_min_peers {
                        DiscoveryPhase::Steady
                    } else if bootstrap_successes == 0
                        && phase_entered.elapsed() > BOOTSTRAP_PHASE_LIMIT
                    {
                        DiscoveryPhase::Isolated
                    } else {
                        DiscoveryPhase::Bootstrap
                    }
                }
                DiscoveryPhase::Steady => {
                    if table_size == 0 {
                        // Routing table collapse accelerates everything.
                        self.bus.publish_reset(
                            ResetReason::RoutingTableEmpty,
                            ResetTrigger::Routing,
                            None,
                        );
                        DiscoveryPhase::Bootstrap
                    } else {
                        DiscoveryPhase::Steady
                    }
                }
                DiscoveryPhase::Isolated => {
                    if valid > 0 {
                        DiscoveryPhase::Steady
                    } else {
                        DiscoveryPhase::Isolated
                    }
                }
            };

            if next_phase != phase {
                info!(from = ?phase, to = ?next_phase, table_size, "rendezvous phase transition");
                *self.phase.write() = next_phase;
                phase_entered = Instant::now();
                if next_phase == DiscoveryPhase::Bootstrap {
                    bootstrap_successes = 0;
                }
                if next_phase != DiscoveryPhase::Isolated {
                    isolated_backoff = ISOLATED_BACKOFF_BASE;
                }
            }

            let sleep_for = match next_phase {
                DiscoveryPhase::Bootstrap => BOOTSTRAP_ROUND_INTERVAL,
                DiscoveryPhase::Steady => self.config.options.dht_steady_interval_cap,
                DiscoveryPhase::Isolated => {
                    let current = isolated_backoff;
                    isolated_backoff = (isolated_backoff * 2).min(ISOLATED_BACKOFF_CAP);
                    current
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(jittered(sleep_for, 0.10)) => {}
                received = reset_rx.recv() => {
                    if received.is_none() { return; }
                    // Accelerate: back to a bootstrap-speed round at once.
                    isolated_backoff = ISOLATED_BACKOFF_BASE;
                }
                _ = stop.changed() => if *stop.borrow() { return },
            }
        }
    }

    /// One advertise-and-read rendezvous round; returns the number of valid
    /// peers observed.
    pub async fn run_rendezvous_round(&self, round_timeout: Duration) -> Result<usize, NetworkError> {
        let mut rx = self
            .routing
            .advertise_and_find_peers(&self.config.namespace)
            .await?;
        self.stats.dht_rounds.fetch_add(1, Ordering::Relaxed);

        let deadline = tokio::time::Instant::now() + round_timeout;
        let mut valid = 0usize;
        loop {
            let info = tokio::select! {
                info = rx.recv() => info,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            let Some(info) = info else { break };
            if self.handle_discovered(info).await {
                valid += 1;
            }
        }
        Ok(valid)
    }

    /// Process one discovered peer; returns whether it counted as valid.
    pub async fn handle_discovered(&self, info: AddrInfo) -> bool {
        let peer = info.peer_id;
        if peer == self.dialer.local_peer_id() {
            return false;
        }
        let addrs = if info.addrs.is_empty() {
            // Fall back to the address manager, which enqueues a
            // rediscovery when it has nothing either.
            self.addr_manager.get_addrs(&peer)
        } else {
            info.addrs
        };
        if addrs.is_empty() {
            return false;
        }
        self.stats.peers_discovered.fetch_add(1, Ordering::Relaxed);
        self.addr_manager.add_dht_addr(&peer, &addrs);

        if self.dialer.is_connected(&peer) {
            return true;
        }

        let (private, _) = partition_private(&addrs);
        let result = if self.config.lan_like && !private.is_empty() {
            let mut ordered = private;
            order_by_transport(&mut ordered);
            let mut last = Err(NetworkError::Transient("no addresses".into()));
            for addr in ordered {
                last = self
                    .dialer
                    .connect(peer, vec![addr], PER_ADDR_DIAL_TIMEOUT)
                    .await;
                if last.is_ok() {
                    break;
                }
            }
            last
        } else {
            self.dialer
                .connect(peer, addrs.clone(), DHT_CONNECT_TIMEOUT)
                .await
        };

        match result {
            Ok(()) => {
                self.bus.publish(NetworkEvent::PeerConnected {
                    peer_id: peer,
                    source: ConnectSource::Dht,
                });
            }
            Err(e) => {
                if let Some(actual) = mismatched_peer(&e) {
                    self.heal_peer_id_mismatch(peer, &addrs, actual);
                } else {
                    debug!(peer = %peer, error = %e, "rendezvous connect failed");
                    self.addr_manager.mark_addr_failed(&peer);
                }
            }
        }
        true
    }

    // ---- peer-ID mismatch self-heal --------------------------------------

    /// Re-home addresses that turned out to belong to a different peer.
    ///
    /// The first occurrence per `(expected, addr)` logs at warn; repeats
    /// within an hour log at debug. The cache exists solely to suppress
    /// repetitive warnings.
    pub fn heal_peer_id_mismatch(&self, expected: PeerId, addrs: &[Multiaddr], actual: PeerId) {
        for addr in addrs {
            self.peerstore.remove_addr(&expected, addr);
            self.peerstore
                .add_addrs(&actual, std::slice::from_ref(addr), AddrClass::Temporary);
            self.stats.mismatches_healed.fetch_add(1, Ordering::Relaxed);

            let key = (expected, addr.clone());
            let first_occurrence = {
                let mut cache = self.mismatch_cache.lock();
                match cache.get(&key) {
                    Some(at) if at.elapsed() < MISMATCH_CACHE_TTL => false,
                    _ => {
                        cache.put(key, Instant::now());
                        true
                    }
                }
            };
            if first_occurrence {
                self.stats
                    .mismatch_combinations
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    expected = %expected,
                    actual = %actual,
                    addr = %addr,
                    "peer id mismatch healed: address re-homed under its real peer"
                );
            } else {
                debug!(
                    expected = %expected,
                    actual = %actual,
                    addr = %addr,
                    "peer id mismatch healed (repeat)"
                );
            }
        }
    }

    fn clean_mismatch_cache(&self) {
        let mut cache = self.mismatch_cache.lock();
        let expired: Vec<(PeerId, Multiaddr)> = cache
            .iter()
            .filter(|(_, at)| at.elapsed() >= MISMATCH_CACHE_TTL)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "mismatch cache cleaned");
        }
    }
}

/// Extract the actual peer from a mismatch-shaped error, either the typed
/// variant or the canonical message form.
fn mismatched_peer(error: &NetworkError) -> Option<PeerId> {
    match error {
        NetworkError::PeerIdMismatch { actual } => Some(*actual),
        other => parse_peer_id_mismatch(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr_manager::AddressManager;
    use crate::config::AddrManagerOptions;
    use crate::routing::OfflineRouting;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct RecordingDialer {
        local: PlMutex<Option<PeerId>>,
        connected: PlMutex<Vec<PeerId>>,
        dials: PlMutex<Vec<(PeerId, Vec<Multiaddr>, Instant)>>,
        fail_with: PlMutex<Option<String>>,
    }

    impl RecordingDialer {
        fn dial_count(&self) -> usize {
            self.dials.lock().len()
        }
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        fn local_peer_id(&self) -> PeerId {
            *self.local.lock().get_or_insert_with(PeerId::random)
        }
        async fn connect(
            &self,
            peer: PeerId,
            addrs: Vec<Multiaddr>,
            _timeout: Duration,
        ) -> Result<(), NetworkError> {
            self.dials.lock().push((peer, addrs, Instant::now()));
            if let Some(message) = self.fail_with.lock().clone() {
                return Err(NetworkError::Transient(message));
            }
            self.connected.lock().push(peer);
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

    fn service_with(
        dialer: Arc<RecordingDialer>,
        bootstrap_peers: Vec<Multiaddr>,
    ) -> Arc<DiscoveryService> {
        let peerstore = Arc::new(Peerstore::new(8));
        let addr_manager = Arc::new(AddressManager::new(
            AddrManagerOptions::default(),
            Arc::clone(&peerstore),
            Arc::new(OfflineRouting),
            dialer.clone() as Arc<dyn Dialer>,
            None,
        ));
        DiscoveryService::new(
            DiscoveryConfig {
                options: DiscoveryOptions::default(),
                namespace: "weisyn-test".into(),
                bootstrap_peers,
                min_peers: 1,
                lan_like: false,
                mdns_enabled: false,
            },
            dialer,
            Arc::new(OfflineRouting),
            addr_manager,
            peerstore,
            EventBus::default(),
        )
    }

    fn bootstrap_addr(peer: PeerId) -> Multiaddr {
        format!("/ip4/203.0.113.5/tcp/28683/p2p/{peer}")
            .parse()
            .unwrap()
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(20);
        for _ in 0..100 {
            let jittered = jittered(base, 0.10);
            assert!(jittered >= Duration::from_secs(18));
            assert!(jittered <= Duration::from_secs(22));
        }
    }

    #[tokio::test]
    async fn dial_all_bootstrap_counts_successes() {
        let dialer = Arc::new(RecordingDialer::default());
        let service = service_with(
            dialer.clone(),
            vec![
                bootstrap_addr(PeerId::random()),
                bootstrap_addr(PeerId::random()),
            ],
        );
        let successes = service.dial_all_bootstrap().await;
        assert_eq!(successes, 2);
        assert_eq!(dialer.dial_count(), 2);
        assert_eq!(service.stats.bootstrap_rounds.load(Ordering::Relaxed), 1);
        assert_eq!(
            service.stats.bootstrap_successes.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn mdns_prefers_private_addrs_on_lan() {
        let dialer = Arc::new(RecordingDialer::default());
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
                options: DiscoveryOptions::default(),
                namespace: "weisyn-test".into(),
                bootstrap_peers: Vec::new(),
                min_peers: 1,
                lan_like: true,
                mdns_enabled: true,
            },
            dialer.clone(),
            Arc::new(OfflineRouting),
            addr_manager,
            peerstore,
            EventBus::default(),
        );
        let peer = PeerId::random();
        service
            .handle_mdns_peer(
                peer,
                vec![
                    "/ip4/203.0.113.9/tcp/28683".parse().unwrap(),
                    "/ip4/192.168.1.9/udp/28683/quic-v1".parse().unwrap(),
                    "/ip4/192.168.1.9/tcp/28683".parse().unwrap(),
                ],
            )
            .await;
        let dials = dialer.dials.lock();
        // One dial, first candidate: the private TCP address.
        assert_eq!(dials.len(), 1);
        assert_eq!(
            dials[0].1,
            vec!["/ip4/192.168.1.9/tcp/28683".parse::<Multiaddr>().unwrap()]
        );
        assert_eq!(
            service.stats.mdns_connect_success.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn mismatch_heals_and_suppresses_duplicate_warnings() {
        let dialer = Arc::new(RecordingDialer::default());
        let service = service_with(dialer, Vec::new());
        let expected = PeerId::random();
        let actual = PeerId::random();
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/28683".parse().unwrap();
        service
            .peerstore
            .add_addrs(&expected, std::slice::from_ref(&addr), AddrClass::Dht);

        service.heal_peer_id_mismatch(expected, std::slice::from_ref(&addr), actual);
        assert!(service.peerstore.addrs(&expected).is_empty());
        let entries = service.peerstore.entries(&actual);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].class, AddrClass::Temporary);

        // A duplicate heal within the hour counts but adds no combination.
        service.heal_peer_id_mismatch(expected, std::slice::from_ref(&addr), actual);
        let stats = service.mismatch_stats();
        assert_eq!(stats.total_healed, 2);
        assert_eq!(stats.unique_combinations, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn discovered_peer_with_mismatch_error_is_healed() {
        let dialer = Arc::new(RecordingDialer::default());
        let service = service_with(dialer.clone(), Vec::new());
        let expected = PeerId::random();
        let actual = PeerId::random();
        *dialer.fail_with.lock() = Some(format!(
            "peer id mismatch: expected {expected}, but remote key matches {actual}"
        ));

        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/28683".parse().unwrap();
        let counted = service
            .handle_discovered(AddrInfo::new(expected, vec![addr.clone()]))
            .await;
        assert!(counted);
        assert!(service.peerstore.addrs(&expected).is_empty());
        assert_eq!(service.peerstore.addrs(&actual), vec![addr]);
        assert_eq!(service.mismatch_stats().total_healed, 1);
    }

    #[tokio::test]
    async fn plain_dial_failure_demotes_addrs() {
        let dialer = Arc::new(RecordingDialer::default());
        let service = service_with(dialer.clone(), Vec::new());
        *dialer.fail_with.lock() = Some("connection refused".into());
        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/28683".parse().unwrap();
        service
            .handle_discovered(AddrInfo::new(peer, vec![addr]))
            .await;
        let entries = service.peerstore.entries(&peer);
        assert!(!entries.is_empty());
        assert!(entries.iter().all(|e| e.class == AddrClass::Failed));
    }

    #[tokio::test]
    async fn self_and_empty_discoveries_are_dropped() {
        let dialer = Arc::new(RecordingDialer::default());
        let service = service_with(dialer.clone(), Vec::new());
        let me = dialer.local_peer_id();
        assert!(!service.handle_discovered(AddrInfo::new(me, Vec::new())).await);
        // Unknown peer with no addresses anywhere: not valid, but a
        // rediscovery entry exists afterwards.
        let stranger = PeerId::random();
        assert!(
            !service
                .handle_discovered(AddrInfo::new(stranger, Vec::new()))
                .await
        );
        assert_eq!(service.addr_manager.rediscovery_stats().size, 1);
    }

    #[tokio::test]
    async fn reset_cooldown_gates_acceleration() {
        let dialer = Arc::new(RecordingDialer::default());
        let service = service_with(dialer, Vec::new());
        service.on_reset_event(ResetReason::PeerDisconnected, ResetTrigger::KeypeerMonitor);
        service.on_reset_event(ResetReason::PeerDisconnected, ResetTrigger::KeypeerMonitor);
        assert_eq!(service.stats.resets_accepted.load(Ordering::Relaxed), 1);
    }
}
