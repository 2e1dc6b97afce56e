//! Address manager: the single source of truth for "peer -> dialable
//! addresses".
//!
//! Bounded in memory, persistent on disk, self-refreshing. Three loops run
//! once started: refresh (extends TTLs before they lapse, connected peers
//! first), rediscovery (bounded retry queue of peers whose addresses went
//! missing) and prune (drops stale persisted records). Every DHT lookup is
//! capped by a semaphore; every map is bounded; bootstrap peers are never
//! evicted.

use crate::addr_store::AddrStore;
use crate::config::AddrManagerOptions;
use crate::events::{EventBus, NetworkEvent};
use crate::host::Dialer;
use crate::peerstore::Peerstore;
use crate::routing::RendezvousRouting;
use crate::types::{AddrClass, NetworkError, PeerAddrRecord, RediscoveryInfo, unix_now};
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

/// Persisted records with at least this many failures and no connection for
/// 48 h are pruned.
const HIGH_FAIL_COUNT: u64 = 5;
/// The no-connection window for the high-fail prune rule.
const HIGH_FAIL_CONNECT_WINDOW: Duration = Duration::from_secs(48 * 3600);
/// Ceiling of the rediscovery backoff schedule.
const REDISCOVERY_BACKOFF_CAP: Duration = Duration::from_secs(600);

/// Rediscovery backoff: `min(10 min, base × 2^min(fails, 5))`.
pub fn rediscovery_backoff(base: Duration, fail_count: u32) -> Duration {
    let factor = 1u32 << fail_count.min(5);
    (base * factor).min(REDISCOVERY_BACKOFF_CAP)
}

/// Counters exposed through diagnostics.
#[derive(Debug, Default)]
pub struct AddrManagerStats {
    /// Lookups started.
    pub lookups_started: AtomicU64,
    /// Lookups that returned addresses.
    pub lookups_succeeded: AtomicU64,
    /// Lookups that failed or timed out.
    pub lookups_failed: AtomicU64,
    /// Lookups refused by a bound (semaphore, pending cap).
    pub lookups_refused: AtomicU64,
    /// Rediscovery queue evictions.
    pub queue_evictions: AtomicU64,
    /// Peers evicted by bound enforcement.
    pub peers_evicted: AtomicU64,
    /// Store write failures.
    pub persist_errors: AtomicU64,
}

/// Rediscovery queue statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RediscoveryQueueStats {
    /// Entries in the queue.
    pub size: usize,
    /// High-priority entries.
    pub high_priority: usize,
    /// Entries with at least one failed attempt.
    pub failed: usize,
    /// Mean fail count.
    pub avg_fail_count: f64,
    /// Max fail count.
    pub max_fail_count: u32,
    /// Age of the oldest attempt, in seconds.
    pub oldest_attempt_secs: u64,
}

struct ManagerState {
    last_seen_at: HashMap<PeerId, Instant>,
    last_connected_at: HashMap<PeerId, Instant>,
    last_refresh_at: HashMap<PeerId, Instant>,
    pending_lookups: HashSet<PeerId>,
    rediscovery_queue: HashMap<PeerId, RediscoveryInfo>,
    bootstrap_peers: HashSet<PeerId>,
    refresh_cursor: usize,
}

/// The address manager. Construct with [`AddressManager::new`], then
/// `start` the loops; all operations are safe before start.
pub struct AddressManager {
    options: AddrManagerOptions,
    peerstore: Arc<Peerstore>,
    routing: Arc<dyn RendezvousRouting>,
    dialer: Arc<dyn Dialer>,
    store: Option<Arc<dyn AddrStore>>,
    state: Mutex<ManagerState>,
    lookup_semaphore: Arc<Semaphore>,
    rediscovery_semaphore: Arc<Semaphore>,
    /// Public counters, read by diagnostics.
    pub stats: AddrManagerStats,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl AddressManager {
    /// Create a manager over the shared peerstore and capabilities.
    pub fn new(
        options: AddrManagerOptions,
        peerstore: Arc<Peerstore>,
        routing: Arc<dyn RendezvousRouting>,
        dialer: Arc<dyn Dialer>,
        store: Option<Arc<dyn AddrStore>>,
    ) -> Self {
        let lookups = options.max_concurrent_lookups.max(1);
        Self {
            options,
            peerstore,
            routing,
            dialer,
            store,
            state: Mutex::new(ManagerState {
                last_seen_at: HashMap::new(),
                last_connected_at: HashMap::new(),
                last_refresh_at: HashMap::new(),
                pending_lookups: HashSet::new(),
                rediscovery_queue: HashMap::new(),
                bootstrap_peers: HashSet::new(),
                refresh_cursor: 0,
            }),
            lookup_semaphore: Arc::new(Semaphore::new(lookups)),
            rediscovery_semaphore: Arc::new(Semaphore::new(lookups)),
            stats: AddrManagerStats::default(),
            stop_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load persisted records into the peerstore, then start the refresh,
    /// rediscovery and prune loops plus the bus listener.
    pub async fn start(self: &Arc<Self>, bus: &EventBus) {
        self.load_persisted().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(stop_tx);
        let mut tasks = self.tasks.lock();

        {
            let this = Arc::clone(self);
            let mut stop = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.options.refresh_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => this.refresh_cycle(),
                        _ = stop.changed() => if *stop.borrow() { break },
                    }
                }
            }));
        }
        {
            let this = Arc::clone(self);
            let mut stop = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.options.rediscovery_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => this.rediscovery_cycle(),
                        _ = stop.changed() => if *stop.borrow() { break },
                    }
                }
            }));
        }
        if self.store.is_some() {
            let this = Arc::clone(self);
            let mut stop = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.options.prune_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => this.prune_cycle().await,
                        _ = stop.changed() => if *stop.borrow() { break },
                    }
                }
            }));
        }
        {
            let this = Arc::clone(self);
            let mut rx = bus.subscribe();
            let mut stop = stop_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Ok(NetworkEvent::PeerConnected { peer_id, .. }) => {
                                this.on_peer_connected(&peer_id);
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

    /// Stop the loops and flush the store.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.close().await {
                warn!(error = %e, "addr store close failed");
            }
        }
    }

    async fn load_persisted(&self) {
        let Some(store) = &self.store else { return };
        match store.load_all().await {
            Ok(records) => {
                let mut loaded = 0usize;
                for record in records {
                    let Ok(peer) = record.parse_peer_id() else {
                        continue;
                    };
                    let addrs = record.parse_addrs();
                    if record.is_bootstrap {
                        self.peerstore.add_addrs(&peer, &addrs, AddrClass::Bootstrap);
                        self.state.lock().bootstrap_peers.insert(peer);
                    } else {
                        self.peerstore.add_addrs(&peer, &addrs, AddrClass::Dht);
                    }
                    loaded += 1;
                }
                debug!(loaded, "loaded persisted peer address records");
            }
            Err(e) => warn!(error = %e, "loading persisted addresses failed"),
        }
    }

    // ---- write operations -------------------------------------------------

    /// Record addresses learned through DHT discovery.
    pub fn add_dht_addr(self: &Arc<Self>, peer: &PeerId, addrs: &[Multiaddr]) {
        let addrs = self.cap_addrs(addrs);
        self.peerstore.add_addrs(peer, &addrs, AddrClass::Dht);
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            state.last_seen_at.insert(*peer, now);
            state.last_refresh_at.insert(*peer, now);
        }
        self.persist(*peer, PersistKind::Seen, addrs);
    }

    /// Upgrade a peer's addresses to the connected TTL tier.
    pub fn add_connected_addr(self: &Arc<Self>, peer: &PeerId, addrs: &[Multiaddr]) {
        let addrs = self.cap_addrs(addrs);
        self.peerstore.add_addrs(peer, &addrs, AddrClass::Connected);
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            state.last_seen_at.insert(*peer, now);
            state.last_connected_at.insert(*peer, now);
            state.last_refresh_at.insert(*peer, now);
        }
        self.persist(*peer, PersistKind::Connected, addrs);
    }

    /// Register a bootstrap peer. Its record and addresses are permanent.
    pub fn add_bootstrap_addr(self: &Arc<Self>, peer: &PeerId, addrs: &[Multiaddr]) {
        self.peerstore.add_addrs(peer, addrs, AddrClass::Bootstrap);
        {
            let mut state = self.state.lock();
            state.bootstrap_peers.insert(*peer);
            state.last_seen_at.insert(*peer, Instant::now());
        }
        self.persist(*peer, PersistKind::Bootstrap, addrs.to_vec());
    }

    /// Keep a peer's addresses but shorten their TTL after a dial failure.
    pub fn mark_addr_failed(self: &Arc<Self>, peer: &PeerId) {
        self.peerstore.demote_to_failed(peer);
        self.persist(*peer, PersistKind::Failed, Vec::new());
    }

    /// Current addresses for a peer. An empty result enqueues a
    /// rediscovery (high priority when the peer was recently connected)
    /// and kicks one bounded async lookup.
    pub fn get_addrs(self: &Arc<Self>, peer: &PeerId) -> Vec<Multiaddr> {
        let addrs = self.peerstore.addrs(peer);
        if addrs.is_empty() {
            let high_priority = self.recently_connected(peer);
            self.trigger_rediscovery(peer, high_priority);
        }
        addrs
    }

    /// Whether the peer connected within the Connected-TTL window.
    pub fn recently_connected(&self, peer: &PeerId) -> bool {
        let window = AddrClass::Connected.ttl().unwrap_or(Duration::ZERO);
        self.state
            .lock()
            .last_connected_at
            .get(peer)
            .is_some_and(|at| at.elapsed() < window)
    }

    /// Whether the peer is a protected bootstrap peer.
    pub fn is_bootstrap(&self, peer: &PeerId) -> bool {
        self.state.lock().bootstrap_peers.contains(peer)
    }

    /// Enqueue a peer for rediscovery and kick one bounded async lookup.
    pub fn trigger_rediscovery(self: &Arc<Self>, peer: &PeerId, high_priority: bool) {
        let priority = u8::from(high_priority);
        {
            let mut state = self.state.lock();
            let is_bootstrap = state.bootstrap_peers.contains(peer);
            match state.rediscovery_queue.get_mut(peer) {
                Some(entry) => {
                    entry.priority = entry.priority.max(priority);
                }
                None => {
                    if state.rediscovery_queue.len() >= self.options.max_rediscovery_queue
                        && !self.evict_rediscovery_victim(&mut state, is_bootstrap || priority > 0)
                    {
                        warn!(peer = %peer, "rediscovery queue full, entry refused");
                        return;
                    }
                    state.rediscovery_queue.insert(
                        *peer,
                        RediscoveryInfo {
                            peer_id: *peer,
                            last_attempt_at: None,
                            fail_count: 0,
                            priority,
                        },
                    );
                }
            }
        }
        self.spawn_lookup(*peer, true);
    }

    /// Evict the weakest queue entry: non-bootstrap, lowest priority,
    /// highest fail count, oldest attempt. Returns false when nothing can
    /// be evicted (and the incoming entry does not outrank the queue).
    fn evict_rediscovery_victim(&self, state: &mut ManagerState, incoming_outranks: bool) -> bool {
        let victim = state
            .rediscovery_queue
            .values()
            .filter(|e| !state.bootstrap_peers.contains(&e.peer_id))
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.fail_count.cmp(&a.fail_count))
                    .then(match (a.last_attempt_at, b.last_attempt_at) {
                        (None, None) => std::cmp::Ordering::Equal,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (Some(x), Some(y)) => x.cmp(&y),
                    })
            })
            .map(|e| (e.peer_id, e.priority));
        match victim {
            Some((peer, victim_priority)) => {
                if victim_priority > 0 && !incoming_outranks {
                    return false;
                }
                state.rediscovery_queue.remove(&peer);
                self.stats.queue_evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn cap_addrs(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        let mut out: Vec<Multiaddr> = Vec::with_capacity(addrs.len().min(self.options.max_addrs_per_peer));
        for addr in addrs {
            if out.len() >= self.options.max_addrs_per_peer {
                break;
            }
            if !out.contains(addr) {
                out.push(addr.clone());
            }
        }
        out
    }

    fn on_peer_connected(self: &Arc<Self>, peer: &PeerId) {
        let addrs = self.peerstore.addrs(peer);
        self.add_connected_addr(peer, &addrs);
    }

    // ---- refresh ----------------------------------------------------------

    /// One refresh cycle: bound enforcement, connected peers first, then a
    /// cursor-paged walk of the rest up to the refresh budget.
    pub fn refresh_cycle(self: &Arc<Self>) {
        self.enforce_bounds();

        // The connection view is sampled once; a peer that disconnects
        // mid-cycle keeps the Connected TTL for this cycle only.
        let connected = self.dialer.connected_peers();
        let connected_set: HashSet<PeerId> = connected.iter().copied().collect();
        for peer in &connected {
            let addrs = self.peerstore.addrs(peer);
            if !addrs.is_empty() {
                self.peerstore.add_addrs(peer, &addrs, AddrClass::Connected);
            }
            let now = Instant::now();
            let mut state = self.state.lock();
            state.last_seen_at.insert(*peer, now);
            state.last_connected_at.insert(*peer, now);
            state.last_refresh_at.insert(*peer, now);
        }

        let mut others: Vec<PeerId> = self
            .peerstore
            .peers()
            .into_iter()
            .filter(|p| !connected_set.contains(p))
            .collect();
        others.sort_unstable();
        if others.is_empty() {
            return;
        }

        let budget = self.options.refresh_budget.max(1);
        let start = {
            let mut state = self.state.lock();
            let start = state.refresh_cursor % others.len();
            state.refresh_cursor = (start + budget) % others.len();
            start
        };

        let mut examined = 0usize;
        let mut index = start;
        while examined < budget && examined < others.len() {
            let peer = others[index];
            if self.should_refresh(&peer) {
                self.spawn_lookup(peer, false);
            }
            index = (index + 1) % others.len();
            examined += 1;
        }
    }

    fn should_refresh(&self, peer: &PeerId) -> bool {
        if self.peerstore.addrs(peer).is_empty() {
            return true;
        }
        let state = self.state.lock();
        let Some(last_refresh) = state.last_refresh_at.get(peer) else {
            return true;
        };
        let window = AddrClass::Connected.ttl().unwrap_or(Duration::ZERO);
        let recently_connected = state
            .last_connected_at
            .get(peer)
            .is_some_and(|at| at.elapsed() < window);
        let applicable_ttl = if recently_connected {
            AddrClass::Connected.ttl()
        } else {
            AddrClass::Dht.ttl()
        };
        match applicable_ttl {
            Some(ttl) => {
                let threshold = ttl.saturating_sub(self.options.refresh_threshold);
                last_refresh.elapsed() >= threshold
            }
            None => false,
        }
    }

    /// Evict eldest non-bootstrap peers beyond `max_tracked_peers`.
    pub fn enforce_bounds(self: &Arc<Self>) {
        let tracked = self.peerstore.len();
        if tracked <= self.options.max_tracked_peers {
            return;
        }
        let excess = tracked - self.options.max_tracked_peers;
        let mut candidates: Vec<(PeerId, Option<Instant>)> = {
            let state = self.state.lock();
            self.peerstore
                .peers()
                .into_iter()
                .filter(|p| !state.bootstrap_peers.contains(p))
                .map(|p| (p, state.last_seen_at.get(&p).copied()))
                .collect()
        };
        // None (never seen) sorts first, then oldest.
        candidates.sort_by_key(|(_, seen)| *seen);
        for (peer, _) in candidates.into_iter().take(excess) {
            self.peerstore.remove_peer(&peer);
            {
                let mut state = self.state.lock();
                state.last_seen_at.remove(&peer);
                state.last_refresh_at.remove(&peer);
                state.last_connected_at.remove(&peer);
                state.rediscovery_queue.remove(&peer);
            }
            self.stats.peers_evicted.fetch_add(1, Ordering::Relaxed);
            if let Some(store) = self.store.clone() {
                tokio::spawn(async move {
                    let _ = store.delete(&peer).await;
                });
            }
        }
    }

    fn spawn_lookup(self: &Arc<Self>, peer: PeerId, from_rediscovery: bool) {
        if self.routing.offline() {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.pending_lookups.contains(&peer) {
                return;
            }
            if state.pending_lookups.len() >= self.options.max_pending_lookups {
                self.stats.lookups_refused.fetch_add(1, Ordering::Relaxed);
                return;
            }
            state.pending_lookups.insert(peer);
        }
        let semaphore = if from_rediscovery {
            Arc::clone(&self.rediscovery_semaphore)
        } else {
            Arc::clone(&self.lookup_semaphore)
        };
        let Ok(permit) = semaphore.try_acquire_owned() else {
            self.state.lock().pending_lookups.remove(&peer);
            self.stats.lookups_refused.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            this.stats.lookups_started.fetch_add(1, Ordering::Relaxed);
            if let Some(entry) = this.state.lock().rediscovery_queue.get_mut(&peer) {
                entry.last_attempt_at = Some(Instant::now());
            }
            let result = this
                .routing
                .find_peer(peer, this.options.lookup_timeout)
                .await;
            this.state.lock().pending_lookups.remove(&peer);
            match result {
                Ok(info) if !info.addrs.is_empty() => {
                    this.stats.lookups_succeeded.fetch_add(1, Ordering::Relaxed);
                    this.add_dht_addr(&peer, &info.addrs);
                    this.state.lock().rediscovery_queue.remove(&peer);
                }
                Ok(_) | Err(NetworkError::Offline) => {
                    this.note_lookup_failure(&peer);
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "addr lookup failed");
                    this.note_lookup_failure(&peer);
                }
            }
        });
    }

    fn note_lookup_failure(&self, peer: &PeerId) {
        self.stats.lookups_failed.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let max_retries = self.options.rediscovery_max_retries;
        if let Some(entry) = state.rediscovery_queue.get_mut(peer) {
            entry.fail_count += 1;
            if entry.fail_count >= max_retries {
                state.rediscovery_queue.remove(peer);
            }
        }
    }

    // ---- rediscovery ------------------------------------------------------

    /// One rediscovery cycle over the queue.
    pub fn rediscovery_cycle(self: &Arc<Self>) {
        let now = Instant::now();
        let eligible: Vec<PeerId> = {
            let mut state = self.state.lock();
            let max_retries = self.options.rediscovery_max_retries;
            state
                .rediscovery_queue
                .retain(|_, e| e.fail_count < max_retries);
            let base = self.options.rediscovery_backoff_base;
            state
                .rediscovery_queue
                .values()
                .filter(|e| match e.last_attempt_at {
                    None => true,
                    Some(at) => {
                        now.duration_since(at) >= rediscovery_backoff(base, e.fail_count)
                    }
                })
                .map(|e| e.peer_id)
                .collect()
        };
        for peer in eligible {
            self.spawn_lookup(peer, true);
        }
    }

    /// Queue statistics.
    pub fn rediscovery_stats(&self) -> RediscoveryQueueStats {
        let state = self.state.lock();
        let queue = &state.rediscovery_queue;
        let size = queue.len();
        let high_priority = queue.values().filter(|e| e.priority > 0).count();
        let failed = queue.values().filter(|e| e.fail_count > 0).count();
        let max_fail_count = queue.values().map(|e| e.fail_count).max().unwrap_or(0);
        let avg_fail_count = if size == 0 {
            0.0
        } else {
            queue.values().map(|e| e.fail_count as f64).sum::<f64>() / size as f64
        };
        let oldest_attempt_secs = queue
            .values()
            .filter_map(|e| e.last_attempt_at)
            .map(|at| at.elapsed().as_secs())
            .max()
            .unwrap_or(0);
        RediscoveryQueueStats {
            size,
            high_priority,
            failed,
            avg_fail_count,
            max_fail_count,
            oldest_attempt_secs,
        }
    }

    /// Number of in-flight lookups.
    pub fn pending_lookup_count(&self) -> usize {
        self.state.lock().pending_lookups.len()
    }

    // ---- prune ------------------------------------------------------------

    /// One prune pass over the persisted records. Bootstrap records are
    /// never deleted.
    pub async fn prune_cycle(&self) {
        let Some(store) = &self.store else { return };
        let records = match store.load_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "prune: loading records failed");
                return;
            }
        };
        let now = unix_now();
        let record_ttl = self.options.record_ttl.as_secs();
        let mut pruned = 0usize;
        for record in records {
            if record.is_bootstrap {
                continue;
            }
            let stale = now.saturating_sub(record.last_seen_at) > record_ttl;
            let hopeless = record.fail_count >= HIGH_FAIL_COUNT
                && now.saturating_sub(record.last_connected_at)
                    > HIGH_FAIL_CONNECT_WINDOW.as_secs();
            if stale || hopeless {
                if let Ok(peer) = record.parse_peer_id() {
                    if store.delete(&peer).await.is_ok() {
                        pruned += 1;
                    }
                }
            }
        }
        if pruned > 0 {
            debug!(pruned, "pruned stale peer address records");
        }
    }

    // ---- persistence ------------------------------------------------------

    fn persist(self: &Arc<Self>, peer: PeerId, kind: PersistKind, addrs: Vec<Multiaddr>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let now = unix_now();
            let mut record = match store.get(&peer).await {
                Ok(Some(record)) => record,
                Ok(None) => PeerAddrRecord::new(&peer, &[], false),
                Err(e) => {
                    this.stats.persist_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(peer = %peer, error = %e, "addr record read failed");
                    return;
                }
            };
            match kind {
                PersistKind::Seen => {
                    record.last_seen_at = now;
                    if !addrs.is_empty() {
                        record.set_addrs(&addrs);
                    }
                }
                PersistKind::Connected => {
                    record.last_seen_at = now;
                    record.last_connected_at = now;
                    record.success_count += 1;
                    if !addrs.is_empty() {
                        record.set_addrs(&addrs);
                    }
                }
                PersistKind::Failed => {
                    record.last_failed_at = now;
                    record.fail_count += 1;
                }
                PersistKind::Bootstrap => {
                    record.is_bootstrap = true;
                    record.last_seen_at = now;
                    if !addrs.is_empty() {
                        record.set_addrs(&addrs);
                    }
                }
            }
            if let Err(e) = store.upsert(&record).await {
                this.stats.persist_errors.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %peer, error = %e, "addr record write failed");
            }
        });
    }
}

enum PersistKind {
    Seen,
    Connected,
    Failed,
    Bootstrap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr_store::MemoryAddrStore;
    use crate::routing::OfflineRouting;
    use crate::types::AddrInfo;
    use async_trait::async_trait;

    struct NoDialer;

    #[async_trait]
    impl Dialer for NoDialer {
        fn local_peer_id(&self) -> PeerId {
            PeerId::random()
        }
        async fn connect(
            &self,
            _peer: PeerId,
            _addrs: Vec<Multiaddr>,
            _timeout: Duration,
        ) -> Result<(), NetworkError> {
            Err(NetworkError::Transient("no dialer".into()))
        }
        async fn disconnect(&self, _peer: PeerId) -> Result<(), NetworkError> {
            Ok(())
        }
        fn is_connected(&self, _peer: &PeerId) -> bool {
            false
        }
        fn connected_peers(&self) -> Vec<PeerId> {
            Vec::new()
        }
    }

    struct StaticRouting {
        addrs: Vec<Multiaddr>,
    }

    #[async_trait]
    impl RendezvousRouting for StaticRouting {
        async fn find_peer(
            &self,
            peer: PeerId,
            _timeout: Duration,
        ) -> Result<AddrInfo, NetworkError> {
            Ok(AddrInfo::new(peer, self.addrs.clone()))
        }
        async fn advertise_and_find_peers(
            &self,
            _namespace: &str,
        ) -> Result<tokio::sync::mpsc::Receiver<AddrInfo>, NetworkError> {
            Err(NetworkError::Offline)
        }
        fn routing_table_size(&self) -> usize {
            1
        }
        fn offline(&self) -> bool {
            false
        }
    }

    fn manager(options: AddrManagerOptions) -> Arc<AddressManager> {
        Arc::new(AddressManager::new(
            options,
            Arc::new(Peerstore::new(8)),
            Arc::new(OfflineRouting),
            Arc::new(NoDialer),
            None,
        ))
    }

    fn ma(port: u16) -> Multiaddr {
        format!("/ip4/10.1.1.1/tcp/{port}").parse().unwrap()
    }

    #[test]
    fn backoff_schedule() {
        let base = Duration::from_secs(30);
        assert_eq!(rediscovery_backoff(base, 0), Duration::from_secs(30));
        assert_eq!(rediscovery_backoff(base, 1), Duration::from_secs(60));
        assert_eq!(rediscovery_backoff(base, 3), Duration::from_secs(240));
        // Exponent saturates at 5 and the schedule caps at 10 minutes.
        assert_eq!(rediscovery_backoff(base, 5), Duration::from_secs(600));
        assert_eq!(rediscovery_backoff(base, 30), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn rediscovery_queue_is_bounded() {
        let options = AddrManagerOptions {
            max_rediscovery_queue: 50,
            ..AddrManagerOptions::default()
        };
        let manager = manager(options);
        for _ in 0..100 {
            manager.trigger_rediscovery(&PeerId::random(), false);
        }
        let stats = manager.rediscovery_stats();
        assert_eq!(stats.size, 50);
        assert_eq!(
            manager.stats.queue_evictions.load(Ordering::Relaxed),
            50
        );
    }

    #[tokio::test]
    async fn bootstrap_entries_never_evicted_from_queue() {
        let options = AddrManagerOptions {
            max_rediscovery_queue: 2,
            ..AddrManagerOptions::default()
        };
        let manager = manager(options);
        let bootstrap = PeerId::random();
        manager.add_bootstrap_addr(&bootstrap, &[ma(1)]);
        manager.peerstore.remove_peer(&bootstrap);
        manager.trigger_rediscovery(&bootstrap, false);
        manager.trigger_rediscovery(&PeerId::random(), false);
        manager.trigger_rediscovery(&PeerId::random(), false);

        let state = manager.state.lock();
        assert_eq!(state.rediscovery_queue.len(), 2);
        assert!(state.rediscovery_queue.contains_key(&bootstrap));
    }

    #[tokio::test]
    async fn get_addrs_on_unknown_peer_enqueues_rediscovery() {
        let manager = manager(AddrManagerOptions::default());
        let peer = PeerId::random();
        assert!(manager.get_addrs(&peer).is_empty());
        assert_eq!(manager.rediscovery_stats().size, 1);
    }

    #[tokio::test]
    async fn lookup_success_fills_peerstore_and_clears_queue() {
        let options = AddrManagerOptions::default();
        let manager = Arc::new(AddressManager::new(
            options,
            Arc::new(Peerstore::new(8)),
            Arc::new(StaticRouting { addrs: vec![ma(9)] }),
            Arc::new(NoDialer),
            None,
        ));
        let peer = PeerId::random();
        manager.trigger_rediscovery(&peer, true);
        // Let the spawned lookup finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.get_addrs(&peer), vec![ma(9)]);
        assert_eq!(manager.rediscovery_stats().size, 0);
        assert_eq!(manager.stats.lookups_succeeded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn enforce_bounds_spares_bootstrap() {
        let options = AddrManagerOptions {
            max_tracked_peers: 2,
            ..AddrManagerOptions::default()
        };
        let manager = manager(options);
        let bootstrap = PeerId::random();
        manager.add_bootstrap_addr(&bootstrap, &[ma(1)]);
        for port in 2..=5 {
            let peer = PeerId::random();
            manager.add_dht_addr(&peer, &[ma(port)]);
        }
        manager.enforce_bounds();
        assert!(manager.peerstore.len() <= 2);
        assert!(!manager.peerstore.addrs(&bootstrap).is_empty());
    }

    #[tokio::test]
    async fn persisted_records_survive_manager_restart() {
        let store: Arc<MemoryAddrStore> = Arc::new(MemoryAddrStore::new());
        let peer = PeerId::random();
        {
            let manager = Arc::new(AddressManager::new(
                AddrManagerOptions::default(),
                Arc::new(Peerstore::new(8)),
                Arc::new(OfflineRouting),
                Arc::new(NoDialer),
                Some(store.clone() as Arc<dyn AddrStore>),
            ));
            manager.add_bootstrap_addr(&peer, &[ma(7)]);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(store.len(), 1);
        }
        let manager = Arc::new(AddressManager::new(
            AddrManagerOptions::default(),
            Arc::new(Peerstore::new(8)),
            Arc::new(OfflineRouting),
            Arc::new(NoDialer),
            Some(store.clone() as Arc<dyn AddrStore>),
        ));
        manager.load_persisted().await;
        assert_eq!(manager.get_addrs(&peer), vec![ma(7)]);
        assert!(manager.is_bootstrap(&peer));
    }

    #[tokio::test]
    async fn prune_spares_bootstrap_and_recent() {
        let store: Arc<MemoryAddrStore> = Arc::new(MemoryAddrStore::new());
        let old_peer = PeerId::random();
        let mut old_record = PeerAddrRecord::new(&old_peer, &[ma(1)], false);
        old_record.last_seen_at = unix_now() - 8 * 24 * 3600;
        store.upsert(&old_record).await.unwrap();

        let old_bootstrap = PeerId::random();
        let mut bootstrap_record = PeerAddrRecord::new(&old_bootstrap, &[ma(2)], true);
        bootstrap_record.last_seen_at = unix_now() - 30 * 24 * 3600;
        store.upsert(&bootstrap_record).await.unwrap();

        let fresh_peer = PeerId::random();
        store
            .upsert(&PeerAddrRecord::new(&fresh_peer, &[ma(3)], false))
            .await
            .unwrap();

        let hopeless_peer = PeerId::random();
        let mut hopeless = PeerAddrRecord::new(&hopeless_peer, &[ma(4)], false);
        hopeless.fail_count = HIGH_FAIL_COUNT;
        hopeless.last_connected_at = unix_now() - 3 * 24 * 3600;
        store.upsert(&hopeless).await.unwrap();

        let manager = Arc::new(AddressManager::new(
            AddrManagerOptions::default(),
            Arc::new(Peerstore::new(8)),
            Arc::new(OfflineRouting),
            Arc::new(NoDialer),
            Some(store.clone() as Arc<dyn AddrStore>),
        ));
        manager.prune_cycle().await;

        assert!(store.get(&old_peer).await.unwrap().is_none());
        assert!(store.get(&hopeless_peer).await.unwrap().is_none());
        assert!(store.get(&old_bootstrap).await.unwrap().is_some());
        assert!(store.get(&fresh_peer).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mark_failed_keeps_addrs_on_short_ttl() {
        let manager = manager(AddrManagerOptions::default());
        let peer = PeerId::random();
        manager.add_dht_addr(&peer, &[ma(1)]);
        manager.mark_addr_failed(&peer);
        let entries = manager.peerstore.entries(&peer);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].class, AddrClass::Failed);
    }

    #[tokio::test]
    async fn cap_addrs_enforced_on_insert() {
        let options = AddrManagerOptions {
            max_addrs_per_peer: 3,
            ..AddrManagerOptions::default()
        };
        let manager = Arc::new(AddressManager::new(
            options,
            Arc::new(Peerstore::new(3)),
            Arc::new(OfflineRouting),
            Arc::new(NoDialer),
            None,
        ));
        let peer = PeerId::random();
        let many: Vec<Multiaddr> = (1..=8).map(ma).collect();
        manager.add_dht_addr(&peer, &many);
        assert_eq!(manager.peerstore.addrs(&peer).len(), 3);
    }
}
