//! Diagnostics collector: read-only aggregation of every subsystem's state
//! for the debug surface and the metrics exporter. Collecting a snapshot
//! never mutates anything.

use crate::addr_manager::AddressManager;
use crate::config::DhtMode;
use crate::connectivity::ConnectivityService;
use crate::discovery::DiscoveryService;
use crate::events::{EventBus, NetworkEvent};
use crate::health::NetworkHealthChecker;
use crate::host::{ConnectionTracker, HostConfigSummary};
use crate::keepalive::KeyPeerMonitor;
use crate::metrics::{self, BandwidthCounters};
use crate::peerstore::Peerstore;
use crate::routing::RendezvousRouting;
use crate::types::unix_now;
use libp2p::PeerId;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;

/// Repair-history entries kept per category.
const HISTORY_LIMIT: usize = 50;

/// One corruption / repair history entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RepairEvent {
    /// What happened.
    pub detail: String,
    /// Unix seconds.
    pub at: u64,
}

/// Everything the collector reads from.
pub struct DiagnosticsDeps {
    /// Local peer ID.
    pub local_peer_id: PeerId,
    /// `<networkNamespace>:<chainID>`.
    pub network_namespace: String,
    /// Chain ID.
    pub chain_id: String,
    /// Host configuration summary.
    pub host_config: HostConfigSummary,
    /// Shared connection tracker.
    pub tracker: Arc<ConnectionTracker>,
    /// Shared peerstore.
    pub peerstore: Arc<Peerstore>,
    /// Shared bandwidth counters.
    pub bandwidth: Arc<BandwidthCounters>,
    /// Routing capability.
    pub routing: Arc<dyn RendezvousRouting>,
    /// Configured DHT mode.
    pub dht_mode: DhtMode,
    /// Configured bootstrap peer count.
    pub bootstrap_peer_count: usize,
    /// Connectivity service.
    pub connectivity: Arc<ConnectivityService>,
    /// Address manager.
    pub addr_manager: Arc<AddressManager>,
    /// Discovery service.
    pub discovery: Arc<DiscoveryService>,
    /// Key-peer monitor.
    pub keepalive: Arc<KeyPeerMonitor>,
    /// Health checker.
    pub health: Arc<NetworkHealthChecker>,
}

struct History {
    corruption: VecDeque<RepairEvent>,
    repairs: VecDeque<RepairEvent>,
    last_kbucket_size: usize,
}

/// The collector.
pub struct DiagnosticsCollector {
    deps: DiagnosticsDeps,
    bus: EventBus,
    history: Mutex<History>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DiagnosticsCollector {
    /// Create a collector.
    pub fn new(deps: DiagnosticsDeps, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            deps,
            bus,
            history: Mutex::new(History {
                corruption: VecDeque::with_capacity(HISTORY_LIMIT),
                repairs: VecDeque::with_capacity(HISTORY_LIMIT),
                last_kbucket_size: 0,
            }),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Network ID string: `<networkNamespace>:<chainID>`.
    pub fn network_id(&self) -> String {
        format!("{}:{}", self.deps.network_namespace, self.deps.chain_id)
    }

    /// Start the bus listener feeding the repair history.
    pub fn start(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(stop_tx);
        let this = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        *self.task.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(NetworkEvent::CorruptionDetected { detail }) => {
                            this.push_history(true, detail);
                        }
                        Ok(NetworkEvent::CorruptionRepaired { detail })
                        | Ok(NetworkEvent::CorruptionRepairFailed { detail }) => {
                            this.push_history(false, detail);
                        }
                        Ok(NetworkEvent::KBucketSummaryUpdated { size }) => {
                            this.history.lock().last_kbucket_size = size;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(_) => break,
                    },
                    _ = stop_rx.changed() => if *stop_rx.borrow() { break },
                }
            }
        }));
    }

    /// Stop the bus listener.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn push_history(&self, corruption: bool, detail: String) {
        let entry = RepairEvent {
            detail,
            at: unix_now(),
        };
        let mut history = self.history.lock();
        let queue = if corruption {
            &mut history.corruption
        } else {
            &mut history.repairs
        };
        if queue.len() == HISTORY_LIMIT {
            queue.pop_front();
        }
        queue.push_back(entry);
    }

    /// Latest corruption event, if any.
    pub fn latest_corruption(&self) -> Option<RepairEvent> {
        self.history.lock().corruption.back().cloned()
    }

    /// Latest repair result, if any.
    pub fn latest_repair(&self) -> Option<RepairEvent> {
        self.history.lock().repairs.back().cloned()
    }

    /// Full JSON snapshot of the runtime; also refreshes the exported
    /// gauges.
    pub fn snapshot(&self) -> Value {
        let connections = self.deps.tracker.len();
        let peers = self.deps.peerstore.len();
        let table_size = self.deps.routing.routing_table_size();
        let bandwidth = self.deps.bandwidth.snapshot();
        let discovery = &self.deps.discovery.stats;
        let keepalive = &self.deps.keepalive.stats;
        let addr_stats = &self.deps.addr_manager.stats;

        let kbucket_score =
            metrics::kbucket_health_score(connections.min(table_size), table_size);
        let quality_score = metrics::connection_quality_score(
            connections,
            peers,
            bandwidth.total_in + bandwidth.total_out > 0,
        );
        metrics::set_gauge(metrics::KBUCKET_HEALTH_SCORE, kbucket_score);
        metrics::set_gauge(metrics::CONNECTION_QUALITY_SCORE, quality_score);
        metrics::set_gauge(metrics::CONNECTIONS_TOTAL, connections as f64);
        metrics::set_gauge(metrics::PEERS_TOTAL, peers as f64);

        let history = self.history.lock();
        json!({
            "host": {
                "id": self.deps.local_peer_id.to_base58(),
                "network_id": self.network_id(),
                "config": &self.deps.host_config,
            },
            "connections": {
                "total": connections,
                "peers_tracked": peers,
            },
            "routing": {
                "routing_table_size": table_size,
                "mode": format!("{:?}", self.deps.dht_mode),
                "offline": self.deps.routing.offline(),
                "num_bootstrap_peers": self.deps.bootstrap_peer_count,
                "kbucket_summary_size": history.last_kbucket_size,
            },
            "connectivity": Value::Object(self.deps.connectivity.stats_map()),
            "reachability": format!("{:?}", self.deps.connectivity.reachability()),
            "discovery": {
                "phase": format!("{:?}", self.deps.discovery.phase()),
                "bootstrap_rounds": discovery.bootstrap_rounds.load(Ordering::Relaxed),
                "bootstrap_successes": discovery.bootstrap_successes.load(Ordering::Relaxed),
                "mdns_found": discovery.mdns_found.load(Ordering::Relaxed),
                "mdns_connect_success": discovery.mdns_connect_success.load(Ordering::Relaxed),
                "mdns_connect_fail": discovery.mdns_connect_fail.load(Ordering::Relaxed),
                "dht_rounds": discovery.dht_rounds.load(Ordering::Relaxed),
                "peers_discovered": discovery.peers_discovered.load(Ordering::Relaxed),
                "resets_accepted": discovery.resets_accepted.load(Ordering::Relaxed),
                "mismatch_cache": self.deps.discovery.mismatch_stats(),
            },
            "addr_manager": {
                "rediscovery": self.deps.addr_manager.rediscovery_stats(),
                "pending_lookups": self.deps.addr_manager.pending_lookup_count(),
                "lookups_started": addr_stats.lookups_started.load(Ordering::Relaxed),
                "lookups_succeeded": addr_stats.lookups_succeeded.load(Ordering::Relaxed),
                "lookups_failed": addr_stats.lookups_failed.load(Ordering::Relaxed),
                "lookups_refused": addr_stats.lookups_refused.load(Ordering::Relaxed),
                "peers_evicted": addr_stats.peers_evicted.load(Ordering::Relaxed),
                "persist_errors": addr_stats.persist_errors.load(Ordering::Relaxed),
            },
            "keepalive": {
                "probe_attempts": keepalive.probe_attempts.load(Ordering::Relaxed),
                "probe_successes": keepalive.probe_successes.load(Ordering::Relaxed),
                "probe_failures": keepalive.probe_failures.load(Ordering::Relaxed),
                "probe_timeouts": keepalive.probe_timeouts.load(Ordering::Relaxed),
                "repairs_triggered": keepalive.repairs_triggered.load(Ordering::Relaxed),
                "repairs_succeeded": keepalive.repairs_succeeded.load(Ordering::Relaxed),
                "repairs_failed": keepalive.repairs_failed.load(Ordering::Relaxed),
                "resets_published": keepalive.resets_published.load(Ordering::Relaxed),
            },
            "health": self.deps.health.snapshot(),
            "bandwidth": {
                "in_total_bytes": bandwidth.total_in,
                "out_total_bytes": bandwidth.total_out,
                "in_rate_bytes_per_sec": bandwidth.in_rate,
                "out_rate_bytes_per_sec": bandwidth.out_rate,
            },
            "scores": {
                "kbucket_health_score": kbucket_score,
                "connection_quality_score": quality_score,
            },
            "repair_history": {
                "latest_corruption": history.corruption.back(),
                "latest_repair": history.repairs.back(),
                "corruption": &history.corruption,
                "repairs": &history.repairs,
            },
        })
    }
}
