//! Metric names and process-wide counters.
//!
//! Gauge/counter names follow the fixed diagnostics contract; the `metrics`
//! facade carries them to whatever exporter the embedding process installs.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Gauge: current connection count.
pub const CONNECTIONS_TOTAL: &str = "p2p_connections_total";
/// Gauge: current peer count.
pub const PEERS_TOTAL: &str = "p2p_peers_total";
/// Gauge: inbound bandwidth rate.
pub const BANDWIDTH_IN_RATE: &str = "p2p_bandwidth_in_rate_bytes_per_sec";
/// Gauge: outbound bandwidth rate.
pub const BANDWIDTH_OUT_RATE: &str = "p2p_bandwidth_out_rate_bytes_per_sec";
/// Gauge: inbound bytes total.
pub const BANDWIDTH_IN_TOTAL: &str = "p2p_bandwidth_in_total_bytes";
/// Gauge: outbound bytes total.
pub const BANDWIDTH_OUT_TOTAL: &str = "p2p_bandwidth_out_total_bytes";
/// Counter: bootstrap dial rounds.
pub const DISCOVERY_BOOTSTRAP_ATTEMPT: &str = "p2p_discovery_bootstrap_attempt_total";
/// Counter: bootstrap rounds with at least one success.
pub const DISCOVERY_BOOTSTRAP_SUCCESS: &str = "p2p_discovery_bootstrap_success_total";
/// Counter: peers found via mDNS.
pub const DISCOVERY_MDNS_PEER_FOUND: &str = "p2p_discovery_mdns_peer_found_total";
/// Counter: successful mDNS-driven connects.
pub const DISCOVERY_MDNS_CONNECT_SUCCESS: &str = "p2p_discovery_mdns_connect_success_total";
/// Counter: failed mDNS-driven connects.
pub const DISCOVERY_MDNS_CONNECT_FAIL: &str = "p2p_discovery_mdns_connect_fail_total";
/// Gauge: unix time of the last bootstrap success.
pub const DISCOVERY_LAST_BOOTSTRAP: &str = "p2p_discovery_last_bootstrap_unixtime";
/// Gauge: unix time of the last mDNS peer found.
pub const DISCOVERY_LAST_MDNS_FOUND: &str = "p2p_discovery_last_mdns_found_unixtime";
/// Gauge: kbucket health score (healthy / total × 100).
pub const KBUCKET_HEALTH_SCORE: &str = "kbucket_health_score";
/// Gauge: composite connection quality score.
pub const CONNECTION_QUALITY_SCORE: &str = "connection_quality_score";

/// Bump a counter by one.
pub fn bump(name: &'static str) {
    metrics::counter!(name, 1);
}

/// Set a gauge.
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name, value);
}

/// kbucket health score formula.
pub fn kbucket_health_score(healthy_peers: usize, total_peers: usize) -> f64 {
    if total_peers == 0 {
        0.0
    } else {
        healthy_peers as f64 / total_peers as f64 * 100.0
    }
}

/// Composite connection quality score:
/// `0.8 × min(1, conns/peers) × 100 + 20 × bandwidth_available`.
pub fn connection_quality_score(connections: usize, peers: usize, bandwidth_available: bool) -> f64 {
    let ratio = if peers == 0 {
        0.0
    } else {
        (connections as f64 / peers as f64).min(1.0)
    };
    0.8 * ratio * 100.0 + if bandwidth_available { 20.0 } else { 0.0 }
}

#[derive(Debug)]
struct RateWindow {
    at: Instant,
    total_in: u64,
    total_out: u64,
    in_rate: f64,
    out_rate: f64,
}

/// Process-wide bandwidth accounting, written by the swarm driver and read
/// by diagnostics. Totals are monotonic; rates are recomputed per snapshot.
#[derive(Debug)]
pub struct BandwidthCounters {
    total_in: AtomicU64,
    total_out: AtomicU64,
    window: Mutex<RateWindow>,
}

/// One bandwidth reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthSnapshot {
    /// Total bytes received.
    pub total_in: u64,
    /// Total bytes sent.
    pub total_out: u64,
    /// Inbound bytes per second over the last snapshot window.
    pub in_rate: f64,
    /// Outbound bytes per second over the last snapshot window.
    pub out_rate: f64,
}

impl BandwidthCounters {
    /// Fresh counters.
    pub fn new() -> Self {
        Self {
            total_in: AtomicU64::new(0),
            total_out: AtomicU64::new(0),
            window: Mutex::new(RateWindow {
                at: Instant::now(),
                total_in: 0,
                total_out: 0,
                in_rate: 0.0,
                out_rate: 0.0,
            }),
        }
    }

    /// Account received bytes.
    pub fn record_in(&self, bytes: u64) {
        self.total_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account sent bytes.
    pub fn record_out(&self, bytes: u64) {
        self.total_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Overwrite the totals from an authoritative source (the transport's
    /// own byte sinks).
    pub fn set_totals(&self, total_in: u64, total_out: u64) {
        self.total_in.store(total_in, Ordering::Relaxed);
        self.total_out.store(total_out, Ordering::Relaxed);
    }

    /// Read totals and refresh the rolling rates.
    pub fn snapshot(&self) -> BandwidthSnapshot {
        let total_in = self.total_in.load(Ordering::Relaxed);
        let total_out = self.total_out.load(Ordering::Relaxed);
        let mut window = self.window.lock();
        let elapsed = window.at.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            window.in_rate = (total_in - window.total_in) as f64 / elapsed;
            window.out_rate = (total_out - window.total_out) as f64 / elapsed;
            window.at = Instant::now();
            window.total_in = total_in;
            window.total_out = total_out;
        }
        let snapshot = BandwidthSnapshot {
            total_in,
            total_out,
            in_rate: window.in_rate,
            out_rate: window.out_rate,
        };
        drop(window);
        set_gauge(BANDWIDTH_IN_TOTAL, total_in as f64);
        set_gauge(BANDWIDTH_OUT_TOTAL, total_out as f64);
        set_gauge(BANDWIDTH_IN_RATE, snapshot.in_rate);
        set_gauge(BANDWIDTH_OUT_RATE, snapshot.out_rate);
        snapshot
    }
}

impl Default for BandwidthCounters {
    fn default() -> Self {
        Self::new()
    }
}
