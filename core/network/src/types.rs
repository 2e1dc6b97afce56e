use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Persisted address record format version.
pub const ADDR_RECORD_VERSION: u32 = 1;

/// Errors produced by the network runtime.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The config resolver refused to produce options. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Host construction failed (PSK, CA bundle, identity key, transport).
    /// Fatal at startup; there is no insecure fallback.
    #[error("host build failed: {0}")]
    HostBuildFailed(String),

    /// Routing is offline. Callers stop their loops instead of spinning.
    #[error("routing offline")]
    Offline,

    /// Recoverable failure (dial, stream timeout, probe miss).
    #[error("transient: {0}")]
    Transient(String),

    /// A dial reached a live peer whose identity key did not match the
    /// expected peer ID. Carries the peer the remote key actually matches.
    #[error("peer id mismatch: remote key matches {actual}")]
    PeerIdMismatch {
        /// Peer the remote key actually belongs to.
        actual: PeerId,
    },

    /// A bounded structure refused the operation.
    #[error("bound exceeded: {0}")]
    BoundExceeded(String),

    /// Address store read/write failed. In-memory state is unaffected.
    #[error("persistence: {0}")]
    Persistence(String),

    /// Operation timed out.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Runtime is shutting down.
    #[error("shutting down")]
    ShuttingDown,

    /// Internal invariant violation.
    #[error("internal: {0}")]
    Internal(String),
}

impl NetworkError {
    /// Whether the error is expected to clear on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetworkError::Transient(_) | NetworkError::Timeout(_) | NetworkError::BoundExceeded(_)
        )
    }
}

/// Dialing target: a peer and the addresses it was last seen under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    /// Peer identity.
    pub peer_id: PeerId,
    /// Known multiaddresses, possibly empty.
    pub addrs: Vec<Multiaddr>,
}

impl AddrInfo {
    /// Create an `AddrInfo` from a peer and its addresses.
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// True when no dialable addresses are known.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// TTL tier attached to an address when written into the peerstore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrClass {
    /// Learned through DHT discovery.
    Dht,
    /// Confirmed by an established connection.
    Connected,
    /// Configured bootstrap peer. Never expires, never evicted.
    Bootstrap,
    /// Recently failed to dial.
    Failed,
    /// Short-lived placement, used when re-homing a mismatched address.
    Temporary,
}

impl AddrClass {
    /// TTL applied when an address of this class is written.
    pub fn ttl(self) -> Option<Duration> {
        match self {
            AddrClass::Dht => Some(Duration::from_secs(2 * 60 * 60)),
            AddrClass::Connected => Some(Duration::from_secs(24 * 60 * 60)),
            AddrClass::Bootstrap => None,
            AddrClass::Failed => Some(Duration::from_secs(5 * 60)),
            AddrClass::Temporary => Some(Duration::from_secs(10 * 60)),
        }
    }

    /// Ordering weight: higher-ranked classes are not downgraded by
    /// lower-ranked writes, except for the explicit `Failed` demotion.
    pub fn rank(self) -> u8 {
        match self {
            AddrClass::Bootstrap => 4,
            AddrClass::Connected => 3,
            AddrClass::Dht => 2,
            AddrClass::Temporary => 1,
            AddrClass::Failed => 0,
        }
    }
}

/// Durable per-peer address record, JSON-encoded under `peer_addrs/v1/`.
///
/// Peer IDs and multiaddresses are stored in their canonical string forms so
/// records survive libp2p version changes byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddrRecord {
    /// Record format version.
    pub version: u32,
    /// Base58 peer ID.
    pub peer_id: String,
    /// Multiaddress strings.
    pub addrs: Vec<String>,
    /// Unix seconds of the last observation from any source. 0 = never.
    pub last_seen_at: u64,
    /// Unix seconds of the last established connection. 0 = never.
    pub last_connected_at: u64,
    /// Unix seconds of the last dial failure. 0 = never.
    pub last_failed_at: u64,
    /// Successful connection count.
    pub success_count: u64,
    /// Failed dial count.
    pub fail_count: u64,
    /// Configured bootstrap peer; protected from pruning.
    pub is_bootstrap: bool,
}

impl PeerAddrRecord {
    /// Create a fresh record for a peer observed now.
    pub fn new(peer_id: &PeerId, addrs: &[Multiaddr], is_bootstrap: bool) -> Self {
        Self {
            version: ADDR_RECORD_VERSION,
            peer_id: peer_id.to_base58(),
            addrs: addrs.iter().map(|a| a.to_string()).collect(),
            last_seen_at: unix_now(),
            last_connected_at: 0,
            last_failed_at: 0,
            success_count: 0,
            fail_count: 0,
            is_bootstrap,
        }
    }

    /// Parse the stored peer ID.
    pub fn parse_peer_id(&self) -> Result<PeerId, NetworkError> {
        self.peer_id
            .parse()
            .map_err(|_| NetworkError::Persistence(format!("bad peer id in record: {}", self.peer_id)))
    }

    /// Parse stored addresses, skipping any that no longer parse.
    pub fn parse_addrs(&self) -> Vec<Multiaddr> {
        self.addrs.iter().filter_map(|a| a.parse().ok()).collect()
    }

    /// Replace the address set, keeping it deduplicated and ordered.
    pub fn set_addrs(&mut self, addrs: &[Multiaddr]) {
        let mut out: Vec<String> = Vec::with_capacity(addrs.len());
        for a in addrs {
            let s = a.to_string();
            if !out.contains(&s) {
                out.push(s);
            }
        }
        self.addrs = out;
    }
}

/// Entry in the bounded rediscovery queue.
#[derive(Debug, Clone)]
pub struct RediscoveryInfo {
    /// Peer awaiting a fresh address lookup.
    pub peer_id: PeerId,
    /// When the last lookup was attempted. `None` before the first attempt.
    pub last_attempt_at: Option<std::time::Instant>,
    /// Consecutive lookup failures.
    pub fail_count: u32,
    /// 1 = recently-connected peer, looked up ahead of the rest.
    pub priority: u8,
}

/// Whether this node is publicly addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReachabilityState {
    /// Not yet determined.
    Unknown,
    /// Publicly dialable.
    Public,
    /// Only addressable on a private network.
    Private,
}

/// Aggregate network health as seen by the health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkHealthState {
    /// Timeout ratio and connection counts nominal.
    Healthy,
    /// Bad checks observed but below the unhealthy threshold.
    Degraded,
    /// Consecutive bad checks crossed the threshold; healing may run.
    Unhealthy,
}

/// Per-namespace DHT rendezvous phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryPhase {
    /// Short rounds until the routing table holds enough peers.
    Bootstrap,
    /// Cruise mode at the capped interval.
    Steady,
    /// No peers found for too long; exponentially backed-off rounds.
    Isolated,
}

/// Canonical substring announcing an identity mismatch in dial errors.
pub const PEER_ID_MISMATCH_MARKER: &str = "peer id mismatch";

/// Extract the actual peer ID from a mismatch-shaped dial error message.
///
/// Recognizes the canonical form `... peer id mismatch ... remote key
/// matches <peer-id> ...` regardless of surrounding text.
pub fn parse_peer_id_mismatch(message: &str) -> Option<PeerId> {
    if !message.contains(PEER_ID_MISMATCH_MARKER) {
        return None;
    }
    let tail = message.split("remote key matches").nth(1)?;
    let token = tail
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == ',' || c == ')')
        .next()?;
    token.parse().ok()
}

/// Current time as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
