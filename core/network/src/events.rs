//! In-process event bus coupling the subsystems.
//!
//! Publishers fire and forget; delivery order across subscribers is not
//! guaranteed and subscribers must be idempotent. Cross-subsystem signals
//! travel only through here, never as direct method calls between siblings.

use crate::types::unix_now;
use libp2p::PeerId;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Why a discovery reset was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// A key peer was lost and repair exhausted its options.
    PeerDisconnected,
    /// The routing table collapsed.
    RoutingTableEmpty,
    /// The health checker declared the network unhealthy.
    NetworkUnhealthy,
}

impl ResetReason {
    /// Token used in logs and diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            ResetReason::PeerDisconnected => "peer_disconnected",
            ResetReason::RoutingTableEmpty => "routing_table_empty",
            ResetReason::NetworkUnhealthy => "network_unhealthy",
        }
    }
}

/// Which subsystem requested the reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTrigger {
    /// Key-peer monitor repair exhaustion.
    KeypeerMonitor,
    /// Routing service.
    Routing,
    /// Network health checker.
    HealthChecker,
}

impl ResetTrigger {
    /// Token used in logs and diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            ResetTrigger::KeypeerMonitor => "keypeer_monitor",
            ResetTrigger::Routing => "routing",
            ResetTrigger::HealthChecker => "health_checker",
        }
    }
}

/// How a connection came to be, for bookkeeping events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectSource {
    /// Bootstrap scheduler dial.
    Bootstrap,
    /// mDNS discovery dial.
    Mdns,
    /// DHT rendezvous dial.
    Dht,
    /// Inbound or otherwise unattributed.
    Other,
}

/// Events carried on the bus.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Accelerate discovery: rewind intervals to base.
    DiscoveryIntervalReset {
        /// Why.
        reason: ResetReason,
        /// Who.
        trigger: ResetTrigger,
        /// The peer that caused it, when one did.
        peer_id: Option<PeerId>,
        /// Unix seconds.
        timestamp: u64,
    },
    /// A connection to a peer was established.
    PeerConnected {
        /// The peer.
        peer_id: PeerId,
        /// Attribution.
        source: ConnectSource,
    },
    /// The last connection to a peer closed.
    PeerDisconnected {
        /// The peer.
        peer_id: PeerId,
    },
    /// The mDNS responder saw a LAN peer (host-notifee path to Discovery).
    MdnsPeerFound {
        /// The peer.
        peer_id: PeerId,
        /// Addresses it announced.
        addrs: Vec<libp2p::Multiaddr>,
    },
    /// A bootstrap dial round started.
    BootstrapAttempt {
        /// Monotonic round number.
        round: u64,
    },
    /// A bootstrap dial round connected at least one peer.
    BootstrapSuccess {
        /// Connected-peer count after the round.
        connected: usize,
    },
    /// Opportunistic hint: network quality changed; discovery may run one
    /// short round outside its schedule.
    NetworkQualityChanged {
        /// True when quality improved.
        healthy: bool,
    },
    /// The node went from zero connected peers to at least one.
    NetworkOnline,
    /// The node lost its last connection.
    NetworkOffline,
    /// Routing table summary for diagnostics.
    KBucketSummaryUpdated {
        /// Current routing table size.
        size: usize,
    },
    /// A corruption condition was detected (diagnostics only).
    CorruptionDetected {
        /// Human-readable detail.
        detail: String,
    },
    /// A corruption condition was repaired (diagnostics only).
    CorruptionRepaired {
        /// Human-readable detail.
        detail: String,
    },
    /// A corruption repair failed (diagnostics only).
    CorruptionRepairFailed {
        /// Human-readable detail.
        detail: String,
    },
}

/// Broadcast-backed bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    /// Non-blocking publish. Events published with no live subscribers are
    /// dropped silently.
    pub fn publish(&self, event: NetworkEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    /// Publish a discovery reset stamped with the current time.
    pub fn publish_reset(&self, reason: ResetReason, trigger: ResetTrigger, peer_id: Option<PeerId>) {
        tracing::info!(
            reason = reason.as_str(),
            trigger = trigger.as_str(),
            peer = ?peer_id,
            "publishing discovery interval reset"
        );
        self.publish(NetworkEvent::DiscoveryIntervalReset {
            reason,
            trigger,
            peer_id,
            timestamp: unix_now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Per-consumer reset cooldown: at most one accepted reset per window.
pub struct ResetCooldown {
    window: Duration,
    last_accepted: Mutex<Option<Instant>>,
}

impl ResetCooldown {
    /// Create a cooldown with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: Mutex::new(None),
        }
    }

    /// Returns true and arms the cooldown when the signal should be acted
    /// on; false while within the window.
    pub fn accept(&self) -> bool {
        let mut last = self.last_accepted.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
