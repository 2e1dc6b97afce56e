//! P2P networking runtime for WES nodes.
//!
//! This crate assembles a libp2p host and the subsystems that keep a node
//! reachable in a partially connected, NAT-laden network: bootstrap
//! dialing, mDNS, DHT rendezvous, relay and hole punching, a bounded
//! TTL-aware address manager with durable persistence, key-peer keepalive
//! with self-healing repair, and the event-bus coupling that turns failure
//! signals into accelerated recovery.

pub mod addr_manager;
pub mod addr_store;
pub mod addrs;
pub mod config;
pub mod connectivity;
pub mod diagnostics;
pub mod discovery;
pub mod events;
pub mod gater;
pub mod health;
pub mod host;
pub mod identity;
pub mod keepalive;
pub mod metrics;
pub mod mtls;
pub mod node;
pub mod peerstore;
pub mod routing;
pub mod types;

pub use addr_manager::{AddressManager, AddrManagerStats, RediscoveryQueueStats};
pub use addr_store::{AddrStore, MemoryAddrStore, SledAddrStore};
pub use config::{
    derive_discovery_namespace, resolve_options, ChainContext, ChainMode, DhtMode, DiscoveryOptions,
    Environment, P2POptions, RawNodeOptions, StaticProfile, PROTOCOL_PREFIX,
};
pub use connectivity::ConnectivityService;
pub use diagnostics::{DiagnosticsCollector, DiagnosticsDeps, RepairEvent};
pub use discovery::{DiscoveryConfig, DiscoveryService, DiscoveryStats, MismatchCacheStats};
pub use events::{ConnectSource, EventBus, NetworkEvent, ResetCooldown, ResetReason, ResetTrigger};
pub use gater::ConnectionGater;
pub use health::{HealthSnapshot, NetworkHealthChecker, PingStats};
pub use host::{
    ConnectionTracker, Dialer, Direction, HostBuilder, HostConfigSummary, HostHandle, NetworkHost,
};
pub use identity::{load_or_create_keypair, load_psk};
pub use keepalive::{KeepaliveStats, KeyPeerMonitor, KeyPeerSet};
pub use metrics::{BandwidthCounters, BandwidthSnapshot};
pub use mtls::{CaPool, MtlsPolicy};
pub use node::NetworkNode;
pub use peerstore::{AddrEntry, Peerstore};
pub use routing::{namespace_key, OfflineRouting, RendezvousRouting, RoutingService};
pub use types::{
    AddrClass, AddrInfo, DiscoveryPhase, NetworkError, NetworkHealthState, PeerAddrRecord,
    ReachabilityState, RediscoveryInfo,
};
