//! P2P options and the config resolver.
//!
//! The resolver is the only place user-visible defaults exist: it merges the
//! chain context (mode, environment, namespace, chain ID, genesis hash) with
//! raw node overrides into a single validated [`P2POptions`]. Downstream
//! components read but never invent.

use crate::types::NetworkError;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Project protocol prefix; DHT streams run under `/<prefix>/kad/1.0.0` and
/// business protocols under `/<prefix>/...`.
pub const PROTOCOL_PREFIX: &str = "weisyn";

/// Legacy rendezvous namespace emitted by old config templates. Treated as
/// unset so the resolver synthesizes a chain-scoped one instead.
pub const LEGACY_DEFAULT_NAMESPACE: &str = "weisyn-default";

/// Deployment chain mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainMode {
    /// Open network: public DHT servers, NAT traversal mandatory in prod.
    Public,
    /// Permissioned network secured by mTLS against a shared CA.
    Consortium,
    /// LAN-scoped network secured by a pre-shared key.
    Private,
}

impl ChainMode {
    /// Lowercase token used in derived namespaces.
    pub fn as_str(self) -> &'static str {
        match self {
            ChainMode::Public => "public",
            ChainMode::Consortium => "consortium",
            ChainMode::Private => "private",
        }
    }
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    /// Local development; validation is advisory.
    Dev,
    /// Shared test networks.
    Test,
    /// Production.
    Prod,
}

impl Environment {
    /// Lowercase token used in derived namespaces.
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Test => "test",
            Environment::Prod => "prod",
        }
    }

    /// True outside dev; gates fail-fast validation.
    pub fn is_strict(self) -> bool {
        !matches!(self, Environment::Dev)
    }
}

/// Kademlia operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtMode {
    /// Answer queries and store records.
    Server,
    /// Query-only.
    Client,
    /// Let AutoNAT decide between client and server.
    Auto,
    /// Server mode scoped to LAN deployments.
    Lan,
}

/// Static reachability profile derived from the chain mode; used when
/// AutoNAT has not produced a live verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaticProfile {
    /// Assumed publicly reachable.
    Server,
    /// Assumed dialing-only.
    Client,
    /// LAN-scoped.
    Lan,
}

/// Connection-manager watermarks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLimits {
    /// Trim target when the high watermark is crossed.
    pub low_water: usize,
    /// Connection count that triggers trimming.
    pub high_water: usize,
    /// Below this the discovery scheduler keeps its base interval.
    pub min_peers: usize,
    /// Soft ceiling on outbound connection maintenance.
    pub max_peers: usize,
    /// New connections are exempt from trimming for this long.
    pub grace_period: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            low_water: 15,
            high_water: 50,
            min_peers: 8,
            max_peers: 30,
            grace_period: Duration::from_secs(20),
        }
    }
}

/// Process resource caps carried in options and surfaced via diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory budget for the networking stack.
    pub memory_limit_mb: u64,
    /// File-descriptor budget.
    pub max_file_descriptors: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: 512,
            max_file_descriptors: 4096,
        }
    }
}

/// Relay / hole-punching flags and relay-service resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayOptions {
    /// Accept relayed (circuit) connections as a client.
    pub enable_relay: bool,
    /// Run the relay service for other peers.
    pub enable_relay_service: bool,
    /// Automatically obtain relay reservations when unreachable.
    pub enable_auto_relay: bool,
    /// Enable DCUTR hole punching.
    pub enable_dcutr: bool,
    /// Relay service: max concurrent reservations.
    pub max_reservations: usize,
    /// Relay service: max concurrent circuits.
    pub max_circuits: usize,
    /// Relay service: per-circuit buffer size in bytes.
    pub circuit_buffer_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            enable_relay: true,
            enable_relay_service: false,
            enable_auto_relay: false,
            enable_dcutr: false,
            max_reservations: 128,
            max_circuits: 16,
            circuit_buffer_size: 2048,
        }
    }
}

/// AutoNAT flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AutoNatOptions {
    /// Ask peers to dial us back to learn our reachability.
    pub enable_client: bool,
    /// Serve dial-back requests for other peers.
    pub enable_service: bool,
}

/// Address persistence knobs.
///
/// `enabled` defaults to `true` at type level; the resolver never re-reads
/// the field to decide its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceOptions {
    /// Persist peer address records to the durable store.
    pub enabled: bool,
    /// Store directory, e.g. `data/<env>/<chain>/p2p/addrs`.
    pub data_dir: PathBuf,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("data/p2p/addrs"),
        }
    }
}

/// Discovery scheduler timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryOptions {
    /// Base interval of the dynamic bootstrap phase.
    pub discovery_interval: Duration,
    /// Ceiling the dynamic interval doubles toward.
    pub max_interval_cap: Duration,
    /// Reset events inside this window are no-ops.
    pub reset_cooldown: Duration,
    /// Rendezvous advertise cadence.
    pub advertise_interval: Duration,
    /// Steady-phase inter-round interval for the DHT loop.
    pub dht_steady_interval_cap: Duration,
    /// Fast-phase attempt ceiling.
    pub fast_attempts: u32,
    /// Per-bootstrap-peer dial timeout.
    pub bootstrap_dial_timeout: Duration,
    /// Fast-phase backoff base.
    pub backoff_base: Duration,
    /// Fast-phase backoff cap.
    pub backoff_cap: Duration,
    /// Fast-phase backoff factor.
    pub backoff_factor: f64,
    /// Routing-table size that lets the rendezvous loop leave Bootstrap.
    pub expected_min_peers: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(20),
            max_interval_cap: Duration::from_secs(120),
            reset_cooldown: Duration::from_secs(10),
            advertise_interval: Duration::from_secs(300),
            dht_steady_interval_cap: Duration::from_secs(120),
            fast_attempts: 5,
            bootstrap_dial_timeout: Duration::from_secs(20),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            backoff_factor: 1.5,
            expected_min_peers: 1,
        }
    }
}

/// Address manager bounds and loop timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrManagerOptions {
    /// Ceiling on tracked peers; eldest non-bootstrap evicted beyond it.
    pub max_tracked_peers: usize,
    /// Ceiling on stored addresses per peer.
    pub max_addrs_per_peer: usize,
    /// Ceiling on concurrent lookup guards.
    pub max_pending_lookups: usize,
    /// Ceiling on the rediscovery queue.
    pub max_rediscovery_queue: usize,
    /// Concurrent DHT FindPeer semaphore size.
    pub max_concurrent_lookups: usize,
    /// Per-lookup timeout.
    pub lookup_timeout: Duration,
    /// Refresh loop cadence.
    pub refresh_interval: Duration,
    /// Non-connected peers refreshed per cycle.
    pub refresh_budget: usize,
    /// Refresh when remaining TTL drops below this.
    pub refresh_threshold: Duration,
    /// Rediscovery loop cadence.
    pub rediscovery_interval: Duration,
    /// Lookup failures before a queue entry is dropped.
    pub rediscovery_max_retries: u32,
    /// Rediscovery backoff base.
    pub rediscovery_backoff_base: Duration,
    /// Prune loop cadence.
    pub prune_interval: Duration,
    /// Persisted records unseen for this long are pruned.
    pub record_ttl: Duration,
}

impl Default for AddrManagerOptions {
    fn default() -> Self {
        Self {
            max_tracked_peers: 5_000,
            max_addrs_per_peer: 8,
            max_pending_lookups: 50,
            max_rediscovery_queue: 50,
            max_concurrent_lookups: 10,
            lookup_timeout: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(600),
            refresh_budget: 500,
            refresh_threshold: Duration::from_secs(1800),
            rediscovery_interval: Duration::from_secs(30),
            rediscovery_max_retries: 3,
            rediscovery_backoff_base: Duration::from_secs(30),
            prune_interval: Duration::from_secs(3600),
            record_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl AddrManagerOptions {
    /// Widened bounds for bootstrap / DHT-server roles.
    pub fn for_bootstrap_role() -> Self {
        Self {
            max_tracked_peers: 20_000,
            max_rediscovery_queue: 100,
            rediscovery_max_retries: 10,
            ..Self::default()
        }
    }
}

/// Keepalive / key-peer monitor knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveOptions {
    /// Probe loop cadence.
    pub probe_interval: Duration,
    /// Skip a peer probed more recently than this.
    pub per_peer_min_interval: Duration,
    /// Concurrent probe workers.
    pub max_concurrent: usize,
    /// Per-probe timeout.
    pub probe_timeout: Duration,
    /// Consecutive failures that trigger repair.
    pub fail_threshold: u32,
    /// `recentlyUseful` bucket expiry window.
    pub useful_window: Duration,
    /// Ceiling on the key-peer set.
    pub max_size: usize,
    /// FindPeer timeout during repair.
    pub repair_lookup_timeout: Duration,
}

impl Default for KeepaliveOptions {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(60),
            per_peer_min_interval: Duration::from_secs(30),
            max_concurrent: 5,
            probe_timeout: Duration::from_secs(5),
            fail_threshold: 3,
            useful_window: Duration::from_secs(600),
            max_size: 128,
            repair_lookup_timeout: Duration::from_secs(30),
        }
    }
}

/// Network health checker knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthOptions {
    /// Check cadence.
    pub check_interval: Duration,
    /// Rolling timeout ratio at or above which a check is bad.
    pub timeout_ratio_threshold: f64,
    /// Consecutive bad checks before Unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive good checks before Healthy again.
    pub healthy_threshold: u32,
    /// Minimum spacing between healing rounds.
    pub healing_cooldown: Duration,
    /// Healing rounds per unhealthy episode.
    pub max_healing_attempts: u32,
    /// Connections idle longer than this are closed while healing.
    pub idle_connection_timeout: Duration,
    /// Adaptive timeout floor.
    pub min_timeout: Duration,
    /// Adaptive timeout ceiling.
    pub max_timeout: Duration,
    /// Multiplier applied while the timeout ratio is high.
    pub timeout_increase_factor: f64,
    /// Shrink factor applied while healthy.
    pub timeout_decrease_factor: f64,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            timeout_ratio_threshold: 0.30,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            healing_cooldown: Duration::from_secs(60),
            max_healing_attempts: 3,
            idle_connection_timeout: Duration::from_secs(300),
            min_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(60),
            timeout_increase_factor: 1.5,
            timeout_decrease_factor: 0.9,
        }
    }
}

/// Connection gater rules: multiaddr prefixes and CIDR blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaterOptions {
    /// Multiaddr prefixes that are always allowed (empty = allow all).
    pub allow_prefixes: Vec<String>,
    /// Multiaddr prefixes that are rejected.
    pub deny_prefixes: Vec<String>,
    /// CIDR blocks that are rejected.
    pub deny_cidrs: Vec<String>,
}

/// Identity key source, highest precedence first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityOptions {
    /// Base64 protobuf-encoded keypair; wins over the key file.
    pub key_base64: Option<String>,
    /// Keypair file, created with mode 0600 on first use.
    pub key_file: Option<PathBuf>,
}

/// Fully resolved, immutable P2P options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct P2POptions {
    /// Chain mode the node runs under.
    pub chain_mode: ChainMode,
    /// Deployment environment.
    pub environment: Environment,
    /// Network namespace token from the chain context.
    pub network_namespace: String,
    /// Chain ID from the chain context.
    pub chain_id: String,
    /// Listen multiaddresses.
    pub listen_addrs: Vec<Multiaddr>,
    /// Validated bootstrap multiaddresses, each carrying `/p2p/<id>`.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Enable the Kademlia DHT.
    pub enable_dht: bool,
    /// Kademlia mode.
    pub dht_mode: DhtMode,
    /// Kademlia bucket size.
    pub bucket_size: usize,
    /// Enable mDNS LAN discovery.
    pub enable_mdns: bool,
    /// mDNS service name; must match across a LAN to interoperate.
    pub mdns_service_name: String,
    /// Rendezvous namespace.
    pub discovery_namespace: String,
    /// Single-node mode: no peers expected, discovery validation relaxed.
    pub single_node: bool,
    /// Connection watermarks.
    pub connection_limits: ConnectionLimits,
    /// Resource caps.
    pub resource_limits: ResourceLimits,
    /// Relay flags and resources.
    pub relay: RelayOptions,
    /// AutoNAT flags.
    pub autonat: AutoNatOptions,
    /// NAT port mapping (UPnP/NAT-PMP) flag.
    pub enable_nat_portmap: bool,
    /// Private libp2p network (PSK or mTLS).
    pub private_network: bool,
    /// PSK file for private-chain deployments.
    pub psk_path: Option<PathBuf>,
    /// CA bundle for consortium mTLS.
    pub ca_bundle_path: Option<PathBuf>,
    /// mTLS: allowed certificate common names (empty = any).
    pub mtls_cn_allowlist: Vec<String>,
    /// mTLS: allowed certificate organizations (empty = any).
    pub mtls_org_allowlist: Vec<String>,
    /// Identity key source.
    pub identity: IdentityOptions,
    /// Publish RFC1918 addresses even off-LAN.
    pub advertise_private_addrs: bool,
    /// Enable the WebSocket transport.
    pub enable_websocket: bool,
    /// Gater rules.
    pub gater: GaterOptions,
    /// Outbound dial timeout.
    pub dial_timeout: Duration,
    /// Address persistence.
    pub persistence: PersistenceOptions,
    /// Discovery timers.
    pub discovery: DiscoveryOptions,
    /// Address manager bounds.
    pub addr_manager: AddrManagerOptions,
    /// Keepalive knobs.
    pub keepalive: KeepaliveOptions,
    /// Health checker knobs.
    pub health: HealthOptions,
}

impl P2POptions {
    /// Static reachability profile for this configuration.
    pub fn static_profile(&self) -> StaticProfile {
        match self.chain_mode {
            ChainMode::Public | ChainMode::Consortium => StaticProfile::Server,
            ChainMode::Private => StaticProfile::Lan,
        }
    }

    /// LAN-like deployment: private chain or mDNS-driven.
    pub fn is_lan_like(&self) -> bool {
        self.chain_mode == ChainMode::Private || self.enable_mdns
    }
}

/// Raw, user-supplied node options. Every field is optional; the resolver
/// fills the gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawNodeOptions {
    /// Listen addresses as strings.
    pub listen_addrs: Option<Vec<String>>,
    /// Bootstrap multiaddresses as strings.
    pub bootstrap_peers: Option<Vec<String>>,
    /// DHT enable override.
    pub enable_dht: Option<bool>,
    /// DHT mode override; `Auto` defers to the chain mode.
    pub dht_mode: Option<DhtMode>,
    /// mDNS enable override.
    pub enable_mdns: Option<bool>,
    /// mDNS service name override.
    pub mdns_service_name: Option<String>,
    /// Rendezvous namespace override.
    pub discovery_namespace: Option<String>,
    /// Single-node mode.
    pub single_node: Option<bool>,
    /// Watermark overrides.
    pub connection_limits: Option<ConnectionLimits>,
    /// Resource overrides.
    pub resource_limits: Option<ResourceLimits>,
    /// Relay overrides.
    pub relay: Option<RelayOptions>,
    /// AutoNAT overrides.
    pub autonat: Option<AutoNatOptions>,
    /// NAT port mapping override.
    pub enable_nat_portmap: Option<bool>,
    /// PSK file path (private chains).
    pub psk_path: Option<PathBuf>,
    /// CA bundle path (consortium chains).
    pub ca_bundle_path: Option<PathBuf>,
    /// mTLS CN allowlist.
    pub mtls_cn_allowlist: Option<Vec<String>>,
    /// mTLS organization allowlist.
    pub mtls_org_allowlist: Option<Vec<String>>,
    /// Identity key source.
    pub identity: Option<IdentityOptions>,
    /// Publish RFC1918 addresses.
    pub advertise_private_addrs: Option<bool>,
    /// WebSocket transport.
    pub enable_websocket: Option<bool>,
    /// Gater rules.
    pub gater: Option<GaterOptions>,
    /// Dial timeout override.
    pub dial_timeout: Option<Duration>,
    /// Persistence overrides.
    pub persistence: Option<PersistenceOptions>,
    /// Discovery timer overrides.
    pub discovery: Option<DiscoveryOptions>,
    /// Address manager overrides.
    pub addr_manager: Option<AddrManagerOptions>,
    /// Keepalive overrides.
    pub keepalive: Option<KeepaliveOptions>,
    /// Health checker overrides.
    pub health: Option<HealthOptions>,
}

/// Chain-level inputs the resolver consumes.
#[derive(Debug, Clone)]
pub struct ChainContext {
    /// Chain mode.
    pub chain_mode: ChainMode,
    /// Environment.
    pub environment: Environment,
    /// Network namespace token.
    pub network_namespace: String,
    /// Chain ID.
    pub chain_id: String,
    /// Hex genesis hash, when the genesis config is available.
    pub genesis_hash: Option<String>,
}

/// Derive the rendezvous namespace for a chain context.
///
/// Only the first 8 hex characters of the genesis hash are used, inherited
/// from the original deployment format; the truncation is collision-weak but
/// preserved for wire compatibility. When the hash is unavailable the final
/// segment is omitted.
pub fn derive_discovery_namespace(ctx: &ChainContext) -> String {
    let base = format!(
        "{}-{}-{}-{}-{}",
        PROTOCOL_PREFIX,
        ctx.environment.as_str(),
        ctx.chain_mode.as_str(),
        ctx.network_namespace,
        ctx.chain_id,
    );
    match ctx.genesis_hash.as_deref() {
        Some(hash) if hash.len() >= 8 => {
            format!("{}-{}", base, &hash[..8].to_ascii_lowercase())
        }
        _ => base,
    }
}

/// Placeholder hosts shipped in config templates; never dialable.
const PLACEHOLDER_MARKERS: &[&str] = &["example.com", "example.org", "placeholder", "replace-me"];

fn is_placeholder_bootstrap(addr: &str) -> bool {
    let lower = addr.to_ascii_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m))
}

fn has_peer_id(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2p(_)))
}

/// Split raw bootstrap strings into valid multiaddrs and rejected inputs.
pub fn filter_bootstrap_addrs(raw: &[String]) -> (Vec<Multiaddr>, Vec<String>) {
    let mut valid = Vec::new();
    let mut rejected = Vec::new();
    for s in raw {
        if is_placeholder_bootstrap(s) {
            rejected.push(s.clone());
            continue;
        }
        match s.parse::<Multiaddr>() {
            Ok(addr) if has_peer_id(&addr) => valid.push(addr),
            _ => rejected.push(s.clone()),
        }
    }
    (valid, rejected)
}

fn default_listen_addrs() -> Vec<Multiaddr> {
    vec![
        "/ip4/0.0.0.0/tcp/28683".parse().unwrap(),
        "/ip4/0.0.0.0/udp/28683/quic-v1".parse().unwrap(),
    ]
}

/// Resolve a chain context plus raw overrides into validated [`P2POptions`].
///
/// Derivation order: profile, DHT mode, namespace, defaults, validation.
/// Validation is fail-fast outside dev; every refusal names the offending
/// configuration key and a remedy.
pub fn resolve_options(
    ctx: &ChainContext,
    raw: &RawNodeOptions,
) -> Result<P2POptions, NetworkError> {
    // Profile / private-network flags.
    let private_network = !matches!(ctx.chain_mode, ChainMode::Public);

    // DHT mode: explicit values preserved; only the unset / auto cases are
    // filled from the chain mode. Consortium keeps an explicit `Auto`.
    let dht_mode = match (ctx.chain_mode, raw.dht_mode) {
        (ChainMode::Public, None | Some(DhtMode::Auto)) => DhtMode::Server,
        (ChainMode::Consortium, None) => DhtMode::Client,
        (ChainMode::Private, None | Some(DhtMode::Auto)) => DhtMode::Lan,
        (_, Some(mode)) => mode,
    };

    // Namespace: a meaningful raw value wins; the legacy template default is
    // treated as unset.
    let discovery_namespace = match raw.discovery_namespace.as_deref() {
        Some(ns) if !ns.is_empty() && ns != LEGACY_DEFAULT_NAMESPACE => ns.to_string(),
        _ => derive_discovery_namespace(ctx),
    };

    let listen_addrs = match &raw.listen_addrs {
        Some(raw_addrs) => {
            let mut addrs = Vec::with_capacity(raw_addrs.len());
            for s in raw_addrs {
                let addr: Multiaddr = s.parse().map_err(|_| {
                    NetworkError::ConfigInvalid(format!(
                        "p2p.listen_addrs entry {s:?} is not a multiaddr; \
                         use forms like /ip4/0.0.0.0/tcp/28683"
                    ))
                })?;
                addrs.push(addr);
            }
            addrs
        }
        None => default_listen_addrs(),
    };

    let raw_bootstrap = raw.bootstrap_peers.clone().unwrap_or_default();
    let (bootstrap_peers, rejected) = filter_bootstrap_addrs(&raw_bootstrap);
    let enable_mdns = raw
        .enable_mdns
        .unwrap_or(matches!(ctx.chain_mode, ChainMode::Private));
    let single_node = raw.single_node.unwrap_or(false);
    let enable_dht = raw.enable_dht.unwrap_or(true);

    let relay = raw.relay.clone().unwrap_or_else(|| {
        let mut r = RelayOptions::default();
        if ctx.chain_mode == ChainMode::Public {
            r.enable_auto_relay = true;
            r.enable_dcutr = true;
        }
        r
    });
    let autonat = raw.autonat.unwrap_or(AutoNatOptions {
        enable_client: ctx.chain_mode == ChainMode::Public,
        enable_service: dht_mode == DhtMode::Server,
    });
    let enable_nat_portmap = raw
        .enable_nat_portmap
        .unwrap_or(ctx.chain_mode == ChainMode::Public);

    let mut addr_manager = raw.addr_manager.clone().unwrap_or_else(|| {
        if dht_mode == DhtMode::Server {
            AddrManagerOptions::for_bootstrap_role()
        } else {
            AddrManagerOptions::default()
        }
    });
    if addr_manager.max_addrs_per_peer == 0 {
        addr_manager.max_addrs_per_peer = AddrManagerOptions::default().max_addrs_per_peer;
    }

    let options = P2POptions {
        chain_mode: ctx.chain_mode,
        environment: ctx.environment,
        network_namespace: ctx.network_namespace.clone(),
        chain_id: ctx.chain_id.clone(),
        listen_addrs,
        bootstrap_peers,
        enable_dht,
        dht_mode,
        bucket_size: 10,
        enable_mdns,
        mdns_service_name: raw
            .mdns_service_name
            .clone()
            .unwrap_or_else(|| format!("{PROTOCOL_PREFIX}-mdns")),
        discovery_namespace,
        single_node,
        connection_limits: raw.connection_limits.clone().unwrap_or_default(),
        resource_limits: raw.resource_limits.clone().unwrap_or_default(),
        relay,
        autonat,
        enable_nat_portmap,
        private_network,
        psk_path: raw.psk_path.clone(),
        ca_bundle_path: raw.ca_bundle_path.clone(),
        mtls_cn_allowlist: raw.mtls_cn_allowlist.clone().unwrap_or_default(),
        mtls_org_allowlist: raw.mtls_org_allowlist.clone().unwrap_or_default(),
        identity: raw.identity.clone().unwrap_or_default(),
        advertise_private_addrs: raw.advertise_private_addrs.unwrap_or(false),
        enable_websocket: raw.enable_websocket.unwrap_or(false),
        gater: raw.gater.clone().unwrap_or_default(),
        dial_timeout: raw.dial_timeout.unwrap_or(Duration::from_secs(15)),
        persistence: raw.persistence.clone().unwrap_or_default(),
        discovery: raw.discovery.clone().unwrap_or_default(),
        addr_manager,
        keepalive: raw.keepalive.clone().unwrap_or_default(),
        health: raw.health.clone().unwrap_or_default(),
    };

    validate_options(&options, &rejected)?;
    Ok(options)
}

fn validate_options(options: &P2POptions, rejected: &[String]) -> Result<(), NetworkError> {
    let strict = options.environment.is_strict();

    if !rejected.is_empty() {
        if strict {
            return Err(NetworkError::ConfigInvalid(format!(
                "p2p.bootstrap_peers contains {} invalid or placeholder entries \
                 (first: {:?}); replace them with real /dns4|/ip4 multiaddrs \
                 ending in /p2p/<peer-id>",
                rejected.len(),
                rejected[0],
            )));
        }
        tracing::warn!(
            rejected = rejected.len(),
            "ignoring invalid bootstrap entries in dev environment"
        );
    }

    if !strict {
        return Ok(());
    }

    if options.bootstrap_peers.is_empty() && !options.enable_mdns && !options.single_node {
        return Err(NetworkError::ConfigInvalid(
            "p2p.bootstrap_peers is empty and p2p.enable_mdns is off: the node \
             cannot discover anyone; configure at least one bootstrap peer or \
             enable mDNS"
                .into(),
        ));
    }

    if options.enable_dht && !options.single_node {
        if options.discovery_namespace.is_empty() {
            return Err(NetworkError::ConfigInvalid(
                "p2p.discovery_namespace is empty while the DHT is enabled; set \
                 it or provide the chain context so one can be derived"
                    .into(),
            ));
        }
        if options.discovery.expected_min_peers < 1 {
            return Err(NetworkError::ConfigInvalid(
                "p2p.discovery.expected_min_peers must be >= 1 when the DHT is \
                 enabled outside single-node mode"
                    .into(),
            ));
        }
    }

    if options.chain_mode == ChainMode::Public {
        let mut missing = Vec::new();
        if !options.autonat.enable_client {
            missing.push("p2p.autonat.enable_client");
        }
        if !options.relay.enable_auto_relay {
            missing.push("p2p.relay.enable_auto_relay");
        }
        if !options.relay.enable_dcutr {
            missing.push("p2p.relay.enable_dcutr");
        }
        if !options.enable_nat_portmap {
            missing.push("p2p.enable_nat_portmap");
        }
        if !missing.is_empty() {
            return Err(NetworkError::ConfigInvalid(format!(
                "public chains outside dev require NAT traversal; enable: {}",
                missing.join(", "),
            )));
        }
    }

    match options.chain_mode {
        ChainMode::Private if options.psk_path.is_none() => {
            return Err(NetworkError::ConfigInvalid(
                "p2p.psk_path is required for private chains; generate a 32-byte \
                 PSK file in libp2p v1 format"
                    .into(),
            ));
        }
        ChainMode::Consortium if options.ca_bundle_path.is_none() => {
            return Err(NetworkError::ConfigInvalid(
                "p2p.ca_bundle_path is required for consortium chains; point it \
                 at the PEM CA bundle shared by the consortium"
                    .into(),
            ));
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(mode: ChainMode, env: Environment) -> ChainContext {
        ChainContext {
            chain_mode: mode,
            environment: env,
            network_namespace: "wesnet".into(),
            chain_id: "1001".into(),
            genesis_hash: Some("ABCDEF0123456789".into()),
        }
    }

    fn bootstrap_entry() -> String {
        let peer = libp2p::PeerId::random();
        format!("/ip4/203.0.113.7/tcp/28683/p2p/{peer}")
    }

    #[test]
    fn namespace_uses_first_eight_hash_chars() {
        let ns = derive_discovery_namespace(&ctx(ChainMode::Public, Environment::Prod));
        assert_eq!(ns, "weisyn-prod-public-wesnet-1001-abcdef01");
    }

    #[test]
    fn namespace_degrades_without_genesis_hash() {
        let mut c = ctx(ChainMode::Public, Environment::Test);
        c.genesis_hash = None;
        assert_eq!(
            derive_discovery_namespace(&c),
            "weisyn-test-public-wesnet-1001"
        );
    }

    #[test]
    fn legacy_namespace_is_replaced() {
        let raw = RawNodeOptions {
            bootstrap_peers: Some(vec![bootstrap_entry()]),
            discovery_namespace: Some(LEGACY_DEFAULT_NAMESPACE.into()),
            relay: Some(RelayOptions {
                enable_auto_relay: true,
                enable_dcutr: true,
                ..RelayOptions::default()
            }),
            ..RawNodeOptions::default()
        };
        let options = resolve_options(&ctx(ChainMode::Public, Environment::Prod), &raw).unwrap();
        assert!(options.discovery_namespace.starts_with("weisyn-prod-public"));
    }

    #[test]
    fn dht_mode_derivation_per_chain_mode() {
        let raw = RawNodeOptions {
            bootstrap_peers: Some(vec![bootstrap_entry()]),
            ..RawNodeOptions::default()
        };
        let public = resolve_options(&ctx(ChainMode::Public, Environment::Prod), &raw).unwrap();
        assert_eq!(public.dht_mode, DhtMode::Server);

        let consortium = resolve_options(
            &ctx(ChainMode::Consortium, Environment::Prod),
            &RawNodeOptions {
                bootstrap_peers: Some(vec![bootstrap_entry()]),
                ca_bundle_path: Some(PathBuf::from("/etc/wes/ca.pem")),
                ..RawNodeOptions::default()
            },
        )
        .unwrap();
        assert_eq!(consortium.dht_mode, DhtMode::Client);
        assert!(consortium.private_network);

        let private = resolve_options(
            &ctx(ChainMode::Private, Environment::Prod),
            &RawNodeOptions {
                psk_path: Some(PathBuf::from("/etc/wes/psk")),
                ..RawNodeOptions::default()
            },
        )
        .unwrap();
        assert_eq!(private.dht_mode, DhtMode::Lan);
        assert!(private.enable_mdns);
    }

    #[test]
    fn explicit_dht_mode_preserved() {
        let raw = RawNodeOptions {
            bootstrap_peers: Some(vec![bootstrap_entry()]),
            dht_mode: Some(DhtMode::Client),
            ..RawNodeOptions::default()
        };
        let options = resolve_options(&ctx(ChainMode::Public, Environment::Prod), &raw).unwrap();
        assert_eq!(options.dht_mode, DhtMode::Client);
    }

    #[test]
    fn placeholder_bootstrap_rejected_in_prod() {
        let raw = RawNodeOptions {
            bootstrap_peers: Some(vec![
                "/dns4/bootstrap.example.com/tcp/28683/p2p/12D3KooWPjceQrSwdWXPyLLeABRXmuqt69Rg3sBYbU1Nft9HyQ6X".into(),
            ]),
            ..RawNodeOptions::default()
        };
        let err = resolve_options(&ctx(ChainMode::Public, Environment::Prod), &raw).unwrap_err();
        assert!(matches!(err, NetworkError::ConfigInvalid(_)));
    }

    #[test]
    fn missing_bootstrap_without_mdns_rejected() {
        let raw = RawNodeOptions {
            enable_mdns: Some(false),
            ..RawNodeOptions::default()
        };
        let err = resolve_options(&ctx(ChainMode::Public, Environment::Prod), &raw).unwrap_err();
        assert!(err.to_string().contains("bootstrap"));
    }

    #[test]
    fn dev_environment_is_lenient() {
        let raw = RawNodeOptions::default();
        let options = resolve_options(&ctx(ChainMode::Public, Environment::Dev), &raw).unwrap();
        assert!(options.bootstrap_peers.is_empty());
        assert!(options.persistence.enabled);
    }

    #[test]
    fn public_prod_requires_nat_traversal() {
        let raw = RawNodeOptions {
            bootstrap_peers: Some(vec![bootstrap_entry()]),
            relay: Some(RelayOptions {
                enable_auto_relay: false,
                ..RelayOptions::default()
            }),
            ..RawNodeOptions::default()
        };
        let err = resolve_options(&ctx(ChainMode::Public, Environment::Prod), &raw).unwrap_err();
        assert!(err.to_string().contains("enable_auto_relay"));
    }

    #[test]
    fn bootstrap_entries_require_peer_id() {
        let (valid, rejected) = filter_bootstrap_addrs(&[
            "/ip4/203.0.113.7/tcp/28683".to_string(),
            bootstrap_entry(),
        ]);
        assert_eq!(valid.len(), 1);
        assert_eq!(rejected.len(), 1);
    }
}
