//! libp2p host: transport assembly, behaviour wiring and the swarm driver.
//!
//! Construction is all-or-nothing: a malformed PSK, an unreadable CA bundle
//! or a broken identity key fails [`HostBuilder::build`] with a typed error
//! instead of degrading to an insecure configuration. After start, the
//! driver task owns the swarm; everything else talks to it through
//! [`HostHandle`] commands and bus events.

use crate::addrs::{filter_advertised_addrs, ip_of};
use crate::config::{ChainMode, DhtMode, P2POptions, PROTOCOL_PREFIX};
use crate::events::{ConnectSource, EventBus, NetworkEvent};
use crate::gater::ConnectionGater;
use crate::health::PingStats;
use crate::identity::{load_or_create_keypair, load_psk};
use crate::metrics::{self, BandwidthCounters};
use crate::mtls::{CaPool, MtlsPolicy};
use crate::peerstore::Peerstore;
use crate::types::{AddrClass, AddrInfo, NetworkError};
use async_trait::async_trait;
use futures::future::Either;
use futures::StreamExt;
use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::{Boxed, Transport as _};
use libp2p::core::upgrade;
use libp2p::kad::{
    self, store::MemoryStore, BootstrapOk, GetClosestPeersOk, GetProvidersOk, QueryId, QueryResult,
    RecordKey,
};
use libp2p::pnet::PnetConfig;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{DialError, NetworkBehaviour, SwarmEvent};
use libp2p::{
    autonat, dcutr, identify, identity::Keypair, mdns, noise, ping, quic, relay, tcp, websocket,
    yamux, Multiaddr, PeerId, StreamProtocol, Swarm, TransportExt,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Hard system-wide connection ceiling.
const SYSTEM_MAX_CONNECTIONS: usize = 200;
/// Hard inbound connection ceiling.
const SYSTEM_MAX_INBOUND: usize = 100;
/// Identify grace before a peer is classified non-WES.
const IDENTIFY_GRACE: Duration = Duration::from_secs(10);
/// Non-WES inbound peers are disconnected after this long.
const NON_WES_INBOUND_LIFETIME: Duration = Duration::from_secs(60);
/// Driver housekeeping cadence (classification, trim, kad cleanup).
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Connection-manager tag for application peers.
pub const TAG_WES_BUSINESS: &str = "wes-business";

/// Connection direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed.
    Outbound,
    /// They dialed.
    Inbound,
}

/// Live connection bookkeeping shared between the driver and the services.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    /// Direction of the first surviving connection.
    pub direction: Direction,
    /// Remote address of that connection.
    pub remote_addr: Multiaddr,
    /// When the peer became connected.
    pub established_at: Instant,
    /// Last protocol-level activity observed on the connection.
    pub last_activity: Instant,
    /// Connection-manager score; higher is kept longer.
    pub score: i32,
    /// Tag assigned by the WES classifier, if any.
    pub tag: Option<&'static str>,
    /// Whether the WES classifier has run for this peer.
    pub classified: bool,
}

/// Shared view of current connections.
#[derive(Default)]
pub struct ConnectionTracker {
    conns: RwLock<HashMap<PeerId, ConnInfo>>,
}

impl ConnectionTracker {
    pub(crate) fn connected(&self, peer: PeerId, direction: Direction, remote_addr: Multiaddr) {
        let now = Instant::now();
        self.conns.write().entry(peer).or_insert(ConnInfo {
            direction,
            remote_addr,
            established_at: now,
            last_activity: now,
            score: 0,
            tag: None,
            classified: false,
        });
    }

    /// Note protocol-level activity on a peer's connection.
    pub fn touch(&self, peer: &PeerId) {
        if let Some(info) = self.conns.write().get_mut(peer) {
            info.last_activity = Instant::now();
        }
    }

    pub(crate) fn disconnected(&self, peer: &PeerId) {
        self.conns.write().remove(peer);
    }

    /// Whether a peer currently has a connection.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.conns.read().contains_key(peer)
    }

    /// All currently connected peers.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.conns.read().keys().copied().collect()
    }

    /// Connection count.
    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    /// True with no connections.
    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    /// Snapshot of a single connection.
    pub fn get(&self, peer: &PeerId) -> Option<ConnInfo> {
        self.conns.read().get(peer).cloned()
    }

    /// Snapshot of every connection.
    pub fn snapshot(&self) -> Vec<(PeerId, ConnInfo)> {
        self.conns
            .read()
            .iter()
            .map(|(p, c)| (*p, c.clone()))
            .collect()
    }

    fn adjust(&self, peer: &PeerId, score: i32, tag: Option<&'static str>) {
        if let Some(info) = self.conns.write().get_mut(peer) {
            info.score = score;
            info.tag = tag;
            info.classified = true;
        }
    }
}

enum HostCommand {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        resp: oneshot::Sender<Result<(), NetworkError>>,
    },
    Disconnect {
        peer: PeerId,
        resp: oneshot::Sender<Result<(), NetworkError>>,
    },
    ListenAddrs {
        resp: oneshot::Sender<Vec<Multiaddr>>,
    },
    ExternalAddrs {
        resp: oneshot::Sender<Vec<Multiaddr>>,
    },
    FindPeer {
        peer: PeerId,
        resp: oneshot::Sender<Result<AddrInfo, NetworkError>>,
    },
    FindClosestPeers {
        key: Vec<u8>,
        resp: oneshot::Sender<Result<Vec<PeerId>, NetworkError>>,
    },
    Bootstrap {
        resp: oneshot::Sender<Result<(), NetworkError>>,
    },
    AdvertiseAndFind {
        namespace_key: Vec<u8>,
        found: mpsc::Sender<AddrInfo>,
    },
    RemoveFromRoutingTable {
        peer: PeerId,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Cloneable command-channel handle to the swarm driver.
#[derive(Clone)]
pub struct HostHandle {
    command_tx: mpsc::UnboundedSender<HostCommand>,
    local_peer_id: PeerId,
    tracker: Arc<ConnectionTracker>,
    routing_table_size: Arc<AtomicUsize>,
    routing_peers: Arc<RwLock<Vec<PeerId>>>,
    dht_offline: bool,
}

impl HostHandle {
    /// Local peer ID.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Shared connection tracker.
    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Current Kademlia routing-table size.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size.load(Ordering::Relaxed)
    }

    /// Peers currently held in the routing table.
    pub fn routing_table_peers(&self) -> Vec<PeerId> {
        self.routing_peers.read().clone()
    }

    /// Whether the DHT was disabled at configuration time.
    pub fn dht_offline(&self) -> bool {
        self.dht_offline
    }

    fn send(&self, command: HostCommand) -> Result<(), NetworkError> {
        self.command_tx
            .send(command)
            .map_err(|_| NetworkError::ShuttingDown)
    }

    /// Addresses the swarm is listening on.
    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        let (tx, rx) = oneshot::channel();
        if self.send(HostCommand::ListenAddrs { resp: tx }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Confirmed external addresses.
    pub async fn external_addrs(&self) -> Vec<Multiaddr> {
        let (tx, rx) = oneshot::channel();
        if self.send(HostCommand::ExternalAddrs { resp: tx }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// DHT lookup for a single peer.
    pub async fn find_peer(
        &self,
        peer: PeerId,
        timeout: Duration,
    ) -> Result<AddrInfo, NetworkError> {
        if self.dht_offline {
            return Err(NetworkError::Offline);
        }
        let (tx, rx) = oneshot::channel();
        self.send(HostCommand::FindPeer { peer, resp: tx })?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetworkError::ShuttingDown),
            Err(_) => Err(NetworkError::Timeout(timeout)),
        }
    }

    /// Closest peers to a key, drawn from a DHT walk.
    pub async fn find_closest_peers(
        &self,
        key: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<PeerId>, NetworkError> {
        if self.dht_offline {
            return Err(NetworkError::Offline);
        }
        let (tx, rx) = oneshot::channel();
        self.send(HostCommand::FindClosestPeers { key, resp: tx })?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetworkError::ShuttingDown),
            Err(_) => Err(NetworkError::Timeout(timeout)),
        }
    }

    /// Kick a DHT bootstrap. No-op success when offline.
    pub async fn kad_bootstrap(&self) -> Result<(), NetworkError> {
        if self.dht_offline {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.send(HostCommand::Bootstrap { resp: tx })?;
        rx.await.map_err(|_| NetworkError::ShuttingDown)?
    }

    /// Advertise under a rendezvous key and stream discovered peers until
    /// the receiver is dropped or the query completes.
    pub async fn advertise_and_find(
        &self,
        namespace_key: Vec<u8>,
    ) -> Result<mpsc::Receiver<AddrInfo>, NetworkError> {
        if self.dht_offline {
            return Err(NetworkError::Offline);
        }
        let (tx, rx) = mpsc::channel(64);
        self.send(HostCommand::AdvertiseAndFind {
            namespace_key,
            found: tx,
        })?;
        Ok(rx)
    }

    /// Evict a peer from the Kademlia routing table.
    pub fn remove_from_routing_table(&self, peer: PeerId) {
        let _ = self.send(HostCommand::RemoveFromRoutingTable { peer });
    }

    /// Stop the driver, waiting up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let (tx, rx) = oneshot::channel();
        if self.send(HostCommand::Shutdown { resp: tx }).is_err() {
            return;
        }
        let _ = tokio::time::timeout(timeout, rx).await;
    }
}

/// Dial-and-observe capability consumed by discovery, keepalive and the
/// address manager. The production implementation is [`HostHandle`]; tests
/// substitute mocks.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Local peer ID.
    fn local_peer_id(&self) -> PeerId;
    /// Dial a peer at the given addresses, waiting up to `timeout` for the
    /// connection to establish.
    async fn connect(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        timeout: Duration,
    ) -> Result<(), NetworkError>;
    /// Close all connections to a peer.
    async fn disconnect(&self, peer: PeerId) -> Result<(), NetworkError>;
    /// Whether the peer is currently connected.
    fn is_connected(&self, peer: &PeerId) -> bool;
    /// Currently connected peers.
    fn connected_peers(&self) -> Vec<PeerId>;
}

#[async_trait]
impl Dialer for HostHandle {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn connect(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        timeout: Duration,
    ) -> Result<(), NetworkError> {
        if self.tracker.is_connected(&peer) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.send(HostCommand::Dial {
            peer,
            addrs,
            resp: tx,
        })?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetworkError::ShuttingDown),
            Err(_) => Err(NetworkError::Timeout(timeout)),
        }
    }

    async fn disconnect(&self, peer: PeerId) -> Result<(), NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.send(HostCommand::Disconnect { peer, resp: tx })?;
        rx.await.map_err(|_| NetworkError::ShuttingDown)?
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.tracker.is_connected(peer)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.tracker.connected_peers()
    }
}

/// Static host configuration summary for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HostConfigSummary {
    /// Listen addresses.
    pub listen: Vec<String>,
    /// Gater allow prefixes.
    pub allow_prefixes: Vec<String>,
    /// Gater deny prefixes.
    pub deny_prefixes: Vec<String>,
    /// Gater deny CIDR count.
    pub deny_cidr_count: usize,
    /// AutoNAT client flag.
    pub autonat_client: bool,
    /// NAT port-map flag.
    pub nat_portmap: bool,
    /// Relay client flag.
    pub relay: bool,
    /// Relay service flag.
    pub relay_service: bool,
    /// DCUTR flag.
    pub dcutr: bool,
    /// Private network flag.
    pub private_network: bool,
    /// Memory cap carried in options (MB).
    pub memory_limit_mb: u64,
    /// FD cap carried in options.
    pub max_file_descriptors: u64,
}

#[derive(NetworkBehaviour)]
struct WesBehaviour {
    kad: Toggle<kad::Behaviour<MemoryStore>>,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    mdns: Toggle<mdns::tokio::Behaviour>,
    relay_client: relay::client::Behaviour,
    relay_server: Toggle<relay::Behaviour>,
    dcutr: Toggle<dcutr::Behaviour>,
    autonat: Toggle<autonat::Behaviour>,
}

/// Everything the builder hands back: the handle plus the shared state the
/// other subsystems are constructed around.
pub struct NetworkHost {
    /// Command handle.
    pub handle: HostHandle,
    /// Local peer ID.
    pub local_peer_id: PeerId,
    /// Shared TTL peerstore.
    pub peerstore: Arc<Peerstore>,
    /// Shared connection tracker.
    pub tracker: Arc<ConnectionTracker>,
    /// Shared bandwidth counters.
    pub bandwidth: Arc<BandwidthCounters>,
    /// Shared ping statistics for the health checker.
    pub ping_stats: Arc<PingStats>,
    /// Live reachability as reported by AutoNAT, once it has spoken.
    pub autonat_reachability: Arc<RwLock<Option<crate::types::ReachabilityState>>>,
    /// Static configuration summary.
    pub config_summary: HostConfigSummary,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl NetworkHost {
    /// Stop the driver task, waiting up to `timeout`.
    pub async fn stop(&mut self, timeout: Duration) {
        self.handle.shutdown(timeout).await;
        if let Some(driver) = self.driver.take() {
            let _ = tokio::time::timeout(timeout, driver).await;
        }
    }
}

/// Host builder. See the module docs for failure semantics.
pub struct HostBuilder;

impl HostBuilder {
    /// Construct the host and spawn its driver task.
    pub fn build(options: &P2POptions, bus: EventBus) -> Result<NetworkHost, NetworkError> {
        let keypair = load_or_create_keypair(&options.identity)?;
        let local_peer_id = PeerId::from(keypair.public());
        info!(peer = %local_peer_id, "building libp2p host");

        let gater = ConnectionGater::new(&options.gater)?;
        let ca_pool = match (options.chain_mode, options.ca_bundle_path.as_deref()) {
            (ChainMode::Consortium, Some(path)) => Some(CaPool::load(
                path,
                MtlsPolicy {
                    allow_intermediates: true,
                    cn_allowlist: options.mtls_cn_allowlist.clone(),
                    org_allowlist: options.mtls_org_allowlist.clone(),
                },
            )?),
            (ChainMode::Consortium, None) => {
                return Err(NetworkError::HostBuildFailed(
                    "consortium mode without p2p.ca_bundle_path".into(),
                ))
            }
            _ => None,
        };
        if let Some(pool) = &ca_pool {
            info!(anchors = pool.len(), "loaded consortium CA bundle");
        }

        let psk = match (options.chain_mode, options.psk_path.as_deref()) {
            (ChainMode::Private, Some(path)) => Some(load_psk(path)?),
            (ChainMode::Private, None) => {
                return Err(NetworkError::HostBuildFailed(
                    "private chain without p2p.psk_path".into(),
                ))
            }
            _ => None,
        };

        let (relay_transport, relay_client) = relay::client::new(local_peer_id);
        let (transport, bandwidth_sinks) = build_transport(&keypair, options, psk, relay_transport)?;
        let behaviour = build_behaviour(&keypair, local_peer_id, options, relay_client)?;
        let dht_offline = !options.enable_dht;

        let mut swarm = Swarm::new(
            transport,
            behaviour,
            local_peer_id,
            libp2p::swarm::Config::with_tokio_executor()
                .with_idle_connection_timeout(Duration::from_secs(60)),
        );

        let mut listening = 0usize;
        for addr in &options.listen_addrs {
            // QUIC listeners cannot run inside a pnet tunnel.
            if options.chain_mode == ChainMode::Private
                && ip_of(addr).is_some()
                && addr.to_string().contains("/quic")
            {
                debug!(addr = %addr, "skipping QUIC listener on a private (PSK) network");
                continue;
            }
            match swarm.listen_on(addr.clone()) {
                Ok(_) => listening += 1,
                Err(e) => warn!(addr = %addr, error = %e, "listen failed"),
            }
        }
        if listening == 0 {
            return Err(NetworkError::HostBuildFailed(
                "no listen address could be bound; check p2p.listen_addrs".into(),
            ));
        }

        // Seed the routing table with the configured bootstrap peers.
        if let Some(kad) = swarm.behaviour_mut().kad.as_mut() {
            for addr in &options.bootstrap_peers {
                if let Some(peer) = peer_id_of(addr) {
                    kad.add_address(&peer, strip_p2p(addr));
                }
            }
        }

        let peerstore = Arc::new(Peerstore::new(options.addr_manager.max_addrs_per_peer));
        let tracker = Arc::new(ConnectionTracker::default());
        let bandwidth = Arc::new(BandwidthCounters::new());
        let ping_stats = Arc::new(PingStats::default());
        let routing_table_size = Arc::new(AtomicUsize::new(0));
        let routing_peers = Arc::new(RwLock::new(Vec::new()));
        let autonat_reachability = Arc::new(RwLock::new(None));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = HostHandle {
            command_tx,
            local_peer_id,
            tracker: Arc::clone(&tracker),
            routing_table_size: Arc::clone(&routing_table_size),
            routing_peers: Arc::clone(&routing_peers),
            dht_offline,
        };

        let config_summary = HostConfigSummary {
            listen: options.listen_addrs.iter().map(|a| a.to_string()).collect(),
            allow_prefixes: options.gater.allow_prefixes.clone(),
            deny_prefixes: options.gater.deny_prefixes.clone(),
            deny_cidr_count: options.gater.deny_cidrs.len(),
            autonat_client: options.autonat.enable_client,
            nat_portmap: options.enable_nat_portmap,
            relay: options.relay.enable_relay,
            relay_service: options.relay.enable_relay_service,
            dcutr: options.relay.enable_dcutr,
            private_network: options.private_network,
            memory_limit_mb: options.resource_limits.memory_limit_mb,
            max_file_descriptors: options.resource_limits.max_file_descriptors,
        };

        let driver = SwarmDriver {
            swarm,
            command_rx,
            bus,
            gater,
            ca_pool,
            peerstore: Arc::clone(&peerstore),
            tracker: Arc::clone(&tracker),
            ping_stats: Arc::clone(&ping_stats),
            bandwidth: Arc::clone(&bandwidth),
            bandwidth_sinks,
            routing_table_size: Arc::clone(&routing_table_size),
            routing_peers,
            autonat_reachability: Arc::clone(&autonat_reachability),
            options: options.clone(),
            pending_dials: HashMap::new(),
            pending_find_peer: HashMap::new(),
            pending_closest: HashMap::new(),
            pending_providers: HashMap::new(),
            was_online: false,
        };
        let driver = Some(tokio::spawn(driver.run()));

        Ok(NetworkHost {
            handle,
            local_peer_id,
            peerstore,
            tracker,
            bandwidth,
            ping_stats,
            autonat_reachability,
            config_summary,
            driver,
        })
    }
}

fn build_behaviour(
    keypair: &Keypair,
    local_peer_id: PeerId,
    options: &P2POptions,
    relay_client: relay::client::Behaviour,
) -> Result<WesBehaviour, NetworkError> {
    let kad = if options.enable_dht {
        let store = MemoryStore::new(local_peer_id);
        let mut config = kad::Config::default();
        let protocol = StreamProtocol::try_from_owned(format!("/{PROTOCOL_PREFIX}/kad/1.0.0"))
            .map_err(|e| NetworkError::HostBuildFailed(format!("kad protocol name: {e}")))?;
        config.set_protocol_names(vec![protocol]);
        config.set_query_timeout(Duration::from_secs(60));
        if let Some(k) = NonZeroUsize::new(options.bucket_size) {
            config.set_replication_factor(k);
        }
        let mut kad = kad::Behaviour::with_config(local_peer_id, store, config);
        match options.dht_mode {
            DhtMode::Server | DhtMode::Lan => kad.set_mode(Some(kad::Mode::Server)),
            DhtMode::Client => kad.set_mode(Some(kad::Mode::Client)),
            DhtMode::Auto => kad.set_mode(None),
        }
        Toggle::from(Some(kad))
    } else {
        Toggle::from(None)
    };

    let identify = identify::Behaviour::new(
        identify::Config::new(format!("/{PROTOCOL_PREFIX}/1.0.0"), keypair.public())
            .with_agent_version(format!("{PROTOCOL_PREFIX}-node/0.4")),
    );

    let ping = ping::Behaviour::new(ping::Config::new());

    let mdns = if options.enable_mdns {
        let behaviour = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
            .map_err(|e| NetworkError::HostBuildFailed(format!("mdns init: {e}")))?;
        info!(service = %options.mdns_service_name, "mDNS discovery enabled");
        Toggle::from(Some(behaviour))
    } else {
        Toggle::from(None)
    };

    let relay_server = if options.relay.enable_relay_service {
        let mut config = relay::Config::default();
        config.max_reservations = options.relay.max_reservations;
        config.max_circuits = options.relay.max_circuits;
        config.max_circuit_bytes = options.relay.circuit_buffer_size as u64;
        Toggle::from(Some(relay::Behaviour::new(local_peer_id, config)))
    } else {
        Toggle::from(None)
    };

    let dcutr = if options.relay.enable_dcutr {
        Toggle::from(Some(dcutr::Behaviour::new(local_peer_id)))
    } else {
        Toggle::from(None)
    };

    let autonat = if options.autonat.enable_client || options.autonat.enable_service {
        let mut config = autonat::Config::default();
        config.boot_delay = Duration::from_secs(15);
        config.only_global_ips = !options.is_lan_like();
        Toggle::from(Some(autonat::Behaviour::new(local_peer_id, config)))
    } else {
        Toggle::from(None)
    };

    Ok(WesBehaviour {
        kad,
        identify,
        ping,
        mdns,
        relay_client,
        relay_server,
        dcutr,
        autonat,
    })
}

#[allow(deprecated)]
fn build_transport(
    keypair: &Keypair,
    options: &P2POptions,
    psk: Option<libp2p::pnet::PreSharedKey>,
    relay_transport: relay::client::Transport,
) -> Result<(Boxed<(PeerId, StreamMuxerBox)>, Arc<libp2p::bandwidth::BandwidthSinks>), NetworkError>
{
    let noise_config = noise::Config::new(keypair)
        .map_err(|e| NetworkError::HostBuildFailed(format!("noise init: {e}")))?;
    let yamux_config = yamux::Config::default();
    let tcp_config = tcp::Config::default().nodelay(true);

    // Each arm ends in the same (PeerId, StreamMuxerBox) shape so the
    // branches unify.
    let upgraded: Boxed<(PeerId, StreamMuxerBox)> = if let Some(psk) = psk {
        // Private network: the whole stream stack runs inside the pnet
        // tunnel. QUIC cannot be tunneled and stays disabled.
        let tcp_transport = tcp::tokio::Transport::new(tcp_config)
            .and_then(move |socket, _| PnetConfig::new(psk).handshake(socket));
        relay_transport
            .or_transport(tcp_transport)
            .upgrade(upgrade::Version::V1)
            .authenticate(noise_config)
            .multiplex(yamux_config)
            .timeout(options.dial_timeout)
            .map(|(peer, muxer), _| (peer, StreamMuxerBox::new(muxer)))
            .boxed()
    } else if options.enable_websocket {
        let ws = websocket::WsConfig::new(tcp::tokio::Transport::new(tcp_config.clone()));
        let tcp_transport = tcp::tokio::Transport::new(tcp_config).or_transport(ws);
        relay_transport
            .or_transport(tcp_transport)
            .upgrade(upgrade::Version::V1)
            .authenticate(noise_config)
            .multiplex(yamux_config)
            .timeout(options.dial_timeout)
            .map(|(peer, muxer), _| (peer, StreamMuxerBox::new(muxer)))
            .boxed()
    } else {
        let tcp_transport = tcp::tokio::Transport::new(tcp_config);
        relay_transport
            .or_transport(tcp_transport)
            .upgrade(upgrade::Version::V1)
            .authenticate(noise_config)
            .multiplex(yamux_config)
            .timeout(options.dial_timeout)
            .map(|(peer, muxer), _| (peer, StreamMuxerBox::new(muxer)))
            .boxed()
    };

    let transport: Boxed<(PeerId, StreamMuxerBox)> = if options.chain_mode == ChainMode::Private {
        upgraded
    } else {
        let quic_transport = quic::tokio::Transport::new(quic::Config::new(keypair));
        quic_transport
            .or_transport(upgraded)
            .map(|either, _| match either {
                Either::Left((peer, muxer)) => (peer, StreamMuxerBox::new(muxer)),
                Either::Right((peer, muxer)) => (peer, muxer),
            })
            .boxed()
    };

    let transport = libp2p::dns::tokio::Transport::system(transport)
        .map_err(|e| NetworkError::HostBuildFailed(format!("dns transport init: {e}")))?
        .boxed();

    Ok(transport.with_bandwidth_logging())
}

/// Peer ID component of a multiaddr, if present.
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        libp2p::multiaddr::Protocol::P2p(peer) => Some(peer),
        _ => None,
    })
}

/// The multiaddr without its trailing `/p2p/<id>` component.
pub fn strip_p2p(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .filter(|p| !matches!(p, libp2p::multiaddr::Protocol::P2p(_)))
        .collect()
}

struct SwarmDriver {
    swarm: Swarm<WesBehaviour>,
    command_rx: mpsc::UnboundedReceiver<HostCommand>,
    bus: EventBus,
    gater: ConnectionGater,
    ca_pool: Option<CaPool>,
    peerstore: Arc<Peerstore>,
    tracker: Arc<ConnectionTracker>,
    ping_stats: Arc<PingStats>,
    bandwidth: Arc<BandwidthCounters>,
    bandwidth_sinks: Arc<libp2p::bandwidth::BandwidthSinks>,
    routing_table_size: Arc<AtomicUsize>,
    routing_peers: Arc<RwLock<Vec<PeerId>>>,
    autonat_reachability: Arc<RwLock<Option<crate::types::ReachabilityState>>>,
    options: P2POptions,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), NetworkError>>>>,
    pending_find_peer: HashMap<QueryId, (PeerId, oneshot::Sender<Result<AddrInfo, NetworkError>>)>,
    pending_closest: HashMap<QueryId, oneshot::Sender<Result<Vec<PeerId>, NetworkError>>>,
    pending_providers: HashMap<QueryId, mpsc::Sender<AddrInfo>>,
    was_online: bool,
}

impl SwarmDriver {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(HostCommand::Shutdown { resp }) => {
                            debug!("swarm driver shutting down");
                            let _ = resp.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    self.housekeeping();
                }
            }
        }
    }

    fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Dial { peer, addrs, resp } => self.start_dial(peer, addrs, resp),
            HostCommand::Disconnect { peer, resp } => {
                let result = self
                    .swarm
                    .disconnect_peer_id(peer)
                    .map_err(|_| NetworkError::Transient("peer not connected".into()));
                let _ = resp.send(result);
            }
            HostCommand::ListenAddrs { resp } => {
                let _ = resp.send(self.swarm.listeners().cloned().collect());
            }
            HostCommand::ExternalAddrs { resp } => {
                let _ = resp.send(self.swarm.external_addresses().cloned().collect());
            }
            HostCommand::FindPeer { peer, resp } => {
                match self.swarm.behaviour_mut().kad.as_mut() {
                    Some(kad) => {
                        let query = kad.get_closest_peers(peer);
                        self.pending_find_peer.insert(query, (peer, resp));
                    }
                    None => {
                        let _ = resp.send(Err(NetworkError::Offline));
                    }
                }
            }
            HostCommand::FindClosestPeers { key, resp } => {
                match self.swarm.behaviour_mut().kad.as_mut() {
                    Some(kad) => {
                        let query = kad.get_closest_peers(key);
                        self.pending_closest.insert(query, resp);
                    }
                    None => {
                        let _ = resp.send(Err(NetworkError::Offline));
                    }
                }
            }
            HostCommand::Bootstrap { resp } => match self.swarm.behaviour_mut().kad.as_mut() {
                Some(kad) => {
                    let result = kad
                        .bootstrap()
                        .map(|_| ())
                        .map_err(|e| NetworkError::Transient(format!("kad bootstrap: {e}")));
                    let _ = resp.send(result);
                }
                None => {
                    let _ = resp.send(Err(NetworkError::Offline));
                }
            },
            HostCommand::AdvertiseAndFind {
                namespace_key,
                found,
            } => {
                if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                    let key = RecordKey::new(&namespace_key);
                    if let Err(e) = kad.start_providing(key.clone()) {
                        warn!(error = %e, "rendezvous advertise failed");
                    }
                    let query = kad.get_providers(key);
                    self.pending_providers.insert(query, found);
                }
                // DHT disabled: the sender drops here and the stream ends.
            }
            HostCommand::RemoveFromRoutingTable { peer } => {
                if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                    kad.remove_peer(&peer);
                }
                self.refresh_routing_table_size();
            }
            HostCommand::Shutdown { resp } => {
                let _ = resp.send(());
            }
        }
    }

    fn start_dial(
        &mut self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        resp: oneshot::Sender<Result<(), NetworkError>>,
    ) {
        if self.tracker.is_connected(&peer) {
            let _ = resp.send(Ok(()));
            return;
        }
        let addrs = self.gater.filter(addrs);
        if addrs.is_empty() {
            let _ = resp.send(Err(NetworkError::Transient(
                "no dialable addresses after gating".into(),
            )));
            return;
        }
        if self.tracker.len() >= SYSTEM_MAX_CONNECTIONS {
            let _ = resp.send(Err(NetworkError::BoundExceeded(format!(
                "connection ceiling {SYSTEM_MAX_CONNECTIONS} reached"
            ))));
            return;
        }
        let opts = DialOpts::peer_id(peer)
            .condition(PeerCondition::NotDialing)
            .addresses(addrs.iter().map(strip_p2p).collect())
            .build();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.entry(peer).or_default().push(resp);
            }
            Err(DialError::DialPeerConditionFalse(_)) => {
                // A dial is already in flight; share its outcome.
                self.pending_dials.entry(peer).or_default().push(resp);
            }
            Err(e) => {
                let _ = resp.send(Err(dial_error_to_network(&e)));
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<WesBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "listening");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                let direction = if endpoint.is_dialer() {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                };
                let remote_addr = endpoint.get_remote_address().clone();
                if direction == Direction::Inbound && !self.gater.permits(&remote_addr) {
                    debug!(peer = %peer_id, addr = %remote_addr, "gater closed inbound connection");
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                    return;
                }
                if num_established.get() == 1 {
                    self.tracker
                        .connected(peer_id, direction, remote_addr.clone());
                    self.peerstore.add_addrs(
                        &peer_id,
                        &[strip_p2p(&remote_addr)],
                        AddrClass::Connected,
                    );
                    for waiter in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                        let _ = waiter.send(Ok(()));
                    }
                    self.bus.publish(NetworkEvent::PeerConnected {
                        peer_id,
                        source: ConnectSource::Other,
                    });
                    if !self.was_online {
                        self.was_online = true;
                        self.bus.publish(NetworkEvent::NetworkOnline);
                    }
                    metrics::set_gauge(metrics::CONNECTIONS_TOTAL, self.tracker.len() as f64);
                }
                self.enforce_system_caps(peer_id, direction);
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.tracker.disconnected(&peer_id);
                    self.bus.publish(NetworkEvent::PeerDisconnected { peer_id });
                    if self.was_online && self.tracker.is_empty() {
                        self.was_online = false;
                        self.bus.publish(NetworkEvent::NetworkOffline);
                    }
                    metrics::set_gauge(metrics::CONNECTIONS_TOTAL, self.tracker.len() as f64);
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer) = peer_id {
                    let mapped = dial_error_to_network(&error);
                    debug!(peer = %peer, error = %mapped, "outbound dial failed");
                    for waiter in self.pending_dials.remove(&peer).unwrap_or_default() {
                        let _ = waiter.send(Err(clone_dial_error(&mapped)));
                    }
                }
            }
            SwarmEvent::NewExternalAddrCandidate { address } => {
                let kept = filter_advertised_addrs(
                    std::slice::from_ref(&address),
                    self.options.advertise_private_addrs,
                    self.options.is_lan_like(),
                );
                if kept.contains(&address) {
                    self.swarm.add_external_address(address);
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: WesBehaviourEvent) {
        match event {
            WesBehaviourEvent::Identify(identify::Event::Received { peer_id, info }) => {
                let protocols: Vec<String> =
                    info.protocols.iter().map(|p| p.to_string()).collect();
                let wes = protocols
                    .iter()
                    .any(|p| p.starts_with(&format!("/{PROTOCOL_PREFIX}")));
                self.peerstore.set_protocols(&peer_id, protocols);
                self.classify_peer(peer_id, wes);
            }
            WesBehaviourEvent::Ping(ping::Event { peer, result, .. }) => match result {
                Ok(rtt) => {
                    self.tracker.touch(&peer);
                    self.ping_stats.record_success(rtt);
                }
                Err(_) => self.ping_stats.record_timeout(),
            },
            WesBehaviourEvent::Mdns(mdns::Event::Discovered(list)) => {
                let local = *self.swarm.local_peer_id();
                let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer, addr) in list {
                    if peer != local {
                        by_peer.entry(peer).or_default().push(addr);
                    }
                }
                for (peer_id, addrs) in by_peer {
                    metrics::bump(metrics::DISCOVERY_MDNS_PEER_FOUND);
                    metrics::set_gauge(
                        metrics::DISCOVERY_LAST_MDNS_FOUND,
                        crate::types::unix_now() as f64,
                    );
                    self.bus
                        .publish(NetworkEvent::MdnsPeerFound { peer_id, addrs });
                }
            }
            WesBehaviourEvent::Mdns(mdns::Event::Expired(_)) => {}
            WesBehaviourEvent::Kad(event) => self.handle_kad_event(event),
            WesBehaviourEvent::Autonat(autonat::Event::StatusChanged { old, new }) => {
                use crate::types::ReachabilityState;
                let state = match &new {
                    autonat::NatStatus::Public(_) => ReachabilityState::Public,
                    autonat::NatStatus::Private => ReachabilityState::Private,
                    autonat::NatStatus::Unknown => ReachabilityState::Unknown,
                };
                info!(?old, ?new, "AutoNAT status changed");
                *self.autonat_reachability.write() = Some(state);
                self.bus.publish(NetworkEvent::NetworkQualityChanged {
                    healthy: state == ReachabilityState::Public,
                });
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated { .. } => {
                self.refresh_routing_table_size();
            }
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                QueryResult::GetClosestPeers(Ok(GetClosestPeersOk { peers, .. })) => {
                    if let Some(resp) = self.pending_closest.remove(&id) {
                        let _ = resp.send(Ok(peers.clone()));
                    }
                    if let Some((target, resp)) = self.pending_find_peer.remove(&id) {
                        let addrs = self.addrs_from_table(&target);
                        let result = if addrs.is_empty() {
                            Err(NetworkError::Transient(format!(
                                "peer {target} not found in DHT"
                            )))
                        } else {
                            Ok(AddrInfo::new(target, addrs))
                        };
                        let _ = resp.send(result);
                    }
                }
                QueryResult::GetClosestPeers(Err(e)) => {
                    if let Some(resp) = self.pending_closest.remove(&id) {
                        let _ = resp.send(Err(NetworkError::Transient(format!("kad: {e}"))));
                    }
                    if let Some((_, resp)) = self.pending_find_peer.remove(&id) {
                        let _ = resp.send(Err(NetworkError::Transient(format!("kad: {e}"))));
                    }
                }
                QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders {
                    providers, ..
                })) => {
                    if let Some(found) = self.pending_providers.get(&id).cloned() {
                        let local = *self.swarm.local_peer_id();
                        for provider in providers {
                            if provider == local {
                                continue;
                            }
                            let addrs = self.addrs_from_table(&provider);
                            if found.try_send(AddrInfo::new(provider, addrs)).is_err() {
                                // Consumer gone or saturated; end the stream.
                                self.pending_providers.remove(&id);
                                break;
                            }
                        }
                    }
                    if step.last {
                        self.pending_providers.remove(&id);
                    }
                }
                QueryResult::GetProviders(Ok(
                    GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
                )) => {
                    self.pending_providers.remove(&id);
                }
                QueryResult::GetProviders(Err(e)) => {
                    debug!(error = %e, "provider query failed");
                    self.pending_providers.remove(&id);
                }
                QueryResult::Bootstrap(Ok(BootstrapOk { .. })) => {
                    self.refresh_routing_table_size();
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn addrs_from_table(&mut self, peer: &PeerId) -> Vec<Multiaddr> {
        if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
            for bucket in kad.kbuckets() {
                for entry in bucket.iter() {
                    if entry.node.key.preimage() == peer {
                        return entry.node.value.iter().cloned().collect();
                    }
                }
            }
        }
        self.peerstore.addrs(peer)
    }

    fn refresh_routing_table_size(&mut self) {
        let peers: Vec<PeerId> = match self.swarm.behaviour_mut().kad.as_mut() {
            Some(kad) => kad
                .kbuckets()
                .flat_map(|bucket| {
                    bucket
                        .iter()
                        .map(|entry| *entry.node.key.preimage())
                        .collect::<Vec<_>>()
                })
                .collect(),
            None => Vec::new(),
        };
        let size = peers.len();
        *self.routing_peers.write() = peers;
        let previous = self.routing_table_size.swap(size, Ordering::Relaxed);
        if previous != size {
            self.bus
                .publish(NetworkEvent::KBucketSummaryUpdated { size });
        }
    }

    fn classify_peer(&mut self, peer: PeerId, wes: bool) {
        let Some(info) = self.tracker.get(&peer) else {
            return;
        };
        if wes {
            self.tracker.adjust(&peer, 20, Some(TAG_WES_BUSINESS));
        } else {
            match info.direction {
                Direction::Inbound => self.tracker.adjust(&peer, -20, None),
                Direction::Outbound => self.tracker.adjust(&peer, -10, None),
            }
        }
        // Consortium membership gate: when the secured-connection adapter
        // has recorded a TLS chain for the peer, it must anchor in the CA
        // pool. A recorded-but-invalid chain closes the connection.
        if let Some(pool) = &self.ca_pool {
            let chain = self.peerstore.tls_chain(&peer);
            if !chain.is_empty() && pool.verify_peer_chain(&chain).is_err() {
                warn!(peer = %peer, "closing connection: consortium mTLS verification failed");
                let _ = self.swarm.disconnect_peer_id(peer);
            }
        }
    }

    fn enforce_system_caps(&mut self, newest: PeerId, direction: Direction) {
        let snapshot = self.tracker.snapshot();
        let inbound = snapshot
            .iter()
            .filter(|(_, c)| c.direction == Direction::Inbound)
            .count();
        if snapshot.len() > SYSTEM_MAX_CONNECTIONS
            || (direction == Direction::Inbound && inbound > SYSTEM_MAX_INBOUND)
        {
            warn!(peer = %newest, "closing connection: system connection cap reached");
            let _ = self.swarm.disconnect_peer_id(newest);
        }
    }

    /// Periodic housekeeping: classify identify stragglers, expire non-WES
    /// inbound peers, trim above the high watermark, evict known non-WES
    /// peers from the routing table, GC the peerstore.
    fn housekeeping(&mut self) {
        let now = Instant::now();
        let wes_prefix = format!("/{PROTOCOL_PREFIX}");
        let bootstrap: Vec<PeerId> = self
            .options
            .bootstrap_peers
            .iter()
            .filter_map(peer_id_of)
            .collect();

        let mut to_disconnect: Vec<PeerId> = Vec::new();
        for (peer, info) in self.tracker.snapshot() {
            if !info.classified {
                if now.duration_since(info.established_at) >= IDENTIFY_GRACE {
                    // Identify never completed: fail open as non-WES.
                    let wes = self.peerstore.supports_prefix(&peer, &wes_prefix);
                    self.classify_peer(peer, wes);
                }
                continue;
            }
            let non_wes_inbound = info.tag.is_none() && info.direction == Direction::Inbound;
            if non_wes_inbound
                && now.duration_since(info.established_at) >= NON_WES_INBOUND_LIFETIME
                && !bootstrap.contains(&peer)
            {
                debug!(peer = %peer, "disconnecting long-lived non-WES inbound peer");
                to_disconnect.push(peer);
            }
        }

        // Watermark trim: evict lowest-scored unprotected peers first.
        let snapshot = self.tracker.snapshot();
        if snapshot.len() > self.options.connection_limits.high_water {
            let excess = snapshot.len() - self.options.connection_limits.low_water;
            let grace = self.options.connection_limits.grace_period;
            let mut candidates: Vec<(PeerId, ConnInfo)> = snapshot
                .into_iter()
                .filter(|(peer, info)| {
                    info.tag != Some(TAG_WES_BUSINESS)
                        && !bootstrap.contains(peer)
                        && now.duration_since(info.established_at) > grace
                })
                .collect();
            candidates
                .sort_by_key(|(_, info)| (info.score, std::cmp::Reverse(info.established_at)));
            for (peer, _) in candidates.into_iter().take(excess) {
                debug!(peer = %peer, "watermark trim");
                to_disconnect.push(peer);
            }
        }

        for peer in to_disconnect {
            let _ = self.swarm.disconnect_peer_id(peer);
        }

        // Routing-table cleanup: drop peers known to advertise no WES
        // protocol. Unknown-protocol peers stay (fail-open admission).
        let mut evict: Vec<PeerId> = Vec::new();
        if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
            for bucket in kad.kbuckets() {
                for entry in bucket.iter() {
                    evict.push(*entry.node.key.preimage());
                }
            }
        }
        evict.retain(|peer| {
            let protocols = self.peerstore.protocols(peer);
            !protocols.is_empty() && !protocols.iter().any(|p| p.starts_with(&wes_prefix))
        });
        if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
            for peer in &evict {
                debug!(peer = %peer, "evicting non-WES peer from routing table");
                kad.remove_peer(peer);
            }
        }
        self.refresh_routing_table_size();
        self.peerstore.gc();
        self.bandwidth.set_totals(
            self.bandwidth_sinks.total_inbound(),
            self.bandwidth_sinks.total_outbound(),
        );
        self.bandwidth.snapshot();
        metrics::set_gauge(metrics::PEERS_TOTAL, self.peerstore.len() as f64);
    }
}

fn dial_error_to_network(error: &DialError) -> NetworkError {
    match error {
        DialError::WrongPeerId { obtained, .. } => {
            NetworkError::PeerIdMismatch { actual: *obtained }
        }
        other => NetworkError::Transient(format!("dial failed: {other}")),
    }
}

fn clone_dial_error(error: &NetworkError) -> NetworkError {
    match error {
        NetworkError::PeerIdMismatch { actual } => NetworkError::PeerIdMismatch { actual: *actual },
        other => NetworkError::Transient(other.to_string()),
    }
}
