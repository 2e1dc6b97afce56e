//! Network node: the lifecycle orchestrator tying every subsystem
//! together.
//!
//! Construction order is strict, leaves first: Host -> Routing -> Address
//! Manager -> Discovery -> Keepalive -> Health -> Diagnostics. Stop runs in
//! reverse, and the host itself gets at most ten seconds to wind down.

use crate::addr_manager::AddressManager;
use crate::addr_store::{AddrStore, SledAddrStore};
use crate::config::P2POptions;
use crate::connectivity::ConnectivityService;
use crate::diagnostics::{DiagnosticsCollector, DiagnosticsDeps};
use crate::discovery::{DiscoveryConfig, DiscoveryService};
use crate::events::EventBus;
use crate::health::NetworkHealthChecker;
use crate::host::{peer_id_of, Dialer, HostBuilder, HostHandle, NetworkHost};
use crate::keepalive::{KeyPeerMonitor, KeyPeerSet};
use crate::routing::{RendezvousRouting, RoutingService};
use crate::types::NetworkError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// How long the host gets to stop.
const HOST_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// The assembled P2P runtime.
pub struct NetworkNode {
    options: P2POptions,
    bus: EventBus,
    host: NetworkHost,
    routing: Arc<RoutingService>,
    connectivity: Arc<ConnectivityService>,
    addr_manager: Arc<AddressManager>,
    discovery: Arc<DiscoveryService>,
    keepalive: Arc<KeyPeerMonitor>,
    health: Arc<NetworkHealthChecker>,
    diagnostics: Arc<DiagnosticsCollector>,
    kbucket_sync_stop: Mutex<Option<watch::Sender<bool>>>,
    kbucket_sync_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    started: bool,
}

impl NetworkNode {
    /// Build the whole runtime from resolved options. Fatal configuration
    /// and host errors surface here; a broken address store only costs
    /// persistence.
    pub async fn build(options: P2POptions) -> Result<Self, NetworkError> {
        let bus = EventBus::default();
        let host = HostBuilder::build(&options, bus.clone())?;
        let dialer: Arc<dyn Dialer> = Arc::new(host.handle.clone());

        let routing = Arc::new(RoutingService::new(
            host.handle.clone(),
            Arc::clone(&host.peerstore),
            options.dht_mode,
            options.bootstrap_peers.len(),
        ));
        let routing_dyn: Arc<dyn RendezvousRouting> = Arc::clone(&routing) as _;

        let store: Option<Arc<dyn AddrStore>> = if options.persistence.enabled {
            match SledAddrStore::open(&options.persistence.data_dir) {
                Ok(store) => Some(Arc::new(store) as Arc<dyn AddrStore>),
                Err(e) => {
                    warn!(error = %e, "address store unavailable, running without persistence");
                    None
                }
            }
        } else {
            None
        };

        let addr_manager = Arc::new(AddressManager::new(
            options.addr_manager.clone(),
            Arc::clone(&host.peerstore),
            Arc::clone(&routing_dyn),
            Arc::clone(&dialer),
            store,
        ));

        let connectivity = Arc::new(ConnectivityService::new(
            &options,
            Arc::clone(&host.autonat_reachability),
            Arc::clone(&host.tracker),
        ));

        let discovery = DiscoveryService::new(
            DiscoveryConfig {
                options: options.discovery.clone(),
                namespace: options.discovery_namespace.clone(),
                bootstrap_peers: options.bootstrap_peers.clone(),
                min_peers: options.connection_limits.min_peers,
                lan_like: options.is_lan_like(),
                mdns_enabled: options.enable_mdns,
            },
            Arc::clone(&dialer),
            Arc::clone(&routing_dyn),
            Arc::clone(&addr_manager),
            Arc::clone(&host.peerstore),
            bus.clone(),
        );

        let key_peers = Arc::new(KeyPeerSet::new(
            options.keepalive.max_size,
            options.keepalive.useful_window,
        ));
        for addr in &options.bootstrap_peers {
            if let Some(peer) = peer_id_of(addr) {
                key_peers.add_bootstrap(peer);
            }
        }
        let keepalive = KeyPeerMonitor::new(
            options.keepalive.clone(),
            key_peers,
            Arc::clone(&dialer),
            Arc::clone(&routing_dyn),
            Arc::clone(&addr_manager),
            bus.clone(),
        );

        let health = Arc::new(NetworkHealthChecker::new(
            options.health.clone(),
            Arc::clone(&dialer),
            Arc::clone(&host.tracker),
            Arc::clone(&host.ping_stats),
            bus.clone(),
        ));

        let diagnostics = DiagnosticsCollector::new(
            DiagnosticsDeps {
                local_peer_id: host.local_peer_id,
                network_namespace: options.network_namespace.clone(),
                chain_id: options.chain_id.clone(),
                host_config: host.config_summary.clone(),
                tracker: Arc::clone(&host.tracker),
                peerstore: Arc::clone(&host.peerstore),
                bandwidth: Arc::clone(&host.bandwidth),
                routing: Arc::clone(&routing_dyn),
                dht_mode: options.dht_mode,
                bootstrap_peer_count: options.bootstrap_peers.len(),
                connectivity: Arc::clone(&connectivity),
                addr_manager: Arc::clone(&addr_manager),
                discovery: Arc::clone(&discovery),
                keepalive: Arc::clone(&keepalive),
                health: Arc::clone(&health),
            },
            bus.clone(),
        );

        Ok(Self {
            options,
            bus,
            host,
            routing,
            connectivity,
            addr_manager,
            discovery,
            keepalive,
            health,
            diagnostics,
            kbucket_sync_stop: Mutex::new(None),
            kbucket_sync_task: Mutex::new(None),
            started: false,
        })
    }

    /// Start every subsystem in dependency order.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.started {
            return Ok(());
        }
        info!(peer = %self.host.local_peer_id, "starting P2P runtime");

        self.connectivity.start();
        if let Err(e) = self.routing.bootstrap().await {
            warn!(error = %e, "initial DHT bootstrap failed, discovery will retry");
        }
        self.addr_manager.start(&self.bus).await;
        self.discovery.start();
        self.keepalive.start();
        self.health.start();
        self.diagnostics.start();
        self.start_kbucket_sync();

        self.started = true;
        Ok(())
    }

    /// Stop in reverse order. Idempotent.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        info!("stopping P2P runtime");
        if let Some(tx) = self.kbucket_sync_stop.lock().take() {
            let _ = tx.send(true);
        }
        let sync_task = self.kbucket_sync_task.lock().take();
        if let Some(task) = sync_task {
            let _ = task.await;
        }
        self.diagnostics.stop().await;
        self.health.stop().await;
        self.keepalive.stop().await;
        self.discovery.stop().await;
        self.addr_manager.stop().await;
        self.connectivity.stop();
        self.host.stop(HOST_STOP_TIMEOUT).await;
        self.started = false;
    }

    /// Mirror the routing table into the key-peer set's kbucket bucket.
    fn start_kbucket_sync(&self) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.kbucket_sync_stop.lock() = Some(stop_tx);
        let handle = self.host.handle.clone();
        let key_peers = self.keepalive.key_peer_set();
        let interval = self.options.keepalive.probe_interval;
        *self.kbucket_sync_task.lock() = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        key_peers.set_kbucket_core(handle.routing_table_peers());
                    }
                    _ = stop_rx.changed() => if *stop_rx.borrow() { break },
                }
            }
        }));
    }

    /// Resolved options.
    pub fn options(&self) -> &P2POptions {
        &self.options
    }

    /// The shared event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Host command handle.
    pub fn host_handle(&self) -> HostHandle {
        self.host.handle.clone()
    }

    /// Routing service.
    pub fn routing(&self) -> Arc<RoutingService> {
        Arc::clone(&self.routing)
    }

    /// Connectivity service.
    pub fn connectivity(&self) -> Arc<ConnectivityService> {
        Arc::clone(&self.connectivity)
    }

    /// Address manager.
    pub fn addr_manager(&self) -> Arc<AddressManager> {
        Arc::clone(&self.addr_manager)
    }

    /// Discovery service.
    pub fn discovery(&self) -> Arc<DiscoveryService> {
        Arc::clone(&self.discovery)
    }

    /// Key-peer monitor.
    pub fn keepalive(&self) -> Arc<KeyPeerMonitor> {
        Arc::clone(&self.keepalive)
    }

    /// Health checker.
    pub fn health(&self) -> Arc<NetworkHealthChecker> {
        Arc::clone(&self.health)
    }

    /// Diagnostics collector.
    pub fn diagnostics(&self) -> Arc<DiagnosticsCollector> {
        Arc::clone(&self.diagnostics)
    }
}
