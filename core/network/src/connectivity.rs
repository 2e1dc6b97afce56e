//! Connectivity service: aggregate reachability / relay / DCUTR / AutoNAT
//! state. Pure state plus lifecycle; no business logic.

use crate::config::{P2POptions, StaticProfile};
use crate::host::{ConnectionTracker, Direction};
use crate::types::ReachabilityState;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Aggregated connectivity state.
pub struct ConnectivityService {
    profile: StaticProfile,
    relay_enabled: bool,
    relay_service_enabled: bool,
    auto_relay_enabled: bool,
    dcutr_enabled: bool,
    autonat_client_enabled: bool,
    autonat_reachability: Arc<RwLock<Option<ReachabilityState>>>,
    tracker: Arc<ConnectionTracker>,
    relay_service_active: AtomicBool,
}

impl ConnectivityService {
    /// Build from resolved options and the host's shared state.
    pub fn new(
        options: &P2POptions,
        autonat_reachability: Arc<RwLock<Option<ReachabilityState>>>,
        tracker: Arc<ConnectionTracker>,
    ) -> Self {
        Self {
            profile: options.static_profile(),
            relay_enabled: options.relay.enable_relay,
            relay_service_enabled: options.relay.enable_relay_service,
            auto_relay_enabled: options.relay.enable_auto_relay,
            dcutr_enabled: options.relay.enable_dcutr,
            autonat_client_enabled: options.autonat.enable_client,
            autonat_reachability,
            tracker,
            relay_service_active: AtomicBool::new(false),
        }
    }

    /// Bring up the relay service when configured.
    pub fn start(&self) {
        if self.relay_service_enabled {
            self.relay_service_active.store(true, Ordering::Relaxed);
            info!("relay service active");
        }
    }

    /// Shut the relay service down.
    pub fn stop(&self) {
        if self.relay_service_active.swap(false, Ordering::Relaxed) {
            info!("relay service stopped");
        }
    }

    /// Live reachability: the AutoNAT verdict when one exists, otherwise
    /// the profile-derived default.
    pub fn reachability(&self) -> ReachabilityState {
        if let Some(state) = *self.autonat_reachability.read() {
            if state != ReachabilityState::Unknown {
                return state;
            }
        }
        match self.profile {
            StaticProfile::Server | StaticProfile::Client => ReachabilityState::Public,
            StaticProfile::Lan => ReachabilityState::Private,
        }
    }

    /// Aggregate stats for diagnostics.
    pub fn stats_map(&self) -> Map<String, Value> {
        let snapshot = self.tracker.snapshot();
        let inbound = snapshot
            .iter()
            .filter(|(_, c)| c.direction == Direction::Inbound)
            .count();
        let mut map = Map::new();
        map.insert("relay_enabled".into(), json!(self.relay_enabled));
        map.insert(
            "relay_active".into(),
            json!(self.relay_service_active.load(Ordering::Relaxed)),
        );
        map.insert("holepunch_enabled".into(), json!(self.dcutr_enabled));
        map.insert("autorelay_enabled".into(), json!(self.auto_relay_enabled));
        map.insert(
            "autonat_enabled".into(),
            json!(self.autonat_client_enabled),
        );
        map.insert(
            "autonat_status".into(),
            json!(format!("{:?}", self.reachability())),
        );
        map.insert("connections".into(), json!(snapshot.len()));
        map.insert("inbound_connections".into(), json!(inbound));
        map.insert(
            "outbound_connections".into(),
            json!(snapshot.len() - inbound),
        );
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainContext, ChainMode, Environment, RawNodeOptions};

    fn options(mode: ChainMode) -> P2POptions {
        let ctx = ChainContext {
            chain_mode: mode,
            environment: Environment::Dev,
            network_namespace: "t".into(),
            chain_id: "1".into(),
            genesis_hash: None,
        };
        crate::config::resolve_options(&ctx, &RawNodeOptions::default()).unwrap()
    }

    #[test]
    fn reachability_prefers_autonat_verdict() {
        let slot = Arc::new(RwLock::new(None));
        let service = ConnectivityService::new(
            &options(ChainMode::Public),
            Arc::clone(&slot),
            Arc::new(ConnectionTracker::default()),
        );
        assert_eq!(service.reachability(), ReachabilityState::Public);

        *slot.write() = Some(ReachabilityState::Private);
        assert_eq!(service.reachability(), ReachabilityState::Private);

        // An Unknown verdict falls back to the profile.
        *slot.write() = Some(ReachabilityState::Unknown);
        assert_eq!(service.reachability(), ReachabilityState::Public);
    }

    #[test]
    fn lan_profile_defaults_private() {
        let service = ConnectivityService::new(
            &options(ChainMode::Private),
            Arc::new(RwLock::new(None)),
            Arc::new(ConnectionTracker::default()),
        );
        assert_eq!(service.reachability(), ReachabilityState::Private);
    }

    #[test]
    fn stats_map_reflects_lifecycle() {
        let mut opts = options(ChainMode::Public);
        opts.relay.enable_relay_service = true;
        let service = ConnectivityService::new(
            &opts,
            Arc::new(RwLock::new(None)),
            Arc::new(ConnectionTracker::default()),
        );
        assert_eq!(service.stats_map()["relay_active"], json!(false));
        service.start();
        assert_eq!(service.stats_map()["relay_active"], json!(true));
        service.stop();
        assert_eq!(service.stats_map()["relay_active"], json!(false));
    }
}
