//! TTL-tiered in-memory peerstore.
//!
//! Tracks, per peer, the known multiaddresses (each with a TTL class and
//! expiry) and the protocols reported by identify. The host driver, the
//! address manager and the discovery self-heal all write through this one
//! structure; it is the single in-memory source of "peer -> dialable addrs".

use crate::types::AddrClass;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

/// One stored address with its class and expiry.
#[derive(Debug, Clone)]
pub struct AddrEntry {
    /// The address.
    pub addr: Multiaddr,
    /// TTL class the address was last written under.
    pub class: AddrClass,
    /// Expiry instant; `None` for permanent (bootstrap) addresses.
    pub expires_at: Option<Instant>,
}

impl AddrEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct PeerEntry {
    addrs: Vec<AddrEntry>,
    protocols: Vec<String>,
    tls_chain: Vec<Vec<u8>>,
}

/// Shared TTL-aware address book.
pub struct Peerstore {
    inner: RwLock<HashMap<PeerId, PeerEntry>>,
    max_addrs_per_peer: usize,
}

impl Peerstore {
    /// Create a peerstore capping stored addresses per peer.
    pub fn new(max_addrs_per_peer: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_addrs_per_peer: max_addrs_per_peer.max(1),
        }
    }

    /// Upsert addresses under a TTL class.
    ///
    /// An existing address is refreshed; its class only moves up in rank.
    /// New addresses are appended until the per-peer cap; beyond it the
    /// lowest-ranked, soonest-expiring entry is replaced first.
    pub fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], class: AddrClass) {
        if addrs.is_empty() {
            return;
        }
        let now = Instant::now();
        let expires_at = class.ttl().map(|ttl| now + ttl);
        let mut inner = self.inner.write();
        let entry = inner.entry(*peer).or_default();
        entry.addrs.retain(|a| !a.expired(now));

        for addr in addrs {
            if let Some(existing) = entry.addrs.iter_mut().find(|a| &a.addr == addr) {
                if class.rank() >= existing.class.rank() {
                    existing.class = class;
                    existing.expires_at = expires_at;
                } else if let (Some(new_exp), Some(old_exp)) = (expires_at, existing.expires_at) {
                    // Lower-ranked write still refreshes a shorter expiry.
                    if new_exp > old_exp {
                        existing.expires_at = Some(new_exp);
                    }
                }
                continue;
            }
            if entry.addrs.len() < self.max_addrs_per_peer {
                entry.addrs.push(AddrEntry {
                    addr: addr.clone(),
                    class,
                    expires_at,
                });
                continue;
            }
            // Full: replace the weakest entry if the incoming class outranks it.
            if let Some(victim_idx) = weakest_entry(&entry.addrs) {
                if class.rank() >= entry.addrs[victim_idx].class.rank() {
                    entry.addrs[victim_idx] = AddrEntry {
                        addr: addr.clone(),
                        class,
                        expires_at,
                    };
                }
            }
        }
    }

    /// Demote a peer's non-bootstrap addresses to the `Failed` TTL,
    /// keeping the addresses themselves.
    pub fn demote_to_failed(&self, peer: &PeerId) {
        let now = Instant::now();
        let expires_at = AddrClass::Failed.ttl().map(|ttl| now + ttl);
        let mut inner = self.inner.write();
        if let Some(entry) = inner.get_mut(peer) {
            for a in entry
                .addrs
                .iter_mut()
                .filter(|a| a.class != AddrClass::Bootstrap)
            {
                a.class = AddrClass::Failed;
                a.expires_at = expires_at;
            }
        }
    }

    /// Non-expired addresses for a peer.
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        self.inner
            .read()
            .get(peer)
            .map(|e| {
                e.addrs
                    .iter()
                    .filter(|a| !a.expired(now))
                    .map(|a| a.addr.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Full non-expired entries for a peer, with class and expiry.
    pub fn entries(&self, peer: &PeerId) -> Vec<AddrEntry> {
        let now = Instant::now();
        self.inner
            .read()
            .get(peer)
            .map(|e| {
                e.addrs
                    .iter()
                    .filter(|a| !a.expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove one address from a peer.
    pub fn remove_addr(&self, peer: &PeerId, addr: &Multiaddr) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.get_mut(peer) {
            entry.addrs.retain(|a| &a.addr != addr);
        }
    }

    /// Forget a peer entirely.
    pub fn remove_peer(&self, peer: &PeerId) {
        self.inner.write().remove(peer);
    }

    /// Record the protocols identify reported for a peer.
    pub fn set_protocols(&self, peer: &PeerId, protocols: Vec<String>) {
        self.inner.write().entry(*peer).or_default().protocols = protocols;
    }

    /// Protocols last reported for a peer.
    pub fn protocols(&self, peer: &PeerId) -> Vec<String> {
        self.inner
            .read()
            .get(peer)
            .map(|e| e.protocols.clone())
            .unwrap_or_default()
    }

    /// Record the DER certificate chain presented by a peer, as delivered
    /// by the secured-connection adapter (consortium deployments).
    pub fn set_tls_chain(&self, peer: &PeerId, chain: Vec<Vec<u8>>) {
        self.inner.write().entry(*peer).or_default().tls_chain = chain;
    }

    /// DER certificate chain last recorded for a peer; empty when the
    /// adapter has not delivered one.
    pub fn tls_chain(&self, peer: &PeerId) -> Vec<Vec<u8>> {
        self.inner
            .read()
            .get(peer)
            .map(|e| e.tls_chain.clone())
            .unwrap_or_default()
    }

    /// True when identify reported any protocol under the given prefix.
    pub fn supports_prefix(&self, peer: &PeerId, prefix: &str) -> bool {
        self.inner
            .read()
            .get(peer)
            .is_some_and(|e| e.protocols.iter().any(|p| p.starts_with(prefix)))
    }

    /// All peers with at least one stored entry.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.read().keys().copied().collect()
    }

    /// Number of tracked peers.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Drop expired addresses and peers left with neither addresses nor
    /// protocol info.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0usize;
        let mut inner = self.inner.write();
        inner.retain(|_, entry| {
            let before = entry.addrs.len();
            entry.addrs.retain(|a| !a.expired(now));
            removed += before - entry.addrs.len();
            !entry.addrs.is_empty() || !entry.protocols.is_empty() || !entry.tls_chain.is_empty()
        });
        removed
    }
}

fn weakest_entry(addrs: &[AddrEntry]) -> Option<usize> {
    addrs
        .iter()
        .enumerate()
        .min_by_key(|(_, a)| (a.class.rank(), a.expires_at))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/10.0.0.1/tcp/{port}").parse().unwrap()
    }

    #[test]
    fn connected_write_outranks_dht() {
        let store = Peerstore::new(8);
        let peer = PeerId::random();
        store.add_addrs(&peer, &[addr(1)], AddrClass::Dht);
        store.add_addrs(&peer, &[addr(1)], AddrClass::Connected);
        let entries = store.entries(&peer);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].class, AddrClass::Connected);

        // A later DHT observation must not downgrade the class.
        store.add_addrs(&peer, &[addr(1)], AddrClass::Dht);
        assert_eq!(store.entries(&peer)[0].class, AddrClass::Connected);
    }

    #[test]
    fn bootstrap_addrs_never_expire() {
        let store = Peerstore::new(8);
        let peer = PeerId::random();
        store.add_addrs(&peer, &[addr(1)], AddrClass::Bootstrap);
        assert!(store.entries(&peer)[0].expires_at.is_none());
        store.demote_to_failed(&peer);
        assert_eq!(store.entries(&peer)[0].class, AddrClass::Bootstrap);
    }

    #[test]
    fn demote_keeps_addrs_with_failed_ttl() {
        let store = Peerstore::new(8);
        let peer = PeerId::random();
        store.add_addrs(&peer, &[addr(1), addr(2)], AddrClass::Connected);
        store.demote_to_failed(&peer);
        let entries = store.entries(&peer);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.class == AddrClass::Failed));
        let max_ttl = Instant::now() + Duration::from_secs(301);
        assert!(entries.iter().all(|e| e.expires_at.unwrap() <= max_ttl));
    }

    #[test]
    fn per_peer_cap_enforced() {
        let store = Peerstore::new(3);
        let peer = PeerId::random();
        for port in 1..=5 {
            store.add_addrs(&peer, &[addr(port)], AddrClass::Dht);
        }
        assert_eq!(store.addrs(&peer).len(), 3);
    }

    #[test]
    fn gc_drops_expired_and_empty() {
        let store = Peerstore::new(8);
        let peer = PeerId::random();
        store.add_addrs(&peer, &[addr(1)], AddrClass::Dht);
        {
            let mut inner = store.inner.write();
            let entry = inner.get_mut(&peer).unwrap();
            entry.addrs[0].expires_at = Some(Instant::now() - Duration::from_secs(1));
        }
        assert_eq!(store.gc(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn protocol_prefix_lookup() {
        let store = Peerstore::new(8);
        let peer = PeerId::random();
        store.set_protocols(&peer, vec!["/weisyn/tx/1.0.0".into(), "/ipfs/id/1.0.0".into()]);
        assert!(store.supports_prefix(&peer, "/weisyn"));
        assert!(!store.supports_prefix(&peer, "/eth"));
    }
}
