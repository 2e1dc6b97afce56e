//! Durable-store round-trip behavior across close/reopen.

use libp2p::{Multiaddr, PeerId};
use weisyn_network::{AddrStore, PeerAddrRecord, SledAddrStore};

fn record(ports: &[u16], bootstrap: bool) -> PeerAddrRecord {
    let peer = PeerId::random();
    let addrs: Vec<Multiaddr> = ports
        .iter()
        .map(|p| format!("/ip4/198.51.100.3/tcp/{p}").parse().unwrap())
        .collect();
    PeerAddrRecord::new(&peer, &addrs, bootstrap)
}

#[tokio::test]
async fn upsert_close_reopen_load_all_round_trips() {
    let dir = tempfile::tempdir().unwrap();

    let mut kept: Vec<PeerAddrRecord> = (0..10)
        .map(|i| record(&[28600 + i, 28700 + i], i % 3 == 0))
        .collect();
    let deleted = record(&[28999], false);

    {
        let store = SledAddrStore::open(dir.path()).unwrap();
        for rec in &kept {
            store.upsert(rec).await.unwrap();
        }
        store.upsert(&deleted).await.unwrap();
        store
            .delete(&deleted.parse_peer_id().unwrap())
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let store = SledAddrStore::open(dir.path()).unwrap();
    let mut restored = store.load_all().await.unwrap();

    kept.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    restored.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    assert_eq!(restored, kept);
    for (restored, original) in restored.iter().zip(kept.iter()) {
        assert_eq!(restored.addrs, original.addrs);
    }
}

#[tokio::test]
async fn upsert_replaces_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledAddrStore::open(dir.path()).unwrap();

    let mut rec = record(&[28601], false);
    store.upsert(&rec).await.unwrap();
    rec.fail_count = 4;
    rec.addrs = vec!["/ip4/198.51.100.4/tcp/28602".into()];
    store.upsert(&rec).await.unwrap();

    let all = store.load_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0], rec);
}

#[tokio::test]
async fn get_missing_record_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledAddrStore::open(dir.path()).unwrap();
    assert_eq!(store.get(&PeerId::random()).await.unwrap(), None);
    // Deleting a missing record is not an error either.
    store.delete(&PeerId::random()).await.unwrap();
}
