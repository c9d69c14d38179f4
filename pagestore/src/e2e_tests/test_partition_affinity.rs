//! A key with an affinity field is stored, indexed and expired in the
//! partition of its affinity bytes, not the partition of its own bytes.

use std::time::Duration;

use crate::cache::CacheKey;
use crate::storage::TimeSource;
use crate::testing::{test_config, test_engine};

const AFFINITY: &[u8] = b"order-42";

#[test]
fn test_pending_row_lands_in_affinity_partition() {
    let (engine, clock) = test_engine(test_config().with_partitions(8));
    let affinity = engine.affinity();
    let expected = affinity.partition_of_bytes(AFFINITY);

    let key = (0..1_000)
        .map(|i| CacheKey::with_affinity(format!("line-{i}"), AFFINITY))
        .find(|key| affinity.partition_of_bytes(key.bytes()) != expected)
        .expect("a key hashing elsewhere");

    let link = engine
        .put(1, &key, b"payload".to_vec(), Some(Duration::from_secs(5)))
        .expect("put");
    assert_eq!(link.page_id().partition(), expected);

    for store in engine.partitions() {
        let pending: Vec<_> = store
            .due_rows(u64::MAX, 10)
            .expect("pending rows");
        if store.partition() == expected {
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].partition(), expected);
            assert_eq!(pending[0].link, link);
            assert_eq!(store.len(), 1);
        } else {
            assert!(pending.is_empty(), "pending row in partition {}", store.partition());
            assert!(store.is_empty());
        }
    }

    clock.advance(5_000);
    assert_eq!(engine.expire(clock.now_ms(), 10).expect("expire").expired, 1);
    assert_eq!(engine.size(), 0);
}

#[test]
fn test_tombstone_is_queued_with_affinity_partition() {
    let (engine, clock) =
        test_engine(test_config().with_partitions(16).with_tombstone_ttl(Duration::from_secs(1)));
    let affinity = engine.affinity();
    let expected = affinity.partition_of_bytes(AFFINITY);
    let key = (0..1_000)
        .map(|i| CacheKey::with_affinity(format!("item-{i}"), AFFINITY))
        .find(|key| affinity.partition_of_bytes(key.bytes()) != expected)
        .expect("a key hashing elsewhere");

    engine.put(1, &key, b"v".to_vec(), None).expect("put");
    let store = engine.partition(expected).expect("partition exists");
    assert!(store.pending_tree().is_empty());

    assert!(engine.remove(1, &key).expect("remove"));
    assert!(!store.pending_tree().is_empty());

    clock.advance(1_000);
    assert_eq!(engine.fill_expiry_queue(clock.now_ms(), 10).expect("fill"), 1);
    let queued = engine.queue().peek().expect("queued tombstone");
    assert!(queued.tombstone);
    assert_eq!(queued.partition(), expected);

    assert_eq!(engine.expire(clock.now_ms(), 10).expect("expire").expired, 1);
    assert!(store.pending_tree().is_empty());
    assert!(engine.queue().is_empty());
}

#[test]
fn test_colocated_keys_share_a_partition() {
    let (engine, _clock) = test_engine(test_config().with_partitions(8));
    let keys: Vec<_> = (0..20)
        .map(|i| CacheKey::with_affinity(format!("line-{i}"), AFFINITY))
        .collect();
    for key in &keys {
        engine.put(1, key, b"v".to_vec(), None).expect("put");
    }

    let expected = engine.affinity().partition_of_bytes(AFFINITY);
    let store = engine.partition(expected).expect("partition exists");
    assert_eq!(store.len(), 20);
    for key in &keys {
        assert!(store.get(1, key.bytes()).expect("get").is_some());
    }
}
