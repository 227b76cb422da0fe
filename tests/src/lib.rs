//! Integration tests driving the engine through its public surface.
#![cfg(test)]

use brt_storage_engine::{
    block::BlockStore, config::EngineConfig, env::Env, message::{TxnId, Xids},
    tree::Tree, CursorOutcome, Error, ReadContext, UpdateResult,
};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rstest::rstest;
use std::{collections::BTreeMap, sync::Arc};

fn test_config() -> EngineConfig {
    EngineConfig {
        nodesize: 4096,
        basementsize: 512,
        fanout: 4,
        cache_bytes: 8 * 1024 * 1024,
        ..EngineConfig::default()
    }
}

fn fresh_tree(config: EngineConfig) -> (Arc<Env>, Arc<BlockStore>, Tree) {
    let _ = env_logger::builder().is_test(true).try_init();
    let env = Arc::new(Env::new());
    let store = Arc::new(BlockStore::new());
    let tree = Tree::create(env.clone(), store.clone(), config).unwrap();
    (env, store, tree)
}

fn key(k: u64) -> Vec<u8> {
    k.to_be_bytes().to_vec()
}

#[test]
fn empty_dictionary() {
    let (_env, _store, tree) = fresh_tree(test_config());
    assert!(tree.cursor().first().unwrap().is_none());
    assert!(tree.cursor().last().unwrap().is_none());
    assert!(tree.lookup(b"missing").unwrap().is_none());
    let stat = tree.stat64().unwrap();
    assert_eq!(stat.nkeys, 0);
    assert_eq!(stat.ndata, 0);
}

#[rstest]
#[case(64)]
#[case(1000)]
#[case(5000)]
fn insert_lookup_scan(#[case] n: u64) {
    let (_env, _store, tree) = fresh_tree(test_config());
    for k in 0..n {
        tree.insert(key(k), format!("value-{}", k), Xids::root()).unwrap();
    }
    for k in 0..n {
        assert_eq!(
            &*tree.lookup(key(k)).unwrap().unwrap(),
            format!("value-{}", k).as_bytes(),
            "key {}",
            k
        );
    }
    // A full forward scan visits every key in order.
    let mut cursor = tree.cursor();
    let mut seen = 0;
    let mut at = cursor.first().unwrap();
    let mut last_key: Option<Vec<u8>> = None;
    while let Some((k, _v)) = at {
        if let Some(prev) = &last_key {
            assert!(&k.to_vec() > prev);
        }
        last_key = Some(k.to_vec());
        seen += 1;
        at = cursor.next().unwrap();
    }
    assert_eq!(seen, n);
    if n >= 1000 {
        // This volume does not fit one leaf.
        assert!(tree.stats().splits > 0);
        assert!(tree.stats().flushes > 0);
    }
}

#[test]
fn survives_checkpoint_and_reopen() {
    let (_env, store, tree) = fresh_tree(test_config());
    for k in 0..800u64 {
        tree.insert(key(k), key(k * 7), Xids::root()).unwrap();
    }
    tree.checkpoint().unwrap();
    // Crash: reopen from the committed image only.
    let image = store.freeze();
    let env = Arc::new(Env::new());
    let store2 = Arc::new(BlockStore::thaw(&image).unwrap());
    let tree2 = Tree::open(env, store2, test_config()).unwrap();
    for k in 0..800u64 {
        assert_eq!(&*tree2.lookup(key(k)).unwrap().unwrap(), &key(k * 7)[..]);
    }
}

#[test]
fn uncheckpointed_writes_do_not_survive_a_crash() {
    let (_env, store, tree) = fresh_tree(test_config());
    tree.insert(b"a", b"1", Xids::root()).unwrap();
    tree.checkpoint().unwrap();
    tree.insert(b"b", b"2", Xids::root()).unwrap();
    let image = store.freeze();
    let env = Arc::new(Env::new());
    let tree2 = Tree::open(
        env,
        Arc::new(BlockStore::thaw(&image).unwrap()),
        test_config(),
    )
    .unwrap();
    assert_eq!(&*tree2.lookup(b"a").unwrap().unwrap(), b"1");
    assert!(tree2.lookup(b"b").unwrap().is_none());
}

/// Insert keys 0..100 with value `10 - k`; broadcast-update every key
/// where `k % 3 == 0` to `((10-k)^2) * (k+4)` inside a transaction, then
/// crash without committing. Recovery (emulated by the undo the
/// recovery driver would inject) leaves every key at `10 - k`.
#[test]
fn broadcast_update_rolls_back_on_crash() {
    let action = |key: &[u8], old: Option<&[u8]>, _extra: &[u8]| {
        let k = i64::from_be_bytes(key.try_into().unwrap());
        if k % 3 == 0 {
            let v = i64::from_le_bytes(old.unwrap().try_into().unwrap());
            UpdateResult::Set(
                brt_storage_engine::CowBytes::from(((v * v) * (k + 4)).to_le_bytes()).into(),
            )
        } else {
            UpdateResult::Keep
        }
    };
    let env = Arc::new(Env::new());
    let store = Arc::new(BlockStore::new());
    let tree = Tree::create_with(env, store.clone(), test_config(), action).unwrap();

    for k in 0..100i64 {
        tree.insert(k.to_be_bytes(), (10 - k).to_le_bytes(), Xids::root())
            .unwrap();
    }
    tree.checkpoint().unwrap();

    let txn = Xids::single(TxnId(77));
    tree.update_broadcast(b"", txn.clone()).unwrap();
    // The transaction sees its own update.
    let own = ReadContext {
        xids: txn.clone(),
        ..ReadContext::latest()
    };
    let v = tree.lookup_with(&9i64.to_be_bytes(), &own).unwrap().unwrap();
    assert_eq!(i64::from_le_bytes((*v).try_into().unwrap()), 13);
    tree.checkpoint().unwrap();

    // Crash without commit; recovery aborts the dangling transaction.
    let image = store.freeze();
    let env = Arc::new(Env::new());
    let tree2 = Tree::open(
        env,
        Arc::new(BlockStore::thaw(&image).unwrap()),
        test_config(),
    )
    .unwrap();
    tree2.abort_txn(txn).unwrap();
    for k in 0..100i64 {
        let v = tree2.lookup(k.to_be_bytes()).unwrap().unwrap();
        assert_eq!(
            i64::from_le_bytes((*v).try_into().unwrap()),
            10 - k,
            "key {}",
            k
        );
    }
}

/// Committed transactions survive the same crash.
#[test]
fn committed_update_survives_crash() {
    let (_env, store, tree) = fresh_tree(test_config());
    tree.insert(b"k", b"old", Xids::root()).unwrap();
    let txn = Xids::single(TxnId(5));
    tree.insert(b"k", b"new", txn.clone()).unwrap();
    tree.commit_txn(txn).unwrap();
    tree.checkpoint().unwrap();
    let env = Arc::new(Env::new());
    let tree2 = Tree::open(
        env,
        Arc::new(BlockStore::thaw(&store.freeze()).unwrap()),
        test_config(),
    )
    .unwrap();
    assert_eq!(&*tree2.lookup(b"k").unwrap().unwrap(), b"new");
}

#[test]
fn delete_and_keyrange() {
    let (_env, _store, tree) = fresh_tree(test_config());
    for k in (0..1000u64).step_by(100) {
        tree.insert(format!("{:04}", k), key(k), Xids::root()).unwrap();
    }
    // An in-flight transactional delete retains its tombstone.
    tree.delete(b"0500", Xids::single(TxnId(42))).unwrap();
    assert!(tree.lookup(b"0500").unwrap().is_none());
    assert_eq!(&*tree.lookup(b"0400").unwrap().unwrap(), &key(400)[..]);
    let kr = tree.keyrange(b"0500").unwrap();
    assert_eq!((kr.less, kr.equal, kr.greater), (5, 0, 5));
    // less + equal + greater accounts for every physical entry.
    assert_eq!(kr.less + kr.equal + kr.greater, 10);
    // Once the delete commits and the slot is reclaimed, the counts
    // drop it entirely.
    tree.commit_txn(Xids::single(TxnId(42))).unwrap();
    let kr = tree.keyrange(b"0500").unwrap();
    assert_eq!((kr.less, kr.equal, kr.greater), (5, 0, 4));
}

#[test]
fn insert_no_overwrite_reports_key_exists() {
    let (_env, _store, tree) = fresh_tree(test_config());
    tree.insert(b"k", b"v1", Xids::root()).unwrap();
    match tree.insert_no_overwrite(b"k", b"v2", Xids::root()) {
        Err(Error::KeyExists) => {}
        other => panic!("expected KeyExists, got {:?}", other.map(|_| ())),
    }
    assert_eq!(&*tree.lookup(b"k").unwrap().unwrap(), b"v1");
    // Into a deleted slot it goes through.
    tree.delete(b"k", Xids::root()).unwrap();
    tree.insert_no_overwrite(b"k", b"v3", Xids::root()).unwrap();
    assert_eq!(&*tree.lookup(b"k").unwrap().unwrap(), b"v3");
}

#[test]
fn forced_try_again_retries_without_observable_change() {
    let (_env, _store, tree) = fresh_tree(test_config());
    for k in 0..2000u64 {
        tree.insert(key(k), key(k + 1), Xids::root()).unwrap();
    }
    let retries_before = tree.stats().retries;
    tree.force_pin_retries(3);
    assert_eq!(&*tree.lookup(key(1234)).unwrap().unwrap(), &key(1235)[..]);
    assert!(tree.stats().retries >= retries_before + 3);

    // A cursor descent unwinds and redescends the same way.
    tree.force_pin_retries(2);
    let mut cursor = tree.cursor();
    let (first, _) = cursor.first().unwrap().unwrap();
    assert_eq!(&*first, &key(0)[..]);
    let (second, _) = cursor.next().unwrap().unwrap();
    assert_eq!(&*second, &key(1)[..]);
}

#[test]
fn snapshot_reader_is_isolated_from_later_writers() {
    let (_env, _store, tree) = fresh_tree(test_config());
    for k in 0..50u64 {
        tree.insert(key(k), b"base", Xids::root()).unwrap();
    }
    let snapshot = ReadContext {
        xids: Xids::root(),
        oldest_live_in_snapshot: TxnId(100),
        snapshot: true,
    };
    // Writer starts after the snapshot horizon.
    let writer = Xids::single(TxnId(100));
    tree.insert(key(7), b"overwritten", writer.clone()).unwrap();
    tree.insert(key(999), b"fresh", writer.clone()).unwrap();

    assert_eq!(&*tree.lookup_with(&key(7), &snapshot).unwrap().unwrap(), b"base");
    assert!(tree.lookup_with(&key(999), &snapshot).unwrap().is_none());
    // The writer observes its own effects.
    let own = ReadContext {
        xids: writer.clone(),
        oldest_live_in_snapshot: TxnId(100),
        snapshot: true,
    };
    assert_eq!(
        &*tree.lookup_with(&key(7), &own).unwrap().unwrap(),
        b"overwritten"
    );
    // A snapshot scan skips the invisible fresh key.
    let mut cursor = tree.cursor_with(snapshot).unwrap();
    let mut count = 0;
    let mut at = cursor.first().unwrap();
    while let Some((k, v)) = at {
        assert!(&*v == b"base", "key {:?}", k);
        count += 1;
        at = cursor.next().unwrap();
    }
    assert_eq!(count, 50);
}

#[test]
fn snapshot_refuses_newer_dictionary() {
    let (_env, _store, tree) = fresh_tree(test_config());
    tree.set_created_txn(TxnId(200));
    let snapshot = ReadContext {
        xids: Xids::root(),
        oldest_live_in_snapshot: TxnId(100),
        snapshot: true,
    };
    match tree.cursor_with(snapshot) {
        Err(Error::DictionaryTooNewForSnapshot) => {}
        other => panic!("expected refusal, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn provisional_deletes_are_skipped_by_scans() {
    let (_env, _store, tree) = fresh_tree(test_config());
    for k in 0..10u64 {
        tree.insert(key(k), b"v", Xids::root()).unwrap();
    }
    let txn = Xids::single(TxnId(9));
    tree.delete(key(4), txn.clone()).unwrap();
    // A reader outside the transaction still sees key 4.
    let outside = ReadContext {
        xids: Xids::root(),
        oldest_live_in_snapshot: TxnId(9),
        snapshot: true,
    };
    let mut cursor = tree.cursor_with(outside).unwrap();
    let mut keys = Vec::new();
    let mut at = cursor.first().unwrap();
    while let Some((k, _)) = at {
        keys.push(k.to_vec());
        at = cursor.next().unwrap();
    }
    assert_eq!(keys.len(), 10);
    // The deleting transaction scans around it.
    let own = ReadContext {
        xids: txn.clone(),
        ..ReadContext::latest()
    };
    let mut cursor = tree.cursor_with(own).unwrap();
    let mut keys = Vec::new();
    let mut at = cursor.first().unwrap();
    while let Some((k, _)) = at {
        keys.push(k.to_vec());
        at = cursor.next().unwrap();
    }
    assert_eq!(keys.len(), 9);
    assert!(!keys.contains(&key(4)));
}

#[test]
fn cursor_set_and_ranges() {
    let (_env, _store, tree) = fresh_tree(test_config());
    for k in (0..100u64).map(|k| k * 2) {
        tree.insert(key(k), key(k), Xids::root()).unwrap();
    }
    let mut cursor = tree.cursor();
    assert_eq!(cursor.set(&key(10)).unwrap().unwrap().0.to_vec(), key(10));
    assert!(cursor.set(&key(11)).unwrap().is_none());
    assert_eq!(
        cursor.set_range(&key(11)).unwrap().unwrap().0.to_vec(),
        key(12)
    );
    assert_eq!(
        cursor.set_range_reverse(&key(11)).unwrap().unwrap().0.to_vec(),
        key(10)
    );
    assert_eq!(cursor.prev().unwrap().unwrap().0.to_vec(), key(8));
    // A caller bound can reject the hit.
    let outcome = cursor
        .set_range_with(&key(50), |k, _v| k <= &key(40)[..])
        .unwrap();
    assert_eq!(outcome, CursorOutcome::Rejected);
    let outcome = cursor
        .set_range_with(&key(50), |k, _v| k <= &key(60)[..])
        .unwrap();
    assert_eq!(outcome, CursorOutcome::Found);
    // Past the right edge.
    assert!(cursor.set_range(&key(1000)).unwrap().is_none());
}

#[test]
fn cursor_delete_through_transaction() {
    let (_env, _store, tree) = fresh_tree(test_config());
    for k in 0..5u64 {
        tree.insert(key(k), b"v", Xids::root()).unwrap();
    }
    let txn = Xids::single(TxnId(3));
    let mut cursor = tree
        .cursor_with(ReadContext {
            xids: txn.clone(),
            ..ReadContext::latest()
        })
        .unwrap();
    cursor.set(&key(2)).unwrap().unwrap();
    assert_eq!(cursor.delete().unwrap(), CursorOutcome::Found);
    tree.commit_txn(txn).unwrap();
    assert!(tree.lookup(key(2)).unwrap().is_none());
    assert_eq!(tree.stat64().unwrap().nkeys, 4);
}

#[test]
fn matches_reference_model_under_random_workload() {
    let (_env, _store, tree) = fresh_tree(test_config());
    let mut reference = BTreeMap::new();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0xb71c0de);
    for _ in 0..4000 {
        let k = rng.gen_range(0..600u64);
        if rng.gen_bool(0.25) {
            tree.delete(key(k), Xids::root()).unwrap();
            reference.remove(&key(k));
        } else {
            let v = rng.gen::<u64>();
            tree.insert(key(k), key(v), Xids::root()).unwrap();
            reference.insert(key(k), key(v));
        }
    }
    for (k, v) in &reference {
        assert_eq!(&*tree.lookup(k).unwrap().unwrap(), &v[..]);
    }
    // Scan both in lockstep.
    let mut cursor = tree.cursor();
    let mut at = cursor.first().unwrap();
    let mut it = reference.iter();
    while let Some((k, v)) = at {
        let (rk, rv) = it.next().expect("tree has no extra entries");
        assert_eq!(&k.to_vec(), rk);
        assert_eq!(&v.to_vec(), rv);
        at = cursor.next().unwrap();
    }
    assert!(it.next().is_none(), "tree is missing entries");
}

/// Flushing between batches must not change the final leaf state.
#[rstest]
#[case(1)]
#[case(4)]
fn flush_timing_is_invisible(#[case] checkpoints: usize) {
    let (_env, _store, baseline) = fresh_tree(test_config());
    let (_env2, _store2, staged) = fresh_tree(test_config());
    let batch = 600usize;
    for i in 0..batch {
        let k = key((i as u64 * 13) % 997);
        baseline.insert(&k, key(i as u64), Xids::root()).unwrap();
        staged.insert(&k, key(i as u64), Xids::root()).unwrap();
        if checkpoints > 0 && i % (batch / checkpoints).max(1) == 0 {
            staged.checkpoint().unwrap();
        }
    }
    let mut a = baseline.cursor();
    let mut b = staged.cursor();
    let mut at_a = a.first().unwrap();
    let mut at_b = b.first().unwrap();
    loop {
        match (&at_a, &at_b) {
            (None, None) => break,
            (Some((ka, va)), Some((kb, vb))) => {
                assert_eq!(ka, kb);
                assert_eq!(va, vb);
            }
            other => panic!("scans diverged: {:?}", other),
        }
        at_a = a.next().unwrap();
        at_b = b.next().unwrap();
    }
}

#[test]
fn delete_heavy_workload_stays_consistent() {
    let (_env, _store, tree) = fresh_tree(test_config());
    for k in 0..3000u64 {
        tree.insert(key(k), key(k), Xids::root()).unwrap();
    }
    for k in 0..3000u64 {
        if k % 10 != 0 {
            tree.delete(key(k), Xids::root()).unwrap();
        }
    }
    tree.checkpoint().unwrap();
    for k in 0..3000u64 {
        let found = tree.lookup(key(k)).unwrap();
        if k % 10 == 0 {
            assert_eq!(&*found.unwrap(), &key(k)[..]);
        } else {
            assert!(found.is_none(), "key {} should be gone", k);
        }
    }
    let mut cursor = tree.cursor();
    let mut count = 0;
    let mut at = cursor.first().unwrap();
    while let Some(_) = at {
        count += 1;
        at = cursor.next().unwrap();
    }
    assert_eq!(count, 300);
}

#[test]
fn eviction_under_memory_pressure() {
    let config = EngineConfig {
        cache_bytes: 64 * 1024,
        ..test_config()
    };
    let (_env, _store, tree) = fresh_tree(config);
    for k in 0..4000u64 {
        tree.insert(key(k), vec![0xabu8; 64], Xids::root()).unwrap();
    }
    let stats = tree.stats();
    assert!(
        stats.partial_evictions + stats.evictions > 0,
        "nothing was evicted under a 64 KiB budget"
    );
    for k in (0..4000u64).step_by(97) {
        assert_eq!(&*tree.lookup(key(k)).unwrap().unwrap(), &[0xabu8; 64][..]);
    }
    assert!(tree.stats().fetches + tree.stats().partial_fetches > 0);
}

#[test]
fn optimize_collapses_quiescent_transactions() {
    let (env, _store, tree) = fresh_tree(test_config());
    let txn = Xids::single(TxnId(10));
    tree.insert(b"k", b"v", txn).unwrap();
    // A snapshot that excludes transaction 10 cannot see the
    // provisional value.
    let snapshot = ReadContext {
        xids: Xids::root(),
        oldest_live_in_snapshot: TxnId(10),
        snapshot: true,
    };
    assert!(tree.lookup_with(b"k", &snapshot).unwrap().is_none());
    // Without a proven watermark, optimize must not commit anything on
    // behalf of the still-open transaction.
    tree.optimize().unwrap();
    assert!(tree.lookup_with(b"k", &snapshot).unwrap().is_none());
    // Transaction 10 is long gone; everything below 50 is decided.
    env.set_oldest_live_txn(TxnId(50));
    tree.optimize().unwrap();
    // The promoted value is committed and visible to everyone.
    assert_eq!(&*tree.lookup_with(b"k", &snapshot).unwrap().unwrap(), b"v");
}

#[test]
fn panicked_dictionary_refuses_everything() {
    // Room for the header, not for node write-back.
    let store = Arc::new(BlockStore::with_capacity(512));
    let env = Arc::new(Env::new());
    let broken = Tree::create(env, store, test_config()).unwrap();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
    for k in 0..64u64 {
        let val: Vec<u8> = (0..64).map(|_| rng.gen()).collect();
        broken.insert(key(k), val, Xids::root()).unwrap();
    }
    let err = broken.checkpoint().unwrap_err();
    assert!(matches!(err, Error::DiskFull));
    match broken.insert(b"b", b"2", Xids::root()) {
        Err(Error::Panicked { .. }) => {}
        other => panic!("expected poisoned dictionary, got {:?}", other.map(|_| ())),
    }
    match broken.checkpoint() {
        Err(Error::Panicked { .. }) => {}
        other => panic!("checkpoints must refuse, got {:?}", other.map(|_| ())),
    }
}
