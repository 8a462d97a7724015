//! End-to-end scenarios exercising the engine through its public API
//! only: growth/splits, DUPSORT promotion, overflow pages surviving a
//! reopen, MVCC snapshot isolation across threads, meta-page crash
//! recovery, and reader exclusion of garbage collection.

use std::os::unix::fs::FileExt;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rdb::{DbFlags, Environment, OpenFlags, PutFlags};
use tempfile::tempdir;

fn open(path: &std::path::Path) -> Environment {
    Environment::builder().open(path, OpenFlags::empty()).unwrap()
}

/// S1: enough inserts to force repeated branch splits, then confirm the
/// whole set is present and a cursor walks it back in sorted order.
#[test]
fn insert_grow_and_split_keeps_order() {
    let _ = env_logger::try_init();
    let dir = tempdir().unwrap();
    let env = open(&dir.path().join("data.db"));

    let keys: Vec<u32> = (0..3000).collect();
    // Insert in a random order, not ascending, so the tree actually has
    // to split internally rather than always appending at the
    // rightmost edge. Seeded so a failure is reproducible.
    let mut insert_order = keys.clone();
    insert_order.shuffle(&mut StdRng::seed_from_u64(0xC0FFEE));
    {
        let mut txn = env.begin_write(None).unwrap();
        let dbi = txn.open_dbi(Some("widgets"), DbFlags::CREATE).unwrap();
        for &k in &insert_order {
            txn.put(dbi, &k.to_be_bytes(), &k.to_le_bytes(), PutFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
    }

    let read = env.begin_read().unwrap();
    let dbi = read.open_dbi(Some("widgets")).unwrap();
    let mut cursor = read.open_cursor(dbi).unwrap();
    let mut seen = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((k, _)) = entry {
        seen.push(k);
        entry = cursor.next().unwrap();
    }
    assert_eq!(seen.len(), keys.len());
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted, "cursor must walk keys in ascending order");

    for &k in &keys {
        assert!(read.get(dbi, &k.to_be_bytes()).unwrap().is_some());
    }
}

/// S2: push a single key's duplicate count past the inline-subpage
/// threshold so it promotes to a sub-tree, and check iteration still
/// sees every duplicate in sorted order.
#[test]
fn dupsort_promotes_to_subtree_and_iterates_in_order() {
    let _ = env_logger::try_init();
    let dir = tempdir().unwrap();
    let env = open(&dir.path().join("data.db"));

    let mut txn = env.begin_write(None).unwrap();
    let dbi = txn.open_dbi(Some("tags"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();
    let mut values: Vec<u32> = (0..2000).collect();
    for &v in &values {
        txn.put(dbi, b"hot", &v.to_be_bytes(), PutFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let read = env.begin_read().unwrap();
    let dbi = read.open_dbi(Some("tags")).unwrap();
    let mut cursor = read.open_cursor(dbi).unwrap();
    assert!(cursor.set(b"hot").unwrap().is_some());
    assert_eq!(cursor.count().unwrap() as usize, values.len());

    let mut seen = Vec::new();
    let mut v = cursor.first_dup().unwrap();
    seen.push(v.clone().unwrap());
    loop {
        v = cursor.next_dup().unwrap();
        match v {
            Some(bytes) => seen.push(bytes),
            None => break,
        }
    }
    values.sort();
    let decoded: Vec<u32> = seen.iter().map(|b| u32::from_be_bytes(b.as_slice().try_into().unwrap())).collect();
    assert_eq!(decoded, values);

    // every duplicate must also be reachable via get_both
    assert!(cursor.get_both(b"hot", &999u32.to_be_bytes()).unwrap());
    assert!(!cursor.get_both(b"hot", &9999999u32.to_be_bytes()).unwrap());
}

/// S3: a value large enough to need overflow pages round-trips through
/// a commit, a full process-level reopen of the file, and a read.
#[test]
fn overflow_value_survives_reopen() {
    let _ = env_logger::try_init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.db");
    let big = (0..200_000u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>();

    {
        let env = open(&path);
        let mut txn = env.begin_write(None).unwrap();
        let dbi = txn.open_dbi(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"blob", &big, PutFlags::empty()).unwrap();
        txn.commit().unwrap();
        env.sync().unwrap();
    }

    let env = open(&path);
    let read = env.begin_read().unwrap();
    let dbi = read.open_dbi(None).unwrap();
    let got = read.get(dbi, b"blob").unwrap().unwrap();
    assert_eq!(got, big);
}

/// S4: a reader begun before a concurrent writer's commit keeps seeing
/// its own snapshot, even while the writer races ahead on another thread.
#[test]
fn reader_snapshot_is_isolated_from_concurrent_writer() {
    let _ = env_logger::try_init();
    let dir = tempdir().unwrap();
    let env = open(&dir.path().join("data.db"));

    {
        let mut txn = env.begin_write(None).unwrap();
        let dbi = txn.open_dbi(None, DbFlags::CREATE).unwrap();
        txn.put(dbi, b"counter", &0u32.to_be_bytes(), PutFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    let read = env.begin_read().unwrap();
    let dbi = read.open_dbi(None).unwrap();
    let before = read.get(dbi, b"counter").unwrap().unwrap();
    assert_eq!(before, 0u32.to_be_bytes());

    let writer_env = env.clone();
    let handle = std::thread::spawn(move || {
        for i in 1..=50u32 {
            let mut txn = writer_env.begin_write(None).unwrap();
            let dbi = txn.open_dbi(None, DbFlags::empty()).unwrap();
            txn.put(dbi, b"counter", &i.to_be_bytes(), PutFlags::empty()).unwrap();
            txn.commit().unwrap();
        }
    });
    handle.join().unwrap();

    // The long-lived reader must still see the value from when it began.
    let still = read.get(dbi, b"counter").unwrap().unwrap();
    assert_eq!(still, before);
    read.close();

    let fresh = env.begin_read().unwrap();
    let dbi = fresh.open_dbi(None).unwrap();
    assert_eq!(fresh.get(dbi, b"counter").unwrap().unwrap(), 50u32.to_be_bytes());
}

/// S5: corrupt the meta page a writer would have just finished
/// overwriting (simulating a crash partway through a later commit) and
/// confirm reopening the file falls back to the other, still-valid
/// meta, recovering the last fully-committed state rather than failing
/// or surfacing torn data.
#[test]
fn reopen_recovers_from_a_corrupted_meta_page() {
    let _ = env_logger::try_init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.db");
    let page_size = 4096u64; // the default EnvBuilder page size used below

    {
        let env = open(&path);
        let mut txn = env.begin_write(None).unwrap();
        let dbi = txn.open_dbi(None, DbFlags::CREATE).unwrap();
        txn.put(dbi, b"a", b"first-commit", PutFlags::empty()).unwrap();
        txn.commit().unwrap(); // lands in meta slot 1
    }
    {
        let env = open(&path);
        let mut txn = env.begin_write(None).unwrap();
        let dbi = txn.open_dbi(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"b", b"second-commit", PutFlags::empty()).unwrap();
        txn.commit().unwrap(); // lands in meta slot 0, now the most recent
    }

    // Smash meta slot 0 as if the process died mid-write of that page.
    {
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&vec![0xAAu8; page_size as usize], 0).unwrap();
    }

    let env = open(&path);
    let read = env.begin_read().unwrap();
    let dbi = read.open_dbi(None).unwrap();
    // The prior, still-valid meta (slot 1) only knows about the first commit.
    assert_eq!(read.get(dbi, b"a").unwrap().unwrap(), b"first-commit");
    assert!(read.get(dbi, b"b").unwrap().is_none());
    read.close();

    // And the environment is fully usable afterward.
    let mut txn = env.begin_write(None).unwrap();
    let dbi = txn.open_dbi(None, DbFlags::empty()).unwrap();
    txn.put(dbi, b"c", b"third-commit", PutFlags::empty()).unwrap();
    txn.commit().unwrap();
    let read = env.begin_read().unwrap();
    assert_eq!(read.get(dbi, b"c").unwrap().unwrap(), b"third-commit");
}

/// S6: while a reader holds an old snapshot open, a writer that
/// repeatedly deletes and reinserts the same keys (churning pages that
/// would otherwise be reclaimed) must never disturb what the reader sees.
#[test]
fn long_lived_reader_blocks_reclamation_of_its_pages() {
    let _ = env_logger::try_init();
    let dir = tempdir().unwrap();
    let env = open(&dir.path().join("data.db"));

    {
        let mut txn = env.begin_write(None).unwrap();
        let dbi = txn.open_dbi(None, DbFlags::CREATE).unwrap();
        for i in 0u32..200 {
            txn.put(dbi, &i.to_be_bytes(), b"original", PutFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
    }

    let read = env.begin_read().unwrap();
    let dbi = read.open_dbi(None).unwrap();
    for i in 0u32..200 {
        assert_eq!(read.get(dbi, &i.to_be_bytes()).unwrap().unwrap(), b"original");
    }

    // Churn every key several times over while the reader is still open.
    for round in 0..10u32 {
        let mut txn = env.begin_write(None).unwrap();
        let dbi = txn.open_dbi(None, DbFlags::empty()).unwrap();
        for i in 0u32..200 {
            txn.del(dbi, &i.to_be_bytes(), None).unwrap();
            txn.put(dbi, &i.to_be_bytes(), format!("round-{round}").as_bytes(), PutFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
    }

    for i in 0u32..200 {
        assert_eq!(read.get(dbi, &i.to_be_bytes()).unwrap().unwrap(), b"original", "reader snapshot must be untouched by reclamation");
    }
    read.close();

    let fresh = env.begin_read().unwrap();
    let dbi = fresh.open_dbi(None).unwrap();
    for i in 0u32..200 {
        assert_eq!(fresh.get(dbi, &i.to_be_bytes()).unwrap().unwrap(), b"round-9");
    }
}

/// Reopening an environment that was never written to at all must not
/// require any writer and must report an empty MainTree.
#[test]
fn fresh_environment_has_no_dbis_until_created() {
    let _ = env_logger::try_init();
    let dir = tempdir().unwrap();
    let env = open(&dir.path().join("data.db"));
    let read = env.begin_read().unwrap();
    let dbi = read.open_dbi(None).unwrap();
    assert_eq!(read.stat(dbi).unwrap().entries, 0);
}

/// Nested write transactions are rejected rather than silently flattened.
#[test]
fn nested_write_transactions_are_rejected() {
    let _ = env_logger::try_init();
    let dir = tempdir().unwrap();
    let env = open(&dir.path().join("data.db"));
    let outer = env.begin_write(None).unwrap();
    let err = env.begin_write(Some(&outer)).unwrap_err();
    assert!(matches!(err, rdb::Error::Incompatible(_)));
    outer.abort();
}

/// Opening an existing file with `OpenFlags::READ_ONLY` must succeed,
/// serve reads over a non-writable mapping, and reject any attempt to
/// start a write transaction rather than letting an OS mmap error
/// bubble up.
#[test]
fn read_only_environment_reads_but_cannot_write() {
    let _ = env_logger::try_init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.db");

    {
        let env = open(&path);
        let mut txn = env.begin_write(None).unwrap();
        let dbi = txn.open_dbi(None, DbFlags::CREATE).unwrap();
        txn.put(dbi, b"k", b"v", PutFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    let env = Environment::builder().open(&path, OpenFlags::READ_ONLY).unwrap();
    let read = env.begin_read().unwrap();
    let dbi = read.open_dbi(None).unwrap();
    assert_eq!(read.get(dbi, b"k").unwrap().unwrap(), b"v");

    let err = env.begin_write(None).unwrap_err();
    assert!(matches!(err, rdb::Error::PermissionDenied));
}
