use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use lumodb::{
    Database, DbFlags, EnvFlags, Environment, Error, Transaction, TransactionFlags, WriteFlags,
};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let mut env = Environment::new();
    env.set_max_dbs(2).unwrap();
    env.open(temp_dir.path(), EnvFlags::NOSYNC, 0o644).unwrap();
    (temp_dir, env)
}

fn put(env: &Environment, key: &[u8], value: &[u8]) {
    let mut txn = env.begin_rw_txn().unwrap();
    Database::MAIN.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_transaction_isolation() {
    let (_dir, env) = setup_test_env();

    // Write transaction
    let mut write_txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&write_txn, None, DbFlags::empty()).unwrap();
    db.put(&mut write_txn, b"key", b"value", WriteFlags::empty()).unwrap();

    // Read transaction shouldn't see uncommitted changes
    let read_txn = env.begin_ro_txn().unwrap();
    assert!(matches!(db.get(&read_txn, b"key"), Err(Error::NotFound)));

    // Nor committed ones made after it started
    write_txn.commit().unwrap();
    assert!(matches!(db.get(&read_txn, b"key"), Err(Error::NotFound)));
    assert_eq!(read_txn.id(), 0);

    // New readers see the commit
    let read_txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&read_txn, b"key").unwrap(), b"value");
    assert_eq!(read_txn.id(), 1);
}

#[test]
fn test_old_snapshot_survives_overwrites() {
    let (_dir, env) = setup_test_env();
    for i in 0..200 {
        let key = format!("key{:04}", i);
        put(&env, key.as_bytes(), b"old");
    }

    let reader = env.begin_ro_txn().unwrap();
    for round in 0..20 {
        let mut txn = env.begin_rw_txn().unwrap();
        for i in 0..200 {
            let key = format!("key{:04}", i);
            let value = format!("new{}", round);
            Database::MAIN.put(&mut txn, key.as_bytes(), value.as_bytes(), WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
    }

    for i in 0..200 {
        let key = format!("key{:04}", i);
        assert_eq!(Database::MAIN.get(&reader, key.as_bytes()).unwrap(), b"old");
    }
    let mut cursor = reader.open_cursor(Database::MAIN).unwrap();
    assert_eq!(cursor.iter().count(), 200);
}

#[test]
fn test_pages_reused_once_readers_finish() {
    let (_dir, env) = setup_test_env();
    let value = [9u8; 500];
    let rewrite = |round: usize| {
        let mut txn = env.begin_rw_txn().unwrap();
        for i in 0..100 {
            let key = format!("key{:04}", i);
            let mut v = value.to_vec();
            v[0] = round as u8;
            Database::MAIN.put(&mut txn, key.as_bytes(), &v, WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
    };

    for round in 0..5 {
        rewrite(round);
    }
    let settled = env.info().unwrap().last_pgno;
    for round in 5..50 {
        rewrite(round);
    }
    let after = env.info().unwrap().last_pgno;
    assert!(after <= settled * 2, "file grew from {} to {} pages", settled, after);

    // A long-lived reader pins its pages, so the file has to grow
    let reader = env.begin_ro_txn().unwrap();
    for round in 50..60 {
        rewrite(round);
    }
    assert!(env.info().unwrap().last_pgno > after);
    assert_eq!(Database::MAIN.get(&reader, b"key0000").unwrap()[0], 49);
}

#[test]
fn test_abort_discards_changes() {
    let (_dir, env) = setup_test_env();
    put(&env, b"kept", b"1");

    let mut txn = env.begin_rw_txn().unwrap();
    Database::MAIN.put(&mut txn, b"gone", b"2", WriteFlags::empty()).unwrap();
    Database::MAIN.del(&mut txn, b"kept").unwrap();
    txn.abort();

    // Dropping without commit aborts too
    {
        let mut txn = env.begin_rw_txn().unwrap();
        Database::MAIN.put(&mut txn, b"dropped", b"3", WriteFlags::empty()).unwrap();
    }

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(Database::MAIN.get(&txn, b"kept").unwrap(), b"1");
    assert!(matches!(Database::MAIN.get(&txn, b"gone"), Err(Error::NotFound)));
    assert!(matches!(Database::MAIN.get(&txn, b"dropped"), Err(Error::NotFound)));
    assert_eq!(env.info().unwrap().last_txnid, 1);
}

fn scan(txn: &Transaction<'_>) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = Database::MAIN.cursor(txn).unwrap();
    cursor
        .iter()
        .map(|r| {
            let (k, v) = r.unwrap();
            (k.to_vec(), v.to_vec())
        })
        .collect()
}

/// Deletes, overwrites and inserts spread over the whole key range.
fn mixed_writes(txn: &mut Transaction<'_>) {
    for i in 0..2000 {
        let key = format!("key{:05}", i);
        match i % 4 {
            0 => Database::MAIN.del(txn, key.as_bytes()).unwrap(),
            1 => Database::MAIN.put(txn, key.as_bytes(), b"changed", WriteFlags::empty()).unwrap(),
            2 => {
                let extra = format!("key{:05}x", i);
                Database::MAIN.put(txn, extra.as_bytes(), &[7u8; 300], WriteFlags::empty()).unwrap();
            }
            _ => {}
        }
    }
    Database::MAIN.put(txn, b"overflow", &[1u8; 10_000], WriteFlags::empty()).unwrap();
}

#[test]
fn test_abort_restores_multi_level_tree() {
    let temp_dir = TempDir::new().unwrap();
    let mut env = Environment::new();
    env.set_map_size(8 << 20).unwrap();
    env.open(temp_dir.path(), EnvFlags::NOSYNC, 0o644).unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..2000 {
        let key = format!("key{:05}", i);
        let value = format!("value{:0>100}", i);
        Database::MAIN.put(&mut txn, key.as_bytes(), value.as_bytes(), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let before = scan(&txn);
    let stat_before = Database::MAIN.stat(&txn).unwrap();
    assert_eq!(before.len(), 2000);
    assert!(stat_before.depth >= 2);
    drop(txn);


    // Top-level abort
    let mut txn = env.begin_rw_txn().unwrap();
    mixed_writes(&mut txn);
    assert_ne!(scan(&txn), before);
    txn.abort();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(scan(&txn), before);
    let stat = Database::MAIN.stat(&txn).unwrap();
    assert_eq!(stat.entries, stat_before.entries);
    assert_eq!(stat.depth, stat_before.depth);
    assert_eq!(stat.leaf_pages, stat_before.leaf_pages);
    drop(txn);

    // Nested abort leaves the parent as it was
    let mut parent = env.begin_rw_txn().unwrap();
    Database::MAIN.put(&mut parent, b"parent", b"p", WriteFlags::empty()).unwrap();
    let in_parent = scan(&parent);
    {
        let mut child = parent.begin_nested().unwrap();
        mixed_writes(&mut child);
        assert_ne!(scan(&child), in_parent);
        child.abort();
    }
    assert_eq!(scan(&parent), in_parent);
    parent.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(scan(&txn), in_parent);
}

#[test]
fn test_named_database_created_in_aborted_txn() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, Some("temp"), DbFlags::CREATE).unwrap();
    txn.abort();

    let txn = env.begin_ro_txn().unwrap();
    assert!(matches!(db.get(&txn, b"k"), Err(Error::BadDbi)));
    assert!(matches!(
        Database::open(&txn, Some("temp"), DbFlags::empty()),
        Err(Error::NotFound)
    ));
}

#[test]
fn test_nested_transactions() {
    let (_dir, env) = setup_test_env();
    let db = Database::MAIN;
    let mut parent = env.begin_rw_txn().unwrap();
    db.put(&mut parent, b"a", b"parent", WriteFlags::empty()).unwrap();

    // Child commit folds into the parent
    let mut child = parent.begin_nested().unwrap();
    assert_eq!(db.get(&child, b"a").unwrap(), b"parent");
    db.put(&mut child, b"b", b"child", WriteFlags::empty()).unwrap();
    child.commit().unwrap();
    assert_eq!(db.get(&parent, b"b").unwrap(), b"child");

    // Child abort leaves the parent as it was
    let mut child = parent.begin_nested().unwrap();
    db.put(&mut child, b"c", b"aborted", WriteFlags::empty()).unwrap();
    db.del(&mut child, b"a").unwrap();
    for i in 0..500 {
        let key = format!("bulk{:04}", i);
        db.put(&mut child, key.as_bytes(), &[1u8; 100], WriteFlags::empty()).unwrap();
    }
    child.abort();
    assert!(matches!(db.get(&parent, b"c"), Err(Error::NotFound)));
    assert_eq!(db.get(&parent, b"a").unwrap(), b"parent");
    assert_eq!(db.stat(&parent).unwrap().entries, 2);

    // Grandchildren
    {
        let mut child = parent.begin_nested().unwrap();
        let mut grandchild = child.begin_nested().unwrap();
        db.put(&mut grandchild, b"g", b"deep", WriteFlags::empty()).unwrap();
        grandchild.commit().unwrap();
        assert_eq!(db.get(&child, b"g").unwrap(), b"deep");
        child.commit().unwrap();
    }
    parent.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"a").unwrap(), b"parent");
    assert_eq!(db.get(&txn, b"b").unwrap(), b"child");
    assert_eq!(db.get(&txn, b"g").unwrap(), b"deep");
    assert!(matches!(db.get(&txn, b"c"), Err(Error::NotFound)));
    assert!(matches!(db.get(&txn, b"bulk0000"), Err(Error::NotFound)));
}

#[test]
fn test_nested_named_database_abort() {
    let (_dir, env) = setup_test_env();
    let mut parent = env.begin_rw_txn().unwrap();
    let child = parent.begin_nested().unwrap();
    let db = Database::open(&child, Some("inner"), DbFlags::CREATE).unwrap();
    child.abort();

    // The database the child created is gone with it
    assert!(matches!(db.get(&parent, b"k"), Err(Error::BadDbi)));
    parent.commit().unwrap();
}

#[test]
fn test_reset_and_renew() {
    let (_dir, env) = setup_test_env();
    put(&env, b"k", b"v1");

    let mut reader = env.begin_ro_txn().unwrap();
    assert_eq!(Database::MAIN.get(&reader, b"k").unwrap(), b"v1");
    reader.reset();
    assert!(matches!(Database::MAIN.get(&reader, b"k"), Err(Error::TxnFinished)));
    assert_eq!(env.info().unwrap().num_readers, 0);

    put(&env, b"k", b"v2");
    reader.renew().unwrap();
    assert_eq!(Database::MAIN.get(&reader, b"k").unwrap(), b"v2");
    assert!(matches!(reader.renew(), Err(Error::BadTxn)));

    // Only read-only transactions can be renewed
    let mut writer = env.begin_rw_txn().unwrap();
    assert!(matches!(writer.renew(), Err(Error::Incompatible)));
}

#[test]
fn test_readers_full() {
    let temp_dir = TempDir::new().unwrap();
    let mut env = Environment::new();
    env.set_max_readers(2).unwrap();
    env.open(temp_dir.path(), EnvFlags::empty(), 0o644).unwrap();
    assert_eq!(env.max_readers(), 2);

    let r1 = env.begin_ro_txn().unwrap();
    let r2 = env.begin_txn(TransactionFlags::RDONLY).unwrap();
    assert!(matches!(env.begin_ro_txn(), Err(Error::ReadersFull)));
    drop(r1);
    let r3 = env.begin_ro_txn().unwrap();
    assert_eq!(env.reader_list().unwrap().len(), 2);
    drop((r2, r3));
}

#[test]
fn test_single_writer() {
    let (_dir, env) = setup_test_env();
    let writer = env.begin_rw_txn().unwrap();
    assert!(matches!(env.try_begin_rw_txn(), Err(Error::WriterBusy)));
    // Readers are not blocked by the writer
    let reader = env.begin_ro_txn().unwrap();
    drop(reader);
    writer.abort();
    env.try_begin_rw_txn().unwrap().abort();
}

#[test]
fn test_second_writer_waits_for_commit() {
    let (_dir, env) = setup_test_env();
    let committed = AtomicBool::new(false);

    thread::scope(|s| {
        let mut first = env.begin_rw_txn().unwrap();
        Database::MAIN.put(&mut first, b"first", b"1", WriteFlags::empty()).unwrap();

        let second = s.spawn(|| {
            let mut txn = env.begin_rw_txn().unwrap();
            assert!(committed.load(Ordering::SeqCst));
            assert_eq!(Database::MAIN.get(&txn, b"first").unwrap(), b"1");
            Database::MAIN.put(&mut txn, b"second", b"2", WriteFlags::empty()).unwrap();
            txn.commit().unwrap();
        });

        thread::sleep(Duration::from_millis(100));
        committed.store(true, Ordering::SeqCst);
        first.commit().unwrap();
        second.join().unwrap();
    });

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(Database::MAIN.get(&txn, b"second").unwrap(), b"2");
    assert_eq!(txn.id(), 2);
}

#[test]
fn test_concurrent_writers_no_lost_updates() {
    let (_dir, env) = setup_test_env();
    const THREADS: u64 = 8;
    const ROUNDS: u64 = 100;

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    let mut txn = env.begin_rw_txn().unwrap();
                    let count = match Database::MAIN.get(&txn, b"counter") {
                        Ok(bytes) => u64::from_le_bytes(bytes.try_into().unwrap()),
                        Err(Error::NotFound) => 0,
                        Err(e) => panic!("unexpected error: {}", e),
                    };
                    Database::MAIN
                        .put(&mut txn, b"counter", &(count + 1).to_le_bytes(), WriteFlags::empty())
                        .unwrap();
                    txn.commit().unwrap();
                }
            });
        }
    });

    let txn = env.begin_ro_txn().unwrap();
    let bytes = Database::MAIN.get(&txn, b"counter").unwrap();
    assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), THREADS * ROUNDS);
    assert_eq!(txn.id(), THREADS * ROUNDS);
}

#[test]
fn test_begin_txn_flags() {
    let (_dir, env) = setup_test_env();
    // RDONLY is the only flag a caller can pass
    assert_eq!(TransactionFlags::all(), TransactionFlags::RDONLY);
    let txn = env.begin_txn(TransactionFlags::all()).unwrap();
    assert!(txn.is_readonly());
    drop(txn);
    let txn = env.begin_txn(TransactionFlags::empty()).unwrap();
    assert!(!txn.is_readonly());
    txn.commit().unwrap();
}

#[test]
fn test_concurrent_readers() {
    let (_dir, env) = setup_test_env();
    for i in 0..100u32 {
        put(&env, &i.to_be_bytes(), &i.to_le_bytes());
    }

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let txn = env.begin_ro_txn().unwrap();
                for i in 0..100u32 {
                    let value = Database::MAIN.get(&txn, &i.to_be_bytes()).unwrap();
                    assert_eq!(value, i.to_le_bytes());
                }
            });
        }
        s.spawn(|| {
            for i in 100..200u32 {
                put(&env, &i.to_be_bytes(), &i.to_le_bytes());
            }
        });
    });

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(Database::MAIN.stat(&txn).unwrap().entries, 200);
}

#[test]
fn test_finished_transaction() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    Database::MAIN.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
    let mut child = txn.begin_nested().unwrap();
    Database::MAIN.put(&mut child, b"c", b"v", WriteFlags::empty()).unwrap();
    child.commit().unwrap();
    txn.commit().unwrap();

    // Committing a read-only transaction just ends it
    let txn = env.begin_ro_txn().unwrap();
    txn.commit().unwrap();
    assert_eq!(env.info().unwrap().num_readers, 0);
}
