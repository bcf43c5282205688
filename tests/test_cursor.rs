use lumodb::{CursorOp, Database, DbFlags, EnvFlags, Environment, Error, WriteFlags};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let mut env = Environment::new();
    env.open(temp_dir.path(), EnvFlags::NOSYNC, 0o644).unwrap();
    (temp_dir, env)
}

/// Fill the main database with `key{i}` -> `value{i}` for even `i` below `2 * n`.
fn fill(env: &Environment, n: usize) {
    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..n {
        let key = format!("key{:05}", i * 2);
        let value = format!("value{}", i * 2);
        Database::MAIN.put(&mut txn, key.as_bytes(), value.as_bytes(), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();
}

#[test]
fn test_cursor_scan() {
    let (_dir, env) = setup_test_env();
    fill(&env, 1000);

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = Database::MAIN.cursor(&txn).unwrap();
    let mut count = 0;
    let mut last: Option<Vec<u8>> = None;
    for item in cursor.iter() {
        let (key, value) = item.unwrap();
        if let Some(prev) = &last {
            assert!(prev.as_slice() < key);
        }
        assert_eq!(&value[..5], b"value");
        last = Some(key.to_vec());
        count += 1;
    }
    assert_eq!(count, 1000);
}

#[test]
fn test_cursor_positioning() {
    let (_dir, env) = setup_test_env();
    fill(&env, 100);

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.open_cursor(Database::MAIN).unwrap();

    let (key, value) = cursor.first().unwrap();
    assert_eq!(key, b"key00000");
    assert_eq!(value, b"value0");
    let (key, _) = cursor.next().unwrap();
    assert_eq!(key, b"key00002");
    let (key, _) = cursor.prev().unwrap();
    assert_eq!(key, b"key00000");
    assert!(matches!(cursor.prev(), Err(Error::NotFound)));
    assert_eq!(cursor.get_current().unwrap().0, b"key00000");

    let (key, _) = cursor.last().unwrap();
    assert_eq!(key, b"key00198");
    assert!(matches!(cursor.next(), Err(Error::NotFound)));
    assert_eq!(cursor.prev().unwrap().0, b"key00198");

    assert_eq!(cursor.set(b"key00050").unwrap().1, b"value50");
    assert!(matches!(cursor.set(b"key00051"), Err(Error::NotFound)));
    assert_eq!(cursor.set_range(b"key00051").unwrap().0, b"key00052");
    assert!(matches!(cursor.set_range(b"zzz"), Err(Error::NotFound)));

    // The generic entry point
    let (key, value) = cursor.get(Some(&b"key00010"[..]), CursorOp::SetKey).unwrap();
    assert_eq!(key, b"key00010".to_vec());
    assert_eq!(value, b"value10".to_vec());
    assert!(matches!(cursor.get(None, CursorOp::Set), Err(Error::BadValSize)));
}

#[test]
fn test_cursor_slices_outlive_moves() {
    let (_dir, env) = setup_test_env();
    fill(&env, 10);

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = Database::MAIN.cursor(&txn).unwrap();
    let (first, _) = cursor.first().unwrap();
    let (second, _) = cursor.next().unwrap();
    cursor.close();
    assert_eq!(first, b"key00000");
    assert_eq!(second, b"key00002");
}

#[test]
fn test_iter_from() {
    let (_dir, env) = setup_test_env();
    fill(&env, 50);

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = Database::MAIN.cursor(&txn).unwrap();
    let keys: Vec<Vec<u8>> = cursor
        .iter_from(b"key00091")
        .map(|r| r.unwrap().0.to_vec())
        .collect();
    assert_eq!(keys, vec![b"key00092".to_vec(), b"key00094".to_vec(), b"key00096".to_vec(), b"key00098".to_vec()]);
    assert_eq!(cursor.iter_from(b"zzz").count(), 0);
}

#[test]
fn test_empty_database_cursor() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = Database::MAIN.cursor(&txn).unwrap();
    assert!(matches!(cursor.first(), Err(Error::NotFound)));
    assert!(matches!(cursor.last(), Err(Error::NotFound)));
    assert!(matches!(cursor.get_current(), Err(Error::NotFound)));
    assert_eq!(cursor.iter().count(), 0);
}

#[test]
fn test_cursor_sees_uncommitted_writes() {
    let (_dir, env) = setup_test_env();
    fill(&env, 10);

    let mut txn = env.begin_rw_txn().unwrap();
    Database::MAIN.put(&mut txn, b"key00001", b"odd", WriteFlags::empty()).unwrap();
    Database::MAIN.del(&mut txn, b"key00004").unwrap();
    let mut cursor = Database::MAIN.cursor(&txn).unwrap();
    let keys: Vec<Vec<u8>> = cursor.iter().map(|r| r.unwrap().0.to_vec()).collect();
    assert_eq!(keys.len(), 10);
    assert_eq!(keys[1], b"key00001");
    assert!(!keys.contains(&b"key00004".to_vec()));
}

#[test]
fn test_rw_cursor_put() {
    let (_dir, env) = setup_test_env();
    fill(&env, 10);

    let mut txn = env.begin_rw_txn().unwrap();
    {
        let mut cursor = Database::MAIN.rw_cursor(&mut txn).unwrap();
        cursor.put(b"key00003", b"three", WriteFlags::empty()).unwrap();
        assert_eq!(cursor.get_current().unwrap().0, b"key00003");
        assert_eq!(cursor.next().unwrap().0, b"key00004");

        // Replace the value under the cursor
        cursor.set(b"key00006").unwrap();
        cursor.put(b"key00006", b"six", WriteFlags::CURRENT).unwrap();
        assert_eq!(cursor.get_current().unwrap().1, b"six");
        assert!(matches!(
            cursor.put(b"key00008", b"eight", WriteFlags::CURRENT),
            Err(Error::Incompatible)
        ));
        assert!(matches!(
            cursor.put(b"key00006", b"x", WriteFlags::NOOVERWRITE),
            Err(Error::KeyExist)
        ));
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(Database::MAIN.get(&txn, b"key00006").unwrap(), b"six");
    assert_eq!(Database::MAIN.get(&txn, b"key00003").unwrap(), b"three");
    assert_eq!(Database::MAIN.stat(&txn).unwrap().entries, 11);
}

#[test]
fn test_rw_cursor_delete() {
    let (_dir, env) = setup_test_env();
    fill(&env, 500);

    let mut txn = env.begin_rw_txn().unwrap();
    {
        let mut cursor = txn.open_rw_cursor(Database::MAIN).unwrap();
        cursor.set(b"key00010").unwrap();
        cursor.del().unwrap();
        assert!(matches!(cursor.get_current(), Err(Error::NotFound)));
        assert_eq!(cursor.next().unwrap().0, b"key00012");

        cursor.set(b"key00020").unwrap();
        cursor.del().unwrap();
        assert_eq!(cursor.prev().unwrap().0, b"key00018");

        // Delete every other remaining key in one pass
        cursor.first().unwrap();
        let mut deleted = 0;
        loop {
            cursor.del().unwrap();
            deleted += 1;
            if cursor.next().is_err() || cursor.next().is_err() {
                break;
            }
        }
        assert_eq!(deleted, 249);
    }
    assert_eq!(Database::MAIN.stat(&txn).unwrap().entries, 249);

    // Then everything
    {
        let mut cursor = txn.open_rw_cursor(Database::MAIN).unwrap();
        cursor.first().unwrap();
        loop {
            cursor.del().unwrap();
            if cursor.next().is_err() {
                break;
            }
        }
        assert!(matches!(cursor.first(), Err(Error::NotFound)));
    }
    let stat = Database::MAIN.stat(&txn).unwrap();
    assert_eq!(stat.entries, 0);
    assert_eq!(stat.depth, 0);
    txn.commit().unwrap();
}

#[test]
fn test_cursor_on_named_database() {
    let temp_dir = TempDir::new().unwrap();
    let mut env = Environment::new();
    env.set_max_dbs(1).unwrap();
    env.open(temp_dir.path(), EnvFlags::empty(), 0o644).unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, Some("items"), DbFlags::CREATE).unwrap();
    db.put(&mut txn, b"x", b"1", WriteFlags::empty()).unwrap();
    db.put(&mut txn, b"y", b"2", WriteFlags::empty()).unwrap();
    Database::MAIN.put(&mut txn, b"other", b"3", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    assert_eq!(cursor.db(), db);
    let keys: Vec<Vec<u8>> = cursor.iter().map(|r| r.unwrap().0.to_vec()).collect();
    assert_eq!(keys, vec![b"x".to_vec(), b"y".to_vec()]);
}
