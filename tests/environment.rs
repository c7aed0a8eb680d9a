//! End-to-end tests against the public `Environment`/`Database` surface.

use ferrokv::btree::cursor::CursorMove;
use ferrokv::config::DEFAULT_PAGE_SIZE;
use ferrokv::{Config, DbFlags, DbType, Environment, DEFAULT_DATABASE};

fn disk_config() -> Config {
    Config::new().page_size(512)
}

#[test]
fn open_close_empty_database_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.db");
    let env = Environment::create(Some(&path), disk_config()).unwrap();
    env.close().unwrap();

    let env = Environment::open(&path, disk_config()).unwrap();
    let db = env.database(DEFAULT_DATABASE).unwrap();
    assert_eq!(db.find(b"anything").unwrap(), None);
    env.close().unwrap();
}

#[test]
fn insert_find_erase_single_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("single.db");
    let env = Environment::create(Some(&path), disk_config()).unwrap();
    let db = env.database(DEFAULT_DATABASE).unwrap();

    assert_eq!(db.find(b"k").unwrap(), None);
    db.insert(b"k", b"v1").unwrap();
    assert_eq!(db.find(b"k").unwrap(), Some(b"v1".to_vec()));

    db.insert(b"k", b"v2").unwrap();
    assert_eq!(db.find(b"k").unwrap(), Some(b"v2".to_vec()));

    assert!(db.erase(b"k").unwrap());
    assert_eq!(db.find(b"k").unwrap(), None);
    assert!(!db.erase(b"k").unwrap());
    env.close().unwrap();
}

#[test]
fn explicit_transaction_commits_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("txn.db");
    let env = Environment::create(Some(&path), disk_config()).unwrap();
    let db = env.database(DEFAULT_DATABASE).unwrap();

    let mut txn = db.begin_txn().unwrap();
    db.insert_txn(&mut txn, b"a", b"1").unwrap();
    db.insert_txn(&mut txn, b"b", b"2").unwrap();
    assert_eq!(db.find_txn(&txn, b"a").unwrap(), Some(b"1".to_vec()));
    db.commit(txn).unwrap();

    assert_eq!(db.find(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.find(b"b").unwrap(), Some(b"2".to_vec()));
    env.close().unwrap();
}

#[test]
fn aborted_transaction_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abort.db");
    let env = Environment::create(Some(&path), disk_config()).unwrap();
    let db = env.database(DEFAULT_DATABASE).unwrap();

    let mut txn = db.begin_txn().unwrap();
    db.insert_txn(&mut txn, b"ghost", b"nope").unwrap();
    db.abort(txn).unwrap();

    assert_eq!(db.find(b"ghost").unwrap(), None);
    env.close().unwrap();
}

#[test]
fn read_only_environment_rejects_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.db");
    {
        let env = Environment::create(Some(&path), disk_config()).unwrap();
        let db = env.database(DEFAULT_DATABASE).unwrap();
        db.insert(b"k", b"v").unwrap();
        env.close().unwrap();
    }
    let ro_config = disk_config().flags(
        DbFlags::READ_ONLY | DbFlags::ENABLE_CRC32 | DbFlags::ENABLE_TRANSACTIONS | DbFlags::ENABLE_RECOVERY,
    );
    let env = Environment::open(&path, ro_config).unwrap();
    let db = env.database(DEFAULT_DATABASE).unwrap();
    assert_eq!(db.find(b"k").unwrap(), Some(b"v".to_vec()));
    assert!(db.insert(b"k2", b"v2").is_err());
}

#[test]
fn many_keys_force_splits_and_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("splits.db");
    let config = disk_config();
    {
        let env = Environment::create(Some(&path), config.clone()).unwrap();
        let db = env.database(DEFAULT_DATABASE).unwrap();
        for i in 0..2_000u32 {
            db.insert(format!("key-{i:06}").as_bytes(), format!("value-{i}").as_bytes())
                .unwrap();
        }
        env.close().unwrap();
    }
    {
        let env = Environment::open(&path, config).unwrap();
        let db = env.database(DEFAULT_DATABASE).unwrap();
        for i in 0..2_000u32 {
            assert_eq!(
                db.find(format!("key-{i:06}").as_bytes()).unwrap(),
                Some(format!("value-{i}").into_bytes()),
                "key-{i:06} missing after reopen"
            );
        }
        for i in (0..2_000u32).step_by(7) {
            assert!(db.erase(format!("key-{i:06}").as_bytes()).unwrap());
        }
        for i in (0..2_000u32).step_by(7) {
            assert_eq!(db.find(format!("key-{i:06}").as_bytes()).unwrap(), None);
        }
        env.close().unwrap();
    }
}

#[test]
fn cursor_iterates_in_ascending_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cursor.db");
    let env = Environment::create(Some(&path), disk_config()).unwrap();
    let db = env.database(DEFAULT_DATABASE).unwrap();

    let mut keys: Vec<u32> = (0..500).collect();
    for &i in &keys {
        db.insert(format!("{i:05}").as_bytes(), b"v").unwrap();
    }

    let mut cursor = db.cursor();
    let mut seen = Vec::new();
    let mut entry = cursor.mv(CursorMove::First).unwrap();
    while let Some((key, _)) = entry {
        seen.push(String::from_utf8(key).unwrap().parse::<u32>().unwrap());
        entry = cursor.mv(CursorMove::Next).unwrap();
    }
    keys.sort_unstable();
    assert_eq!(seen, keys);
    env.close().unwrap();
}

#[test]
fn cursor_can_walk_backward_from_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cursor_rev.db");
    let env = Environment::create(Some(&path), disk_config()).unwrap();
    let db = env.database(DEFAULT_DATABASE).unwrap();
    for i in 0..50u32 {
        db.insert(format!("{i:05}").as_bytes(), b"v").unwrap();
    }

    let mut cursor = db.cursor();
    let last = cursor.mv(CursorMove::Last).unwrap().unwrap();
    assert_eq!(last.0, b"00049");

    let prev = cursor.mv(CursorMove::Previous).unwrap().unwrap();
    assert_eq!(prev.0, b"00048");
    env.close().unwrap();
}

#[test]
fn multiple_databases_keep_independent_key_spaces() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("multi.db");
    let config = disk_config();
    {
        let env = Environment::create(Some(&path), config.clone()).unwrap();
        env.create_database(1, DbType::Lexicographic).unwrap();
        env.create_database(2, DbType::Lexicographic).unwrap();

        env.database(DEFAULT_DATABASE).unwrap().insert(b"k", b"default").unwrap();
        env.database(1).unwrap().insert(b"k", b"one").unwrap();
        env.database(2).unwrap().insert(b"k", b"two").unwrap();
        env.close().unwrap();
    }
    {
        let env = Environment::open(&path, config).unwrap();
        assert_eq!(
            env.database(DEFAULT_DATABASE).unwrap().find(b"k").unwrap(),
            Some(b"default".to_vec())
        );
        assert_eq!(env.database(1).unwrap().find(b"k").unwrap(), Some(b"one".to_vec()));
        assert_eq!(env.database(2).unwrap().find(b"k").unwrap(), Some(b"two".to_vec()));
    }
}

#[test]
fn oversized_key_and_value_spill_to_the_blob_manager_and_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob.db");
    let config = Config::new().page_size(DEFAULT_PAGE_SIZE);
    let big_key = vec![b'k'; 300];
    let big_value = vec![b'v'; DEFAULT_PAGE_SIZE * 3];
    {
        let env = Environment::create(Some(&path), config.clone()).unwrap();
        let db = env.database(DEFAULT_DATABASE).unwrap();
        db.insert(&big_key, &big_value).unwrap();
        assert_eq!(db.find(&big_key).unwrap(), Some(big_value.clone()));
        env.close().unwrap();
    }
    {
        let env = Environment::open(&path, config).unwrap();
        let db = env.database(DEFAULT_DATABASE).unwrap();
        assert_eq!(db.find(&big_key).unwrap(), Some(big_value));
    }
}

#[test]
fn overwriting_a_blob_value_with_a_smaller_one_is_visible_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob_overwrite.db");
    let env = Environment::create(Some(&path), Config::new().page_size(DEFAULT_PAGE_SIZE)).unwrap();
    let db = env.database(DEFAULT_DATABASE).unwrap();

    let big_value = vec![b'x'; DEFAULT_PAGE_SIZE * 2];
    db.insert(b"blob-key", &big_value).unwrap();
    db.insert(b"blob-key", b"small").unwrap();
    assert_eq!(db.find(b"blob-key").unwrap(), Some(b"small".to_vec()));
    env.close().unwrap();
}

#[test]
fn in_memory_environment_needs_no_path() {
    let env = Environment::create::<&str>(None, Config::new().flags(DbFlags::IN_MEMORY).page_size(512)).unwrap();
    let db = env.database(DEFAULT_DATABASE).unwrap();
    db.insert(b"a", b"b").unwrap();
    assert_eq!(db.find(b"a").unwrap(), Some(b"b".to_vec()));
}

#[test]
fn crash_after_commit_replays_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recover.db");
    let config = disk_config().commit_threshold(1_000_000);
    {
        let env = Environment::create(Some(&path), config.clone()).unwrap();
        let db = env.database(DEFAULT_DATABASE).unwrap();
        for i in 0..20u32 {
            db.insert(format!("r{i}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        // Intentionally no env.close(): the journal already has every commit
        // record even though flush_pending never ran (commit_threshold is
        // huge), simulating a crash before the batched tree flush.
    }
    {
        let env = Environment::open(&path, config).unwrap();
        let db = env.database(DEFAULT_DATABASE).unwrap();
        for i in 0..20u32 {
            assert_eq!(
                db.find(format!("r{i}").as_bytes()).unwrap(),
                Some(format!("v{i}").into_bytes())
            );
        }
    }
}
