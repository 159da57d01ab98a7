#![allow(missing_docs)]

mod common;

use std::collections::BTreeMap;

use arbor::{ArborError, Database, KeyOrder, Result, TxnState, WriteMode};
use common::{collect, db_path, file_len, init_tracing, key, value};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

#[test]
fn put_commit_compact_keeps_value_and_never_grows() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = Database::open(&path)?;

    db.sync()?;
    let s0 = file_len(&path);

    let mut txn = db.begin(false)?;
    txn.put(b"Hi", b"Mike")?;
    txn.commit()?;
    let s1 = file_len(&path);
    assert!(s1 > s0, "commit should grow the file: {s0} -> {s1}");
    assert_eq!(db.get(b"Hi")?, b"Mike".to_vec());

    db.compact()?;
    let s2 = file_len(&path);
    assert!(s2 <= s1, "compaction must not grow the file: {s1} -> {s2}");
    assert_eq!(db.get(b"Hi")?, b"Mike".to_vec());
    drop(txn);
    db.close()
}

#[test]
fn cursor_yields_keys_in_order() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db = Database::open(db_path(&dir))?;
    let mut txn = db.begin_write()?;
    for k in [b"b", b"a", b"c"] {
        txn.put(k, k)?;
    }
    txn.commit()?;

    let txn = db.begin_read();
    let keys: Vec<Vec<u8>> = txn.iter()?.map(|e| e.map(|(k, _)| k)).collect::<Result<_>>()?;
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    let mut cursor = txn.cursor()?;
    assert_eq!(cursor.last()?.map(|(k, _)| k), Some(b"c".to_vec()));
    assert_eq!(cursor.prev()?.map(|(k, _)| k), Some(b"b".to_vec()));
    assert_eq!(cursor.prev()?.map(|(k, _)| k), Some(b"a".to_vec()));
    assert_eq!(cursor.prev()?, None);
    assert_eq!(cursor.next()?.map(|(k, _)| k), Some(b"a".to_vec()));
    assert_eq!(cursor.seek(b"bb")?.map(|(k, _)| k), Some(b"c".to_vec()));
    assert_eq!(cursor.seek_exact(b"bb")?, None);
    assert_eq!(cursor.seek_exact(b"b")?, Some(b"b".to_vec()));
    Ok(())
}

#[test]
fn committed_keys_are_seen_once_with_latest_value() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = Database::open(&path)?;
    let mut reference = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xA11CE);

    for round in 0..20u32 {
        let mut txn = db.begin_write()?;
        for _ in 0..100 {
            let i = rng.gen_range(0..500u32);
            txn.put(&key(i), &value(i, round))?;
            reference.insert(key(i), value(i, round));
        }
        txn.commit()?;

        let seen = collect(&db)?;
        let expected: Vec<_> = reference.clone().into_iter().collect();
        assert_eq!(seen, expected, "mismatch after round {round}");
    }
    assert_eq!(db.stat()?.entries, reference.len() as u64);
    drop(db);

    let db = Database::open(&path)?;
    let expected: Vec<_> = reference.into_iter().collect();
    assert_eq!(collect(&db)?, expected);
    Ok(())
}

#[test]
fn aborted_writes_leave_no_trace() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = Database::open(&path)?;
    db.put(b"kept", b"1")?;

    let mut txn = db.begin_write()?;
    txn.put(b"ghost", b"boo")?;
    txn.put(b"kept", b"overwritten")?;
    txn.abort()?;
    assert_eq!(txn.state(), TxnState::Aborted);
    drop(txn);

    {
        let mut dropped = db.begin_write()?;
        dropped.put(b"dropped", b"x")?;
    }

    assert!(matches!(db.get(b"ghost"), Err(ArborError::NotFound)));
    assert!(matches!(db.get(b"dropped"), Err(ArborError::NotFound)));
    assert_eq!(db.get(b"kept")?, b"1".to_vec());
    drop(db);

    let db = Database::open(&path)?;
    assert!(matches!(db.get(b"ghost"), Err(ArborError::NotFound)));
    assert_eq!(db.get(b"kept")?, b"1".to_vec());
    assert_eq!(db.stat()?.entries, 1);
    Ok(())
}

#[test]
fn delete_removes_keys_and_reports_missing_ones() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db = Database::builder().page_size(512).open(db_path(&dir))?;
    let mut txn = db.begin_write()?;
    for i in 0..300 {
        txn.put(&key(i), &value(i, 0))?;
    }
    txn.commit()?;

    let mut txn = db.begin_write()?;
    for i in (0..300).filter(|i| i % 3 != 0) {
        txn.delete(&key(i))?;
    }
    assert!(matches!(txn.delete(&key(1)), Err(ArborError::NotFound)));
    txn.commit()?;

    let keys: Vec<Vec<u8>> = collect(&db)?.into_iter().map(|(k, _)| k).collect();
    let expected: Vec<Vec<u8>> = (0..300).filter(|i| i % 3 == 0).map(key).collect();
    assert_eq!(keys, expected);
    assert!(matches!(db.delete(&key(1)), Err(ArborError::NotFound)));

    let mut txn = db.begin_write()?;
    for i in (0..300).filter(|i| i % 3 == 0) {
        txn.delete(&key(i))?;
    }
    txn.commit()?;
    let stat = db.stat()?;
    assert_eq!(stat.entries, 0);
    assert_eq!(stat.depth, 0);
    assert!(collect(&db)?.is_empty());
    Ok(())
}

#[test]
fn no_overwrite_keeps_the_first_value() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db = Database::open(db_path(&dir))?;
    let mut txn = db.begin_write()?;
    txn.put_with(b"k", b"first", WriteMode::NoOverwrite)?;
    assert!(matches!(
        txn.put_with(b"k", b"second", WriteMode::NoOverwrite),
        Err(ArborError::KeyExists)
    ));
    txn.commit()?;
    assert_eq!(db.get(b"k")?, b"first".to_vec());
    Ok(())
}

#[test]
fn large_values_survive_reopen() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let big: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    {
        let db = Database::open(&path)?;
        db.put(b"big", &big)?;
        db.put(b"small", b"s")?;
        assert!(db.stat()?.overflow_pages >= 12);
        db.put(b"big", b"now small")?;
        db.put(b"big2", &big)?;
    }
    let db = Database::open(&path)?;
    assert_eq!(db.get(b"big")?, b"now small".to_vec());
    assert_eq!(db.get(b"big2")?, big);
    assert_eq!(db.get(b"small")?, b"s".to_vec());
    Ok(())
}

#[test]
fn reverse_key_order_is_recorded_in_the_file() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    {
        let db = Database::builder().key_order(KeyOrder::Reverse).open(&path)?;
        let mut txn = db.begin_write()?;
        for k in [&b"ab"[..], b"ba", b"ca", b"b"] {
            txn.put(k, b"")?;
        }
        txn.commit()?;
    }
    // Reopened with default options: the order comes from the meta page.
    let db = Database::open(&path)?;
    assert_eq!(db.stat()?.key_order, KeyOrder::Reverse);
    let keys: Vec<Vec<u8>> = collect(&db)?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(
        keys,
        vec![b"ba".to_vec(), b"ca".to_vec(), b"b".to_vec(), b"ab".to_vec()]
    );
    Ok(())
}

#[test]
fn revert_discards_the_last_commit() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = Database::open(&path)?;
    db.put(b"a", b"1")?;
    db.put(b"b", b"2")?;
    let txn = db.revert()?;
    assert_eq!(txn.0, 1);
    assert_eq!(db.get(b"a")?, b"1".to_vec());
    assert!(matches!(db.get(b"b"), Err(ArborError::NotFound)));

    db.put(b"c", b"3")?;
    drop(db);
    let db = Database::open(&path)?;
    assert_eq!(
        collect(&db)?,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"c".to_vec(), b"3".to_vec())
        ]
    );
    Ok(())
}
