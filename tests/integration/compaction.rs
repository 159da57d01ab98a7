#![allow(missing_docs)]

mod common;

use std::collections::BTreeMap;

use arbor::{admin, ArborError, Database, Result};
use common::{collect, db_path, file_len, init_tracing, key, value};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

#[test]
fn compaction_preserves_content_and_shrinks_the_file() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = Database::open(&path)?;
    let mut reference = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(7);

    for round in 0..10u32 {
        let mut txn = db.begin_write()?;
        for _ in 0..300 {
            let i = rng.gen_range(0..2_000u32);
            if rng.gen_bool(0.3) && reference.contains_key(&key(i)) {
                txn.delete(&key(i))?;
                reference.remove(&key(i));
            } else {
                let v = if rng.gen_bool(0.05) {
                    vec![round as u8; 6_000]
                } else {
                    value(i, round)
                };
                txn.put(&key(i), &v)?;
                reference.insert(key(i), v);
            }
        }
        txn.commit()?;
    }

    let before = file_len(&path);
    let report = db.compact()?;
    let after = file_len(&path);
    assert_eq!(report.bytes_before, before);
    assert_eq!(report.bytes_after, after);
    assert!(after <= before, "{before} -> {after}");

    let expected: Vec<_> = reference.into_iter().collect();
    assert_eq!(collect(&db)?, expected);
    drop(db);

    let db = Database::open(&path)?;
    assert_eq!(collect(&db)?, expected);
    assert_eq!(db.stat()?.free_pages, 0);
    Ok(())
}

#[test]
fn deleting_most_keys_then_compacting_reclaims_space() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = Database::open(&path)?;
    let mut txn = db.begin_write()?;
    for i in 0..5_000 {
        txn.put(&key(i), &value(i, 0))?;
    }
    txn.commit()?;
    let mut txn = db.begin_write()?;
    for i in 10..5_000 {
        txn.delete(&key(i))?;
    }
    txn.commit()?;

    let before = file_len(&path);
    let report = db.compact()?;
    assert!(report.bytes_after < before);
    assert_eq!(report.pages_copied, 1);
    assert_eq!(file_len(&path), 3 * 4096);
    assert_eq!(collect(&db)?.len(), 10);
    Ok(())
}

#[test]
fn writes_continue_after_compaction() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = Database::open(&path)?;
    db.put(b"a", b"1")?;
    let txn_before = db.stat()?.txn;
    db.compact()?;
    assert_eq!(db.stat()?.txn, txn_before);

    db.put(b"b", b"2")?;
    db.delete(b"a")?;
    assert_eq!(collect(&db)?, vec![(b"b".to_vec(), b"2".to_vec())]);
    drop(db);
    let db = Database::open(&path)?;
    assert_eq!(collect(&db)?, vec![(b"b".to_vec(), b"2".to_vec())]);
    Ok(())
}

#[test]
fn compacted_file_has_no_earlier_commit_to_revert_to() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db = Database::open(db_path(&dir))?;
    db.put(b"a", b"1")?;
    db.put(b"a", b"2")?;
    db.compact()?;
    assert!(matches!(db.revert(), Err(ArborError::Invalid(_))));
    assert_eq!(db.get(b"a")?, b"2".to_vec());
    Ok(())
}

#[test]
fn other_handles_must_reopen_after_compaction() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let a = Database::open(&path)?;
    let mut b = Database::open(&path)?;
    a.put(b"k1", b"1")?;
    a.compact()?;

    assert!(matches!(b.put(b"k2", b"2"), Err(ArborError::StaleHandle)));
    assert!(matches!(b.revert(), Err(ArborError::StaleHandle)));
    b.reopen()?;
    b.put(b"k2", b"2")?;
    assert_eq!(b.get(b"k1")?, b"1".to_vec());

    // The compacting handle picks up the commit made through the reopened one.
    a.put(b"k3", b"3")?;
    drop((a, b));
    let db = Database::open(&path)?;
    assert_eq!(
        collect(&db)?,
        vec![
            (b"k1".to_vec(), b"1".to_vec()),
            (b"k2".to_vec(), b"2".to_vec()),
            (b"k3".to_vec(), b"3".to_vec()),
        ]
    );
    Ok(())
}

#[test]
fn compacting_an_empty_database() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = Database::open(&path)?;
    let report = db.compact()?;
    assert_eq!(report.pages_copied, 0);
    assert_eq!(file_len(&path), 2 * 4096);
    assert!(collect(&db)?.is_empty());
    Ok(())
}

#[test]
fn stale_staging_file_is_replaced() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    std::fs::write(admin::staging_path(&path), b"left over from a crash")?;
    let db = Database::open(&path)?;
    db.put(b"k", b"v")?;
    db.compact()?;
    assert!(!admin::staging_path(&path).exists());
    assert_eq!(db.get(b"k")?, b"v".to_vec());
    Ok(())
}

#[test]
fn compaction_waits_for_the_writer() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db = Database::open(db_path(&dir))?;
    let mut txn = db.begin_write()?;
    txn.put(b"k", b"v")?;
    assert!(matches!(db.compact(), Err(ArborError::LockBusy)));
    txn.commit()?;
    db.compact()?;
    Ok(())
}
