#![allow(missing_docs)]

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use arbor::{Database, Result};
use common::{db_path, init_tracing, key, value};
use tempfile::tempdir;

#[test]
fn reader_keeps_its_snapshot_across_commits() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db = Database::open(db_path(&dir))?;
    db.put(b"k", b"v1")?;

    let reader = db.begin_read();
    let mut writer = db.begin_write()?;
    writer.put(b"k", b"v2")?;
    writer.put(b"new", b"x")?;
    assert_eq!(reader.get(b"k")?, Some(b"v1".to_vec()));
    writer.commit()?;

    assert_eq!(reader.get(b"k")?, Some(b"v1".to_vec()));
    assert_eq!(reader.get(b"new")?, None);
    assert_eq!(reader.entries()?, 1);

    let later = db.begin_read();
    assert_eq!(later.get(b"k")?, Some(b"v2".to_vec()));
    assert_eq!(later.get(b"new")?, Some(b"x".to_vec()));
    Ok(())
}

#[test]
fn pages_seen_by_a_reader_are_not_reused() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db = Database::builder().page_size(512).open(db_path(&dir))?;
    let mut txn = db.begin_write()?;
    for i in 0..400 {
        txn.put(&key(i), &value(i, 0))?;
    }
    txn.commit()?;

    let reader = db.begin_read();
    for round in 1..=10 {
        let mut txn = db.begin_write()?;
        for i in 0..400 {
            txn.put(&key(i), &value(i, round))?;
        }
        txn.commit()?;
    }

    let seen: Vec<(Vec<u8>, Vec<u8>)> = reader.iter()?.collect::<Result<_>>()?;
    assert_eq!(seen.len(), 400);
    for (i, (k, v)) in seen.into_iter().enumerate() {
        assert_eq!(k, key(i as u32));
        assert_eq!(v, value(i as u32, 0));
    }
    drop(reader);

    // With the reader gone, the next writer recycles the parked pages.
    let before = db.stat()?;
    let mut txn = db.begin_write()?;
    txn.put(&key(0), b"recycled")?;
    txn.commit()?;
    let after = db.stat()?;
    assert!(after.next_page <= before.next_page);
    Ok(())
}

#[test]
fn reader_snapshot_survives_compaction() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db = Database::open(db_path(&dir))?;
    let mut txn = db.begin_write()?;
    for i in 0..200 {
        txn.put(&key(i), &value(i, 0))?;
    }
    txn.commit()?;

    let reader = db.begin_read();
    let mut txn = db.begin_write()?;
    for i in 0..200 {
        txn.delete(&key(i))?;
    }
    txn.put(b"after", b"compaction")?;
    txn.commit()?;
    db.compact()?;

    assert_eq!(reader.get(&key(7))?, Some(value(7, 0)));
    assert_eq!(reader.iter()?.count(), 200);
    assert_eq!(reader.get(b"after")?, None);

    let fresh = db.begin_read();
    assert_eq!(fresh.get(&key(7))?, None);
    assert_eq!(fresh.get(b"after")?, Some(b"compaction".to_vec()));
    Ok(())
}

#[test]
fn concurrent_readers_see_consistent_snapshots() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db = Database::open(db_path(&dir))?;
    // Every commit writes the same round number under all keys.
    let mut txn = db.begin_write()?;
    for i in 0..50 {
        txn.put(&key(i), &0u32.to_be_bytes())?;
    }
    txn.commit()?;

    let done = AtomicBool::new(false);
    let (done, db) = (&done, &db);
    thread::scope(|scope| -> Result<()> {
        let readers: Vec<_> = (0..4)
            .map(move |_| {
                scope.spawn(move || -> Result<u32> {
                    let mut checks = 0;
                    while !done.load(Ordering::Acquire) {
                        let txn = db.begin_read();
                        let rounds: Vec<Vec<u8>> = txn
                            .iter()?
                            .map(|entry| entry.map(|(_, v)| v))
                            .collect::<Result<_>>()?;
                        assert_eq!(rounds.len(), 50);
                        assert!(rounds.windows(2).all(|w| w[0] == w[1]));
                        checks += 1;
                    }
                    Ok(checks)
                })
            })
            .collect();

        for round in 1..=50u32 {
            let mut txn = db.begin_write()?;
            for i in 0..50 {
                txn.put(&key(i), &round.to_be_bytes())?;
            }
            txn.commit()?;
        }
        done.store(true, Ordering::Release);
        for reader in readers {
            reader.join().expect("reader thread panicked")?;
        }
        Ok(())
    })?;
    assert_eq!(db.get(&key(0))?, 50u32.to_be_bytes().to_vec());
    Ok(())
}
