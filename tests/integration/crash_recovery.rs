#![allow(missing_docs)]

mod common;

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use arbor::primitives::io::{FileIo, OpenMode, StdFileIo};
use arbor::{ArborError, Database, DatabaseOptions, Result, TxnState};
use common::{collect, db_path, init_tracing, key, value};
use tempfile::tempdir;

const PAGE_SIZE: u64 = 4096;
const TORN_PREFIX: usize = 48;

/// Failure to inject into the next commit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Fault {
    None = 0,
    /// The fsync after the data pages fails; the meta page is never written.
    DataSync = 1,
    /// The meta page write is lost entirely.
    MetaWrite = 2,
    /// Only the header and salt of the meta page reach the file.
    TornMeta = 3,
}

struct FaultyIo {
    inner: StdFileIo,
    fault: AtomicU8,
}

impl FaultyIo {
    fn open(path: &Path) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            inner: StdFileIo::open(path, OpenMode::default())?,
            fault: AtomicU8::new(Fault::None as u8),
        }))
    }

    fn arm(&self, fault: Fault) {
        self.fault.store(fault as u8, Ordering::SeqCst);
    }

    fn armed(&self, fault: Fault) -> bool {
        self.fault.load(Ordering::SeqCst) == fault as u8
    }

    fn injected() -> ArborError {
        ArborError::Io(io::Error::new(io::ErrorKind::Other, "injected fault"))
    }
}

impl FileIo for FaultyIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let is_meta = off < 2 * PAGE_SIZE;
        if is_meta && self.armed(Fault::MetaWrite) {
            return Err(Self::injected());
        }
        if is_meta && self.armed(Fault::TornMeta) {
            self.inner.write_at(off, &src[..TORN_PREFIX])?;
            return Err(Self::injected());
        }
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        if self.armed(Fault::DataSync) {
            return Err(Self::injected());
        }
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }
}

fn seed(db: &Database, round: u32) -> Result<()> {
    let mut txn = db.begin_write()?;
    for i in 0..200 {
        txn.put(&key(i), &value(i, round))?;
    }
    txn.commit()
}

fn expected(round: u32) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..200).map(|i| (key(i), value(i, round))).collect()
}

fn failed_commit_keeps_previous_state(fault: Fault) -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    seed(&Database::open(&path)?, 0)?;

    let io = FaultyIo::open(&path)?;
    let db = Database::open_with_io(&path, io.clone(), DatabaseOptions::default())?;
    let mut txn = db.begin_write()?;
    for i in 0..200 {
        txn.put(&key(i), &value(i, 1))?;
    }
    txn.put(b"only-in-failed-commit", b"x")?;
    io.arm(fault);
    let err = txn.commit().expect_err("injected fault must surface");
    assert!(matches!(err, ArborError::Io(_)), "unexpected error {err:?}");
    assert_eq!(txn.state(), TxnState::Aborted);
    io.arm(Fault::None);
    drop(txn);

    // The handle keeps serving the previous commit.
    assert_eq!(collect(&db)?, expected(0));
    drop(db);

    let db = Database::open(&path)?;
    assert_eq!(collect(&db)?, expected(0));
    assert!(matches!(db.get(b"only-in-failed-commit"), Err(ArborError::NotFound)));
    assert_eq!(db.stat()?.txn.0, 1);
    Ok(())
}

#[test]
fn failed_data_sync_keeps_previous_state() -> Result<()> {
    failed_commit_keeps_previous_state(Fault::DataSync)
}

#[test]
fn lost_meta_write_keeps_previous_state() -> Result<()> {
    failed_commit_keeps_previous_state(Fault::MetaWrite)
}

#[test]
fn torn_meta_write_keeps_previous_state() -> Result<()> {
    failed_commit_keeps_previous_state(Fault::TornMeta)
}

#[test]
fn handle_recovers_after_a_failed_commit() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let io = FaultyIo::open(&path)?;
    let db = Database::open_with_io(&path, io.clone(), DatabaseOptions::default())?;
    seed(&db, 0)?;

    io.arm(Fault::TornMeta);
    assert!(seed(&db, 1).is_err());
    io.arm(Fault::None);
    seed(&db, 2)?;
    assert_eq!(collect(&db)?, expected(2));
    drop(db);

    let db = Database::open(&path)?;
    assert_eq!(collect(&db)?, expected(2));
    assert_eq!(db.stat()?.txn.0, 2);
    Ok(())
}

/// Runs a full rewrite of every key whose commit dies on the data fsync,
/// leaving its pages written but unpublished.
fn fail_rewrite(db: &Database, io: &FaultyIo, round: u32) -> Result<()> {
    let mut txn = db.begin_write()?;
    for i in 0..200 {
        txn.put(&key(i), &value(i, round))?;
    }
    io.arm(Fault::DataSync);
    let result = txn.commit();
    io.arm(Fault::None);
    assert!(result.is_err());
    Ok(())
}

#[test]
fn revert_after_a_failed_commit_restores_the_earlier_commit() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let io = FaultyIo::open(&path)?;
    let db = Database::open_with_io(&path, io.clone(), DatabaseOptions::default())?;
    seed(&db, 0)?;
    seed(&db, 1)?;
    fail_rewrite(&db, &io, 2)?;

    assert_eq!(db.revert()?.0, 1);
    assert_eq!(collect(&db)?, expected(0));
    drop(db);

    let db = Database::open(&path)?;
    assert_eq!(db.stat()?.txn.0, 1);
    assert_eq!(collect(&db)?, expected(0));
    Ok(())
}

#[test]
fn revert_after_a_crash_restores_the_earlier_commit() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    {
        let db = Database::open(&path)?;
        seed(&db, 0)?;
        seed(&db, 1)?;
    }
    {
        // The handle goes away right after the failed commit, as in a crash.
        let io = FaultyIo::open(&path)?;
        let db = Database::open_with_io(&path, io.clone(), DatabaseOptions::default())?;
        fail_rewrite(&db, &io, 2)?;
    }

    let db = Database::open(&path)?;
    assert_eq!(collect(&db)?, expected(1));
    assert_eq!(db.revert()?.0, 1);
    assert_eq!(collect(&db)?, expected(0));
    Ok(())
}

#[test]
fn corrupt_current_meta_falls_back_to_previous_commit() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    {
        let db = Database::open(&path)?;
        seed(&db, 0)?;
        seed(&db, 1)?;
    }
    // Commit 2 lives in slot 0; scribble over its payload.
    let mut file = OpenOptions::new().write(true).open(&path)?;
    file.seek(SeekFrom::Start(100))?;
    file.write_all(&[0xAB; 64])?;
    file.sync_all()?;
    drop(file);

    let db = Database::open(&path)?;
    assert_eq!(db.stat()?.txn.0, 1);
    assert_eq!(collect(&db)?, expected(0));
    Ok(())
}

#[test]
fn both_meta_pages_corrupt_is_reported() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    seed(&Database::open(&path)?, 0)?;
    let mut file = OpenOptions::new().write(true).open(&path)?;
    file.write_all(&vec![0u8; 2 * PAGE_SIZE as usize])?;
    file.sync_all()?;
    drop(file);

    assert!(matches!(
        Database::open(&path),
        Err(ArborError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn corrupt_tree_page_is_detected_on_read() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    seed(&Database::open(&path)?, 0)?;
    // Page 2 holds tree data; flip a byte in its payload.
    let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
    let target = SeekFrom::Start(2 * PAGE_SIZE + 200);
    let mut byte = [0u8; 1];
    file.seek(target)?;
    file.read_exact(&mut byte)?;
    file.seek(target)?;
    file.write_all(&[!byte[0]])?;
    file.sync_all()?;
    drop(file);

    let db = Database::open(&path)?;
    let txn = db.begin_read();
    let result: Result<Vec<_>> = txn.iter()?.collect();
    assert!(matches!(result, Err(ArborError::Corruption(_))));
    Ok(())
}
