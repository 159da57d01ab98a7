#![allow(missing_docs)]

mod common;

use std::str::FromStr;

use arbor::primitives::concurrency::lock_path;
use arbor::{ArborError, Database, DatabaseOptions, LockMode, Result, Synchronous, TxnState};
use common::{db_path, file_len, init_tracing, key, value};
use tempfile::tempdir;

#[test]
fn page_size_is_fixed_at_creation() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    {
        let db = Database::builder().page_size(1024).open(&path)?;
        db.put(b"k", b"v")?;
        assert_eq!(file_len(&path), 3 * 1024);
    }
    let db = Database::builder().page_size(8192).open(&path)?;
    assert_eq!(db.stat()?.page_size, 1024);
    assert_eq!(db.get(b"k")?, b"v".to_vec());
    Ok(())
}

#[test]
fn unsupported_page_size_is_rejected() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    for size in [100, 3000, 65536] {
        let result = Database::builder()
            .page_size(size)
            .open(dir.path().join(format!("bad-{size}.arbor")));
        assert!(matches!(result, Err(ArborError::Invalid(_))), "size {size}");
    }
    Ok(())
}

#[test]
fn read_only_open_requires_an_existing_file() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let result = Database::open_with_options(&path, DatabaseOptions::read_only());
    assert!(result.is_err());
    assert!(!path.exists());
    Ok(())
}

#[test]
fn read_only_handle_reads_but_never_writes() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    Database::open(&path)?.put(b"k", b"v")?;
    let before = file_len(&path);

    let db = Database::builder().read_only(true).open(&path)?;
    assert_eq!(db.get(b"k")?, b"v".to_vec());
    assert!(matches!(db.begin(false), Err(ArborError::ReadOnly)));
    assert!(matches!(db.put(b"x", b"y"), Err(ArborError::ReadOnly)));
    assert!(matches!(db.revert(), Err(ArborError::ReadOnly)));
    db.sync()?;
    assert_eq!(file_len(&path), before);
    Ok(())
}

#[cfg(unix)]
#[test]
fn permissions_apply_when_creating() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = Database::open_with_permissions(&path, 0o600)?;
    let mode = std::fs::metadata(&path)?.permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    db.close()
}

#[test]
fn writer_lock_lives_in_a_side_file() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    let _db = Database::open(&path)?;
    assert!(lock_path(&path).exists());
    Ok(())
}

#[test]
fn max_pages_turns_growth_into_out_of_space() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db = Database::builder()
        .page_size(512)
        .max_pages(8)
        .open(db_path(&dir))?;
    let mut txn = db.begin_write()?;
    let mut failure = None;
    for i in 0..1_000 {
        if let Err(err) = txn.put(&key(i), &value(i, 0)) {
            failure = Some(err);
            break;
        }
    }
    assert!(matches!(failure, Some(ArborError::OutOfSpace)));
    assert_eq!(txn.state(), TxnState::Aborted);
    drop(txn);

    // Nothing from the failed transaction is visible and small writes still fit.
    assert_eq!(db.stat()?.entries, 0);
    db.put(b"small", b"ok")?;
    assert_eq!(db.get(b"small")?, b"ok".to_vec());
    Ok(())
}

#[test]
fn no_sync_mode_still_persists_on_clean_close() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = db_path(&dir);
    {
        let db = Database::builder()
            .synchronous(Synchronous::Off)
            .open(&path)?;
        db.put(b"k", b"v")?;
        db.close()?;
    }
    let db = Database::open(&path)?;
    assert_eq!(db.get(b"k")?, b"v".to_vec());
    Ok(())
}

#[test]
fn synchronous_parses_from_text() {
    assert_eq!(Synchronous::from_str("full").ok(), Some(Synchronous::Full));
    assert_eq!(Synchronous::from_str("nosync").ok(), Some(Synchronous::Off));
    assert!(Synchronous::from_str("sometimes").is_err());
    assert_eq!(Synchronous::Off.to_string(), "off");
}

#[test]
fn blocking_lock_mode_is_configurable() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db = Database::builder()
        .lock_mode(LockMode::Block)
        .open(db_path(&dir))?;
    assert_eq!(db.options().lock_mode, LockMode::Block);
    let txn = db.begin_write()?;
    drop(txn);
    let _again = db.begin_write()?;
    Ok(())
}
