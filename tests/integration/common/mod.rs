#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;

use arbor::{Database, Result};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("arbor=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.arbor")
}

pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

pub fn key(i: u32) -> Vec<u8> {
    format!("key-{i:06}").into_bytes()
}

pub fn value(i: u32, round: u32) -> Vec<u8> {
    format!("value-{i}-{round}").into_bytes()
}

pub fn collect(db: &Database) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let txn = db.begin_read();
    let entries = txn.iter()?.collect::<Result<Vec<_>>>()?;
    Ok(entries)
}
