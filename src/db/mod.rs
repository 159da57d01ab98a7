//! Database handles and transactions.

mod arena;
mod database;
mod options;
mod transaction;

pub use database::Database;
pub use options::{DatabaseBuilder, DatabaseOptions};
pub use transaction::{Transaction, TxnState};
