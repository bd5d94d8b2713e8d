//! Storage contract shared by the sync engine and the query API, plus its
//! relational (SQLite) and document-store (CouchDB) implementations.
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::error::StorageResult;
use crate::types::{
    Block, BlockQuery, Channel, Page, Transaction, TransactionQuery, TransactionSort,
};

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was written.
    Inserted,
    /// A record with the same id already existed; nothing was written.
    AlreadyExists,
}

/// Uniform contract over every storage backend.
///
/// Writes are keyed on the entity's natural id and are idempotent: a duplicate
/// key is reported as [`InsertOutcome::AlreadyExists`], never as an error.
/// Point reads report a miss as [`StorageError::NotFound`](crate::error::StorageError::NotFound).
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Check that the backend is reachable.
    async fn connect(&self) -> StorageResult<()>;

    /// Provision schema and indexes, then insert a zero-height row for every
    /// channel not yet present. Safe to repeat.
    async fn setup(&self, channels: &[String]) -> StorageResult<()>;

    async fn get_channel(&self, name: &str) -> StorageResult<Channel>;

    /// Persist `channel` only if its height is strictly greater than the stored
    /// one; the stored row is re-read first. Returns whether a write happened.
    async fn update_channel(&self, channel: &Channel) -> StorageResult<bool>;

    async fn add_block(&self, block: &Block) -> StorageResult<InsertOutcome>;

    async fn add_transaction(&self, transaction: &Transaction) -> StorageResult<InsertOutcome>;

    async fn get_channels(&self) -> StorageResult<Vec<Channel>>;

    async fn get_block_by_id(&self, id: &str) -> StorageResult<Block>;

    async fn get_transaction_by_id(&self, id: &str) -> StorageResult<Transaction>;

    /// Ordered by the sort field, then by id; `skip = size * (page - 1)`.
    async fn get_blocks(&self, query: &BlockQuery) -> StorageResult<Vec<Block>>;

    /// Ordered by the sort field, then by id; `skip = size * (page - 1)`.
    async fn get_transactions(&self, query: &TransactionQuery) -> StorageResult<Vec<Transaction>>;

    /// Transactions of one block, paged like [`get_transactions`](Self::get_transactions).
    async fn get_block_transactions(
        &self,
        block_id: &str,
        page: &Page<TransactionSort>,
    ) -> StorageResult<Vec<Transaction>>;

    /// Release backend resources.
    async fn disconnect(&self) {}
}

impl DatabaseConfig {
    /// Build the adapter selected by configuration.
    pub fn open(&self) -> anyhow::Result<Arc<dyn DatabaseAdapter>> {
        match self {
            #[cfg(feature = "store-sqlite")]
            DatabaseConfig::Sqlite { path } => Ok(Arc::new(SqliteDatabase::new(path.clone()))),
            #[cfg(feature = "store-couchdb")]
            DatabaseConfig::CouchDb { url } => Ok(Arc::new(CouchDatabase::new(url)?)),
            #[allow(unreachable_patterns)]
            other => anyhow::bail!("storage backend {other:?} is not compiled in"),
        }
    }
}

#[cfg(feature = "store-couchdb")]
pub mod couch_store;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;

#[cfg(feature = "store-couchdb")]
pub use couch_store::CouchDatabase;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteDatabase;
