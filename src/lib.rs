#![forbid(unsafe_code)]
//! ledger-explorer: block/transaction synchronization and query API for
//! permissioned-ledger explorers.
//!
//! ## What you implement
//! - [`LedgerNetwork`]: connect to the ledger and open one block subscription
//!   per channel, yielding decoded [`BlockEvent`](event::BlockEvent)s.
//!
//! ## What the crate does
//! - [`ExplorerSync`] subscribes to every configured channel, normalizes each
//!   delivered block into [`Block`]/[`Transaction`] records and stores them
//!   through a [`DatabaseAdapter`] (SQLite or CouchDB).
//! - Progress is tracked per channel by a write-behind [`WatermarkCache`];
//!   blocks at or below the watermark are skipped.
//! - [`ExplorerApi`] answers paged, filtered queries and a cross-entity search.
//!
//! ## Minimal usage
//! ```rust,ignore
//! use ledger_explorer::prelude::*;
//! use std::sync::Arc;
//!
//! async fn run(network: Arc<impl LedgerNetwork + 'static>) -> anyhow::Result<()> {
//!     let config = ExplorerConfig::from_env()?;
//!     let database = config.database.open()?;
//!     let mut sync = ExplorerSync::new(
//!         network,
//!         Arc::clone(&database),
//!         config.require_channels()?.to_vec(),
//!         config.write_interval,
//!     );
//!     sync.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     sync.stop().await;
//!     Ok(())
//! }
//! ```

/// Query facade and its HTTP routes.
pub mod api;

/// Environment-driven configuration.
pub mod config;

/// Storage, delivery and startup error types.
pub mod error;

/// Block event model as delivered by the network client.
pub mod event;

/// Subscriber setup for binaries.
pub mod logging;

/// Network client abstraction (block subscriptions).
pub mod network;

/// Storage contract and backends.
pub mod store;

/// Block listeners and per-block ingestion.
pub mod sync;

/// Pure block/transaction normalization.
pub mod transform;

/// Persisted records and query types.
pub mod types;

/// Per-channel write-behind watermark cache.
pub mod watermark;

// Public re-exports
pub use api::{ApiError, ExplorerApi};
pub use config::{ChannelOption, DatabaseConfig, ExplorerConfig, StartBlock};
pub use error::{DeliveryError, StorageError, StorageResult, SyncError};
pub use network::{LedgerNetwork, ListenerHandle, Subscription};
pub use store::{DatabaseAdapter, InsertOutcome};
pub use sync::{BlockIngestor, ExplorerSync, ListenerState};
pub use types::{Block, Channel, Decoded, Transaction};
pub use watermark::WatermarkCache;

/// Convenience prelude for end users.
pub mod prelude {
    pub use crate::{
        ChannelOption, DatabaseAdapter, ExplorerApi, ExplorerConfig, ExplorerSync, LedgerNetwork,
        Subscription, WatermarkCache,
    };
}
