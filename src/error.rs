//! Error taxonomy shared by the storage layer, the sync engine and the API.
use thiserror::Error;

/// Result alias used by every [`DatabaseAdapter`](crate::store::DatabaseAdapter) method.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures surfaced by a storage backend.
///
/// A point lookup miss is always [`StorageError::NotFound`], never one of the
/// backend variants, so callers can tell "absent" apart from "broken".
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (`channel`, `block`, `transaction`).
        entity: &'static str,
        /// Key that was looked up.
        id: String,
    },

    /// Relational backend failure.
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Transport failure talking to the document store.
    #[cfg(feature = "store-couchdb")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The document store answered with an unexpected status.
    #[error("couchdb error ({status}): {reason}")]
    Couch {
        /// HTTP status code returned by the server.
        status: u16,
        /// Error body (`reason` field when present).
        reason: String,
    },

    /// A stored record could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A stored value violates the record schema.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StorageError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// `true` when this is a point lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Error reported by the network client on a block subscription.
///
/// Transient: the subscription stays open and reconnection is the client's job.
#[derive(Debug, Clone, Error)]
#[error("block delivery error: {message}")]
pub struct DeliveryError {
    /// Human readable cause reported by the client.
    pub message: String,
}

impl DeliveryError {
    /// Wrap a client-side message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Fatal startup failures. Any of these aborts [`ExplorerSync::start`](crate::sync::ExplorerSync::start).
#[derive(Debug, Error)]
pub enum SyncError {
    /// The ledger network client could not connect.
    #[error("unable to connect to network: {0:#}")]
    Connect(#[source] anyhow::Error),

    /// The storage backend could not be reached.
    #[error("database connection problem: {0}")]
    Database(#[source] StorageError),

    /// Schema provisioning or channel row creation failed.
    #[error("unable to run setup on database: {0}")]
    Setup(#[source] StorageError),

    /// A block listener could not be registered.
    #[error("unable to add block listener: channel={channel}, start_block={start}: {source:#}")]
    Subscribe {
        /// Channel the listener was for.
        channel: String,
        /// Resolved start height.
        start: u64,
        /// Client error.
        #[source]
        source: anyhow::Error,
    },

    /// Source configuration is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}
