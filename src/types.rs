//! Normalized records persisted by the storage layer and the query types used to read them.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-channel ingestion progress ("watermark").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// Unique channel name.
    pub name: String,
    /// Height of the last block durably known to be ingested.
    pub height: u64,
    /// Hash of that block (empty for a fresh channel).
    #[serde(default)]
    pub last_hash: String,
}

impl Channel {
    /// Zero-height channel row, as created by `setup`.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            height: 0,
            last_hash: String::new(),
        }
    }
}

/// A normalized block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Block data hash (primary key).
    pub id: String,
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub transaction_count: u64,
    pub channel_name: String,
}

/// Result of best-effort JSON decoding of ledger bytes.
///
/// Serialized as the bare value: the decoded JSON, or the hex string. A stored
/// value always reads back as `Decoded`, since any JSON is a valid decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Decoded {
    /// Bytes were valid JSON.
    Decoded(serde_json::Value),
    /// Bytes were not JSON; lowercase hex of the raw bytes.
    Raw(String),
}

/// Committed version observed by a chaincode read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadVersion {
    pub block: u64,
    pub transaction: u64,
}

/// Written keys: `None` marks a delete.
pub type ChaincodeWrites = BTreeMap<String, Option<Decoded>>;

/// Read keys: `None` means the key had no prior version.
pub type ChaincodeReads = BTreeMap<String, Option<ReadVersion>>;

/// A normalized transaction.
///
/// The `chaincode_*`, `response*`, `writes` and `reads` fields are all `Some`
/// iff the envelope carried an endorsed chaincode invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    #[serde(rename = "type")]
    pub tx_type: i32,
    pub type_string: String,
    pub timestamp: DateTime<Utc>,
    pub block_hash: String,
    pub block_height: u64,
    pub channel_name: String,
    pub channel_version: i32,
    pub chaincode_name: Option<String>,
    pub chaincode_version: Option<String>,
    pub response_status: Option<i32>,
    pub response: Option<Decoded>,
    pub writes: Option<ChaincodeWrites>,
    pub reads: Option<ChaincodeReads>,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

impl Direction {
    /// SQL keyword.
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// Lowercase form (also the CouchDB Mango sort value).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    /// Anything other than `asc` sorts descending.
    pub fn parse_lenient(s: Option<&str>) -> Self {
        match s {
            Some(d) if d.eq_ignore_ascii_case("asc") => Self::Asc,
            _ => Self::Desc,
        }
    }
}

/// A sortable field of some record type.
pub trait SortKey: Copy + Default + fmt::Debug + Send + Sync {
    /// Column name in the relational schema.
    fn column(self) -> &'static str;
    /// Field name in the JSON document.
    fn field(self) -> &'static str;
    /// Look a field up by its external (camelCase) name.
    fn from_field(name: &str) -> Option<Self>;
}

/// Recognized block sort fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockSort {
    #[default]
    Timestamp,
    Height,
    Id,
    ChannelName,
    TransactionCount,
}

impl SortKey for BlockSort {
    fn column(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Height => "height",
            Self::Id => "id",
            Self::ChannelName => "channel_name",
            Self::TransactionCount => "transaction_count",
        }
    }

    fn field(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Height => "height",
            Self::Id => "id",
            Self::ChannelName => "channelName",
            Self::TransactionCount => "transactionCount",
        }
    }

    fn from_field(name: &str) -> Option<Self> {
        Some(match name {
            "timestamp" => Self::Timestamp,
            "height" => Self::Height,
            "id" => Self::Id,
            "channelName" => Self::ChannelName,
            "transactionCount" => Self::TransactionCount,
            _ => return None,
        })
    }
}

/// Recognized transaction sort fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionSort {
    #[default]
    Timestamp,
    BlockHeight,
    Id,
    ChannelName,
    ChaincodeName,
    Type,
}

impl SortKey for TransactionSort {
    fn column(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::BlockHeight => "block_height",
            Self::Id => "id",
            Self::ChannelName => "channel_name",
            Self::ChaincodeName => "chaincode_name",
            Self::Type => "tx_type",
        }
    }

    fn field(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::BlockHeight => "blockHeight",
            Self::Id => "id",
            Self::ChannelName => "channelName",
            Self::ChaincodeName => "chaincodeName",
            Self::Type => "type",
        }
    }

    fn from_field(name: &str) -> Option<Self> {
        Some(match name {
            "timestamp" => Self::Timestamp,
            // `height` is accepted as an alias so both list routes share a vocabulary
            "blockHeight" | "height" => Self::BlockHeight,
            "id" => Self::Id,
            "channelName" => Self::ChannelName,
            "chaincodeName" => Self::ChaincodeName,
            "type" => Self::Type,
            _ => return None,
        })
    }
}

/// Equality filters for block listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockFilter {
    pub id: Option<String>,
    pub height: Option<u64>,
    pub channel_name: Option<String>,
    /// Blocks holding at least one transaction of this chaincode.
    pub chaincode_name: Option<String>,
}

/// Equality filters for transaction listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub id: Option<String>,
    pub block_hash: Option<String>,
    pub block_height: Option<u64>,
    pub channel_name: Option<String>,
    pub chaincode_name: Option<String>,
}

/// Offset pagination plus ordering.
///
/// `page` and `size` are 1-based and never zero; construct through [`Page::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page<S> {
    pub page: u32,
    pub size: u32,
    pub sort: S,
    pub direction: Direction,
}

impl<S: SortKey> Page<S> {
    /// Largest page size a caller may request.
    pub const MAX_SIZE: u32 = 100;

    /// Clamp `page >= 1` and `1 <= size <= MAX_SIZE`.
    pub fn new(page: u32, size: u32, sort: S, direction: Direction) -> Self {
        Self {
            page: page.max(1),
            size: size.clamp(1, Self::MAX_SIZE),
            sort,
            direction,
        }
    }

    /// Number of records to skip.
    pub fn offset(&self) -> u64 {
        u64::from(self.size) * u64::from(self.page - 1)
    }
}

impl<S: SortKey> Default for Page<S> {
    fn default() -> Self {
        Self::new(1, 25, S::default(), Direction::Desc)
    }
}

/// Paged, filtered block listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockQuery {
    pub page: Page<BlockSort>,
    pub filter: BlockFilter,
}

/// Paged, filtered transaction listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionQuery {
    pub page: Page<TransactionSort>,
    pub filter: TransactionFilter,
}
