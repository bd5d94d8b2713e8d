//! Read-only query facade over a [`DatabaseAdapter`].
//!
//! Turns loosely typed request parameters into typed queries. Paging and sort
//! parameters are defaulted rather than rejected; only recognized filter fields
//! reach the storage layer.
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::error;

use crate::error::StorageError;
use crate::store::DatabaseAdapter;
use crate::types::{
    Block, BlockFilter, BlockQuery, Channel, Direction, Page, SortKey, Transaction,
    TransactionFilter, TransactionQuery, TransactionSort,
};

pub mod http;

/// Length of a block or transaction hash in hex.
pub const HASH_LEN: usize = 64;

const DEFAULT_PAGE: u32 = 1;
const DEFAULT_SIZE: u32 = 25;

/// Error answered to an API caller: a status plus a message, never a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl fmt::Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST, format!("Bad Request: {message}"))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        if e.is_not_found() {
            return Self::not_found(e.to_string());
        }
        error!(error = %e, "storage error while serving request");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

/// Body of an error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: bool,
    pub message: String,
}

impl From<&ApiError> for ErrorBody {
    fn from(e: &ApiError) -> Self {
        Self {
            error: true,
            message: e.message.clone(),
        }
    }
}

/// What `/search` found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchResult {
    Block(Block),
    Transaction(Transaction),
    Channel(Channel),
}

/// `page`, `size`, `sort` and `direction` as received.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<String>,
    pub size: Option<String>,
    pub sort: Option<String>,
    pub direction: Option<String>,
}

/// Query string of a block listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockParams {
    pub id: Option<String>,
    pub height: Option<String>,
    pub channel_name: Option<String>,
    pub chaincode_name: Option<String>,
    pub page: Option<String>,
    pub size: Option<String>,
    pub sort: Option<String>,
    pub direction: Option<String>,
}

/// Query string of a transaction listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionParams {
    pub id: Option<String>,
    pub block_hash: Option<String>,
    pub block_height: Option<String>,
    pub channel_name: Option<String>,
    pub chaincode_name: Option<String>,
    pub page: Option<String>,
    pub size: Option<String>,
    pub sort: Option<String>,
    pub direction: Option<String>,
}

/// Query string of `/search`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn text(v: &Option<String>) -> Option<String> {
    non_blank(v).map(str::to_owned)
}

fn number(v: &Option<String>, name: &str) -> Result<Option<u64>, ApiError> {
    non_blank(v)
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| ApiError::bad_request(format!("{name} must be a non-negative integer")))
        })
        .transpose()
}

/// Lenient paging: bad or missing values fall back to the defaults, an
/// unknown sort field sorts by timestamp.
fn page<S: SortKey>(
    page: &Option<String>,
    size: &Option<String>,
    sort: &Option<String>,
    direction: &Option<String>,
) -> Page<S> {
    let page_no = non_blank(page)
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PAGE);
    let size = non_blank(size)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_SIZE);
    let sort = non_blank(sort)
        .and_then(S::from_field)
        .unwrap_or_default();
    Page::new(page_no, size, sort, Direction::parse_lenient(non_blank(direction)))
}

impl PageParams {
    pub fn to_page<S: SortKey>(&self) -> Page<S> {
        page(&self.page, &self.size, &self.sort, &self.direction)
    }
}

impl BlockParams {
    pub fn to_query(&self) -> Result<BlockQuery, ApiError> {
        Ok(BlockQuery {
            page: page(&self.page, &self.size, &self.sort, &self.direction),
            filter: BlockFilter {
                id: text(&self.id),
                height: number(&self.height, "height")?,
                channel_name: text(&self.channel_name),
                chaincode_name: text(&self.chaincode_name),
            },
        })
    }
}

impl TransactionParams {
    pub fn to_query(&self) -> Result<TransactionQuery, ApiError> {
        Ok(TransactionQuery {
            page: page(&self.page, &self.size, &self.sort, &self.direction),
            filter: TransactionFilter {
                id: text(&self.id),
                block_hash: text(&self.block_hash),
                block_height: number(&self.block_height, "blockHeight")?,
                channel_name: text(&self.channel_name),
                chaincode_name: text(&self.chaincode_name),
            },
        })
    }
}

/// Stateless query facade; cheap to share behind an `Arc`.
#[derive(Clone)]
pub struct ExplorerApi {
    database: Arc<dyn DatabaseAdapter>,
}

impl ExplorerApi {
    pub fn new(database: Arc<dyn DatabaseAdapter>) -> Self {
        Self { database }
    }

    pub async fn get_channels(&self) -> Result<Vec<Channel>, ApiError> {
        Ok(self.database.get_channels().await?)
    }

    pub async fn get_blocks(&self, params: &BlockParams) -> Result<Vec<Block>, ApiError> {
        let query = params.to_query()?;
        Ok(self.database.get_blocks(&query).await?)
    }

    pub async fn get_block_by_id(&self, id: &str) -> Result<Block, ApiError> {
        Ok(self.database.get_block_by_id(id).await?)
    }

    pub async fn get_block_transactions(
        &self,
        id: &str,
        params: &PageParams,
    ) -> Result<Vec<Transaction>, ApiError> {
        let page: Page<TransactionSort> = params.to_page();
        Ok(self.database.get_block_transactions(id, &page).await?)
    }

    pub async fn get_transactions(
        &self,
        params: &TransactionParams,
    ) -> Result<Vec<Transaction>, ApiError> {
        let query = params.to_query()?;
        Ok(self.database.get_transactions(&query).await?)
    }

    pub async fn get_transaction_by_id(&self, id: &str) -> Result<Transaction, ApiError> {
        Ok(self.database.get_transaction_by_id(id).await?)
    }

    /// A 64-character term is looked up as a block id, then a transaction id.
    /// Anything else is looked up as a channel name.
    pub async fn search(&self, term: Option<&str>) -> Result<SearchResult, ApiError> {
        let term = term
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::bad_request("search term (?q=) is required"))?;

        if term.len() == HASH_LEN {
            match self.database.get_block_by_id(term).await {
                Ok(block) => return Ok(SearchResult::Block(block)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            return match self.database.get_transaction_by_id(term).await {
                Ok(tx) => Ok(SearchResult::Transaction(tx)),
                Err(e) if e.is_not_found() => {
                    Err(ApiError::not_found(format!("Hash not found: {term}")))
                }
                Err(e) => Err(e.into()),
            };
        }

        match self.database.get_channel(term).await {
            Ok(channel) => Ok(SearchResult::Channel(channel)),
            Err(e) if e.is_not_found() => Err(ApiError::not_found(format!("Not found: {term}"))),
            Err(e) => Err(e.into()),
        }
    }
}
