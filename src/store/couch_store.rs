//! CouchDB backend (the document-store implementation of [`DatabaseAdapter`]).
//!
//! Every record is a JSON document whose `_id` is the record's natural key;
//! listings go through Mango `_find` queries backed by the indexes created in
//! [`setup`](DatabaseAdapter::setup).
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::redact_url;
use crate::error::{StorageError, StorageResult};
use crate::store::{DatabaseAdapter, InsertOutcome};
use crate::types::{
    Block, BlockQuery, Channel, Page, SortKey, Transaction, TransactionFilter, TransactionQuery,
    TransactionSort,
};

const CHANNELS: &str = "explorer_channels";
const BLOCKS: &str = "explorer_blocks";
const TRANSACTIONS: &str = "explorer_transactions";

/// Upper bound on distinct blocks collected for a block-by-chaincode listing.
const CHAINCODE_BLOCK_SCAN: u32 = 10_000;

struct IndexDef {
    name: &'static str,
    fields: &'static [&'static str],
}

const TABLES: &[(&str, &[IndexDef])] = &[
    (CHANNELS, &[]),
    (
        BLOCKS,
        &[
            IndexDef { name: "block_timestamp", fields: &["timestamp"] },
            IndexDef { name: "block_height", fields: &["height"] },
            IndexDef { name: "block_channel_name", fields: &["channelName"] },
            IndexDef { name: "block_transaction_count", fields: &["transactionCount"] },
        ],
    ),
    (
        TRANSACTIONS,
        &[
            IndexDef { name: "tx_timestamp", fields: &["timestamp"] },
            IndexDef { name: "tx_block_height", fields: &["blockHeight"] },
            IndexDef { name: "tx_block_hash", fields: &["blockHash"] },
            IndexDef { name: "tx_channel_name", fields: &["channelName"] },
            IndexDef { name: "tx_chaincode_name", fields: &["channelName", "chaincodeName"] },
            IndexDef { name: "tx_chaincode_only", fields: &["chaincodeName"] },
            IndexDef { name: "tx_type", fields: &["type"] },
        ],
    ),
];

#[derive(Deserialize)]
struct FindResponse<T> {
    docs: Vec<T>,
}

#[derive(Deserialize)]
struct AllDocs<T> {
    rows: Vec<AllDocsRow<T>>,
}

#[derive(Deserialize)]
struct AllDocsRow<T> {
    id: String,
    doc: Option<T>,
}

#[derive(Deserialize)]
struct StoredChannel {
    #[serde(rename = "_rev")]
    rev: String,
    height: u64,
}

#[derive(Serialize)]
struct ChannelDoc<'a> {
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    rev: Option<&'a str>,
    #[serde(flatten)]
    channel: &'a Channel,
}

/// Serialize a record with its `timestamp` at fixed microsecond precision, so
/// Mango string collation orders it chronologically.
fn record_doc<T: Serialize>(record: &T, timestamp: &DateTime<Utc>) -> StorageResult<Value> {
    let mut doc = serde_json::to_value(record)?;
    if let Some(fields) = doc.as_object_mut() {
        fields.insert(
            "timestamp".into(),
            Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
    }
    Ok(doc)
}

#[derive(Debug)]
struct Credentials {
    user: String,
    password: SecretString,
}

/// CouchDB server reachable over HTTP.
#[derive(Debug)]
pub struct CouchDatabase {
    client: Client,
    /// Server root with the userinfo stripped, so request errors never carry it.
    base: Url,
    credentials: Option<Credentials>,
}

impl CouchDatabase {
    /// `url` is the server root, e.g. `http://admin:pw@localhost:5984`.
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let mut base = Url::parse(url)
            .map_err(|e| anyhow::anyhow!("invalid couchdb url {}: {e}", redact_url(url)))?;
        anyhow::ensure!(
            !base.cannot_be_a_base(),
            "couchdb url {} cannot be a base",
            redact_url(url)
        );
        // reqwest does not lift userinfo into an Authorization header on its own
        let credentials = match base.password() {
            Some(password) if !base.username().is_empty() => Some(Credentials {
                user: base.username().to_owned(),
                password: SecretString::from(password.to_owned()),
            }),
            _ => None,
        };
        let _ = base.set_username("");
        let _ = base.set_password(None);
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base,
            credentials,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let builder = self.client.request(method, self.url(segments));
        match &self.credentials {
            Some(c) => builder.basic_auth(&c.user, Some(c.password.expose_secret())),
            None => builder,
        }
    }

    /// Map non-success statuses to [`StorageError::Couch`].
    async fn checked(response: Response) -> StorageResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let reason = body
            .get("reason")
            .or_else(|| body.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_owned();
        Err(StorageError::Couch {
            status: status.as_u16(),
            reason,
        })
    }

    async fn get_doc<T: DeserializeOwned>(
        &self,
        db: &str,
        entity: &'static str,
        id: &str,
    ) -> StorageResult<T> {
        let response = self.request(Method::GET, &[db, id]).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::not_found(entity, id));
        }
        Ok(Self::checked(response).await?.json().await?)
    }

    /// PUT a new document; a 409 means the id is already taken.
    async fn insert_doc<T: Serialize + ?Sized>(
        &self,
        db: &str,
        id: &str,
        doc: &T,
    ) -> StorageResult<InsertOutcome> {
        let response = self.request(Method::PUT, &[db, id]).json(doc).send().await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(InsertOutcome::AlreadyExists);
        }
        Self::checked(response).await?;
        Ok(InsertOutcome::Inserted)
    }

    async fn find<T: DeserializeOwned>(&self, db: &str, query: Value) -> StorageResult<Vec<T>> {
        let response = self
            .request(Method::POST, &[db, "_find"])
            .json(&query)
            .send()
            .await?;
        let found: FindResponse<T> = Self::checked(response).await?.json().await?;
        Ok(found.docs)
    }

    async fn list_databases(&self) -> StorageResult<Vec<String>> {
        let response = self.request(Method::GET, &["_all_dbs"]).send().await?;
        Ok(Self::checked(response).await?.json().await?)
    }

    async fn find_transactions(
        &self,
        filter: &TransactionFilter,
        page: &Page<TransactionSort>,
    ) -> StorageResult<Vec<Transaction>> {
        let mut selector = Map::new();
        put(&mut selector, "_id", filter.id.clone().map(Value::from));
        put(&mut selector, "blockHash", filter.block_hash.clone().map(Value::from));
        put(&mut selector, "blockHeight", filter.block_height.map(Value::from));
        put(&mut selector, "channelName", filter.channel_name.clone().map(Value::from));
        put(&mut selector, "chaincodeName", filter.chaincode_name.clone().map(Value::from));
        self.find(TRANSACTIONS, mango(selector, page)).await
    }
}

fn put(selector: &mut Map<String, Value>, field: &str, value: Option<Value>) {
    if let Some(v) = value {
        selector.insert(field.to_owned(), v);
    }
}

/// `id` is the document `_id`, which CouchDB always indexes.
fn doc_field<S: SortKey>(sort: S) -> &'static str {
    match sort.field() {
        "id" => "_id",
        other => other,
    }
}

/// Build a paged Mango query. Json indexes order ties by `_id`, so sorting on
/// the single field is already stable by primary key.
fn mango<S: SortKey>(mut selector: Map<String, Value>, page: &Page<S>) -> Value {
    let field = doc_field(page.sort);
    // the sort field must appear in the selector for the index to be chosen
    selector
        .entry(field.to_owned())
        .or_insert_with(|| json!({ "$gt": null }));
    json!({
        "selector": selector,
        "sort": [{ field: page.direction.as_str() }],
        "skip": page.offset(),
        "limit": page.size,
    })
}

#[async_trait]
impl DatabaseAdapter for CouchDatabase {
    async fn connect(&self) -> StorageResult<()> {
        let databases = self.list_databases().await?;
        debug!(found = %databases.join(","), "couchdb reachable");
        Ok(())
    }

    async fn setup(&self, channels: &[String]) -> StorageResult<()> {
        let existing = self.list_databases().await?;

        for &(db, indexes) in TABLES {
            if !existing.iter().any(|name| name == db) {
                info!(table = %db, "creating table");
                let response = self.request(Method::PUT, &[db]).send().await?;
                // 412: created concurrently by another process
                if response.status() != StatusCode::PRECONDITION_FAILED {
                    Self::checked(response).await?;
                }
            }
            // index creation is idempotent on the server side
            for index in indexes {
                let body = json!({
                    "name": index.name,
                    "type": "json",
                    "index": { "fields": index.fields },
                });
                let response = self
                    .request(Method::POST, &[db, "_index"])
                    .json(&body)
                    .send()
                    .await?;
                Self::checked(response).await?;
            }
        }

        for name in channels {
            let channel = Channel::empty(name.as_str());
            let doc = ChannelDoc { rev: None, channel: &channel };
            if self.insert_doc(CHANNELS, name, &doc).await? == InsertOutcome::Inserted {
                info!(channel = %name, "created channel document");
            }
        }
        Ok(())
    }

    async fn get_channel(&self, name: &str) -> StorageResult<Channel> {
        self.get_doc(CHANNELS, "channel", name).await
    }

    async fn update_channel(&self, channel: &Channel) -> StorageResult<bool> {
        let stored = match self
            .get_doc::<StoredChannel>(CHANNELS, "channel", &channel.name)
            .await
        {
            Ok(stored) => Some(stored),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        if let Some(previous) = &stored {
            if channel.height <= previous.height {
                return Ok(false);
            }
        }

        let doc = ChannelDoc {
            rev: stored.as_ref().map(|s| s.rev.as_str()),
            channel,
        };
        let response = self
            .request(Method::PUT, &[CHANNELS, &channel.name])
            .json(&doc)
            .send()
            .await?;
        // a 409 here is a concurrent writer; surfaced so the caller retries
        Self::checked(response).await?;
        info!(
            channel = %channel.name,
            from = stored.map(|s| s.height).unwrap_or(0),
            to = channel.height,
            "saved height to database"
        );
        Ok(true)
    }

    async fn add_block(&self, block: &Block) -> StorageResult<InsertOutcome> {
        let doc = record_doc(block, &block.timestamp)?;
        self.insert_doc(BLOCKS, &block.id, &doc).await
    }

    async fn add_transaction(&self, transaction: &Transaction) -> StorageResult<InsertOutcome> {
        let doc = record_doc(transaction, &transaction.timestamp)?;
        self.insert_doc(TRANSACTIONS, &transaction.id, &doc).await
    }

    async fn get_channels(&self) -> StorageResult<Vec<Channel>> {
        let response = self
            .request(Method::GET, &[CHANNELS, "_all_docs"])
            .query(&[("include_docs", "true")])
            .send()
            .await?;
        let all: AllDocs<Channel> = Self::checked(response).await?.json().await?;
        Ok(all
            .rows
            .into_iter()
            .filter(|row| !row.id.starts_with("_design/"))
            .filter_map(|row| row.doc)
            .collect())
    }

    async fn get_block_by_id(&self, id: &str) -> StorageResult<Block> {
        self.get_doc(BLOCKS, "block", id).await
    }

    async fn get_transaction_by_id(&self, id: &str) -> StorageResult<Transaction> {
        self.get_doc(TRANSACTIONS, "transaction", id).await
    }

    async fn get_blocks(&self, query: &BlockQuery) -> StorageResult<Vec<Block>> {
        let f = &query.filter;
        let mut selector = Map::new();
        put(&mut selector, "_id", f.id.clone().map(Value::from));
        put(&mut selector, "height", f.height.map(Value::from));
        put(&mut selector, "channelName", f.channel_name.clone().map(Value::from));

        if let Some(chaincode) = &f.chaincode_name {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct HashOnly {
                block_hash: String,
            }
            let hits: Vec<HashOnly> = self
                .find(
                    TRANSACTIONS,
                    json!({
                        "selector": { "chaincodeName": chaincode },
                        "fields": ["blockHash"],
                        "limit": CHAINCODE_BLOCK_SCAN,
                    }),
                )
                .await?;
            let mut hashes: Vec<String> = hits.into_iter().map(|h| h.block_hash).collect();
            hashes.sort();
            hashes.dedup();

            // an explicit id filter must also be one of the matching blocks
            match selector.remove("_id") {
                Some(Value::String(id)) if !hashes.contains(&id) => return Ok(vec![]),
                Some(id) => {
                    selector.insert("_id".into(), id);
                }
                None => {
                    selector.insert("_id".into(), json!({ "$in": hashes }));
                }
            }
        }

        self.find(BLOCKS, mango(selector, &query.page)).await
    }

    async fn get_transactions(&self, query: &TransactionQuery) -> StorageResult<Vec<Transaction>> {
        self.find_transactions(&query.filter, &query.page).await
    }

    async fn get_block_transactions(
        &self,
        block_id: &str,
        page: &Page<TransactionSort>,
    ) -> StorageResult<Vec<Transaction>> {
        let filter = TransactionFilter {
            block_hash: Some(block_id.to_owned()),
            ..Default::default()
        };
        self.find_transactions(&filter, page).await
    }
}
