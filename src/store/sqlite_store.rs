//! Embedded SQLite backend (the relational implementation of [`DatabaseAdapter`]).
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{
    ffi, params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row,
    TransactionBehavior,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::store::{DatabaseAdapter, InsertOutcome};
use crate::types::{
    Block, BlockQuery, Channel, Page, SortKey, Transaction, TransactionFilter,
    TransactionQuery, TransactionSort,
};

/// Tables:
///   channels(name PK, height, last_hash)
///   blocks(id PK, height, timestamp, previous_hash, transaction_count, channel_name)
///   transactions(id PK, ..., response/writes/reads as JSON text)
///
/// Timestamps are RFC 3339 UTC text with fixed microsecond precision, so
/// lexical order equals chronological order.
const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;

    CREATE TABLE IF NOT EXISTS channels (
        name      TEXT PRIMARY KEY,
        height    INTEGER NOT NULL DEFAULT 0,
        last_hash TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS blocks (
        id                TEXT PRIMARY KEY,
        height            INTEGER NOT NULL,
        timestamp         TEXT NOT NULL,
        previous_hash     TEXT NOT NULL,
        transaction_count INTEGER NOT NULL,
        channel_name      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS block_timestamp    ON blocks(timestamp);
    CREATE INDEX IF NOT EXISTS block_height       ON blocks(height);
    CREATE INDEX IF NOT EXISTS block_channel_name ON blocks(channel_name);

    CREATE TABLE IF NOT EXISTS transactions (
        id                TEXT PRIMARY KEY,
        tx_type           INTEGER NOT NULL,
        type_string       TEXT NOT NULL,
        timestamp         TEXT NOT NULL,
        block_hash        TEXT NOT NULL,
        block_height      INTEGER NOT NULL,
        channel_name      TEXT NOT NULL,
        channel_version   INTEGER NOT NULL,
        chaincode_name    TEXT,
        chaincode_version TEXT,
        response_status   INTEGER,
        response          TEXT,
        writes            TEXT,
        reads             TEXT
    );
    CREATE INDEX IF NOT EXISTS tx_timestamp      ON transactions(timestamp);
    CREATE INDEX IF NOT EXISTS tx_block_height   ON transactions(block_height);
    CREATE INDEX IF NOT EXISTS tx_block_hash     ON transactions(block_hash);
    CREATE INDEX IF NOT EXISTS tx_channel_name   ON transactions(channel_name);
    CREATE INDEX IF NOT EXISTS tx_chaincode_name ON transactions(channel_name, chaincode_name);
"#;

const BLOCK_COLUMNS: &str =
    "id, height, timestamp, previous_hash, transaction_count, channel_name";

const TX_COLUMNS: &str = "id, tx_type, type_string, timestamp, block_hash, block_height, \
     channel_name, channel_version, chaincode_name, chaincode_version, response_status, \
     response, writes, reads";

/// SQLite file database. Every call opens its own connection on the blocking pool.
pub struct SqliteDatabase {
    path: PathBuf,
}

impl SqliteDatabase {
    /// Use the SQLite file at `path` (created on first access).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(path: &PathBuf) -> StorageResult<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Run `f` against a fresh connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = Self::open(&path)?;
            f(&mut conn)
        })
        .await?
    }
}

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

fn json_to_sql<T: serde::Serialize>(value: &Option<T>) -> StorageResult<Option<String>> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

fn json_from_sql<T: serde::de::DeserializeOwned>(raw: Option<String>) -> StorageResult<Option<T>> {
    Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
}

/// A primary-key collision is the idempotent no-op case.
fn insert_outcome(res: rusqlite::Result<usize>) -> StorageResult<InsertOutcome> {
    match res {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            Ok(InsertOutcome::AlreadyExists)
        }
        Err(e) => Err(e.into()),
    }
}

fn read_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        name: row.get(0)?,
        height: row.get(1)?,
        last_hash: row.get(2)?,
    })
}

fn read_block(row: &Row<'_>) -> StorageResult<Block> {
    let ts: String = row.get(2)?;
    Ok(Block {
        id: row.get(0)?,
        height: row.get(1)?,
        timestamp: ts_from_sql(&ts)?,
        previous_hash: row.get(3)?,
        transaction_count: row.get(4)?,
        channel_name: row.get(5)?,
    })
}

fn read_transaction(row: &Row<'_>) -> StorageResult<Transaction> {
    let ts: String = row.get(3)?;
    Ok(Transaction {
        id: row.get(0)?,
        tx_type: row.get(1)?,
        type_string: row.get(2)?,
        timestamp: ts_from_sql(&ts)?,
        block_hash: row.get(4)?,
        block_height: row.get(5)?,
        channel_name: row.get(6)?,
        channel_version: row.get(7)?,
        chaincode_name: row.get(8)?,
        chaincode_version: row.get(9)?,
        response_status: row.get(10)?,
        response: json_from_sql(row.get(11)?)?,
        writes: json_from_sql(row.get(12)?)?,
        reads: json_from_sql(row.get(13)?)?,
    })
}

/// `WHERE` clause builder collecting positional values.
#[derive(Default)]
struct Where {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl Where {
    fn eq(&mut self, column: &str, value: Option<Value>) {
        if let Some(v) = value {
            self.values.push(v);
            self.clauses.push(format!("{column} = ?{}", self.values.len()));
        }
    }

    fn raw(&mut self, clause: &str, value: Value) {
        self.values.push(value);
        self.clauses
            .push(clause.replace("?", &format!("?{}", self.values.len())));
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }

    /// `ORDER BY <sort>, id` plus `LIMIT/OFFSET`, appended as the last two values.
    fn paged<S: SortKey>(mut self, select: &str, page: &Page<S>) -> (String, Vec<Value>) {
        let dir = page.direction.as_sql();
        let mut order = format!("{} {dir}", page.sort.column());
        if page.sort.column() != "id" {
            order.push_str(&format!(", id {dir}"));
        }
        let sql = format!(
            "{select} {} ORDER BY {order} LIMIT ?{} OFFSET ?{}",
            self.sql(),
            self.values.len() + 1,
            self.values.len() + 2,
        );
        self.values.push(Value::Integer(i64::from(page.size)));
        self.values
            .push(Value::Integer(i64::try_from(page.offset()).unwrap_or(i64::MAX)));
        (sql, self.values)
    }
}

fn text(v: &Option<String>) -> Option<Value> {
    v.clone().map(Value::Text)
}

fn int(v: Option<u64>) -> Option<Value> {
    v.map(|n| Value::Integer(i64::try_from(n).unwrap_or(i64::MAX)))
}

fn tx_where(filter: &TransactionFilter) -> Where {
    let mut w = Where::default();
    w.eq("id", text(&filter.id));
    w.eq("block_hash", text(&filter.block_hash));
    w.eq("block_height", int(filter.block_height));
    w.eq("channel_name", text(&filter.channel_name));
    w.eq("chaincode_name", text(&filter.chaincode_name));
    w
}

fn query_transactions(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> StorageResult<Vec<Transaction>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(values))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_transaction(row)?);
    }
    Ok(out)
}

#[async_trait]
impl DatabaseAdapter for SqliteDatabase {
    async fn connect(&self) -> StorageResult<()> {
        let path = self.path.clone();
        self.with_conn(move |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            debug!(path = %path.display(), "sqlite reachable");
            Ok(())
        })
        .await
    }

    async fn setup(&self, channels: &[String]) -> StorageResult<()> {
        let channels = channels.to_vec();
        self.with_conn(move |conn| {
            conn.execute_batch(SCHEMA)?;
            let tx = conn.transaction()?;
            for name in &channels {
                let created = tx.execute(
                    "INSERT OR IGNORE INTO channels(name, height, last_hash) VALUES(?1, 0, '')",
                    params![name],
                )?;
                if created > 0 {
                    info!(channel = %name, "created channel row");
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_channel(&self, name: &str) -> StorageResult<Channel> {
        let name = name.to_owned();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT name, height, last_hash FROM channels WHERE name = ?1",
                params![name],
                read_channel,
            )
            .optional()?
            .ok_or_else(|| StorageError::not_found("channel", name))
        })
        .await
    }

    async fn update_channel(&self, channel: &Channel) -> StorageResult<bool> {
        let channel = channel.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored: Option<u64> = tx
                .query_row(
                    "SELECT height FROM channels WHERE name = ?1",
                    params![channel.name],
                    |r| r.get(0),
                )
                .optional()?;

            let written = match stored {
                Some(previous) if channel.height <= previous => false,
                Some(previous) => {
                    tx.execute(
                        "UPDATE channels SET height = ?2, last_hash = ?3 WHERE name = ?1",
                        params![channel.name, channel.height, channel.last_hash],
                    )?;
                    info!(channel = %channel.name, from = previous, to = channel.height, "saved height to database");
                    true
                }
                None => {
                    tx.execute(
                        "INSERT INTO channels(name, height, last_hash) VALUES(?1, ?2, ?3)",
                        params![channel.name, channel.height, channel.last_hash],
                    )?;
                    info!(channel = %channel.name, to = channel.height, "saved height to database");
                    true
                }
            };
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    async fn add_block(&self, block: &Block) -> StorageResult<InsertOutcome> {
        let block = block.clone();
        self.with_conn(move |conn| {
            insert_outcome(conn.execute(
                &format!("INSERT INTO blocks({BLOCK_COLUMNS}) VALUES(?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    block.id,
                    block.height,
                    ts_to_sql(&block.timestamp),
                    block.previous_hash,
                    block.transaction_count,
                    block.channel_name,
                ],
            ))
        })
        .await
    }

    async fn add_transaction(&self, transaction: &Transaction) -> StorageResult<InsertOutcome> {
        let t = transaction.clone();
        self.with_conn(move |conn| {
            let response = json_to_sql(&t.response)?;
            let writes = json_to_sql(&t.writes)?;
            let reads = json_to_sql(&t.reads)?;
            insert_outcome(conn.execute(
                &format!(
                    "INSERT INTO transactions({TX_COLUMNS}) \
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    t.id,
                    t.tx_type,
                    t.type_string,
                    ts_to_sql(&t.timestamp),
                    t.block_hash,
                    t.block_height,
                    t.channel_name,
                    t.channel_version,
                    t.chaincode_name,
                    t.chaincode_version,
                    t.response_status,
                    response,
                    writes,
                    reads,
                ],
            ))
        })
        .await
    }

    async fn get_channels(&self) -> StorageResult<Vec<Channel>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name, height, last_hash FROM channels ORDER BY name")?;
            let rows = stmt.query_map([], read_channel)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn get_block_by_id(&self, id: &str) -> StorageResult<Block> {
        let id = id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE id = ?1"))?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => read_block(row),
                None => Err(StorageError::not_found("block", id)),
            }
        })
        .await
    }

    async fn get_transaction_by_id(&self, id: &str) -> StorageResult<Transaction> {
        let id = id.to_owned();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {TX_COLUMNS} FROM transactions WHERE id = ?1");
            query_transactions(conn, &sql, vec![Value::Text(id.clone())])?
                .pop()
                .ok_or_else(|| StorageError::not_found("transaction", id))
        })
        .await
    }

    async fn get_blocks(&self, query: &BlockQuery) -> StorageResult<Vec<Block>> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let f = &query.filter;
            let mut w = Where::default();
            w.eq("id", text(&f.id));
            w.eq("height", int(f.height));
            w.eq("channel_name", text(&f.channel_name));
            if let Some(cc) = &f.chaincode_name {
                w.raw(
                    "EXISTS (SELECT 1 FROM transactions t \
                     WHERE t.block_hash = blocks.id AND t.chaincode_name = ?)",
                    Value::Text(cc.clone()),
                );
            }
            let (sql, values) =
                w.paged(&format!("SELECT {BLOCK_COLUMNS} FROM blocks"), &query.page);

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(read_block(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn get_transactions(&self, query: &TransactionQuery) -> StorageResult<Vec<Transaction>> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let (sql, values) = tx_where(&query.filter).paged(
                &format!("SELECT {TX_COLUMNS} FROM transactions"),
                &query.page,
            );
            query_transactions(conn, &sql, values)
        })
        .await
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
        self.get_transactions(&TransactionQuery { page: *page, filter })
            .await
    }
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase").field("path", &self.path).finish()
    }
}
