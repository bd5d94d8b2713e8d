//! Shared fixtures: block event builders, an in-memory ledger network and a
//! fault-injecting storage wrapper.
#![allow(dead_code)]

pub mod conformance;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::StreamExt;
use ledger_explorer::event::*;
use ledger_explorer::network::{LedgerNetwork, ListenerHandle, Subscription};
use ledger_explorer::store::{DatabaseAdapter, InsertOutcome, SqliteDatabase};
use ledger_explorer::types::{
    Block, BlockQuery, Channel, Page, Transaction, TransactionQuery, TransactionSort,
};
use ledger_explorer::{DeliveryError, StorageError, StorageResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;

// ------- event builders -------

fn seed(channel: &str) -> u64 {
    channel.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Deterministic 64-hex block hash, distinct per (channel, height).
pub fn block_hash(channel: &str, height: u64) -> String {
    format!("{:016x}{:048x}", seed(channel), height)
}

/// Deterministic 64-hex transaction id, never equal to a block hash.
pub fn tx_id(channel: &str, height: u64, index: usize) -> String {
    format!("{:016x}{:040x}{:08x}", !seed(channel), height, index)
}

pub fn ts(height: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + height as i64 * 10, 0).unwrap()
}

fn channel_header(channel: &str, tx_id: &str, header_type: i32, type_string: &str, at: DateTime<Utc>) -> ChannelHeader {
    ChannelHeader {
        tx_id: tx_id.to_owned(),
        header_type,
        type_string: type_string.to_owned(),
        timestamp: at,
        channel_id: channel.to_owned(),
        version: 0,
    }
}

/// Endorsed chaincode invocation writing `writes` (values are raw bytes).
pub fn invoke_envelope(
    channel: &str,
    tx_id: &str,
    at: DateTime<Utc>,
    chaincode: &str,
    writes: &[(&str, &[u8])],
) -> Envelope {
    let writes = writes
        .iter()
        .map(|(key, value)| KvWrite {
            key: (*key).to_owned(),
            is_delete: false,
            value: value.to_vec(),
        })
        .collect();
    Envelope {
        payload: Payload {
            header: PayloadHeader {
                channel_header: channel_header(channel, tx_id, 3, "ENDORSER_TRANSACTION", at),
            },
            data: PayloadData {
                actions: vec![Action {
                    payload: ActionPayload {
                        action: EndorsedAction {
                            proposal_response_payload: ProposalResponsePayload {
                                extension: Some(ChaincodeAction {
                                    chaincode_id: ChaincodeId {
                                        name: chaincode.to_owned(),
                                        version: "1.0".to_owned(),
                                    },
                                    response: ChaincodeResponse {
                                        status: 200,
                                        payload: br#"{"ok":true}"#.to_vec(),
                                    },
                                    results: TxReadWriteSet {
                                        ns_rwset: vec![NsReadWriteSet {
                                            namespace: chaincode.to_owned(),
                                            rwset: KvRwSet {
                                                reads: Vec::new(),
                                                writes,
                                            },
                                        }],
                                    },
                                }),
                            },
                        },
                    },
                }],
            },
        },
    }
}

/// Configuration transaction: no actions, no chaincode extension.
pub fn config_envelope(channel: &str, tx_id: &str, at: DateTime<Utc>) -> Envelope {
    Envelope {
        payload: Payload {
            header: PayloadHeader {
                channel_header: channel_header(channel, tx_id, 1, "CONFIG", at),
            },
            data: PayloadData::default(),
        },
    }
}

pub fn block_event(channel: &str, height: u64, envelopes: Vec<Envelope>) -> BlockEvent {
    BlockEvent {
        header: BlockHeader {
            number: height.to_string(),
            data_hash: block_hash(channel, height),
            previous_hash: block_hash(channel, height.saturating_sub(1)),
        },
        data: BlockData { data: envelopes },
    }
}

/// Block at `height` with one invocation of `chaincode` writing `{"A": "<height>"}`.
pub fn simple_block(channel: &str, height: u64, chaincode: &str) -> BlockEvent {
    let value = format!("\"{height}\"");
    block_event(
        channel,
        height,
        vec![invoke_envelope(
            channel,
            &tx_id(channel, height, 0),
            ts(height),
            chaincode,
            &[("A", value.as_bytes())],
        )],
    )
}

// ------- storage -------

/// Fresh SQLite database with `setup` already run for `channels`.
pub async fn sqlite_db(channels: &[&str]) -> anyhow::Result<(Arc<dyn DatabaseAdapter>, NamedTempFile)> {
    let tmp = NamedTempFile::new()?;
    let db = SqliteDatabase::new(tmp.path());
    db.connect().await?;
    let names: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
    db.setup(&names).await?;
    Ok((Arc::new(db), tmp))
}

/// Storage wrapper with switchable write failures and an optional delay on
/// channel updates.
pub struct FlakyDatabase {
    inner: Arc<dyn DatabaseAdapter>,
    pub fail_updates: AtomicBool,
    pub fail_block_writes: AtomicBool,
    pub update_delay: Mutex<Option<Duration>>,
    pub update_calls: AtomicUsize,
}

impl FlakyDatabase {
    pub fn new(inner: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            inner,
            fail_updates: AtomicBool::new(false),
            fail_block_writes: AtomicBool::new(false),
            update_delay: Mutex::new(None),
            update_calls: AtomicUsize::new(0),
        }
    }

    fn injected() -> StorageError {
        StorageError::Couch {
            status: 503,
            reason: "injected failure".into(),
        }
    }
}

#[async_trait]
impl DatabaseAdapter for FlakyDatabase {
    async fn connect(&self) -> StorageResult<()> {
        self.inner.connect().await
    }
    async fn setup(&self, channels: &[String]) -> StorageResult<()> {
        self.inner.setup(channels).await
    }
    async fn get_channel(&self, name: &str) -> StorageResult<Channel> {
        self.inner.get_channel(name).await
    }
    async fn update_channel(&self, channel: &Channel) -> StorageResult<bool> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.update_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.update_channel(channel).await
    }
    async fn add_block(&self, block: &Block) -> StorageResult<InsertOutcome> {
        if self.fail_block_writes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.add_block(block).await
    }
    async fn add_transaction(&self, transaction: &Transaction) -> StorageResult<InsertOutcome> {
        self.inner.add_transaction(transaction).await
    }
    async fn get_channels(&self) -> StorageResult<Vec<Channel>> {
        self.inner.get_channels().await
    }
    async fn get_block_by_id(&self, id: &str) -> StorageResult<Block> {
        self.inner.get_block_by_id(id).await
    }
    async fn get_transaction_by_id(&self, id: &str) -> StorageResult<Transaction> {
        self.inner.get_transaction_by_id(id).await
    }
    async fn get_blocks(&self, query: &BlockQuery) -> StorageResult<Vec<Block>> {
        self.inner.get_blocks(query).await
    }
    async fn get_transactions(&self, query: &TransactionQuery) -> StorageResult<Vec<Transaction>> {
        self.inner.get_transactions(query).await
    }
    async fn get_block_transactions(
        &self,
        block_id: &str,
        page: &Page<TransactionSort>,
    ) -> StorageResult<Vec<Transaction>> {
        self.inner.get_block_transactions(block_id, page).await
    }
    async fn disconnect(&self) {
        self.inner.disconnect().await
    }
}

// ------- ledger network -------

pub type Sender = mpsc::UnboundedSender<Result<BlockEvent, DeliveryError>>;

struct RecordingHandle {
    channel: String,
    log: Arc<Mutex<Vec<String>>>,
}

impl ListenerHandle for RecordingHandle {
    fn unsubscribe(&self) {
        self.log.lock().unwrap().push(self.channel.clone());
    }
}

/// In-memory network: every subscription is an unbounded channel the test
/// pushes events into.
#[derive(Default)]
pub struct FakeNetwork {
    pub senders: Mutex<HashMap<String, Sender>>,
    /// (channel, start) per subscribe call.
    pub subscriptions: Mutex<Vec<(String, u64)>>,
    pub unsubscribed: Arc<Mutex<Vec<String>>>,
    pub connected: AtomicBool,
    pub disconnected: AtomicBool,
    pub fail_connect: bool,
    /// Channel whose subscribe call fails.
    pub fail_subscribe: Option<String>,
    /// Items queued on a channel's stream before `subscribe` returns.
    pub backlog: Mutex<HashMap<String, Vec<Result<BlockEvent, DeliveryError>>>>,
}

impl FakeNetwork {
    /// Push one item to `channel`'s subscription. Returns `false` when nobody listens.
    pub fn deliver(&self, channel: &str, item: Result<BlockEvent, DeliveryError>) -> bool {
        match self.senders.lock().unwrap().get(channel) {
            Some(tx) => tx.unbounded_send(item).is_ok(),
            None => false,
        }
    }

    pub fn start_of(&self, channel: &str) -> Option<u64> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c == channel)
            .map(|(_, start)| *start)
    }
}

#[async_trait]
impl LedgerNetwork for FakeNetwork {
    async fn connect(&self) -> anyhow::Result<()> {
        if self.fail_connect {
            anyhow::bail!("gateway unreachable");
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, channel: &str, start: u64) -> anyhow::Result<Subscription> {
        if self.fail_subscribe.as_deref() == Some(channel) {
            anyhow::bail!("channel {channel} refused the listener");
        }
        let (tx, rx) = mpsc::unbounded();
        let queued = self.backlog.lock().unwrap().remove(channel).unwrap_or_default();
        for item in queued {
            let _ = tx.unbounded_send(item);
        }
        self.senders.lock().unwrap().insert(channel.to_owned(), tx);
        self.subscriptions
            .lock()
            .unwrap()
            .push((channel.to_owned(), start));
        Ok(Subscription {
            events: rx.boxed(),
            handle: Box::new(RecordingHandle {
                channel: channel.to_owned(),
                log: Arc::clone(&self.unsubscribed),
            }),
        })
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
