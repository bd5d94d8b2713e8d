//! Pure mapping from a delivered [`BlockEvent`] to normalized [`Block`] and
//! [`Transaction`] records. No I/O happens here.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::event::{BlockEvent, ChaincodeAction, Envelope};
use crate::types::{Block, ChaincodeReads, ChaincodeWrites, Decoded, ReadVersion, Transaction};

/// A block and its transactions, in envelope order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecords {
    pub block: Block,
    pub transactions: Vec<Transaction>,
}

/// Decode bytes as JSON, falling back to their hex encoding. Never fails.
pub fn try_json_decode(bytes: &[u8]) -> Decoded {
    match serde_json::from_slice(bytes) {
        Ok(value) => Decoded::Decoded(value),
        Err(_) => Decoded::Raw(hex::encode(bytes)),
    }
}

/// Parse a decimal height as delivered on the wire.
pub fn parse_height(raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("invalid block number {raw:?}"))
}

/// Normalize a block event received on `channel_name`.
///
/// The block timestamp is the first transaction's channel-header timestamp.
/// A block without transactions is stamped with `received_at` instead.
pub fn transform_block(
    event: &BlockEvent,
    channel_name: &str,
    received_at: DateTime<Utc>,
) -> Result<BlockRecords> {
    let hash = event.header.data_hash.clone();
    let height = parse_height(&event.header.number)?;
    let envelopes = &event.data.data;

    let timestamp = envelopes
        .first()
        .map(|env| env.payload.header.channel_header.timestamp)
        .unwrap_or(received_at);

    let transactions = envelopes
        .iter()
        .enumerate()
        .map(|(i, env)| {
            transform_transaction(env, &hash, height)
                .with_context(|| format!("transaction #{i} of block {height}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let block = Block {
        id: hash,
        height,
        timestamp,
        previous_hash: event.header.previous_hash.clone(),
        transaction_count: envelopes.len() as u64,
        channel_name: channel_name.to_owned(),
    };

    Ok(BlockRecords {
        block,
        transactions,
    })
}

/// Normalize one envelope belonging to block `block_hash` at `block_height`.
pub fn transform_transaction(
    envelope: &Envelope,
    block_hash: &str,
    block_height: u64,
) -> Result<Transaction> {
    let header = &envelope.payload.header.channel_header;
    let mut tx = Transaction {
        id: header.tx_id.clone(),
        tx_type: header.header_type,
        type_string: header.type_string.clone(),
        timestamp: header.timestamp,
        block_hash: block_hash.to_owned(),
        block_height,
        channel_name: header.channel_id.clone(),
        channel_version: header.version,
        chaincode_name: None,
        chaincode_version: None,
        response_status: None,
        response: None,
        writes: None,
        reads: None,
    };

    if let Some(action) = envelope.chaincode_action() {
        let (reads, writes) = read_write_sets(action)?;
        tx.chaincode_name = Some(action.chaincode_id.name.clone());
        tx.chaincode_version = Some(action.chaincode_id.version.clone());
        tx.response_status = Some(action.response.status);
        tx.response = Some(try_json_decode(&action.response.payload));
        tx.writes = Some(writes);
        tx.reads = Some(reads);
    }

    Ok(tx)
}

/// Flatten every namespace's read/write set. Later namespaces win on key clashes.
fn read_write_sets(action: &ChaincodeAction) -> Result<(ChaincodeReads, ChaincodeWrites)> {
    let mut reads = ChaincodeReads::new();
    let mut writes = ChaincodeWrites::new();

    for ns in &action.results.ns_rwset {
        for read in &ns.rwset.reads {
            let version = match &read.version {
                Some(v) => Some(ReadVersion {
                    block: parse_height(&v.block_num)
                        .with_context(|| format!("read version of {:?}", read.key))?,
                    transaction: parse_height(&v.tx_num)
                        .with_context(|| format!("read version of {:?}", read.key))?,
                }),
                None => None,
            };
            reads.insert(read.key.clone(), version);
        }
        for write in &ns.rwset.writes {
            let value = (!write.is_delete).then(|| try_json_decode(&write.value));
            writes.insert(write.key.clone(), value);
        }
    }

    Ok((reads, writes))
}
