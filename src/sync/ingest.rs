//! Per-block ingestion: transform, dedup against the watermark, persist.
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::DeliveryError;
use crate::event::BlockEvent;
use crate::store::{DatabaseAdapter, InsertOutcome};
use crate::transform::transform_block;
use crate::watermark::WatermarkCache;

/// Result of processing one delivered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Persisted and the watermark advanced.
    Ingested { height: u64, transactions: usize },
    /// At or below the watermark; nothing was written.
    Skipped { height: u64, watermark: u64 },
}

/// Result of handling one item from a subscription stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Block(BlockOutcome),
    /// The client reported a delivery error.
    DeliveryFailed,
    /// Transforming or persisting failed; the watermark did not move.
    ProcessingFailed,
}

fn short_id(id: &str) -> &str {
    id.get(..16).unwrap_or(id)
}

/// Persists delivered blocks. Cheap to clone; one per engine, shared by all listeners.
#[derive(Clone)]
pub struct BlockIngestor {
    database: Arc<dyn DatabaseAdapter>,
    cache: Arc<WatermarkCache>,
}

impl BlockIngestor {
    pub fn new(database: Arc<dyn DatabaseAdapter>, cache: Arc<WatermarkCache>) -> Self {
        Self { database, cache }
    }

    /// Handle one subscription item. Never fails: errors are logged and
    /// reported through the outcome.
    pub async fn on_event(
        &self,
        channel: &str,
        item: Result<BlockEvent, DeliveryError>,
    ) -> EventOutcome {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                error!(channel = %channel, error = %e, "block event error");
                return EventOutcome::DeliveryFailed;
            }
        };

        match self.on_block(channel, &event).await {
            Ok(outcome) => EventOutcome::Block(outcome),
            Err(e) => {
                error!(channel = %channel, block = %event.header.number, error = ?e, "unhandled block error");
                EventOutcome::ProcessingFailed
            }
        }
    }

    /// Transform `event` and persist it unless it is at or below the
    /// channel's watermark. Transactions are written before the block, and
    /// the watermark only advances once both are stored.
    pub async fn on_block(&self, channel: &str, event: &BlockEvent) -> anyhow::Result<BlockOutcome> {
        let records = transform_block(event, channel, Utc::now()).context("transform block")?;
        let height = records.block.height;
        let hash = records.block.id.as_str();

        let watermark = self
            .cache
            .get_height(channel)
            .await
            .context("load channel watermark")?;
        if height <= watermark {
            debug!(channel = %channel, height, block = %short_id(hash), "skipped block");
            return Ok(BlockOutcome::Skipped { height, watermark });
        }

        info!(channel = %channel, height, block = %short_id(hash), "new block");

        for tx in &records.transactions {
            let outcome = self
                .database
                .add_transaction(tx)
                .await
                .with_context(|| format!("store transaction {}", tx.id))?;
            match outcome {
                InsertOutcome::Inserted => {
                    debug!(channel = %tx.channel_name, height, tx = %short_id(&tx.id), "new transaction")
                }
                InsertOutcome::AlreadyExists => {
                    debug!(channel = %tx.channel_name, height, tx = %short_id(&tx.id), "transaction already stored")
                }
            }
        }

        self.database
            .add_block(&records.block)
            .await
            .with_context(|| format!("store block {hash}"))?;

        self.cache.advance(channel, height, hash);

        Ok(BlockOutcome::Ingested {
            height,
            transactions: records.transactions.len(),
        })
    }
}
