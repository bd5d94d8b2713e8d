mod common;

use common::{block_event, config_envelope, invoke_envelope, simple_block, ts, tx_id, FlakyDatabase};
use ledger_explorer::store::DatabaseAdapter;
use ledger_explorer::sync::{BlockIngestor, BlockOutcome, EventOutcome};
use ledger_explorer::types::*;
use ledger_explorer::watermark::WatermarkCache;
use ledger_explorer::DeliveryError;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn ingestor(db: &Arc<dyn DatabaseAdapter>) -> (BlockIngestor, Arc<WatermarkCache>) {
    let cache = Arc::new(WatermarkCache::new(Arc::clone(db)));
    (BlockIngestor::new(Arc::clone(db), Arc::clone(&cache)), cache)
}

async fn counts(db: &Arc<dyn DatabaseAdapter>, channel: &str) -> anyhow::Result<(usize, usize)> {
    let blocks = db
        .get_blocks(&BlockQuery {
            page: Page::new(1, 100, BlockSort::Height, Direction::Asc),
            filter: BlockFilter {
                channel_name: Some(channel.into()),
                ..Default::default()
            },
        })
        .await?;
    let txs = db
        .get_transactions(&TransactionQuery {
            page: Page::new(1, 100, TransactionSort::Id, Direction::Asc),
            filter: TransactionFilter {
                channel_name: Some(channel.into()),
                ..Default::default()
            },
        })
        .await?;
    Ok((blocks.len(), txs.len()))
}

fn scenario_block() -> ledger_explorer::event::BlockEvent {
    block_event(
        "demo",
        1,
        vec![
            invoke_envelope("demo", &tx_id("demo", 1, 0), ts(1), "marbles", &[("A", &br#""100""#[..])]),
            config_envelope("demo", &tx_id("demo", 1, 1), ts(1)),
        ],
    )
}

#[tokio::test]
async fn new_block_is_persisted() -> anyhow::Result<()> {
    let (db, _tmp) = common::sqlite_db(&["demo"]).await?;
    let (ingestor, cache) = ingestor(&db);

    let outcome = ingestor.on_block("demo", &scenario_block()).await?;
    assert_eq!(outcome, BlockOutcome::Ingested { height: 1, transactions: 2 });

    let block = db.get_block_by_id(&common::block_hash("demo", 1)).await?;
    assert_eq!(block.height, 1);
    assert_eq!(block.transaction_count, 2);
    assert_eq!(block.timestamp, ts(1));

    let invoke = db.get_transaction_by_id(&tx_id("demo", 1, 0)).await?;
    assert_eq!(invoke.chaincode_name.as_deref(), Some("marbles"));
    let writes = invoke.writes.expect("writes recorded");
    assert_eq!(writes["A"], Some(Decoded::Decoded(serde_json::json!("100"))));

    let config = db.get_transaction_by_id(&tx_id("demo", 1, 1)).await?;
    assert_eq!(config.chaincode_name, None);
    assert_eq!(config.chaincode_version, None);
    assert_eq!(config.response_status, None);
    assert_eq!(config.response, None);
    assert_eq!(config.writes, None);
    assert_eq!(config.reads, None);

    let entry = cache.entry("demo").expect("cached");
    assert_eq!(entry.channel.height, 1);
    assert!(entry.dirty);
    // write-behind: the stored channel row has not moved yet
    assert_eq!(db.get_channel("demo").await?.height, 0);
    Ok(())
}

#[tokio::test]
async fn redelivered_block_is_skipped() -> anyhow::Result<()> {
    let (db, _tmp) = common::sqlite_db(&["demo"]).await?;
    let (ingestor, cache) = ingestor(&db);

    ingestor.on_block("demo", &scenario_block()).await?;
    let again = ingestor.on_block("demo", &scenario_block()).await?;
    assert_eq!(again, BlockOutcome::Skipped { height: 1, watermark: 1 });

    assert_eq!(counts(&db, "demo").await?, (1, 2));
    assert_eq!(cache.get_height("demo").await?, 1);
    Ok(())
}

#[tokio::test]
async fn block_at_watermark_is_skipped_next_one_is_not() -> anyhow::Result<()> {
    let (db, _tmp) = common::sqlite_db(&["demo"]).await?;
    db.update_channel(&Channel {
        name: "demo".into(),
        height: 5,
        last_hash: common::block_hash("demo", 5),
    })
    .await?;
    let (ingestor, cache) = ingestor(&db);

    assert_eq!(
        ingestor.on_block("demo", &simple_block("demo", 5, "marbles")).await?,
        BlockOutcome::Skipped { height: 5, watermark: 5 }
    );
    assert_eq!(
        ingestor.on_block("demo", &simple_block("demo", 4, "marbles")).await?,
        BlockOutcome::Skipped { height: 4, watermark: 5 }
    );
    assert_eq!(counts(&db, "demo").await?, (0, 0));

    assert_eq!(
        ingestor.on_block("demo", &simple_block("demo", 6, "marbles")).await?,
        BlockOutcome::Ingested { height: 6, transactions: 1 }
    );
    assert_eq!(cache.get_height("demo").await?, 6);
    assert_eq!(counts(&db, "demo").await?, (1, 1));
    Ok(())
}

#[tokio::test]
async fn empty_block_uses_ingestion_time() -> anyhow::Result<()> {
    let (db, _tmp) = common::sqlite_db(&["demo"]).await?;
    let (ingestor, _cache) = ingestor(&db);

    let before = chrono::Utc::now();
    let outcome = ingestor.on_block("demo", &block_event("demo", 1, vec![])).await?;
    assert_eq!(outcome, BlockOutcome::Ingested { height: 1, transactions: 0 });

    let block = db.get_block_by_id(&common::block_hash("demo", 1)).await?;
    assert_eq!(block.transaction_count, 0);
    assert!(block.timestamp >= before - chrono::Duration::seconds(1));
    Ok(())
}

#[tokio::test]
async fn failed_write_leaves_watermark_and_retries() -> anyhow::Result<()> {
    let (inner, _tmp) = common::sqlite_db(&["demo"]).await?;
    let flaky = Arc::new(FlakyDatabase::new(inner));
    let db: Arc<dyn DatabaseAdapter> = flaky.clone();
    let (ingestor, cache) = ingestor(&db);

    flaky.fail_block_writes.store(true, Ordering::SeqCst);
    let outcome = ingestor
        .on_event("demo", Ok(simple_block("demo", 1, "marbles")))
        .await;
    assert_eq!(outcome, EventOutcome::ProcessingFailed);
    assert_eq!(cache.get_height("demo").await?, 0);
    // the transaction made it, the block did not
    assert_eq!(counts(&db, "demo").await?, (0, 1));

    // redelivery after recovery completes the block without duplicating the transaction
    flaky.fail_block_writes.store(false, Ordering::SeqCst);
    let outcome = ingestor
        .on_event("demo", Ok(simple_block("demo", 1, "marbles")))
        .await;
    assert_eq!(
        outcome,
        EventOutcome::Block(BlockOutcome::Ingested { height: 1, transactions: 1 })
    );
    assert_eq!(counts(&db, "demo").await?, (1, 1));
    assert_eq!(cache.get_height("demo").await?, 1);
    Ok(())
}

#[tokio::test]
async fn delivery_error_is_reported_not_raised() -> anyhow::Result<()> {
    let (db, _tmp) = common::sqlite_db(&["demo"]).await?;
    let (ingestor, cache) = ingestor(&db);

    let outcome = ingestor
        .on_event("demo", Err(DeliveryError::new("peer went away")))
        .await;
    assert_eq!(outcome, EventOutcome::DeliveryFailed);
    assert_eq!(cache.get_height("demo").await?, 0);
    Ok(())
}

#[tokio::test]
async fn malformed_block_number_is_a_processing_failure() -> anyhow::Result<()> {
    let (db, _tmp) = common::sqlite_db(&["demo"]).await?;
    let (ingestor, _cache) = ingestor(&db);

    let mut event = simple_block("demo", 1, "marbles");
    event.header.number = "one".into();
    assert_eq!(
        ingestor.on_event("demo", Ok(event)).await,
        EventOutcome::ProcessingFailed
    );
    assert_eq!(counts(&db, "demo").await?, (0, 0));
    Ok(())
}

#[tokio::test]
async fn channels_advance_independently() -> anyhow::Result<()> {
    let (db, _tmp) = common::sqlite_db(&["demo", "audit"]).await?;
    let (ingestor, cache) = ingestor(&db);

    for h in 1..=3 {
        ingestor.on_block("demo", &simple_block("demo", h, "marbles")).await?;
    }
    ingestor.on_block("audit", &simple_block("audit", 1, "fabcar")).await?;

    assert_eq!(cache.get_height("demo").await?, 3);
    assert_eq!(cache.get_height("audit").await?, 1);
    assert_eq!(counts(&db, "demo").await?, (3, 3));
    assert_eq!(counts(&db, "audit").await?, (1, 1));
    Ok(())
}
