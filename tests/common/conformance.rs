//! Behaviour every `DatabaseAdapter` backend must share. Channel names are
//! prefixed so the suite can run against a long-lived server.
use chrono::Utc;
use ledger_explorer::store::{DatabaseAdapter, InsertOutcome};
use ledger_explorer::transform::{transform_block, BlockRecords};
use ledger_explorer::types::*;

use super::{block_event, block_hash, config_envelope, invoke_envelope, simple_block, ts, tx_id};

fn records(channel: &str, height: u64, chaincode: &str) -> anyhow::Result<BlockRecords> {
    transform_block(&simple_block(channel, height, chaincode), channel, Utc::now())
}

async fn store(db: &dyn DatabaseAdapter, r: &BlockRecords) -> anyhow::Result<()> {
    for tx in &r.transactions {
        db.add_transaction(tx).await?;
    }
    db.add_block(&r.block).await?;
    Ok(())
}

fn heights(blocks: &[Block]) -> Vec<u64> {
    blocks.iter().map(|b| b.height).collect()
}

/// Run the whole contract. `db` must be connected; `setup` is exercised here.
pub async fn run(db: &dyn DatabaseAdapter, prefix: &str) -> anyhow::Result<()> {
    let demo = format!("{prefix}demo");
    let audit = format!("{prefix}audit");

    channels(db, &demo, &audit).await?;
    idempotent_inserts(db, &demo).await?;
    listings(db, &demo, &audit).await?;
    Ok(())
}

async fn channels(db: &dyn DatabaseAdapter, demo: &str, audit: &str) -> anyhow::Result<()> {
    let names = vec![demo.to_owned(), audit.to_owned()];
    db.setup(&names).await?;
    // setup is repeatable and never resets a channel
    db.setup(&names).await?;

    assert_eq!(db.get_channel(demo).await?, Channel::empty(demo));
    let all = db.get_channels().await?;
    assert!(all.iter().any(|c| c.name == demo));
    assert!(all.iter().any(|c| c.name == audit));

    let missing = db.get_channel(&format!("{demo}-missing")).await.unwrap_err();
    assert!(missing.is_not_found(), "got {missing:?}");

    // update only moves forward
    let at = |height: u64| Channel {
        name: demo.to_owned(),
        height,
        last_hash: block_hash(demo, height),
    };
    assert!(db.update_channel(&at(5)).await?);
    assert!(!db.update_channel(&at(3)).await?);
    assert!(!db.update_channel(&at(5)).await?);
    assert_eq!(db.get_channel(demo).await?, at(5));

    db.setup(&names).await?;
    assert_eq!(db.get_channel(demo).await?.height, 5, "setup must not reset height");
    Ok(())
}

async fn idempotent_inserts(db: &dyn DatabaseAdapter, demo: &str) -> anyhow::Result<()> {
    let event = block_event(
        demo,
        100,
        vec![
            invoke_envelope(demo, &tx_id(demo, 100, 0), ts(100), "marbles", &[("A", &br#""100""#[..])]),
            config_envelope(demo, &tx_id(demo, 100, 1), ts(100)),
        ],
    );
    let r = transform_block(&event, demo, Utc::now())?;

    for tx in &r.transactions {
        assert_eq!(db.add_transaction(tx).await?, InsertOutcome::Inserted);
        assert_eq!(db.add_transaction(tx).await?, InsertOutcome::AlreadyExists);
        assert_eq!(&db.get_transaction_by_id(&tx.id).await?, tx);
    }
    assert_eq!(db.add_block(&r.block).await?, InsertOutcome::Inserted);
    assert_eq!(db.add_block(&r.block).await?, InsertOutcome::AlreadyExists);
    assert_eq!(db.get_block_by_id(&r.block.id).await?, r.block);

    let invoke = db.get_transaction_by_id(&tx_id(demo, 100, 0)).await?;
    assert_eq!(invoke.chaincode_name.as_deref(), Some("marbles"));
    let writes = invoke.writes.expect("invocation has writes");
    assert_eq!(
        writes.get("A"),
        Some(&Some(Decoded::Decoded(serde_json::json!("100"))))
    );

    let config = db.get_transaction_by_id(&tx_id(demo, 100, 1)).await?;
    assert_eq!(config.chaincode_name, None);
    assert_eq!(config.writes, None);
    assert_eq!(config.response, None);

    let err = db.get_block_by_id(&block_hash(demo, 9_999)).await.unwrap_err();
    assert!(err.is_not_found(), "got {err:?}");
    let err = db.get_transaction_by_id(&tx_id(demo, 9_999, 0)).await.unwrap_err();
    assert!(err.is_not_found(), "got {err:?}");

    let in_block = db
        .get_block_transactions(&r.block.id, &Page::new(1, 10, TransactionSort::Id, Direction::Asc))
        .await?;
    assert_eq!(in_block.len(), 2);
    assert_eq!(in_block[0].id, tx_id(demo, 100, 0));
    Ok(())
}

async fn listings(db: &dyn DatabaseAdapter, demo: &str, audit: &str) -> anyhow::Result<()> {
    for height in 1..=3 {
        let chaincode = if height == 2 { "fabcar" } else { "marbles" };
        store(db, &records(demo, height, chaincode)?).await?;
    }
    store(db, &records(audit, 1, "fabcar")?).await?;

    let by_channel = |name: &str, page: Page<BlockSort>| BlockQuery {
        page,
        filter: BlockFilter {
            channel_name: Some(name.to_owned()),
            ..Default::default()
        },
    };

    // the idempotency block at height 100 is on this channel too
    let blocks = db
        .get_blocks(&by_channel(demo, Page::new(1, 10, BlockSort::Height, Direction::Desc)))
        .await?;
    assert_eq!(heights(&blocks), vec![100, 3, 2, 1]);

    let asc = db
        .get_blocks(&by_channel(demo, Page::new(1, 10, BlockSort::Height, Direction::Asc)))
        .await?;
    assert_eq!(heights(&asc), vec![1, 2, 3, 100]);

    // consecutive pages are disjoint and concatenate to the full ordering
    let first = db
        .get_blocks(&by_channel(demo, Page::new(1, 2, BlockSort::Height, Direction::Desc)))
        .await?;
    let second = db
        .get_blocks(&by_channel(demo, Page::new(2, 2, BlockSort::Height, Direction::Desc)))
        .await?;
    let third = db
        .get_blocks(&by_channel(demo, Page::new(3, 2, BlockSort::Height, Direction::Desc)))
        .await?;
    assert_eq!(heights(&first), vec![100, 3]);
    assert_eq!(heights(&second), vec![2, 1]);
    assert!(third.is_empty());

    let exact = db
        .get_blocks(&BlockQuery {
            filter: BlockFilter {
                channel_name: Some(demo.to_owned()),
                height: Some(2),
                ..Default::default()
            },
            ..Default::default()
        })
        .await?;
    assert_eq!(heights(&exact), vec![2]);

    let with_fabcar = db
        .get_blocks(&BlockQuery {
            page: Page::new(1, 10, BlockSort::Height, Direction::Asc),
            filter: BlockFilter {
                channel_name: Some(demo.to_owned()),
                chaincode_name: Some("fabcar".into()),
                ..Default::default()
            },
        })
        .await?;
    assert_eq!(heights(&with_fabcar), vec![2]);

    let by_time = db
        .get_blocks(&by_channel(audit, Page::default()))
        .await?;
    assert_eq!(heights(&by_time), vec![1]);

    let txs = db
        .get_transactions(&TransactionQuery {
            page: Page::new(1, 10, TransactionSort::BlockHeight, Direction::Asc),
            filter: TransactionFilter {
                channel_name: Some(demo.to_owned()),
                chaincode_name: Some("marbles".into()),
                ..Default::default()
            },
        })
        .await?;
    let tx_heights: Vec<u64> = txs.iter().map(|t| t.block_height).collect();
    assert_eq!(tx_heights, vec![1, 3, 100]);

    let by_hash = db
        .get_transactions(&TransactionQuery {
            filter: TransactionFilter {
                block_hash: Some(block_hash(demo, 3)),
                ..Default::default()
            },
            ..Default::default()
        })
        .await?;
    assert_eq!(by_hash.len(), 1);
    assert_eq!(by_hash[0].id, tx_id(demo, 3, 0));

    let by_height = db
        .get_transactions(&TransactionQuery {
            filter: TransactionFilter {
                channel_name: Some(audit.to_owned()),
                block_height: Some(1),
                ..Default::default()
            },
            ..Default::default()
        })
        .await?;
    assert_eq!(by_height.len(), 1);
    assert_eq!(by_height[0].channel_name, audit);

    let none = db
        .get_transactions(&TransactionQuery {
            filter: TransactionFilter {
                id: Some(tx_id(audit, 42, 0)),
                ..Default::default()
            },
            ..Default::default()
        })
        .await?;
    assert!(none.is_empty());
    Ok(())
}
