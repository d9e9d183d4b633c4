mod common;

use common::{harness, quorum_cert, vote};
use mnbft::types::SyncInfo;
use std::time::Duration;

#[test]
fn test_hygiene_keeps_recent_votes() {
    let mut h = harness(5, 0);
    for round in [1, 2] {
        h.engine
            .vote_handler(&h.chain, vote(&h.keys[0], h.block(round, 1)))
            .unwrap();
    }
    // Nothing is stale this early.
    assert_eq!(h.engine.hygiene_vote_pool(), 0);

    h.advance_to(12);
    h.engine
        .vote_handler(&h.chain, vote(&h.keys[0], h.block(12, 1)))
        .unwrap();

    // Lower bound 12 - 10 = 2: round 1 goes, round 2 stays.
    assert_eq!(h.engine.hygiene_vote_pool(), 1);
    let mut rounds: Vec<u64> = h.engine.received_votes().keys().map(|k| k.round).collect();
    rounds.sort();
    assert_eq!(rounds, vec![2, 12]);
}

#[test]
fn test_hygiene_sync_info_pool() {
    let mut h = harness(5, 0);
    // Buffered even though it carries nothing new.
    h.engine
        .sync_info_handler(&h.chain, h.engine.build_sync_info())
        .unwrap();

    h.advance_to(20);
    let recent = SyncInfo {
        highest_quorum_cert: quorum_cert(&h.keys[..4], h.block(15, 3), 0),
        highest_timeout_cert: None,
    };
    h.engine.sync_info_handler(&h.chain, recent).unwrap();
    assert_eq!(h.engine.received_sync_info().len(), 2);

    h.engine.run_pool_hygiene();
    let kept: Vec<u64> = h
        .engine
        .received_sync_info()
        .keys()
        .map(|k| k.qc_round)
        .collect();
    assert_eq!(kept, vec![15]);
}

#[tokio::test]
async fn test_periodic_hygiene_job() {
    let mut h = harness(5, 0);
    h.engine
        .vote_handler(&h.chain, vote(&h.keys[0], h.block(1, 1)))
        .unwrap();
    h.advance_to(30);

    let job = h.engine.spawn_periodic_hygiene(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(200)).await;
    job.abort();

    assert!(h.engine.received_votes().is_empty());
}
