mod common;

use common::{harness, harness_with, timeout};
use mnbft::chain::ChainReader;
use mnbft::config::ConsensusConfig;
use mnbft::consensus::ConsensusError;
use mnbft::countdown::{CountdownTimer, TimerCommand};
use mnbft::crypto::{Signature, generate_keypair_from_id};
use mnbft::pool::TimeoutPoolKey;
use mnbft::types::{ConsensusMessage, Round};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_fourth_timeout_forms_tc_and_advances_round() {
    let mut h = harness(5, 0);
    h.advance_to(7);

    // Three of five: 3 < 5 * 0.667
    for key in &h.keys[..3] {
        h.engine.timeout_handler(&h.chain, timeout(key, 7)).unwrap();
    }
    assert_eq!(h.engine.current_round(), 7);
    assert_eq!(h.engine.round_state().highest_tc_round(), 6);
    let pooled = h.engine.received_timeouts();
    assert_eq!(
        pooled[&TimeoutPoolKey {
            round: 7,
            gap_number: 0
        }]
            .len(),
        3
    );
    assert!(h.drain_timer().is_empty());

    // The fourth crosses the threshold.
    h.engine
        .timeout_handler(&h.chain, timeout(&h.keys[3], 7))
        .unwrap();

    let state = h.engine.round_state();
    assert_eq!(state.current_round, 8);
    let tc = state.highest_timeout_cert.unwrap();
    assert_eq!(tc.round, 7);
    assert_eq!(tc.signatures.len(), 4);
    assert_eq!(
        h.drain_timer(),
        vec![TimerCommand::Reset {
            round: 8,
            period: Duration::from_secs(30)
        }]
    );
    // A new round starts with an empty timeout pool.
    assert!(h.engine.received_timeouts().is_empty());
}

#[test]
fn test_repeated_signer_counts_once() {
    let h = harness(5, 0);
    for key in &h.keys[..3] {
        h.engine.timeout_handler(&h.chain, timeout(key, 1)).unwrap();
    }
    h.engine
        .timeout_handler(&h.chain, timeout(&h.keys[0], 1))
        .unwrap();
    assert_eq!(h.engine.current_round(), 1);
}

#[test]
fn test_timeout_for_other_round_is_rejected() {
    let mut h = harness(5, 0);
    h.advance_to(4);

    for round in [3, 5] {
        let err = h
            .engine
            .timeout_handler(&h.chain, timeout(&h.keys[1], round))
            .unwrap_err();
        match err {
            ConsensusError::RoundMismatch {
                kind,
                incoming,
                current,
            } => {
                assert_eq!(kind, "timeout");
                assert_eq!(incoming, round);
                assert_eq!(current, 4);
            }
            other => panic!("Expected RoundMismatch, got {:?}", other),
        }
    }
    assert!(h.engine.received_timeouts().is_empty());
}

#[test]
fn test_verify_timeout_message() {
    let mut h = harness(5, 0);
    h.advance_to(3);

    // Signer is recovered, not trusted.
    let mut incoming = timeout(&h.keys[2], 3);
    incoming.signer = Default::default();
    assert!(h.engine.verify_timeout_message(&h.chain, &mut incoming).unwrap());
    assert_eq!(incoming.signer, h.keys[2].address());

    // Stale rounds are not worth verifying.
    let mut stale = timeout(&h.keys[2], 2);
    assert!(!h.engine.verify_timeout_message(&h.chain, &mut stale).unwrap());

    // Valid signature, but not from a masternode.
    let (_, outsider) = generate_keypair_from_id(99);
    let mut foreign = timeout(&outsider, 3);
    assert!(!h.engine.verify_timeout_message(&h.chain, &mut foreign).unwrap());

    // Signature over a different round.
    let mut forged = timeout(&h.keys[2], 3);
    forged.signature = timeout(&h.keys[2], 4).signature;
    assert!(matches!(
        h.engine.verify_timeout_message(&h.chain, &mut forged),
        Err(ConsensusError::Crypto(_))
    ));

    let mut garbage = timeout(&h.keys[2], 3);
    garbage.signature = Signature(vec![1, 2, 3]);
    assert!(h.engine.verify_timeout_message(&h.chain, &mut garbage).is_err());
}

#[test]
fn test_countdown_sends_timeout_and_periodic_sync_info() {
    let mut h = harness(5, 0);

    // Default sync threshold is 3.
    for _ in 0..3 {
        h.engine.on_countdown_timeout(&h.chain).unwrap();
    }

    let messages = h.drain_outbound();
    assert_eq!(messages.len(), 4);
    for message in &messages[..3] {
        match message {
            ConsensusMessage::Timeout(t) => {
                assert_eq!(t.round, 1);
                assert_eq!(t.gap_number, 0);
                assert_eq!(t.signer, h.keys[0].address());
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
    }
    match &messages[3] {
        ConsensusMessage::SyncInfo(sync_info) => {
            assert_eq!(sync_info.highest_quorum_cert.round(), 0);
            assert!(sync_info.highest_timeout_cert.is_none());
        }
        other => panic!("Expected SyncInfo, got {:?}", other),
    }

    // Our own timeout is counted once however often we send it.
    let pooled = h.engine.received_timeouts();
    assert_eq!(pooled.values().map(|b| b.len()).sum::<usize>(), 1);
    assert_eq!(h.engine.current_round(), 1);
}

#[test]
fn test_countdown_completes_tc_with_own_timeout() {
    let mut h = harness(5, 0);
    for key in &h.keys[1..4] {
        h.engine.timeout_handler(&h.chain, timeout(key, 1)).unwrap();
    }
    assert_eq!(h.engine.current_round(), 1);

    h.engine.on_countdown_timeout(&h.chain).unwrap();
    assert_eq!(h.engine.current_round(), 2);
    assert!(matches!(
        h.drain_outbound().as_slice(),
        [ConsensusMessage::Timeout(t)] if t.round == 1
    ));
}

#[test]
fn test_non_masternode_does_not_send() {
    let mut h = harness(5, 42);
    h.engine.on_countdown_timeout(&h.chain).unwrap();
    assert!(h.drain_outbound().is_empty());
    assert!(h.engine.received_timeouts().is_empty());
}

#[test]
fn test_timeout_gap_number_follows_epoch_switch() {
    let config = ConsensusConfig {
        epoch: 10,
        gap: 5,
        ..ConsensusConfig::default()
    };
    let h = harness_with(config, 5, 0);
    for round in 1..=29 {
        h.chain.extend(round);
    }
    let head = h.chain.current_header();
    assert_eq!(head.number, 29);

    // Round 30 opens an epoch: the next block is 30, boundary 30.
    assert!(h.engine.is_epoch_switch_at_round(30, &head));
    assert_eq!(h.engine.timeout_gap_number(&h.chain, 30).unwrap(), 25);

    // Round 29 stays in the epoch whose switch block is 20.
    assert!(!h.engine.is_epoch_switch_at_round(29, &head));
    assert_eq!(h.engine.timeout_gap_number(&h.chain, 29).unwrap(), 15);

    // The switch block itself always opens an epoch.
    let genesis = h.chain.header_by_number(0).unwrap();
    assert!(h.engine.is_epoch_switch_at_round(5, &genesis));
}

#[tokio::test]
async fn test_countdown_timer_drives_timeouts() {
    let mut config = ConsensusConfig::default();
    config.v2.configs.get_mut(&0).unwrap().timeout_period_secs = 1;
    let mut h = harness_with(config, 5, 0);

    let engine = h.engine.clone();
    let chain = h.chain.clone();
    let (handle, commands) = mnbft::countdown::channel();
    let timer = CountdownTimer::new(
        commands,
        Arc::new(move |_: Round| {
            engine.on_countdown_timeout(&chain).unwrap();
        }),
    )
    .spawn();

    handle.reset(h.engine.current_round(), Duration::from_secs(1));
    let message = tokio::time::timeout(Duration::from_secs(5), h.outbound.recv())
        .await
        .expect("countdown never fired")
        .unwrap();
    assert!(matches!(message, ConsensusMessage::Timeout(t) if t.round == 1));

    handle.stop();
    timer.await.unwrap();
}
