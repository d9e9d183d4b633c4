mod common;

use common::{harness, timeout, timeout_cert};
use mnbft::consensus::{ConsensusError, RoundState};
use mnbft::countdown::TimerCommand;
use mnbft::types::{ConsensusMessage, Round, SyncInfo};
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

fn assert_not_behind(before: &RoundState, after: &RoundState) {
    assert!(after.current_round >= before.current_round);
    assert!(after.highest_qc_round() >= before.highest_qc_round());
    assert!(after.highest_tc_round() >= before.highest_tc_round());
}

/// Late timeouts for a round that already ended are rejected, anything else
/// is a failure.
fn accept_timeout(result: Result<(), ConsensusError>, round: Round) {
    match result {
        Ok(()) => {}
        Err(ConsensusError::RoundMismatch { incoming, .. }) => assert_eq!(incoming, round),
        Err(e) => panic!("Unexpected timeout error: {:?}", e),
    }
}

#[test]
fn test_concurrent_timeouts_and_sync_info_advance_once() {
    let mut h = harness(5, 0);

    for round in 1..=10 {
        let competing = SyncInfo {
            highest_quorum_cert: h.engine.round_state().highest_quorum_cert,
            highest_timeout_cert: Some(timeout_cert(&h.keys[1..], round, 0)),
        };
        let timeouts: Vec<_> = h.keys.iter().map(|k| timeout(k, round)).collect();
        let barrier = Barrier::new(timeouts.len() + 2);
        let engine = &h.engine;
        let chain = &h.chain;
        let barrier = &barrier;

        thread::scope(|s| {
            for t in timeouts {
                s.spawn(move || {
                    barrier.wait();
                    accept_timeout(engine.timeout_handler(chain, t), round);
                });
            }
            s.spawn(move || {
                barrier.wait();
                engine.sync_info_handler(chain, competing).unwrap();
            });
            s.spawn(move || {
                barrier.wait();
                let mut last = engine.round_state();
                while last.current_round <= round {
                    let now = engine.round_state();
                    assert_not_behind(&last, &now);
                    last = now;
                }
            });
        });

        let state = h.engine.round_state();
        assert_eq!(state.current_round, round + 1);
        assert_eq!(state.highest_tc_round(), round);
        assert_eq!(
            h.drain_timer(),
            vec![TimerCommand::Reset {
                round: round + 1,
                period: Duration::from_secs(30)
            }]
        );
        assert!(h.engine.received_timeouts().is_empty());
    }
}

#[test]
fn test_countdown_races_incoming_timeouts() {
    let mut h = harness(5, 0);
    h.advance_to(4);

    let timeouts: Vec<_> = h.keys[1..].iter().map(|k| timeout(k, 4)).collect();
    let barrier = Barrier::new(timeouts.len() + 1);
    let engine = &h.engine;
    let chain = &h.chain;
    let barrier = &barrier;

    thread::scope(|s| {
        for t in timeouts {
            s.spawn(move || {
                barrier.wait();
                accept_timeout(engine.timeout_handler(chain, t), 4);
            });
        }
        s.spawn(move || {
            barrier.wait();
            engine.on_countdown_timeout(chain).unwrap();
        });
    });

    let state = h.engine.round_state();
    assert_eq!(state.current_round, 5);
    assert_eq!(state.highest_tc_round(), 4);
    assert_eq!(
        h.drain_timer(),
        vec![TimerCommand::Reset {
            round: 5,
            period: Duration::from_secs(30)
        }]
    );

    // Our own timeout went out for whichever round the countdown saw.
    let sent: Vec<Round> = h
        .drain_outbound()
        .into_iter()
        .filter_map(|m| match m {
            ConsensusMessage::Timeout(t) => Some(t.round),
            _ => None,
        })
        .collect();
    assert_eq!(sent.len(), 1);
    assert!(sent[0] == 4 || sent[0] == 5);
}
