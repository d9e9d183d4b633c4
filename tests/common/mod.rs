#![allow(dead_code)]

use mnbft::chain::{ChainReader, MemChain};
use mnbft::config::ConsensusConfig;
use mnbft::consensus::BftEngine;
use mnbft::countdown::{self, TimerCommand};
use mnbft::crypto::{PrivateKey, generate_keypair_from_id, sign};
use mnbft::types::{
    Address, BlockInfo, ConsensusMessage, QuorumCert, Round, Timeout, TimeoutCert, Vote,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct Harness {
    pub chain: MemChain,
    pub keys: Vec<PrivateKey>,
    pub engine: Arc<BftEngine>,
    pub outbound: UnboundedReceiver<ConsensusMessage>,
    pub timer: UnboundedReceiver<TimerCommand>,
}

/// `validators` masternodes with keys 0..validators; the engine signs with key `me`.
pub fn harness(validators: u64, me: u64) -> Harness {
    harness_with(ConsensusConfig::default(), validators, me)
}

pub fn harness_with(config: ConsensusConfig, validators: u64, me: u64) -> Harness {
    let keys: Vec<PrivateKey> = (0..validators)
        .map(|i| generate_keypair_from_id(i).1)
        .collect();
    let masternodes: Vec<Address> = keys.iter().map(PrivateKey::address).collect();
    let chain = MemChain::new(masternodes, config.epoch);
    let genesis = QuorumCert::genesis(chain.current_header().block_info());

    let (broadcaster, outbound) = tokio::sync::mpsc::unbounded_channel();
    let (timer_handle, timer) = countdown::channel();
    let (_, my_key) = generate_keypair_from_id(me);
    let engine = Arc::new(BftEngine::new(
        config,
        my_key,
        Arc::new(chain.clone()),
        Arc::new(chain.clone()),
        broadcaster,
        timer_handle,
        genesis,
    ));
    Harness {
        chain,
        keys,
        engine,
        outbound,
        timer,
    }
}

impl Harness {
    pub fn drain_timer(&mut self) -> Vec<TimerCommand> {
        let mut commands = vec![];
        while let Ok(c) = self.timer.try_recv() {
            commands.push(c);
        }
        commands
    }

    pub fn drain_outbound(&mut self) -> Vec<ConsensusMessage> {
        let mut messages = vec![];
        while let Ok(m) = self.outbound.try_recv() {
            messages.push(m);
        }
        messages
    }

    /// Move the engine to `round` with a TC for `round - 1`.
    pub fn advance_to(&mut self, round: Round) {
        let tc = timeout_cert(&self.keys[..4], round - 1, 0);
        self.engine.process_tc(&self.chain, &tc).unwrap();
        assert_eq!(self.engine.current_round(), round);
        self.drain_timer();
    }

    /// A block at `round` that the chain knows about.
    pub fn block(&self, round: Round, tag: u8) -> BlockInfo {
        let info = block(round, tag);
        self.chain.import_block(&info);
        info
    }
}

/// A block at `round`, distinct per `(round, tag)`, unknown to any chain.
pub fn block(round: Round, tag: u8) -> BlockInfo {
    BlockInfo {
        hash: mnbft::crypto::hash_data(&("block", round, tag)),
        number: round,
        round,
    }
}

pub fn timeout_cert(keys: &[PrivateKey], round: Round, gap_number: u64) -> TimeoutCert {
    let mut tc = TimeoutCert {
        round,
        gap_number,
        signatures: vec![],
    };
    let digest = tc.sig_hash();
    tc.signatures = keys.iter().map(|k| sign(k, &digest)).collect();
    tc
}

pub fn quorum_cert(keys: &[PrivateKey], block: BlockInfo, gap_number: u64) -> QuorumCert {
    let mut qc = QuorumCert {
        proposed_block_info: block,
        gap_number,
        signatures: vec![],
    };
    let digest = qc.sig_hash();
    qc.signatures = keys.iter().map(|k| sign(k, &digest)).collect();
    qc
}

pub fn timeout(key: &PrivateKey, round: Round) -> Timeout {
    Timeout::signed(round, 0, key)
}

pub fn vote(key: &PrivateKey, block: BlockInfo) -> Vote {
    Vote::signed(block, 0, key)
}
