use crate::chain::{ChainError, ChainReader, EpochSwitchResolver, Snapshot, SnapshotResolver};
use crate::config::{ConsensusConfig, POOL_HYGIENE_ROUND};
use crate::countdown::CountdownHandle;
use crate::crypto::{CryptoError, Hash, PrivateKey, recover_signer};
use crate::pool::{Pool, PoolBucket, VotePoolKey};
use crate::types::{
    Address, BlockInfo, ConsensusMessage, QuorumCert, Round, SyncInfo, Timeout, TimeoutCert, Vote,
};
use crate::verifier::{VerifyError, threshold_reached, verify_certificate_signatures};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Incoming {kind} round {incoming} does not equal current round {current}")]
    RoundMismatch {
        kind: &'static str,
        incoming: Round,
        current: Round,
    },
    #[error("Incoming {kind} round {incoming} is too far from current round {current}")]
    RoundTooFar {
        kind: &'static str,
        incoming: Round,
        current: Round,
    },
    #[error("Invalid QC")]
    InvalidQC,
    #[error("Block {number} ({hash}) is not in the local chain yet")]
    BlockNotSynced { number: u64, hash: Hash },
    #[error("Invalid QC signatures: {0}")]
    InvalidQCSignatures(#[source] VerifyError),
    #[error("Invalid TC")]
    InvalidTC,
    #[error("Invalid TC signatures: {0}")]
    InvalidTCSignatures(#[source] VerifyError),
    #[error("Empty masternode list for gap number {0}")]
    EmptyMasternodes(u64),
    #[error("Chain lookup failed: {0}")]
    Chain(#[from] ChainError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ConsensusError {
    /// The message may verify once the local chain catches up.
    pub fn is_chain_pending(&self) -> bool {
        matches!(
            self,
            ConsensusError::BlockNotSynced { .. }
                | ConsensusError::Chain(ChainError::SnapshotNotFound(_))
                | ConsensusError::Chain(ChainError::HeaderNotFound(_))
        )
    }
}

/// Fire-and-forget sender into the consensus broadcast channel.
pub type Broadcaster = mpsc::UnboundedSender<ConsensusMessage>;

/// How far this node has progressed. Only mutated under the engine lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundState {
    pub current_round: Round,
    pub highest_quorum_cert: QuorumCert,
    pub highest_timeout_cert: Option<TimeoutCert>,
}

impl RoundState {
    pub fn new(highest_quorum_cert: QuorumCert) -> Self {
        Self {
            current_round: highest_quorum_cert.round() + 1,
            highest_quorum_cert,
            highest_timeout_cert: None,
        }
    }

    pub fn highest_qc_round(&self) -> Round {
        self.highest_quorum_cert.round()
    }

    pub fn highest_tc_round(&self) -> Round {
        self.highest_timeout_cert.as_ref().map_or(0, |tc| tc.round)
    }
}

/// Everything guarded by the engine lock.
pub(crate) struct EngineState {
    pub(crate) round: RoundState,
    pub(crate) vote_pool: Pool<Vote>,
    pub(crate) timeout_pool: Pool<Timeout>,
    pub(crate) sync_info_pool: Pool<SyncInfo>,
    /// Local timeouts sent since the last round change.
    pub(crate) timeout_count: u64,
}

/// The round controller: owns round state and the aggregation pools, and
/// serializes every handler behind one lock.
pub struct BftEngine {
    pub(crate) config: ConsensusConfig,
    pub(crate) signing_key: PrivateKey,
    pub(crate) signer: Address,
    pub(crate) snapshots: Arc<dyn SnapshotResolver>,
    pub(crate) epochs: Arc<dyn EpochSwitchResolver>,
    broadcaster: Broadcaster,
    timer: CountdownHandle,
    state: Mutex<EngineState>,
}

impl BftEngine {
    pub fn new(
        config: ConsensusConfig,
        signing_key: PrivateKey,
        snapshots: Arc<dyn SnapshotResolver>,
        epochs: Arc<dyn EpochSwitchResolver>,
        broadcaster: Broadcaster,
        timer: CountdownHandle,
        highest_quorum_cert: QuorumCert,
    ) -> Self {
        let signer = signing_key.address();
        let round = RoundState::new(highest_quorum_cert);
        log::info!(
            "Initialised BFT engine for {}: round {}, highest QC round {}",
            signer,
            round.current_round,
            round.highest_qc_round()
        );
        Self {
            config,
            signing_key,
            signer,
            snapshots,
            epochs,
            broadcaster,
            timer,
            state: Mutex::new(EngineState {
                round,
                vote_pool: Pool::new(),
                timeout_pool: Pool::new(),
                sync_info_pool: Pool::new(),
                timeout_count: 0,
            }),
        }
    }

    /// Arm the countdown for the current round.
    pub fn start(&self) {
        let round = self.lock().round.current_round;
        self.timer.reset(round, self.timeout_period(round));
    }

    pub fn signer(&self) -> Address {
        self.signer
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn round_state(&self) -> RoundState {
        self.lock().round.clone()
    }

    pub fn current_round(&self) -> Round {
        self.lock().round.current_round
    }

    /// Verify an inbound message and hand it to the matching handler.
    /// SyncInfo that cannot be checked against the local chain yet is
    /// buffered for replay instead of dropped.
    pub fn handle_message(
        &self,
        chain: &dyn ChainReader,
        message: ConsensusMessage,
    ) -> Result<(), ConsensusError> {
        match message {
            ConsensusMessage::Vote(mut vote) => {
                if self.verify_vote_message(chain, &mut vote)? {
                    self.vote_handler(chain, vote)?;
                }
            }
            ConsensusMessage::Timeout(mut timeout) => {
                if self.verify_timeout_message(chain, &mut timeout)? {
                    self.timeout_handler(chain, timeout)?;
                }
            }
            ConsensusMessage::SyncInfo(sync_info) => {
                match self.verify_sync_info_message(chain, &sync_info) {
                    Ok(true) => self.sync_info_handler(chain, sync_info)?,
                    Ok(false) => {}
                    Err(e) if e.is_chain_pending() => {
                        log::info!("Buffering SyncInfo until the chain catches up: {}", e);
                        self.buffer_sync_info(sync_info);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn cert_threshold(&self, round: Round) -> f64 {
        self.config.v2.config(round).cert_threshold
    }

    pub(crate) fn timeout_period(&self, round: Round) -> Duration {
        self.config.v2.config(round).timeout_period()
    }

    pub(crate) fn broadcast(&self, message: ConsensusMessage) {
        if self.broadcaster.send(message).is_err() {
            log::warn!("Consensus channel closed, message dropped");
        }
    }

    pub(crate) fn snapshot(
        &self,
        chain: &dyn ChainReader,
        gap_number: u64,
    ) -> Result<Arc<Snapshot>, ConsensusError> {
        let snapshot = self
            .snapshots
            .get_snapshot(chain, gap_number, true)
            .inspect_err(|e| {
                log::error!("Failed to get snapshot for gap number {}: {}", gap_number, e)
            })?;
        if snapshot.masternodes.is_empty() {
            log::error!("Snapshot for gap number {} has no masternodes", gap_number);
            return Err(ConsensusError::EmptyMasternodes(gap_number));
        }
        Ok(snapshot)
    }

    // -------------------------------------------------------------------------
    // Certificates
    // -------------------------------------------------------------------------

    /// Verify `qc` and, if it is newer than the highest known QC, adopt it.
    pub fn process_qc(&self, chain: &dyn ChainReader, qc: &QuorumCert) -> Result<(), ConsensusError> {
        let mut state = self.lock();
        self.verify_and_process_qc(&mut state, chain, qc)
    }

    /// Verify `tc` and, if it is newer than the highest known TC, adopt it.
    pub fn process_tc(&self, chain: &dyn ChainReader, tc: &TimeoutCert) -> Result<(), ConsensusError> {
        let mut state = self.lock();
        self.verify_and_process_tc(&mut state, chain, tc)
    }

    pub(crate) fn verify_and_process_qc(
        &self,
        state: &mut EngineState,
        chain: &dyn ChainReader,
        qc: &QuorumCert,
    ) -> Result<(), ConsensusError> {
        if qc.round() <= state.round.highest_qc_round() {
            log::debug!(
                "Skipping stale QC: round {}, highest QC round {}",
                qc.round(),
                state.round.highest_qc_round()
            );
            return Ok(());
        }
        self.verify_qc(chain, qc)?;
        self.apply_qc(state, qc);
        Ok(())
    }

    pub(crate) fn verify_and_process_tc(
        &self,
        state: &mut EngineState,
        chain: &dyn ChainReader,
        tc: &TimeoutCert,
    ) -> Result<(), ConsensusError> {
        if tc.round <= state.round.highest_tc_round() {
            log::debug!(
                "Skipping stale TC: round {}, highest TC round {}",
                tc.round,
                state.round.highest_tc_round()
            );
            return Ok(());
        }
        self.verify_tc(chain, tc)?;
        self.apply_tc(state, tc);
        Ok(())
    }

    pub(crate) fn verify_qc(&self, chain: &dyn ChainReader, qc: &QuorumCert) -> Result<(), ConsensusError> {
        // Genesis carries no signatures.
        if qc.round() == 0 {
            return Ok(());
        }
        if qc.signatures.is_empty() {
            log::warn!("QC for round {} has no signatures", qc.round());
            return Err(ConsensusError::InvalidQC);
        }
        self.verify_proposed_block(chain, &qc.proposed_block_info)?;
        let snapshot = self.snapshot(chain, qc.gap_number)?;
        verify_certificate_signatures(
            &qc.sig_hash(),
            &qc.signatures,
            &snapshot.masternodes,
            self.cert_threshold(qc.round()),
        )
        .map_err(|e| {
            log::warn!(
                "QC verification failed: round {}, block {}, gap {}: {}",
                qc.round(),
                qc.proposed_block_info.number,
                qc.gap_number,
                e
            );
            ConsensusError::InvalidQCSignatures(e)
        })
    }

    /// The certified block must be known locally and agree on number and round.
    fn verify_proposed_block(
        &self,
        chain: &dyn ChainReader,
        info: &BlockInfo,
    ) -> Result<(), ConsensusError> {
        let header = chain.header_by_hash(&info.hash).ok_or_else(|| {
            log::debug!("QC block {} ({}) not found locally", info.number, info.hash);
            ConsensusError::BlockNotSynced {
                number: info.number,
                hash: info.hash,
            }
        })?;
        if header.number != info.number || header.round != info.round {
            log::warn!(
                "QC block {} mismatch: number {} round {}, local number {} round {}",
                info.hash,
                info.number,
                info.round,
                header.number,
                header.round
            );
            return Err(ConsensusError::InvalidQC);
        }
        Ok(())
    }

    pub(crate) fn verify_tc(&self, chain: &dyn ChainReader, tc: &TimeoutCert) -> Result<(), ConsensusError> {
        if tc.signatures.is_empty() {
            log::warn!("TC for round {} has no signatures", tc.round);
            return Err(ConsensusError::InvalidTC);
        }
        let snapshot = self.snapshot(chain, tc.gap_number)?;
        verify_certificate_signatures(
            &tc.sig_hash(),
            &tc.signatures,
            &snapshot.masternodes,
            self.cert_threshold(tc.round),
        )
        .map_err(|e| {
            log::warn!(
                "TC verification failed: round {}, gap {}: {}",
                tc.round,
                tc.gap_number,
                e
            );
            ConsensusError::InvalidTCSignatures(e)
        })
    }

    /// Adopt an already verified QC.
    fn apply_qc(&self, state: &mut EngineState, qc: &QuorumCert) {
        if qc.round() > state.round.highest_qc_round() {
            log::info!(
                "New highest QC: round {}, block {}",
                qc.round(),
                qc.proposed_block_info.number
            );
            state.round.highest_quorum_cert = qc.clone();
        }
        if qc.round() >= state.round.current_round {
            self.set_new_round(state, qc.round() + 1);
        }
    }

    /// Adopt an already verified TC.
    fn apply_tc(&self, state: &mut EngineState, tc: &TimeoutCert) {
        if tc.round > state.round.highest_tc_round() {
            log::info!("New highest TC: round {}", tc.round);
            state.round.highest_timeout_cert = Some(tc.clone());
        }
        if tc.round >= state.round.current_round {
            self.set_new_round(state, tc.round + 1);
        }
    }

    fn set_new_round(&self, state: &mut EngineState, round: Round) {
        log::info!(
            "Entering round {} (was {}), resetting countdown and timeout pool",
            round,
            state.round.current_round
        );
        state.round.current_round = round;
        state.timeout_count = 0;
        self.timer.reset(round, self.timeout_period(round));
        // Votes stay: a vote for the next round may already be in flight.
        state.timeout_pool.clear();
    }

    // -------------------------------------------------------------------------
    // Votes
    // -------------------------------------------------------------------------

    /// Check a vote's signature against the snapshot for its gap number and
    /// record the signer. `Ok(false)` for stale or non-masternode votes.
    pub fn verify_vote_message(
        &self,
        chain: &dyn ChainReader,
        vote: &mut Vote,
    ) -> Result<bool, ConsensusError> {
        let current_round = self.current_round();
        if vote.round() < current_round {
            log::debug!(
                "Disqualified vote for round {}, current round {}",
                vote.round(),
                current_round
            );
            return Ok(false);
        }
        let snapshot = self.snapshot(chain, vote.gap_number)?;
        let signer = recover_signer(&vote.sig_hash(), &vote.signature).inspect_err(|e| {
            log::warn!("Cannot verify vote signature: {}", e);
        })?;
        if !snapshot.is_masternode(&signer) {
            log::warn!("Vote from non-masternode {}", signer);
            return Ok(false);
        }
        vote.signer = signer;
        Ok(true)
    }

    /// Collect a verified vote; form, verify and process a QC once the bucket
    /// for its block reaches the threshold.
    pub fn vote_handler(&self, chain: &dyn ChainReader, vote: Vote) -> Result<(), ConsensusError> {
        let mut state = self.lock();
        self.handle_vote(&mut state, chain, vote)
    }

    fn handle_vote(
        &self,
        state: &mut EngineState,
        chain: &dyn ChainReader,
        vote: Vote,
    ) -> Result<(), ConsensusError> {
        let round = vote.round();
        let current_round = state.round.current_round;
        if round < current_round {
            log::debug!("Stale vote for round {}, current round {}", round, current_round);
            return Ok(());
        }
        if round > current_round + 1 {
            return Err(ConsensusError::RoundTooFar {
                kind: "vote",
                incoming: round,
                current: current_round,
            });
        }

        let gap_number = vote.gap_number;
        let (count, pooled) = state.vote_pool.add(vote.clone());
        log::debug!("Collected vote for round {}: {} in pool", round, count);

        if round <= state.round.highest_qc_round() {
            // Another block already certified this round.
            return Ok(());
        }

        let snapshot = self.snapshot(chain, gap_number)?;
        if threshold_reached(count, snapshot.masternodes.len(), self.cert_threshold(round)) {
            log::info!("Vote pool threshold reached for round {}: {} votes", round, count);
            self.on_vote_pool_threshold_reached(state, chain, pooled, &vote)?;
        }
        Ok(())
    }

    fn on_vote_pool_threshold_reached(
        &self,
        state: &mut EngineState,
        chain: &dyn ChainReader,
        pooled: PoolBucket<Vote>,
        vote: &Vote,
    ) -> Result<(), ConsensusError> {
        let qc = QuorumCert {
            proposed_block_info: vote.proposed_block_info.clone(),
            gap_number: vote.gap_number,
            signatures: pooled.into_values().map(|v| v.signature).collect(),
        };
        self.verify_and_process_qc(state, chain, &qc).inspect_err(|e| {
            log::error!("Failed to process QC formed from vote pool: round {}: {}", qc.round(), e);
        })?;
        log::info!(
            "Formed QC for round {} with {} signatures",
            qc.round(),
            qc.signatures.len()
        );
        Ok(())
    }

    pub fn received_votes(&self) -> HashMap<VotePoolKey, PoolBucket<Vote>> {
        self.lock().vote_pool.get()
    }

    // -------------------------------------------------------------------------
    // Pool hygiene
    // -------------------------------------------------------------------------

    pub fn hygiene_vote_pool(&self) -> usize {
        let mut state = self.lock();
        let round = state.round.current_round;
        state.vote_pool.hygiene(round, POOL_HYGIENE_ROUND).len()
    }

    pub fn hygiene_timeout_pool(&self) -> usize {
        let mut state = self.lock();
        let round = state.round.current_round;
        state.timeout_pool.hygiene(round, POOL_HYGIENE_ROUND).len()
    }

    pub fn hygiene_sync_info_pool(&self) -> usize {
        let mut state = self.lock();
        let round = state.round.current_round;
        state.sync_info_pool.hygiene(round, POOL_HYGIENE_ROUND).len()
    }

    pub fn run_pool_hygiene(&self) {
        let votes = self.hygiene_vote_pool();
        let timeouts = self.hygiene_timeout_pool();
        let sync_infos = self.hygiene_sync_info_pool();
        if votes + timeouts + sync_infos > 0 {
            log::debug!(
                "Pool hygiene removed {} vote, {} timeout, {} sync info buckets",
                votes,
                timeouts,
                sync_infos
            );
        }
    }

    /// Run every hygiene sweep once per `period` until the engine is dropped
    /// by everyone else.
    pub fn spawn_periodic_hygiene(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.upgrade() {
                    Some(engine) => engine.run_pool_hygiene(),
                    None => break,
                }
            }
        })
    }
}
