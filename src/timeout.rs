//! Timeout messages: verification, collection into TCs, and the local
//! countdown path that produces them.

use crate::chain::ChainReader;
use crate::consensus::{BftEngine, ConsensusError, EngineState};
use crate::crypto::recover_signer;
use crate::pool::{PoolBucket, TimeoutPoolKey};
use crate::types::{ConsensusMessage, Header, Round, Timeout, TimeoutCert};
use crate::verifier::threshold_reached;
use std::collections::HashMap;

/// Snapshot selector for a chain position: the epoch boundary at or before
/// `number`, minus the gap window, clamped at zero.
pub fn gap_number(number: u64, epoch: u64, gap: u64) -> u64 {
    if epoch == 0 {
        return 0;
    }
    let boundary = number - number % epoch;
    boundary.saturating_sub(gap)
}

impl BftEngine {
    /// Check a timeout's signature against the snapshot for its gap number and
    /// record the signer. `Ok(false)` when the round is already behind us or
    /// the signer is not a masternode.
    pub fn verify_timeout_message(
        &self,
        chain: &dyn ChainReader,
        timeout: &mut Timeout,
    ) -> Result<bool, ConsensusError> {
        let current_round = self.current_round();
        if timeout.round < current_round {
            log::debug!(
                "Disqualified timeout for round {}, current round {}",
                timeout.round,
                current_round
            );
            return Ok(false);
        }
        let snapshot = self.snapshot(chain, timeout.gap_number)?;
        let signer = recover_signer(&timeout.sig_hash(), &timeout.signature).inspect_err(|e| {
            log::warn!("Cannot verify timeout signature: {}", e);
        })?;
        if !snapshot.is_masternode(&signer) {
            log::warn!("Timeout from non-masternode {}", signer);
            return Ok(false);
        }
        timeout.signer = signer;
        Ok(true)
    }

    /// Collect a verified timeout for the current round; synthesize and
    /// process a TC once the pool reaches the threshold.
    pub fn timeout_handler(
        &self,
        chain: &dyn ChainReader,
        timeout: Timeout,
    ) -> Result<(), ConsensusError> {
        let mut state = self.lock();
        self.handle_timeout(&mut state, chain, timeout)
    }

    fn handle_timeout(
        &self,
        state: &mut EngineState,
        chain: &dyn ChainReader,
        timeout: Timeout,
    ) -> Result<(), ConsensusError> {
        let current_round = state.round.current_round;
        if timeout.round != current_round {
            return Err(ConsensusError::RoundMismatch {
                kind: "timeout",
                incoming: timeout.round,
                current: current_round,
            });
        }

        let round = timeout.round;
        let gap_number = timeout.gap_number;
        let (count, pooled) = state.timeout_pool.add(timeout);
        log::debug!("Collected timeout for round {}: {} in pool", round, count);

        let snapshot = self.snapshot(chain, gap_number)?;
        if threshold_reached(count, snapshot.masternodes.len(), self.cert_threshold(round)) {
            log::info!(
                "Timeout pool threshold reached for round {}: {} timeouts",
                round,
                count
            );
            self.on_timeout_pool_threshold_reached(state, chain, pooled, round, gap_number)?;
        }
        Ok(())
    }

    fn on_timeout_pool_threshold_reached(
        &self,
        state: &mut EngineState,
        chain: &dyn ChainReader,
        pooled: PoolBucket<Timeout>,
        round: Round,
        gap_number: u64,
    ) -> Result<(), ConsensusError> {
        let tc = TimeoutCert {
            round,
            gap_number,
            signatures: pooled.into_values().map(|t| t.signature).collect(),
        };
        self.verify_and_process_tc(state, chain, &tc).inspect_err(|e| {
            log::error!(
                "Failed to process TC formed from timeout pool: round {}, {} signatures, gap {}: {}",
                tc.round,
                tc.signatures.len(),
                gap_number,
                e
            );
        })?;
        log::info!(
            "Formed TC for round {} with {} signatures",
            tc.round,
            tc.signatures.len()
        );
        Ok(())
    }

    /// Called by the countdown timer when a round expires without progress.
    pub fn on_countdown_timeout(&self, chain: &dyn ChainReader) -> Result<(), ConsensusError> {
        let mut state = self.lock();

        let head = chain.current_header();
        if !self.allowed_to_send(chain, &head, "timeout") {
            return Ok(());
        }
        self.replay_sync_info_pool(&mut state, chain);

        self.send_timeout(&mut state, chain).inspect_err(|e| {
            log::error!("Failed to send timeout for round {}: {}", state.round.current_round, e);
        })?;

        state.timeout_count += 1;
        let sync_threshold = self
            .config
            .v2
            .config(state.round.current_round)
            .timeout_sync_threshold;
        if sync_threshold > 0 && state.timeout_count % sync_threshold == 0 {
            let sync_info = Self::build_sync_info_from(&state);
            log::info!(
                "Timeout sync threshold reached, sending SyncInfo: QC round {}, TC round {}",
                sync_info.highest_quorum_cert.round(),
                sync_info.timeout_round()
            );
            self.broadcast(ConsensusMessage::SyncInfo(sync_info));
        }
        Ok(())
    }

    /// Sign a timeout for the current round, count it locally, then broadcast it.
    fn send_timeout(
        &self,
        state: &mut EngineState,
        chain: &dyn ChainReader,
    ) -> Result<(), ConsensusError> {
        let round = state.round.current_round;
        let gap_number = self.timeout_gap_number(chain, round)?;
        let timeout = Timeout::signed(round, gap_number, &self.signing_key);
        log::warn!(
            "Timeout generated for round {}, gap number {}, sending",
            round,
            gap_number
        );
        self.handle_timeout(state, chain, timeout.clone())?;
        self.broadcast(ConsensusMessage::Timeout(timeout));
        Ok(())
    }

    /// Gap number a local timeout for `round` commits to.
    pub fn timeout_gap_number(
        &self,
        chain: &dyn ChainReader,
        round: Round,
    ) -> Result<u64, ConsensusError> {
        let head = chain.current_header();
        if self.is_epoch_switch_at_round(round, &head) {
            // The block we expect is the child of the current head.
            let number = head.number + 1;
            let gap = gap_number(number, self.config.epoch, self.config.gap);
            log::debug!("Epoch switch round {}: number {}, gap number {}", round, number, gap);
            Ok(gap)
        } else {
            let info = self.epochs.epoch_switch_info(chain, &head)?;
            let number = info.epoch_switch_block_info.number;
            let gap = gap_number(number, self.config.epoch, self.config.gap);
            log::debug!("Round {} in epoch starting at {}: gap number {}", round, number, gap);
            Ok(gap)
        }
    }

    /// Whether a block at `round` on top of `parent` opens a new epoch.
    pub fn is_epoch_switch_at_round(&self, round: Round, parent: &Header) -> bool {
        let epoch = self.config.epoch;
        if epoch == 0 {
            return false;
        }
        let epoch_num = self.config.v2.switch_epoch + round / epoch;
        if parent.number == self.config.v2.switch_block {
            log::debug!("Parent is the v2 switch block, epoch {} starts", epoch_num);
            return true;
        }
        let epoch_start_round = round - round % epoch;
        parent.round < epoch_start_round
    }

    /// Only masternodes of the current epoch send consensus messages.
    pub(crate) fn allowed_to_send(
        &self,
        chain: &dyn ChainReader,
        head: &Header,
        kind: &str,
    ) -> bool {
        match self.epochs.epoch_switch_info(chain, head) {
            Ok(info) if info.masternodes.contains(&self.signer) => true,
            Ok(_) => {
                log::debug!("{} is not a masternode, not sending {}", self.signer, kind);
                false
            }
            Err(e) => {
                log::error!("Cannot resolve masternodes before sending {}: {}", kind, e);
                false
            }
        }
    }

    pub fn received_timeouts(&self) -> HashMap<TimeoutPoolKey, PoolBucket<Timeout>> {
        self.lock().timeout_pool.get()
    }
}
