//! SyncInfo exchange: packaging our highest certificates and catching up
//! from a peer's.

use crate::chain::ChainReader;
use crate::consensus::{BftEngine, ConsensusError, EngineState};
use crate::pool::{PoolBucket, SyncInfoPoolKey};
use crate::types::SyncInfo;
use std::collections::HashMap;

impl BftEngine {
    pub fn build_sync_info(&self) -> SyncInfo {
        Self::build_sync_info_from(&self.lock())
    }

    pub(crate) fn build_sync_info_from(state: &EngineState) -> SyncInfo {
        SyncInfo {
            highest_quorum_cert: state.round.highest_quorum_cert.clone(),
            highest_timeout_cert: state.round.highest_timeout_cert.clone(),
        }
    }

    /// True when our highest QC and TC already cover everything `sync_info` carries.
    fn dominates(state: &EngineState, sync_info: &SyncInfo) -> bool {
        state.round.highest_qc_round() >= sync_info.highest_quorum_cert.round()
            && sync_info
                .highest_timeout_cert
                .as_ref()
                .is_none_or(|tc| state.round.highest_tc_round() >= tc.round)
    }

    /// Check the signatures of both certificates in `sync_info`. `Ok(false)`
    /// when it carries nothing newer than what we hold.
    pub fn verify_sync_info_message(
        &self,
        chain: &dyn ChainReader,
        sync_info: &SyncInfo,
    ) -> Result<bool, ConsensusError> {
        if Self::dominates(&self.lock(), sync_info) {
            log::debug!(
                "Local rounds cover SyncInfo: QC round {}, TC round {}",
                sync_info.highest_quorum_cert.round(),
                sync_info.timeout_round()
            );
            return Ok(false);
        }

        // Round 0 is genesis and needs no signatures.
        self.verify_qc(chain, &sync_info.highest_quorum_cert)?;
        // A node that has never seen a TC sends none.
        if let Some(tc) = &sync_info.highest_timeout_cert {
            self.verify_tc(chain, tc)?;
        }
        Ok(true)
    }

    /// Buffer `sync_info` for later replay, then process it now.
    pub fn sync_info_handler(
        &self,
        chain: &dyn ChainReader,
        sync_info: SyncInfo,
    ) -> Result<(), ConsensusError> {
        let mut state = self.lock();
        // The chain may not have reached the referenced height yet.
        state.sync_info_pool.add(sync_info.clone());
        self.handle_sync_info(&mut state, chain, &sync_info)
    }

    /// Keep `sync_info` for the next replay without processing it.
    pub(crate) fn buffer_sync_info(&self, sync_info: SyncInfo) {
        let (count, _) = self.lock().sync_info_pool.add(sync_info);
        log::debug!("Buffered SyncInfo: {} in bucket", count);
    }

    fn handle_sync_info(
        &self,
        state: &mut EngineState,
        chain: &dyn ChainReader,
        sync_info: &SyncInfo,
    ) -> Result<(), ConsensusError> {
        if Self::dominates(state, sync_info) {
            log::debug!(
                "Skipping SyncInfo: local QC round {}, TC round {}, incoming QC round {}, TC round {}",
                state.round.highest_qc_round(),
                state.round.highest_tc_round(),
                sync_info.highest_quorum_cert.round(),
                sync_info.timeout_round()
            );
            return Ok(());
        }

        self.verify_and_process_qc(state, chain, &sync_info.highest_quorum_cert)?;
        if let Some(tc) = &sync_info.highest_timeout_cert {
            self.verify_and_process_tc(state, chain, tc)?;
        }
        Ok(())
    }

    /// Replay buffered SyncInfo bundles, e.g. once the chain has caught up.
    pub fn process_sync_info_pool(&self, chain: &dyn ChainReader) {
        let mut state = self.lock();
        self.replay_sync_info_pool(&mut state, chain);
    }

    pub(crate) fn replay_sync_info_pool(&self, state: &mut EngineState, chain: &dyn ChainReader) {
        for key in state.sync_info_pool.pool_obj_keys_list() {
            log::debug!("Replaying SyncInfo pool key {}", key);
            let candidates: Vec<SyncInfo> = state
                .sync_info_pool
                .bucket(&key)
                .map(|bucket| bucket.values().cloned().collect())
                .unwrap_or_default();
            // Any one valid bundle per key is enough.
            for sync_info in candidates {
                match self.handle_sync_info(state, chain, &sync_info) {
                    Ok(()) => break,
                    Err(e) => log::error!(
                        "Failed to replay SyncInfo {}: {} (round {}, head {})",
                        key,
                        e,
                        state.round.current_round,
                        chain.current_header().number
                    ),
                }
            }
        }
    }

    pub fn received_sync_info(&self) -> HashMap<SyncInfoPoolKey, PoolBucket<SyncInfo>> {
        self.lock().sync_info_pool.get()
    }
}
