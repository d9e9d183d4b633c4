use crate::types::Round;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Pool buckets more than this many rounds behind the current round are swept.
pub const POOL_HYGIENE_ROUND: u64 = 10;

/// How often the background hygiene job runs.
pub const PERIODIC_JOB_PERIOD: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Parameters that may change at a given round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundConfig {
    pub switch_round: Round,
    /// Fraction of the masternode set a certificate needs, compared exactly.
    pub cert_threshold: f64,
    pub timeout_period_secs: u64,
    /// Every Nth local timeout also broadcasts a SyncInfo.
    pub timeout_sync_threshold: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            switch_round: 0,
            cert_threshold: 0.667,
            timeout_period_secs: 30,
            timeout_sync_threshold: 3,
        }
    }
}

impl RoundConfig {
    pub fn timeout_period(&self) -> Duration {
        Duration::from_secs(self.timeout_period_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct V2Config {
    pub switch_epoch: u64,
    pub switch_block: u64,
    /// Keyed by `switch_round`.
    pub configs: BTreeMap<Round, RoundConfig>,
}

impl Default for V2Config {
    fn default() -> Self {
        let mut configs = BTreeMap::new();
        configs.insert(0, RoundConfig::default());
        Self {
            switch_epoch: 0,
            switch_block: 0,
            configs,
        }
    }
}

impl V2Config {
    /// The config in force at `round`: the one with the greatest switch round <= `round`.
    pub fn config(&self, round: Round) -> &RoundConfig {
        self.configs
            .range(..=round)
            .next_back()
            .map(|(_, c)| c)
            .or_else(|| self.configs.values().next())
            .unwrap_or(&DEFAULT_ROUND_CONFIG)
    }
}

static DEFAULT_ROUND_CONFIG: RoundConfig = RoundConfig {
    switch_round: 0,
    cert_threshold: 0.667,
    timeout_period_secs: 30,
    timeout_sync_threshold: 3,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Blocks per epoch.
    pub epoch: u64,
    /// Gap window subtracted from the epoch boundary to pick the snapshot.
    pub gap: u64,
    pub v2: V2Config,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            epoch: 900,
            gap: 450,
            v2: V2Config::default(),
        }
    }
}

impl ConsensusConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: ConsensusConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epoch == 0 {
            return Err(ConfigError::Invalid("epoch must be positive".into()));
        }
        if self.v2.configs.is_empty() {
            return Err(ConfigError::Invalid("v2.configs must not be empty".into()));
        }
        for (round, c) in &self.v2.configs {
            if *round != c.switch_round {
                return Err(ConfigError::Invalid(format!(
                    "config keyed at round {} declares switch_round {}",
                    round, c.switch_round
                )));
            }
            if !(c.cert_threshold > 0.0 && c.cert_threshold <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "cert_threshold {} at round {} is outside (0, 1]",
                    c.cert_threshold, round
                )));
            }
            if c.timeout_sync_threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "timeout_sync_threshold at round {} must be positive",
                    round
                )));
            }
        }
        Ok(())
    }
}
