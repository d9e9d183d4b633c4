use crate::crypto::{Hash, PrivateKey, Signature, hash_data, sign};
pub use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

/// The Round number definition (u64).
pub type Round = u64;

/// Identifies a proposed block at a specific round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockInfo {
    pub hash: Hash,
    pub number: u64,
    pub round: Round,
}

/// Payload a masternode signs when voting for a proposed block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteForSign {
    pub proposed_block_info: BlockInfo,
    pub gap_number: u64,
}

/// Payload a masternode signs when giving up on a round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutForSign {
    pub round: Round,
    pub gap_number: u64,
}

pub fn vote_sig_hash(vote: &VoteForSign) -> Hash {
    hash_data(vote)
}

pub fn timeout_sig_hash(timeout: &TimeoutForSign) -> Hash {
    hash_data(timeout)
}

/// A Vote from a masternode for a proposed block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vote {
    pub proposed_block_info: BlockInfo,
    pub gap_number: u64,
    pub signature: Signature,
    /// Filled in by signature verification (or by the local signer); never sent.
    #[serde(skip)]
    pub signer: Address,
}

impl Vote {
    pub fn signed(proposed_block_info: BlockInfo, gap_number: u64, key: &PrivateKey) -> Self {
        let digest = vote_sig_hash(&VoteForSign {
            proposed_block_info: proposed_block_info.clone(),
            gap_number,
        });
        Self {
            proposed_block_info,
            gap_number,
            signature: sign(key, &digest),
            signer: key.address(),
        }
    }

    pub fn round(&self) -> Round {
        self.proposed_block_info.round
    }

    pub fn sig_hash(&self) -> Hash {
        vote_sig_hash(&VoteForSign {
            proposed_block_info: self.proposed_block_info.clone(),
            gap_number: self.gap_number,
        })
    }

    /// Hash of the wire content (excludes the local `signer` annotation).
    pub fn hash(&self) -> Hash {
        hash_data(self)
    }
}

/// A Timeout from a masternode that gave up on `round`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Timeout {
    pub round: Round,
    pub gap_number: u64,
    pub signature: Signature,
    /// Filled in by signature verification (or by the local signer); never sent.
    #[serde(skip)]
    pub signer: Address,
}

impl Timeout {
    pub fn signed(round: Round, gap_number: u64, key: &PrivateKey) -> Self {
        let digest = timeout_sig_hash(&TimeoutForSign { round, gap_number });
        Self {
            round,
            gap_number,
            signature: sign(key, &digest),
            signer: key.address(),
        }
    }

    pub fn sig_hash(&self) -> Hash {
        timeout_sig_hash(&TimeoutForSign {
            round: self.round,
            gap_number: self.gap_number,
        })
    }

    pub fn hash(&self) -> Hash {
        hash_data(self)
    }
}

/// A Quorum Certificate proves that a threshold of masternodes voted for a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCert {
    pub proposed_block_info: BlockInfo,
    pub gap_number: u64,
    pub signatures: Vec<Signature>,
}

impl QuorumCert {
    /// The certificate a fresh node starts from (round 0, no signatures).
    pub fn genesis(block: BlockInfo) -> Self {
        Self {
            proposed_block_info: block,
            gap_number: 0,
            signatures: vec![],
        }
    }

    pub fn round(&self) -> Round {
        self.proposed_block_info.round
    }

    pub fn sig_hash(&self) -> Hash {
        vote_sig_hash(&VoteForSign {
            proposed_block_info: self.proposed_block_info.clone(),
            gap_number: self.gap_number,
        })
    }
}

/// A Timeout Certificate proves that a threshold of masternodes gave up on a round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutCert {
    pub round: Round,
    pub gap_number: u64,
    pub signatures: Vec<Signature>,
}

impl TimeoutCert {
    pub fn sig_hash(&self) -> Hash {
        timeout_sig_hash(&TimeoutForSign {
            round: self.round,
            gap_number: self.gap_number,
        })
    }
}

/// Highest certificates known to a node, sent to help peers catch up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub highest_quorum_cert: QuorumCert,
    /// Absent on a node that has not formed or seen any TC yet.
    pub highest_timeout_cert: Option<TimeoutCert>,
}

impl SyncInfo {
    pub fn hash(&self) -> Hash {
        hash_data(self)
    }

    pub fn timeout_round(&self) -> Round {
        self.highest_timeout_cert.as_ref().map_or(0, |tc| tc.round)
    }
}

/// Messages exchanged on the consensus channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Vote(Vote),
    Timeout(Timeout),
    SyncInfo(SyncInfo),
}

/// A block header as far as the round core needs one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub number: u64,
    pub hash: Hash,
    pub parent_hash: Hash,
    pub round: Round,
}

impl Header {
    pub fn block_info(&self) -> BlockInfo {
        BlockInfo {
            hash: self.hash,
            number: self.number,
            round: self.round,
        }
    }
}

/// The epoch switch block governing a chain position, with its masternodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochSwitchInfo {
    pub epoch_switch_block_info: BlockInfo,
    pub masternodes: Vec<Address>,
}
