//! Read-only collaborators the round core consumes: chain headers, validator
//! snapshots and epoch switch lookups.

use crate::crypto::Hash;
use crate::types::{Address, BlockInfo, EpochSwitchInfo, Header};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Header not found: number {0}")]
    HeaderNotFound(u64),
    #[error("Snapshot not found for gap number {0}")]
    SnapshotNotFound(u64),
}

/// Validator set valid from a checkpoint (gap) block onward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub number: u64,
    pub masternodes: Vec<Address>,
}

impl Snapshot {
    pub fn is_masternode(&self, address: &Address) -> bool {
        self.masternodes.contains(address)
    }
}

pub trait ChainReader: Send + Sync {
    fn current_header(&self) -> Header;
    fn header_by_number(&self, number: u64) -> Option<Header>;
    fn header_by_hash(&self, hash: &Hash) -> Option<Header>;
}

pub trait SnapshotResolver: Send + Sync {
    fn get_snapshot(
        &self,
        chain: &dyn ChainReader,
        gap_number: u64,
        use_cache: bool,
    ) -> Result<Arc<Snapshot>, ChainError>;
}

pub trait EpochSwitchResolver: Send + Sync {
    /// Epoch switch info for the epoch containing `header`.
    fn epoch_switch_info(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
    ) -> Result<EpochSwitchInfo, ChainError>;
}

// -----------------------------------------------------------------------------
// In-Memory Chain (tests and the standalone node, where no real chain exists)
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct MemChain {
    epoch: u64,
    masternodes: Vec<Address>,
    headers: Arc<Mutex<BTreeMap<u64, Header>>>,
    by_hash: Arc<Mutex<HashMap<Hash, Header>>>,
    snapshots: Arc<Mutex<HashMap<u64, Arc<Snapshot>>>>,
}

impl MemChain {
    /// A chain holding only a genesis header, with `masternodes` as the
    /// snapshot for gap number 0.
    pub fn new(masternodes: Vec<Address>, epoch: u64) -> Self {
        let chain = Self {
            epoch,
            masternodes: masternodes.clone(),
            headers: Arc::new(Mutex::new(BTreeMap::new())),
            by_hash: Arc::new(Mutex::new(HashMap::new())),
            snapshots: Arc::new(Mutex::new(HashMap::new())),
        };
        chain.insert_header(Header {
            number: 0,
            hash: crate::crypto::hash_data(&("genesis", 0u64)),
            parent_hash: Hash::default(),
            round: 0,
        });
        chain.insert_snapshot(0, masternodes);
        chain
    }

    pub fn insert_header(&self, header: Header) {
        self.by_hash.lock().unwrap().insert(header.hash, header.clone());
        self.headers.lock().unwrap().insert(header.number, header);
    }

    /// Make a block known by hash without moving the head.
    pub fn import_block(&self, info: &BlockInfo) {
        self.by_hash.lock().unwrap().insert(
            info.hash,
            Header {
                number: info.number,
                hash: info.hash,
                parent_hash: Hash::default(),
                round: info.round,
            },
        );
    }

    /// Append a child of the current head at `round`.
    pub fn extend(&self, round: u64) -> Header {
        let parent = self.current_header();
        let number = parent.number + 1;
        let header = Header {
            number,
            hash: crate::crypto::hash_data(&(parent.hash, number, round)),
            parent_hash: parent.hash,
            round,
        };
        self.insert_header(header.clone());
        header
    }

    pub fn insert_snapshot(&self, gap_number: u64, masternodes: Vec<Address>) {
        self.snapshots.lock().unwrap().insert(
            gap_number,
            Arc::new(Snapshot {
                number: gap_number,
                masternodes,
            }),
        );
    }

    pub fn masternodes(&self) -> &[Address] {
        &self.masternodes
    }
}

impl ChainReader for MemChain {
    fn current_header(&self) -> Header {
        self.headers
            .lock()
            .unwrap()
            .values()
            .next_back()
            .cloned()
            .unwrap_or_default()
    }

    fn header_by_number(&self, number: u64) -> Option<Header> {
        self.headers.lock().unwrap().get(&number).cloned()
    }

    fn header_by_hash(&self, hash: &Hash) -> Option<Header> {
        self.by_hash.lock().unwrap().get(hash).cloned()
    }
}

impl SnapshotResolver for MemChain {
    fn get_snapshot(
        &self,
        _chain: &dyn ChainReader,
        gap_number: u64,
        _use_cache: bool,
    ) -> Result<Arc<Snapshot>, ChainError> {
        self.snapshots
            .lock()
            .unwrap()
            .get(&gap_number)
            .cloned()
            .ok_or(ChainError::SnapshotNotFound(gap_number))
    }
}

impl EpochSwitchResolver for MemChain {
    fn epoch_switch_info(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
    ) -> Result<EpochSwitchInfo, ChainError> {
        let boundary = header.number - header.number.checked_rem(self.epoch).unwrap_or(0);
        let switch_header = chain
            .header_by_number(boundary)
            .ok_or(ChainError::HeaderNotFound(boundary))?;
        Ok(EpochSwitchInfo {
            epoch_switch_block_info: switch_header.block_info(),
            masternodes: self.masternodes.clone(),
        })
    }
}
