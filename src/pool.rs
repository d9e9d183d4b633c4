//! Keyed collectors for votes, timeouts and SyncInfo bundles.

use crate::crypto::Hash;
use crate::types::{Address, Round, SyncInfo, Timeout, Vote};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash as StdHash;

/// Something a [`Pool`] can collect.
pub trait PoolObject: Clone {
    type Key: Clone + Eq + StdHash + fmt::Display + fmt::Debug + PoolKey;
    /// Identity used for last-writer-wins inside one bucket.
    type Signer: Clone + Eq + StdHash + fmt::Debug + fmt::Display;

    fn hash(&self) -> Hash;
    fn pool_key(&self) -> Self::Key;
    fn signer(&self) -> Self::Signer;
}

/// Pool keys know which rounds they belong to, for hygiene.
pub trait PoolKey {
    /// True when every round the key refers to is below `lower_bound`.
    fn is_older_than(&self, lower_bound: Round) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutPoolKey {
    pub round: Round,
    pub gap_number: u64,
}

impl fmt::Display for TimeoutPoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.round, self.gap_number)
    }
}

impl PoolKey for TimeoutPoolKey {
    fn is_older_than(&self, lower_bound: Round) -> bool {
        self.round < lower_bound
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VotePoolKey {
    pub round: Round,
    pub gap_number: u64,
    pub block_number: u64,
    pub block_hash: Hash,
}

impl fmt::Display for VotePoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.round, self.gap_number, self.block_number, self.block_hash
        )
    }
}

impl PoolKey for VotePoolKey {
    fn is_older_than(&self, lower_bound: Round) -> bool {
        self.round < lower_bound
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncInfoPoolKey {
    pub qc_round: Round,
    pub qc_gap_number: u64,
    pub qc_block_number: u64,
    /// 0 when the bundle carries no TC.
    pub tc_round: Round,
    pub tc_gap_number: u64,
    pub qc_block_hash: Hash,
}

impl fmt::Display for SyncInfoPoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            self.qc_round,
            self.qc_gap_number,
            self.qc_block_number,
            self.tc_round,
            self.tc_gap_number,
            self.qc_block_hash
        )
    }
}

impl PoolKey for SyncInfoPoolKey {
    fn is_older_than(&self, lower_bound: Round) -> bool {
        self.qc_round < lower_bound && (self.tc_round == 0 || self.tc_round < lower_bound)
    }
}

impl PoolObject for Timeout {
    type Key = TimeoutPoolKey;
    type Signer = Address;

    fn hash(&self) -> Hash {
        Timeout::hash(self)
    }

    fn pool_key(&self) -> TimeoutPoolKey {
        TimeoutPoolKey {
            round: self.round,
            gap_number: self.gap_number,
        }
    }

    fn signer(&self) -> Address {
        self.signer
    }
}

impl PoolObject for Vote {
    type Key = VotePoolKey;
    type Signer = Address;

    fn hash(&self) -> Hash {
        Vote::hash(self)
    }

    fn pool_key(&self) -> VotePoolKey {
        VotePoolKey {
            round: self.proposed_block_info.round,
            gap_number: self.gap_number,
            block_number: self.proposed_block_info.number,
            block_hash: self.proposed_block_info.hash,
        }
    }

    fn signer(&self) -> Address {
        self.signer
    }
}

impl PoolObject for SyncInfo {
    type Key = SyncInfoPoolKey;
    /// Bundles are unsigned; identical content is the same entry.
    type Signer = Hash;

    fn hash(&self) -> Hash {
        SyncInfo::hash(self)
    }

    fn pool_key(&self) -> SyncInfoPoolKey {
        let qc = &self.highest_quorum_cert;
        let (tc_round, tc_gap_number) = self
            .highest_timeout_cert
            .as_ref()
            .map_or((0, 0), |tc| (tc.round, tc.gap_number));
        SyncInfoPoolKey {
            qc_round: qc.proposed_block_info.round,
            qc_gap_number: qc.gap_number,
            qc_block_number: qc.proposed_block_info.number,
            tc_round,
            tc_gap_number,
            qc_block_hash: qc.proposed_block_info.hash,
        }
    }

    fn signer(&self) -> Hash {
        SyncInfo::hash(self)
    }
}

pub type PoolBucket<T> = HashMap<<T as PoolObject>::Signer, T>;

/// A keyed collector of partial votes/timeouts. Not internally locked: the
/// engine owns every pool behind its own lock.
#[derive(Debug)]
pub struct Pool<T: PoolObject> {
    objects: HashMap<T::Key, PoolBucket<T>>,
}

impl<T: PoolObject> Default for Pool<T> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
        }
    }
}

impl<T: PoolObject> Pool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `obj` under its key, replacing any earlier entry from the same signer.
    /// Returns the bucket size and a copy of the bucket.
    pub fn add(&mut self, obj: T) -> (usize, PoolBucket<T>) {
        let bucket = self.objects.entry(obj.pool_key()).or_default();
        bucket.insert(obj.signer(), obj);
        (bucket.len(), bucket.clone())
    }

    pub fn pool_obj_keys_list(&self) -> Vec<T::Key> {
        self.objects.keys().cloned().collect()
    }

    pub fn bucket(&self, key: &T::Key) -> Option<&PoolBucket<T>> {
        self.objects.get(key)
    }

    pub fn get(&self) -> HashMap<T::Key, PoolBucket<T>> {
        self.objects.clone()
    }

    pub fn clear_by_pool_key(&mut self, key: &T::Key) {
        self.objects.remove(key);
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    /// Drop every bucket whose key is more than `window` rounds behind
    /// `current_round`. Returns the removed keys.
    pub fn hygiene(&mut self, current_round: Round, window: u64) -> Vec<T::Key> {
        let Some(lower_bound) = current_round.checked_sub(window) else {
            return vec![];
        };
        let stale: Vec<T::Key> = self
            .objects
            .keys()
            .filter(|k| k.is_older_than(lower_bound))
            .cloned()
            .collect();
        for key in &stale {
            log::debug!(
                "Cleaned pool key {} (current round {}, lower bound {})",
                key,
                current_round,
                lower_bound
            );
            self.clear_by_pool_key(key);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Signature;
    use crate::types::{BlockInfo, QuorumCert, TimeoutCert};

    fn timeout(round: Round, gap: u64, signer: u8) -> Timeout {
        Timeout {
            round,
            gap_number: gap,
            signature: Signature(vec![signer]),
            signer: Address::repeat_byte(signer),
        }
    }

    #[test]
    fn test_add_counts_per_key() {
        let mut pool = Pool::new();
        assert_eq!(pool.add(timeout(5, 0, 1)).0, 1);
        assert_eq!(pool.add(timeout(5, 0, 2)).0, 2);
        // Same round, different gap: separate bucket.
        assert_eq!(pool.add(timeout(5, 450, 3)).0, 1);

        let (count, bucket) = pool.add(timeout(5, 0, 3));
        assert_eq!(count, 3);
        assert!(bucket.contains_key(&Address::repeat_byte(3)));
        assert_eq!(pool.pool_obj_keys_list().len(), 2);
    }

    #[test]
    fn test_same_signer_replaces() {
        let mut pool = Pool::new();
        pool.add(timeout(5, 0, 1));
        let mut again = timeout(5, 0, 1);
        again.signature = Signature(vec![9, 9]);
        let (count, bucket) = pool.add(again);

        assert_eq!(count, 1);
        assert_eq!(
            bucket[&Address::repeat_byte(1)].signature,
            Signature(vec![9, 9])
        );
    }

    #[test]
    fn test_competing_blocks_do_not_mix() {
        let vote = |hash: u8, signer: u8| Vote {
            proposed_block_info: BlockInfo {
                hash: Hash([hash; 32]),
                number: 10,
                round: 12,
            },
            gap_number: 0,
            signature: Signature(vec![signer]),
            signer: Address::repeat_byte(signer),
        };
        let mut pool = Pool::new();
        pool.add(vote(1, 1));
        pool.add(vote(1, 2));
        let (count, _) = pool.add(vote(2, 3));
        assert_eq!(count, 1);
        assert_eq!(pool.bucket(&vote(1, 9).pool_key()).map_or(0, |b| b.len()), 2);
    }

    #[test]
    fn test_clear_by_pool_key() {
        let mut pool = Pool::new();
        pool.add(timeout(5, 0, 1));
        pool.add(timeout(6, 0, 1));
        pool.clear_by_pool_key(&TimeoutPoolKey {
            round: 5,
            gap_number: 0,
        });
        assert_eq!(
            pool.pool_obj_keys_list(),
            vec![TimeoutPoolKey {
                round: 6,
                gap_number: 0
            }]
        );
    }

    #[test]
    fn test_hygiene_removes_exactly_stale_keys() {
        let mut pool = Pool::new();
        for round in [1, 9, 10, 11, 19, 20] {
            pool.add(timeout(round, 0, 1));
        }
        // lower bound = 20 - 10 = 10: rounds 1 and 9 go.
        let mut removed: Vec<Round> = pool.hygiene(20, 10).iter().map(|k| k.round).collect();
        removed.sort();
        assert_eq!(removed, vec![1, 9]);

        let mut kept: Vec<Round> = pool.pool_obj_keys_list().iter().map(|k| k.round).collect();
        kept.sort();
        assert_eq!(kept, vec![10, 11, 19, 20]);
    }

    #[test]
    fn test_hygiene_early_rounds_keep_everything() {
        let mut pool = Pool::new();
        pool.add(timeout(0, 0, 1));
        pool.add(timeout(3, 0, 1));
        assert!(pool.hygiene(5, 10).is_empty());
        assert_eq!(pool.pool_obj_keys_list().len(), 2);
    }

    #[test]
    fn test_sync_info_key_staleness_considers_tc() {
        let sync_info = |qc_round: Round, tc_round: Option<Round>| SyncInfo {
            highest_quorum_cert: QuorumCert {
                proposed_block_info: BlockInfo {
                    hash: Hash::default(),
                    number: qc_round,
                    round: qc_round,
                },
                gap_number: 0,
                signatures: vec![],
            },
            highest_timeout_cert: tc_round.map(|round| TimeoutCert {
                round,
                gap_number: 0,
                signatures: vec![],
            }),
        };

        let mut pool = Pool::new();
        pool.add(sync_info(2, None));
        pool.add(sync_info(2, Some(3)));
        pool.add(sync_info(2, Some(25)));
        pool.add(sync_info(15, None));

        pool.hygiene(20, 10);
        let mut kept: Vec<(Round, Round)> = pool
            .pool_obj_keys_list()
            .iter()
            .map(|k| (k.qc_round, k.tc_round))
            .collect();
        kept.sort();
        assert_eq!(kept, vec![(2, 25), (15, 0)]);
    }

    #[test]
    fn test_key_display() {
        let key = TimeoutPoolKey {
            round: 7,
            gap_number: 450,
        };
        assert_eq!(key.to_string(), "7:450");
    }
}
