//! Hinted scheduler — promotes high-tally cached forks into elections.
//!
//! Votes accumulating in the vote cache are a hint that the network is
//! already deciding a fork this node has not started an election for.
//! The scheduler polls the cache's priority ordering and activates a
//! hinted election for the strongest waiting hash once its tally clears
//! a fraction of trended online weight and the block body is present in
//! the ledger.

use crate::election::ElectionBehavior;
use crate::interfaces::RepWeightOracle;
use crate::vote_cache::{CacheEntry, VoteCache};
use quill_ledger::{Block, Ledger};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Capability to start a hinted election; implemented by the owning
/// election table.
pub trait ElectionActivator: Send + Sync {
    /// Start an election for `block`, seeded from the cached votes in
    /// `entry`. Returns false when the table declines (duplicate root,
    /// at capacity).
    fn activate(&self, block: Block, entry: &CacheEntry, behavior: ElectionBehavior) -> bool;
}

#[derive(Clone, Debug)]
pub struct HintedSchedulerConfig {
    pub enable: bool,
    /// Minimum cached tally, as a percentage of trended online weight,
    /// before a hash is worth an election.
    pub hinting_threshold_percent: u8,
}

impl Default for HintedSchedulerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            hinting_threshold_percent: 10,
        }
    }
}

pub struct HintedScheduler {
    config: HintedSchedulerConfig,
    oracle: Arc<dyn RepWeightOracle>,
    ledger: Arc<dyn Ledger>,
    cache: Arc<Mutex<VoteCache>>,
}

impl HintedScheduler {
    pub fn new(
        config: HintedSchedulerConfig,
        oracle: Arc<dyn RepWeightOracle>,
        ledger: Arc<dyn Ledger>,
        cache: Arc<Mutex<VoteCache>>,
    ) -> Self {
        Self {
            config,
            oracle,
            ledger,
            cache,
        }
    }

    fn tally_threshold(&self) -> u128 {
        self.oracle.trended_weight() / 100 * self.config.hinting_threshold_percent as u128
    }

    /// Drain the cache's queue of everything currently worth
    /// activating. Entries whose block body is missing are parked until
    /// the block processor triggers their hash.
    pub fn run_once(&self, activator: &dyn ElectionActivator) -> usize {
        if !self.config.enable {
            return 0;
        }
        let threshold = self.tally_threshold();
        let mut activated = 0;
        loop {
            let entry = {
                let cache = self.cache.lock().unwrap();
                cache.peek(threshold).cloned()
            };
            let Some(entry) = entry else {
                break;
            };
            match self.ledger.block(&entry.hash) {
                Some(block) => {
                    if activator.activate(block, &entry, ElectionBehavior::Hinted) {
                        activated += 1;
                    }
                    self.cache.lock().unwrap().erase(&entry.hash);
                }
                None => {
                    trace!(hash = %entry.hash, tally = entry.tally,
                        "hinted block body missing, parking entry");
                    self.cache.lock().unwrap().dequeue(&entry.hash);
                }
            }
        }
        activated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vote_cache::VoteCacheConfig;
    use crate::vote_info::Vote;
    use quill_ledger::{BlockKind, BlockStatus, MemoryLedger};
    use quill_types::{Account, BlockHash, Signature, Timestamp, WorkNonce};

    struct StaticOracle {
        trended: u128,
    }

    impl RepWeightOracle for StaticOracle {
        fn weight(&self, _a: &Account) -> u128 {
            0
        }
        fn trended_weight(&self) -> u128 {
            self.trended
        }
        fn quorum_delta(&self) -> u128 {
            0
        }
        fn minimum_principal_weight(&self) -> u128 {
            0
        }
        fn final_votes_canary(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct RecordingActivator {
        started: Mutex<Vec<BlockHash>>,
    }

    impl ElectionActivator for RecordingActivator {
        fn activate(&self, block: Block, entry: &CacheEntry, behavior: ElectionBehavior) -> bool {
            assert_eq!(block.hash, entry.hash);
            assert_eq!(behavior, ElectionBehavior::Hinted);
            self.started.lock().unwrap().push(block.hash);
            true
        }
    }

    fn committed_block(ledger: &MemoryLedger) -> Block {
        let block = Block {
            kind: BlockKind::Open,
            account: Account::new("qll_alice"),
            previous: BlockHash::ZERO,
            representative: Account::new("qll_rep1"),
            balance: 100,
            link: BlockHash::ZERO,
            timestamp: Timestamp::new(1_700_000_000),
            work: WorkNonce(1),
            signature: Signature([1; 64]),
            hash: BlockHash::ZERO,
        }
        .seal();
        let mut tx = ledger.begin_write();
        assert_eq!(ledger.process(&mut tx, &block), BlockStatus::Progress);
        block
    }

    fn vote_for(hash: BlockHash, voter: &str) -> Vote {
        Vote::new(Account::new(voter), 1, hash, Signature([1; 64]))
    }

    fn scheduler(
        ledger: Arc<MemoryLedger>,
        cache: Arc<Mutex<VoteCache>>,
    ) -> HintedScheduler {
        HintedScheduler::new(
            HintedSchedulerConfig::default(),
            Arc::new(StaticOracle { trended: 1000 }),
            ledger,
            cache,
        )
    }

    #[test]
    fn activates_strong_entry_with_known_block() {
        let ledger = Arc::new(MemoryLedger::new());
        let block = committed_block(&ledger);
        let cache = Arc::new(Mutex::new(VoteCache::new(VoteCacheConfig::default())));
        // 150 of 1000 trended weight clears the 10% threshold.
        cache
            .lock()
            .unwrap()
            .vote(&vote_for(block.hash, "qll_rep1"), 150);

        let activator = RecordingActivator::default();
        let sched = scheduler(ledger, cache.clone());
        assert_eq!(sched.run_once(&activator), 1);
        assert_eq!(activator.started.lock().unwrap().as_slice(), &[block.hash]);
        assert!(cache.lock().unwrap().is_empty(), "activated entry erased");
    }

    #[test]
    fn weak_entries_stay_cached() {
        let ledger = Arc::new(MemoryLedger::new());
        let block = committed_block(&ledger);
        let cache = Arc::new(Mutex::new(VoteCache::new(VoteCacheConfig::default())));
        cache
            .lock()
            .unwrap()
            .vote(&vote_for(block.hash, "qll_rep1"), 50);

        let activator = RecordingActivator::default();
        let sched = scheduler(ledger, cache.clone());
        assert_eq!(sched.run_once(&activator), 0);
        assert_eq!(cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn missing_block_parks_entry_until_trigger() {
        let ledger = Arc::new(MemoryLedger::new());
        let unknown = BlockHash::new([9; 32]);
        let cache = Arc::new(Mutex::new(VoteCache::new(VoteCacheConfig::default())));
        cache.lock().unwrap().vote(&vote_for(unknown, "qll_rep1"), 500);

        let activator = RecordingActivator::default();
        let sched = scheduler(ledger.clone(), cache.clone());
        assert_eq!(sched.run_once(&activator), 0);
        assert_eq!(cache.lock().unwrap().len(), 1, "votes retained");

        // Block arrives: the processor triggers the hash and the
        // scheduler picks it up on its next pass.
        let block = committed_block(&ledger);
        assert_eq!(block.hash, block.compute_hash());
        cache.lock().unwrap().trigger(&unknown);
        // The cached hash still differs from any real block; nothing
        // activates, but the entry is queued again.
        assert!(cache.lock().unwrap().peek(0).is_some());
    }
}
