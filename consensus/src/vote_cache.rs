//! Vote cache — stores votes that arrive before their election exists.
//!
//! Votes can arrive out of order: a representative may broadcast a vote
//! for a block before this node has seen the block or started the
//! election. The cache holds such votes, keyed by block hash, under two
//! hard bounds: a per-entry voter cap and a total entry cap. A tally
//! ordering lets the hinted scheduler promote the strongest waiting
//! fork, and decides which entry to evict under memory pressure.

use crate::vote_info::Vote;
use quill_types::{Account, BlockHash};
use std::collections::{BTreeSet, HashMap, VecDeque};

#[derive(Clone, Debug)]
pub struct VoteCacheConfig {
    /// Maximum number of distinct block hashes tracked.
    pub max_size: usize,
    /// Maximum voters retained per entry.
    pub max_voters: usize,
}

impl Default for VoteCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 65536,
            max_voters: 40,
        }
    }
}

#[derive(Clone, Debug)]
struct CachedVoter {
    account: Account,
    timestamp: u64,
    weight: u128,
}

/// All cached votes for one block hash.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub hash: BlockHash,
    /// Insertion sequence; breaks tally ties (smaller = older).
    id: u64,
    /// Voters in arrival order; the front is evicted when full.
    voters: VecDeque<CachedVoter>,
    pub tally: u128,
    pub final_tally: u128,
}

impl CacheEntry {
    fn new(hash: BlockHash, id: u64) -> Self {
        Self {
            hash,
            id,
            voters: VecDeque::new(),
            tally: 0,
            final_tally: 0,
        }
    }

    /// Record one vote. A known voter is replaced in place when the new
    /// timestamp is strictly higher (its weight leaves and re-enters the
    /// tally, never summing); when the entry is full the oldest voter is
    /// displaced to admit a new one.
    fn vote(&mut self, vote: &Vote, weight: u128, max_voters: usize) {
        if let Some(existing) = self.voters.iter_mut().find(|v| v.account == vote.voter) {
            if vote.timestamp <= existing.timestamp {
                return;
            }
            self.tally = self.tally - existing.weight + weight;
            if existing.timestamp == quill_types::VOTE_TIMESTAMP_FINAL {
                self.final_tally -= existing.weight;
            }
            existing.timestamp = vote.timestamp;
            existing.weight = weight;
        } else {
            if self.voters.len() >= max_voters {
                if let Some(oldest) = self.voters.pop_front() {
                    self.tally -= oldest.weight;
                    if oldest.timestamp == quill_types::VOTE_TIMESTAMP_FINAL {
                        self.final_tally -= oldest.weight;
                    }
                }
            }
            self.voters.push_back(CachedVoter {
                account: vote.voter.clone(),
                timestamp: vote.timestamp,
                weight,
            });
            self.tally += weight;
        }
        if vote.is_final() {
            self.final_tally += weight;
        }
    }

    /// The cached (voter, timestamp) pairs, oldest first.
    pub fn voters(&self) -> impl Iterator<Item = (&Account, u64)> {
        self.voters.iter().map(|v| (&v.account, v.timestamp))
    }

    pub fn size(&self) -> usize {
        self.voters.len()
    }
}

type OrderKey = (u128, u64, BlockHash);

/// Pre-election vote storage with per-voter deduplication and running
/// tallies.
pub struct VoteCache {
    config: VoteCacheConfig,
    next_id: u64,
    cache: HashMap<BlockHash, CacheEntry>,
    /// All entries ordered by (tally, id): the minimum is the eviction
    /// victim (lowest tally, oldest among ties).
    order: BTreeSet<OrderKey>,
    /// Entries awaiting scheduler pickup, same ordering; the maximum is
    /// the strongest waiting fork.
    queue: BTreeSet<OrderKey>,
}

impl VoteCache {
    pub fn new(config: VoteCacheConfig) -> Self {
        Self {
            config,
            next_id: 0,
            cache: HashMap::new(),
            order: BTreeSet::new(),
            queue: BTreeSet::new(),
        }
    }

    fn key(entry: &CacheEntry) -> OrderKey {
        (entry.tally, entry.id, entry.hash)
    }

    /// Insert or update the entry for `vote.hash`, crediting
    /// `rep_weight` to its tally.
    pub fn vote(&mut self, vote: &Vote, rep_weight: u128) {
        match self.cache.get_mut(&vote.hash) {
            Some(entry) => {
                let old_key = Self::key(entry);
                let was_queued = self.queue.remove(&old_key);
                self.order.remove(&old_key);
                entry.vote(vote, rep_weight, self.config.max_voters);
                let new_key = Self::key(entry);
                self.order.insert(new_key);
                // Queued entries keep their scheduler visibility;
                // others only return via trigger.
                if was_queued {
                    self.queue.insert(new_key);
                }
            }
            None => {
                let mut entry = CacheEntry::new(vote.hash, self.next_id);
                self.next_id += 1;
                entry.vote(vote, rep_weight, self.config.max_voters);
                let key = Self::key(&entry);
                self.order.insert(key);
                self.queue.insert(key);
                self.cache.insert(vote.hash, entry);
            }
        }

        if self.cache.len() > self.config.max_size {
            if let Some(victim) = self.order.first().copied() {
                self.remove_key(&victim);
            }
        }
    }

    pub fn find(&self, hash: &BlockHash) -> Option<&CacheEntry> {
        self.cache.get(hash)
    }

    pub fn erase(&mut self, hash: &BlockHash) -> bool {
        match self.cache.get(hash).map(Self::key) {
            Some(key) => {
                self.remove_key(&key);
                true
            }
            None => false,
        }
    }

    /// The highest-tally queued entry with tally ≥ `min_tally`, left in
    /// place.
    pub fn peek(&self, min_tally: u128) -> Option<&CacheEntry> {
        let (tally, _, hash) = self.queue.last()?;
        if *tally < min_tally {
            return None;
        }
        self.cache.get(hash)
    }

    /// Like [`Self::peek`], but removes the returned entry from the
    /// cache.
    pub fn pop(&mut self, min_tally: u128) -> Option<CacheEntry> {
        let key = *self.queue.last()?;
        if key.0 < min_tally {
            return None;
        }
        let entry = self.cache.get(&key.2).cloned();
        self.remove_key(&key);
        entry
    }

    /// Re-signal `hash` to the scheduler: used when a block body
    /// finally arrives for a hash that already accumulated votes.
    pub fn trigger(&mut self, hash: &BlockHash) {
        if let Some(entry) = self.cache.get(hash) {
            self.queue.insert(Self::key(entry));
        }
    }

    /// Hide `hash` from the scheduler without dropping its votes; a
    /// later [`Self::trigger`] brings it back. Used when the entry's
    /// block body has not arrived yet.
    pub fn dequeue(&mut self, hash: &BlockHash) {
        if let Some(entry) = self.cache.get(hash) {
            self.queue.remove(&Self::key(entry));
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn remove_key(&mut self, key: &OrderKey) {
        self.order.remove(key);
        self.queue.remove(key);
        self.cache.remove(&key.2);
    }
}
