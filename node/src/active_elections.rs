//! Active elections — the table of in-flight conflict resolutions.
//!
//! One election per qualified root. Incoming votes are routed to the
//! election tracking their hash; votes that arrive before any election
//! exists are parked in the vote cache so the hinted scheduler (or a
//! later election start) can replay them. Confirmed winners are
//! cemented into the ledger from the election's confirmation action.

use crate::metrics::NodeMetrics;
use quill_consensus::{
    CacheEntry, ConfirmationSolicitor, Election, ElectionActivator, ElectionBehavior,
    ElectionSink, ElectionState, ElectionStatus, ElectionTimings, LocalVoting, RepWeightOracle,
    Vote, VoteCache, VoteResult, VoteSource,
};
use quill_ledger::{Block, BlockStatus, Ledger};
use quill_types::{BlockHash, QualifiedRoot};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

#[derive(Clone, Debug)]
pub struct ActiveElectionsConfig {
    /// Maximum concurrent elections before inserts are declined.
    pub max_elections: usize,
}

impl Default for ActiveElectionsConfig {
    fn default() -> Self {
        Self {
            max_elections: 5000,
        }
    }
}

const RECENTLY_CONFIRMED_MAX: usize = 65536;

/// Bounded memory of just-confirmed hashes, so late votes for them are
/// classified as replays instead of spilling into the vote cache.
struct RecentlyConfirmed {
    order: VecDeque<BlockHash>,
    hashes: HashSet<BlockHash>,
}

impl RecentlyConfirmed {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            hashes: HashSet::new(),
        }
    }

    fn insert(&mut self, hash: BlockHash) {
        if !self.hashes.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        while self.order.len() > RECENTLY_CONFIRMED_MAX {
            if let Some(old) = self.order.pop_front() {
                self.hashes.remove(&old);
            }
        }
    }

    fn contains(&self, hash: &BlockHash) -> bool {
        self.hashes.contains(hash)
    }
}

struct ElectionsIndex {
    roots: HashMap<QualifiedRoot, Arc<Election>>,
    by_hash: HashMap<BlockHash, QualifiedRoot>,
}

type ConfirmedObserver = Box<dyn Fn(&ElectionStatus) + Send + Sync>;

pub struct ActiveElections {
    config: ActiveElectionsConfig,
    timings: ElectionTimings,
    oracle: Arc<dyn RepWeightOracle>,
    ledger: Arc<dyn Ledger>,
    sink: Arc<dyn ElectionSink>,
    solicitor: Arc<dyn ConfirmationSolicitor>,
    voting: Arc<dyn LocalVoting>,
    vote_cache: Arc<Mutex<VoteCache>>,
    metrics: Arc<NodeMetrics>,
    index: Mutex<ElectionsIndex>,
    recently_confirmed: Arc<Mutex<RecentlyConfirmed>>,
    /// Winners that reached quorum before their forced commit landed;
    /// cemented as soon as the processor reports them committed.
    pending_cement: Arc<Mutex<HashSet<BlockHash>>>,
    confirmed_observers: Arc<Mutex<Vec<ConfirmedObserver>>>,
}

impl ActiveElections {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ActiveElectionsConfig,
        timings: ElectionTimings,
        oracle: Arc<dyn RepWeightOracle>,
        ledger: Arc<dyn Ledger>,
        sink: Arc<dyn ElectionSink>,
        solicitor: Arc<dyn ConfirmationSolicitor>,
        voting: Arc<dyn LocalVoting>,
        vote_cache: Arc<Mutex<VoteCache>>,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            config,
            timings,
            oracle,
            ledger,
            sink,
            solicitor,
            voting,
            vote_cache,
            metrics,
            index: Mutex::new(ElectionsIndex {
                roots: HashMap::new(),
                by_hash: HashMap::new(),
            }),
            recently_confirmed: Arc::new(Mutex::new(RecentlyConfirmed::new())),
            pending_cement: Arc::new(Mutex::new(HashSet::new())),
            confirmed_observers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register for confirmed election results.
    pub fn on_confirmed(&self, observer: ConfirmedObserver) {
        self.confirmed_observers.lock().unwrap().push(observer);
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Election currently tracking `hash`, if any.
    pub fn election_for_hash(&self, hash: &BlockHash) -> Option<Arc<Election>> {
        let index = self.index.lock().unwrap();
        let root = index.by_hash.get(hash)?;
        index.roots.get(root).cloned()
    }

    pub fn election(&self, root: &QualifiedRoot) -> Option<Arc<Election>> {
        self.index.lock().unwrap().roots.get(root).cloned()
    }

    /// Start an election for `block`'s fork slot, or return the one
    /// already running there. `None` means the table is at capacity or
    /// the slot was recently confirmed.
    pub fn insert(
        &self,
        block: Block,
        behavior: ElectionBehavior,
    ) -> Option<Arc<Election>> {
        let root = block.qualified_root();
        {
            if self.recently_confirmed.lock().unwrap().contains(&block.hash) {
                trace!(hash = %block.hash, "election declined, recently confirmed");
                return None;
            }
        }
        let mut index = self.index.lock().unwrap();
        if let Some(existing) = index.roots.get(&root) {
            return Some(Arc::clone(existing));
        }
        if index.roots.len() >= self.config.max_elections {
            debug!(%root, "election declined, table at capacity");
            return None;
        }

        let hash = block.hash;
        let election = Arc::new(Election::new(
            block,
            behavior,
            self.timings,
            Arc::clone(&self.oracle),
            Arc::clone(&self.sink),
            Arc::clone(&self.solicitor),
            Arc::clone(&self.voting),
            self.confirmation_action(),
        ));
        index.roots.insert(root.clone(), Arc::clone(&election));
        index.by_hash.insert(hash, root.clone());
        self.metrics.election_count.set(index.roots.len() as i64);
        debug!(%root, %hash, behavior = behavior.as_str(), "election started");
        Some(election)
    }

    /// What a confirmed election does: cement the winner, remember the
    /// hash, notify observers.
    fn confirmation_action(&self) -> Box<dyn Fn(ElectionStatus) + Send + Sync> {
        let ledger = Arc::clone(&self.ledger);
        let recently_confirmed = Arc::clone(&self.recently_confirmed);
        let pending_cement = Arc::clone(&self.pending_cement);
        let observers = Arc::clone(&self.confirmed_observers);
        let metrics = Arc::clone(&self.metrics);
        Box::new(move |status: ElectionStatus| {
            metrics
                .confirmation_latency_ms
                .observe(status.duration.as_secs_f64() * 1000.0);
            if let Some(winner) = &status.winner {
                let mut tx = ledger.begin_write();
                match ledger.confirm(&mut tx, &winner.hash) {
                    Ok(()) => {
                        metrics.blocks_confirmed.inc();
                        debug!(hash = %winner.hash, tally = status.tally, "block confirmed");
                    }
                    Err(e) => {
                        // The winner can still be in flight through the
                        // forced queue when quorum lands; cement it once
                        // its commit comes back from the processor.
                        debug!(hash = %winner.hash, error = %e, "cementing deferred");
                        pending_cement.lock().unwrap().insert(winner.hash);
                    }
                }
                recently_confirmed.lock().unwrap().insert(winner.hash);
            }
            for observer in observers.lock().unwrap().iter() {
                observer(&status);
            }
        })
    }

    /// Route a live vote: to the election tracking its hash, or into
    /// the vote cache when no election exists yet.
    pub fn vote(&self, vote: &Vote) -> VoteResult {
        self.metrics.votes_received.inc();
        if let Some(election) = self.election_for_hash(&vote.hash) {
            return election.vote(&vote.voter, vote.timestamp, vote.hash, VoteSource::Live);
        }
        if self.recently_confirmed.lock().unwrap().contains(&vote.hash) {
            return VoteResult::REPLAY;
        }
        let weight = self.oracle.weight(&vote.voter);
        {
            let mut cache = self.vote_cache.lock().unwrap();
            cache.vote(vote, weight);
            self.metrics.vote_cache_size.set(cache.len() as i64);
        }
        trace!(hash = %vote.hash, voter = %vote.voter, "vote cached, no election");
        VoteResult::PROCESSED
    }

    /// Offer `block` as a candidate to the election running on its
    /// fork slot. Returns false when no election exists or the election
    /// declined it.
    pub fn publish(&self, block: Block) -> bool {
        let root = block.qualified_root();
        let Some(election) = self.election(&root) else {
            return false;
        };
        let hash = block.hash;
        let cache_tally = self
            .vote_cache
            .lock()
            .unwrap()
            .find(&hash)
            .map(|entry| entry.tally)
            .unwrap_or_default();
        let evicted = match election.publish(block, cache_tally) {
            Ok(evicted) => evicted,
            Err(e) => {
                trace!(%root, %hash, error = %e, "candidate not accepted");
                return false;
            }
        };
        {
            let mut index = self.index.lock().unwrap();
            // An evicted candidate no longer tallies; its votes belong
            // back in the cache.
            if let Some(evicted) = evicted {
                index.by_hash.remove(&evicted);
            }
            index.by_hash.insert(hash, root);
        }
        // The candidate may have cached votes waiting for it.
        if let Some(entry) = self.vote_cache.lock().unwrap().find(&hash).cloned() {
            election.fill_from_cache(&entry);
        }
        true
    }

    /// React to a batch leaving the block processor. Progress results
    /// feed existing elections and wake parked vote-cache entries;
    /// forks start an election over the committed occupant and offer
    /// the challenger to it.
    pub fn handle_processed(&self, results: &[(BlockStatus, Block)]) {
        for (status, block) in results {
            self.metrics
                .blocks_processed
                .with_label_values(&[status.as_str()])
                .inc();
            match status {
                BlockStatus::Progress => {
                    if self.pending_cement.lock().unwrap().remove(&block.hash) {
                        let mut tx = self.ledger.begin_write();
                        match self.ledger.confirm(&mut tx, &block.hash) {
                            Ok(()) => {
                                self.metrics.blocks_confirmed.inc();
                                debug!(hash = %block.hash, "deferred cement applied");
                            }
                            Err(e) => {
                                warn!(hash = %block.hash, error = %e, "deferred cement failed");
                            }
                        }
                    }
                    self.publish(block.clone());
                    self.vote_cache.lock().unwrap().trigger(&block.hash);
                }
                BlockStatus::Fork => {
                    if let Some(committed) = self.ledger.successor(&block.qualified_root()) {
                        self.insert(committed, ElectionBehavior::Normal);
                    }
                    self.publish(block.clone());
                }
                _ => {}
            }
        }
    }

    /// Drive election timers and reap finished elections. Returns the
    /// number removed.
    pub fn tick(&self) -> usize {
        let elections: Vec<Arc<Election>> = {
            let index = self.index.lock().unwrap();
            index.roots.values().cloned().collect()
        };
        for election in &elections {
            election.transition_time();
        }

        let mut index = self.index.lock().unwrap();
        let before = index.roots.len();
        let expired: Vec<QualifiedRoot> = index
            .roots
            .iter()
            .filter(|(_, e)| {
                matches!(
                    e.state(),
                    ElectionState::ExpiredConfirmed | ElectionState::ExpiredUnconfirmed
                )
            })
            .map(|(root, _)| root.clone())
            .collect();
        for root in expired {
            if let Some(election) = index.roots.remove(&root) {
                for block in election.blocks() {
                    index.by_hash.remove(&block.hash);
                }
                trace!(%root, state = election.state().as_str(), "election reaped");
            }
        }
        self.metrics.election_count.set(index.roots.len() as i64);
        before - index.roots.len()
    }
}

impl ElectionActivator for ActiveElections {
    fn activate(&self, block: Block, entry: &CacheEntry, behavior: ElectionBehavior) -> bool {
        let Some(election) = self.insert(block, behavior) else {
            return false;
        };
        self.metrics.hinted_elections.inc();
        election.fill_from_cache(entry);
        true
    }
}
