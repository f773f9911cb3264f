//! Election state machine — drives one fork root's voting process to
//! confirmation or expiry.
//!
//! An election is created when a block becomes active for a qualified
//! root. Representatives vote on which candidate to confirm; the fork is
//! settled when the leader's margin over the runner-up reaches the
//! quorum delta. The state discriminant is atomic so hot paths can ask
//! "is this settled?" without the lock; compound fields live behind one
//! per-election mutex, so concurrent vote arrivals for different forks
//! never contend.

use crate::error::ConsensusError;
use crate::interfaces::{ConfirmationSolicitor, ElectionSink, LocalVoting, RepWeightOracle};
use crate::vote_info::{VoteInfo, VoteResult, VoteSource};
use quill_ledger::Block;
use quill_types::{Account, BlockHash, QualifiedRoot, VOTE_TIMESTAMP_FINAL};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Cap on distinct candidate blocks per election.
pub const MAX_ELECTION_BLOCKS: usize = 10;

/// Lifecycle state. All transitions are one-directional; the two
/// expired states are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ElectionState {
    /// Created, waiting out the passive duration before soliciting.
    Passive = 0,
    /// Actively soliciting votes and rebroadcasting the winner.
    Active = 1,
    /// Quorum reached; side effects have run exactly once.
    Confirmed = 2,
    /// Confirmed and seen by a subsequent tick; eligible for cleanup.
    ExpiredConfirmed = 3,
    /// Timed out without confirmation.
    ExpiredUnconfirmed = 4,
}

impl ElectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ElectionState::Passive,
            1 => ElectionState::Active,
            2 => ElectionState::Confirmed,
            3 => ElectionState::ExpiredConfirmed,
            _ => ElectionState::ExpiredUnconfirmed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionState::Passive => "passive",
            ElectionState::Active => "active",
            ElectionState::Confirmed => "confirmed",
            ElectionState::ExpiredConfirmed => "expired_confirmed",
            ElectionState::ExpiredUnconfirmed => "expired_unconfirmed",
        }
    }
}

/// Transition legality as a pure function; everything not listed is
/// rejected.
pub fn valid_change(from: ElectionState, to: ElectionState) -> bool {
    use ElectionState::*;
    matches!(
        (from, to),
        (Passive, Active)
            | (Passive, Confirmed)
            | (Passive, ExpiredUnconfirmed)
            | (Active, Confirmed)
            | (Active, ExpiredUnconfirmed)
            | (Confirmed, ExpiredConfirmed)
    )
}

/// How the election came to exist; parameterizes its timing constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionBehavior {
    /// Started for a freshly processed fork.
    Normal,
    /// Promoted out of the vote cache by the hinted scheduler.
    Hinted,
    /// Started speculatively for an unconfirmed frontier.
    Optimistic,
}

impl ElectionBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionBehavior::Normal => "normal",
            ElectionBehavior::Hinted => "hinted",
            ElectionBehavior::Optimistic => "optimistic",
        }
    }
}

/// Timing constants, scaled from a base network latency.
#[derive(Clone, Copy, Debug)]
pub struct ElectionTimings {
    pub base_latency: Duration,
    /// Time-to-live for normal elections.
    pub normal_ttl: Duration,
    /// Time-to-live for hinted and optimistic elections.
    pub hinted_ttl: Duration,
}

impl ElectionTimings {
    pub fn production() -> Self {
        Self {
            base_latency: Duration::from_secs(1),
            normal_ttl: Duration::from_secs(300),
            hinted_ttl: Duration::from_secs(30),
        }
    }

    /// Compressed latencies for single-node dev networks and tests.
    pub fn dev() -> Self {
        Self {
            base_latency: Duration::from_millis(25),
            ..Self::production()
        }
    }

    pub fn time_to_live(&self, behavior: ElectionBehavior) -> Duration {
        match behavior {
            ElectionBehavior::Normal => self.normal_ttl,
            ElectionBehavior::Hinted | ElectionBehavior::Optimistic => self.hinted_ttl,
        }
    }

    fn passive_duration(&self) -> Duration {
        self.base_latency * 5
    }

    fn confirm_req_interval(&self, behavior: ElectionBehavior) -> Duration {
        match behavior {
            ElectionBehavior::Optimistic => self.base_latency * 2,
            _ => self.base_latency * 5,
        }
    }

    fn block_broadcast_interval(&self) -> Duration {
        self.base_latency * 15
    }

    fn vote_broadcast_interval(&self) -> Duration {
        self.base_latency * 5
    }
}

impl Default for ElectionTimings {
    fn default() -> Self {
        Self::production()
    }
}

/// Ordering key for the tally: descending weight, then ascending hash
/// so iteration order is deterministic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TallyKey(pub u128, pub BlockHash);

impl Ord for TallyKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.cmp(&self.0).then_with(|| self.1.cmp(&other.1))
    }
}

impl PartialOrd for TallyKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Per-candidate weights, strongest first.
pub type Tally = BTreeMap<TallyKey, Block>;

/// Snapshot of an election's progress, handed to the confirmation
/// action when it settles.
#[derive(Clone, Debug)]
pub struct ElectionStatus {
    pub winner: Option<Block>,
    pub tally: u128,
    pub final_tally: u128,
    pub block_count: u32,
    pub voter_count: u32,
    pub confirmation_request_count: u32,
    /// Time from election start to confirmation. Zero until settled.
    pub duration: Duration,
    pub behavior: ElectionBehavior,
}

struct ElectionData {
    status: ElectionStatus,
    last_votes: HashMap<Account, VoteInfo>,
    last_blocks: HashMap<BlockHash, Block>,
    /// Per-candidate weights from the most recent tally.
    last_tally: HashMap<BlockHash, u128>,
    final_weights: HashMap<BlockHash, u128>,
    last_block_broadcast: Option<Instant>,
    last_vote_broadcast: Option<Instant>,
    last_confirm_req: Option<Instant>,
}

type ConfirmationAction = Box<dyn Fn(ElectionStatus) + Send + Sync>;

/// A single fork's consensus object. See the module docs for the
/// locking discipline.
pub struct Election {
    pub qualified_root: QualifiedRoot,
    pub behavior: ElectionBehavior,
    timings: ElectionTimings,
    state: AtomicU8,
    data: Mutex<ElectionData>,
    /// Final vote broadcast happens at most once per election.
    final_vote_sent: AtomicBool,
    election_start: Instant,
    oracle: Arc<dyn RepWeightOracle>,
    sink: Arc<dyn ElectionSink>,
    solicitor: Arc<dyn ConfirmationSolicitor>,
    voting: Arc<dyn LocalVoting>,
    confirmation_action: ConfirmationAction,
}

impl Election {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block: Block,
        behavior: ElectionBehavior,
        timings: ElectionTimings,
        oracle: Arc<dyn RepWeightOracle>,
        sink: Arc<dyn ElectionSink>,
        solicitor: Arc<dyn ConfirmationSolicitor>,
        voting: Arc<dyn LocalVoting>,
        confirmation_action: ConfirmationAction,
    ) -> Self {
        let qualified_root = block.qualified_root();
        let mut last_blocks = HashMap::new();
        last_blocks.insert(block.hash, block.clone());
        Self {
            qualified_root,
            behavior,
            timings,
            state: AtomicU8::new(ElectionState::Passive as u8),
            data: Mutex::new(ElectionData {
                status: ElectionStatus {
                    winner: Some(block),
                    tally: 0,
                    final_tally: 0,
                    block_count: 1,
                    voter_count: 0,
                    confirmation_request_count: 0,
                    duration: Duration::ZERO,
                    behavior,
                },
                last_votes: HashMap::new(),
                last_blocks,
                last_tally: HashMap::new(),
                final_weights: HashMap::new(),
                last_block_broadcast: None,
                last_vote_broadcast: None,
                last_confirm_req: None,
            }),
            final_vote_sent: AtomicBool::new(false),
            election_start: Instant::now(),
            oracle,
            sink,
            solicitor,
            voting,
            confirmation_action,
        }
    }

    pub fn state(&self) -> ElectionState {
        ElectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Lock-free settled check for hot paths.
    pub fn confirmed(&self) -> bool {
        matches!(
            self.state(),
            ElectionState::Confirmed | ElectionState::ExpiredConfirmed
        )
    }

    pub fn failed(&self) -> bool {
        self.state() == ElectionState::ExpiredUnconfirmed
    }

    pub fn winner(&self) -> Option<Block> {
        self.data.lock().unwrap().status.winner.clone()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.data.lock().unwrap().last_blocks.values().cloned().collect()
    }

    pub fn votes(&self) -> HashMap<Account, VoteInfo> {
        self.data.lock().unwrap().last_votes.clone()
    }

    pub fn status(&self) -> ElectionStatus {
        self.data.lock().unwrap().status.clone()
    }

    /// Attempt one legal transition. All writers go through here; the
    /// compare-exchange keeps lock-free readers coherent.
    fn state_change(&self, from: ElectionState, to: ElectionState) -> bool {
        if !valid_change(from, to) {
            return false;
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Revote cooldown, tiered by the voter's share of trended online
    /// weight: >5% may revote after 1s, >1% after 5s, everyone else
    /// after 15s.
    fn cooldown(&self, weight: u128) -> Duration {
        let trended = self.oracle.trended_weight();
        if weight > trended / 20 {
            Duration::from_secs(1)
        } else if weight > trended / 100 {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(15)
        }
    }

    /// Feed one vote into the election.
    ///
    /// Acceptance per voter is monotonic in (timestamp, hash): an older
    /// timestamp, or an equal timestamp without a lexicographically
    /// larger hash, is a replay. Final votes supersede anything and
    /// bypass the cooldown; live votes from the same voter inside their
    /// cooldown window are dropped.
    pub fn vote(
        &self,
        voter: &Account,
        timestamp: u64,
        hash: BlockHash,
        source: VoteSource,
    ) -> VoteResult {
        let weight = self.oracle.weight(voter);
        if weight < self.oracle.minimum_principal_weight() && !self.oracle.is_dev_network() {
            return VoteResult::IGNORED;
        }

        let confirmed_status = {
            let mut data = self.data.lock().unwrap();
            if let Some(last) = data.last_votes.get(voter) {
                if last.timestamp > timestamp {
                    return VoteResult::REPLAY;
                }
                if last.timestamp == timestamp && hash <= last.hash {
                    return VoteResult::REPLAY;
                }
                let past_cooldown = timestamp == VOTE_TIMESTAMP_FINAL
                    || last.time.elapsed() >= self.cooldown(weight);
                if source == VoteSource::Live && !past_cooldown {
                    return VoteResult::IGNORED;
                }
            }
            data.last_votes
                .insert(voter.clone(), VoteInfo::new(timestamp, hash));
            if source == VoteSource::Live {
                trace!(root = %self.qualified_root, voter = %voter, %hash, "live vote recorded");
            }
            self.confirm_if_quorum(&mut data)
        };

        if let Some(status) = confirmed_status {
            (self.confirmation_action)(status);
        }
        VoteResult::PROCESSED
    }

    /// Replay an entry's cached votes into this election.
    pub fn fill_from_cache(&self, entry: &crate::vote_cache::CacheEntry) {
        for (account, timestamp) in entry.voters() {
            self.vote(account, timestamp, entry.hash, VoteSource::Cached);
        }
    }

    /// Recompute per-candidate weights from `last_votes`. Votes for
    /// blocks this election no longer holds contribute nothing.
    fn tally_impl(&self, data: &mut ElectionData) -> Tally {
        let mut weights: HashMap<BlockHash, u128> = HashMap::new();
        let mut finals: HashMap<BlockHash, u128> = HashMap::new();
        for (voter, info) in &data.last_votes {
            let w = self.oracle.weight(voter);
            *weights.entry(info.hash).or_default() += w;
            if info.is_final() {
                *finals.entry(info.hash).or_default() += w;
            }
        }
        let mut tally = Tally::new();
        for (hash, weight) in &weights {
            if let Some(block) = data.last_blocks.get(hash) {
                tally.insert(TallyKey(*weight, *hash), block.clone());
            }
        }
        data.last_tally = weights;
        data.final_weights = finals;
        tally
    }

    /// Public tally snapshot, strongest candidate first.
    pub fn tally(&self) -> Tally {
        let mut data = self.data.lock().unwrap();
        self.tally_impl(&mut data)
    }

    /// Margin-based quorum: the leader must beat the runner-up by at
    /// least the quorum delta. Tolerates offline or byzantine minority
    /// weight while still requiring a clear plurality lead.
    pub fn have_quorum(&self, tally: &Tally) -> bool {
        let mut keys = tally.keys();
        let top = keys.next().map(|k| k.0).unwrap_or_default();
        let second = keys.next().map(|k| k.0).unwrap_or_default();
        top.saturating_sub(second) >= self.oracle.quorum_delta()
    }

    /// Re-tally and confirm if quorum holds. Returns the status to hand
    /// to the confirmation action when this call won the transition.
    fn confirm_if_quorum(&self, data: &mut ElectionData) -> Option<ElectionStatus> {
        let tally = self.tally_impl(data);
        let (top_key, top_block) = tally.iter().next()?;
        let (winner_weight, winner_hash) = (top_key.0, top_key.1);
        let winner_block = top_block.clone();
        let total: u128 = tally.keys().map(|k| k.0).sum();
        let delta = self.oracle.quorum_delta();

        data.status.tally = winner_weight;
        data.status.final_tally = data
            .final_weights
            .get(&winner_hash)
            .copied()
            .unwrap_or_default();

        let previous_winner = data.status.winner.as_ref().map(|b| b.hash);
        if previous_winner != Some(winner_hash) && total >= delta {
            debug!(root = %self.qualified_root, old = ?previous_winner, new = %winner_hash,
                "election winner changed, forcing recommit");
            data.status.winner = Some(winner_block.clone());
            if let Some(old) = previous_winner {
                data.last_votes.retain(|_, v| v.hash != old);
            }
            self.sink.force(winner_block);
        }

        if !self.have_quorum(&tally) {
            return None;
        }
        if self.oracle.final_votes_canary() {
            if self.voting.is_representative()
                && !self.final_vote_sent.swap(true, Ordering::SeqCst)
            {
                self.voting
                    .generate_vote(&self.qualified_root, &winner_hash, true);
            }
            if data.status.final_tally < delta {
                return None;
            }
        }
        self.confirm_once(data)
    }

    /// Take the Confirmed transition exactly once. Callers hold the
    /// data lock, so only one of them can win the exchange; the winner
    /// runs the side effects.
    fn confirm_once(&self, data: &mut ElectionData) -> Option<ElectionStatus> {
        let current = self.state();
        if !matches!(current, ElectionState::Passive | ElectionState::Active) {
            return None;
        }
        if !self.state_change(current, ElectionState::Confirmed) {
            return None;
        }
        data.status.block_count = data.last_blocks.len() as u32;
        data.status.voter_count = data.last_votes.len() as u32;
        data.status.duration = self.election_start.elapsed();
        info!(root = %self.qualified_root,
            winner = ?data.status.winner.as_ref().map(|b| b.hash),
            tally = data.status.tally, "election confirmed");
        Some(data.status.clone())
    }

    /// Accept a new candidate block for this root. Fails if the
    /// election is already settled or the candidate set stayed full.
    /// Returns the hash of any candidate evicted to make room, so the
    /// caller can drop its own indexes on it.
    pub fn publish(&self, block: Block, cache_tally: u128) -> Result<Option<BlockHash>, ConsensusError> {
        let state = self.state();
        if !matches!(state, ElectionState::Passive | ElectionState::Active) {
            trace!(root = %self.qualified_root, hash = %block.hash, "publish on settled election");
            return Err(ConsensusError::AlreadySettled {
                state: state.as_str(),
            });
        }
        let mut data = self.data.lock().unwrap();
        let hash = block.hash;
        if data.last_blocks.contains_key(&hash) {
            // Known candidate: refresh content; re-flood if it is the
            // current winner.
            data.last_blocks.insert(hash, block.clone());
            if data.status.winner.as_ref().map(|b| b.hash) == Some(hash) {
                data.status.winner = Some(block.clone());
                self.solicitor.flood_block(&block);
            }
            return Ok(None);
        }
        let mut evicted = None;
        if data.last_blocks.len() >= MAX_ELECTION_BLOCKS {
            evicted = Self::replace_by_weight(&mut data, cache_tally);
            if evicted.is_none() {
                debug!(root = %self.qualified_root, %hash, "candidate set full, block not accepted");
                return Err(ConsensusError::CandidatesFull(hash));
            }
        }
        data.last_blocks.insert(hash, block);
        Ok(evicted)
    }

    /// Evict the lowest-tallied candidate if the newcomer's cached
    /// tally beats it, returning the evicted hash. The current winner
    /// is never evicted; among equal-lowest tallies the smallest hash
    /// loses.
    fn replace_by_weight(data: &mut ElectionData, cache_tally: u128) -> Option<BlockHash> {
        let winner_hash = data.status.winner.as_ref().map(|b| b.hash);
        let mut sorted: Vec<(u128, BlockHash)> = data
            .last_blocks
            .keys()
            .map(|h| (data.last_tally.get(h).copied().unwrap_or_default(), *h))
            .collect();
        sorted.sort();
        let victim = sorted
            .iter()
            .find(|(_, h)| Some(*h) != winner_hash)
            .copied();
        match victim {
            Some((tally, hash)) if cache_tally > tally => {
                data.last_blocks.remove(&hash);
                data.last_tally.remove(&hash);
                data.last_votes.retain(|_, v| v.hash != hash);
                debug!(evicted = %hash, evicted_tally = tally, cache_tally,
                    "candidate replaced by weight");
                Some(hash)
            }
            _ => None,
        }
    }

    /// Periodic driver, called by the owning table's tick loop.
    pub fn transition_time(&self) {
        match self.state() {
            ElectionState::Passive => {
                if self.election_start.elapsed() >= self.timings.passive_duration()
                    && self.state_change(ElectionState::Passive, ElectionState::Active)
                {
                    trace!(root = %self.qualified_root, "election activated");
                }
            }
            ElectionState::Active => {
                self.broadcast_block_if_needed();
                self.broadcast_vote_if_needed();
                self.request_confirmations_if_needed();
            }
            ElectionState::Confirmed => {
                self.state_change(ElectionState::Confirmed, ElectionState::ExpiredConfirmed);
            }
            _ => {}
        }

        if !self.confirmed()
            && self.election_start.elapsed() >= self.timings.time_to_live(self.behavior)
        {
            let current = self.state();
            if matches!(current, ElectionState::Passive | ElectionState::Active)
                && self.state_change(current, ElectionState::ExpiredUnconfirmed)
            {
                debug!(root = %self.qualified_root, behavior = self.behavior.as_str(),
                    "election expired unconfirmed");
            }
        }
    }

    fn broadcast_block_if_needed(&self) {
        let mut data = self.data.lock().unwrap();
        let due = data
            .last_block_broadcast
            .map_or(true, |t| t.elapsed() >= self.timings.block_broadcast_interval());
        if !due {
            return;
        }
        if let Some(winner) = data.status.winner.clone() {
            self.solicitor.flood_block(&winner);
            data.last_block_broadcast = Some(Instant::now());
        }
    }

    fn broadcast_vote_if_needed(&self) {
        if !self.voting.is_representative() {
            return;
        }
        let mut data = self.data.lock().unwrap();
        let due = data
            .last_vote_broadcast
            .map_or(true, |t| t.elapsed() >= self.timings.vote_broadcast_interval());
        if !due {
            return;
        }
        if let Some(winner) = data.status.winner.as_ref().map(|b| b.hash) {
            self.solicitor.broadcast_vote(&winner, false);
            data.last_vote_broadcast = Some(Instant::now());
        }
    }

    fn request_confirmations_if_needed(&self) {
        let mut data = self.data.lock().unwrap();
        let due = data
            .last_confirm_req
            .map_or(true, |t| {
                t.elapsed() >= self.timings.confirm_req_interval(self.behavior)
            });
        if !due {
            return;
        }
        if let Some(winner) = data.status.winner.as_ref().map(|b| b.hash) {
            self.solicitor.request_confirm(&self.qualified_root, &winner);
            data.status.confirmation_request_count += 1;
            data.last_confirm_req = Some(Instant::now());
        }
    }

    /// Immediately confirm the current winner. Dev networks only.
    pub fn force_confirm(&self) {
        if !self.oracle.is_dev_network() {
            warn!(root = %self.qualified_root, "force_confirm outside dev network ignored");
            return;
        }
        let confirmed_status = {
            let mut data = self.data.lock().unwrap();
            self.confirm_once(&mut data)
        };
        if let Some(status) = confirmed_status {
            (self.confirmation_action)(status);
        }
    }
}
