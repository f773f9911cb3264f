//! Consensus — fork resolution via Open Representative Voting (ORV).
//!
//! Each account delegates its weight to a representative; representatives
//! vote on conflicting blocks. A fork is settled when the leading candidate's
//! margin over the runner-up reaches the quorum delta derived from trended
//! online weight.
//!
//! ## Module overview
//!
//! - [`election`] — per-fork election state machine (Passive → Active →
//!   Confirmed/Expired) with weighted tally and fork replacement.
//! - [`vote_cache`] — bounded storage for votes that arrive before their
//!   election exists.
//! - [`hinted`] — scheduler that promotes high-tally cached forks into
//!   elections.
//! - [`vote_info`] — per-voter vote records and vote processing results.
//! - [`vote_spacing`] — flip-flop damping for locally generated votes.
//! - [`interfaces`] — injected collaborator capabilities (weight oracle,
//!   processor sink, network solicitation, local voting).
//! - [`error`] — consensus error types.

pub mod election;
pub mod error;
pub mod hinted;
pub mod interfaces;
pub mod vote_cache;
pub mod vote_info;
pub mod vote_spacing;

pub use election::{
    Election, ElectionBehavior, ElectionState, ElectionStatus, ElectionTimings, Tally, TallyKey,
    MAX_ELECTION_BLOCKS,
};
pub use error::ConsensusError;
pub use hinted::{ElectionActivator, HintedScheduler, HintedSchedulerConfig};
pub use interfaces::{ConfirmationSolicitor, ElectionSink, LocalVoting, RepWeightOracle};
pub use vote_cache::{CacheEntry, VoteCache, VoteCacheConfig};
pub use vote_info::{Vote, VoteInfo, VoteResult, VoteSource};
pub use vote_spacing::VoteSpacing;
