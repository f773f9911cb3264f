//! Vote data — a representative's vote on a block, and the per-voter
//! record an election keeps for it.

use quill_types::{Account, BlockHash, Signature, VOTE_TIMESTAMP_FINAL};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A vote as received from the network (or generated locally).
///
/// `timestamp` is monotonic per voter; [`VOTE_TIMESTAMP_FINAL`] marks an
/// irrevocable final vote, exempt from cooldown and never superseded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: Account,
    pub timestamp: u64,
    pub hash: BlockHash,
    pub signature: Signature,
}

impl Vote {
    pub fn new(voter: Account, timestamp: u64, hash: BlockHash, signature: Signature) -> Self {
        Self {
            voter,
            timestamp,
            hash,
            signature,
        }
    }

    pub fn is_final(&self) -> bool {
        self.timestamp == VOTE_TIMESTAMP_FINAL
    }
}

/// Where a vote entered the election from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteSource {
    /// Fresh from the network; subject to cooldown and recorded in vote
    /// history.
    Live,
    /// Replayed out of the vote cache when the election was created;
    /// bypasses cooldown and the live side effects.
    Cached,
}

/// Outcome of feeding one vote into an election.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoteResult {
    /// The vote was older than (or tied with) the voter's recorded vote.
    pub replay: bool,
    /// The vote was recorded in `last_votes`.
    pub processed: bool,
}

impl VoteResult {
    pub const REPLAY: Self = Self {
        replay: true,
        processed: false,
    };
    pub const IGNORED: Self = Self {
        replay: false,
        processed: false,
    };
    pub const PROCESSED: Self = Self {
        replay: false,
        processed: true,
    };
}

/// The last vote an election has recorded for one voter.
#[derive(Clone, Debug)]
pub struct VoteInfo {
    /// Local arrival time; drives the revote cooldown.
    pub time: Instant,
    /// The voter-supplied monotonic timestamp.
    pub timestamp: u64,
    /// The block voted for.
    pub hash: BlockHash,
}

impl VoteInfo {
    pub fn new(timestamp: u64, hash: BlockHash) -> Self {
        Self {
            time: Instant::now(),
            timestamp,
            hash,
        }
    }

    pub fn is_final(&self) -> bool {
        self.timestamp == VOTE_TIMESTAMP_FINAL
    }
}
