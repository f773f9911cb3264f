//! Vote spacing — prevents rapid vote flip-flopping during fork
//! resolution.
//!
//! When the leading candidate changes, a representative should not
//! immediately flip its vote: an adversary alternating the winner could
//! otherwise drive vote oscillation. Spacing enforces a minimum gap
//! between vote changes for the same fork root; re-voting for the same
//! block is always allowed.

use quill_types::{BlockHash, QualifiedRoot};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const MIN_VOTE_SPACING: Duration = Duration::from_millis(1500);

/// Tracks per-root vote timing to damp vote flipping.
pub struct VoteSpacing {
    last_vote: HashMap<QualifiedRoot, (Instant, BlockHash)>,
}

impl VoteSpacing {
    pub fn new() -> Self {
        Self {
            last_vote: HashMap::new(),
        }
    }

    /// Whether a vote for `candidate` may be generated at this root.
    pub fn votable(&self, root: &QualifiedRoot, candidate: &BlockHash) -> bool {
        match self.last_vote.get(root) {
            None => true,
            Some((last_time, last_hash)) => {
                last_hash == candidate || last_time.elapsed() >= MIN_VOTE_SPACING
            }
        }
    }

    /// Record that a vote was cast for this root.
    pub fn record(&mut self, root: QualifiedRoot, hash: BlockHash) {
        self.last_vote.insert(root, (Instant::now(), hash));
    }

    /// Drop entries old enough to be irrelevant.
    pub fn cleanup(&mut self) {
        let cutoff = MIN_VOTE_SPACING * 2;
        self.last_vote.retain(|_, (t, _)| t.elapsed() < cutoff);
    }

    pub fn len(&self) -> usize {
        self.last_vote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_vote.is_empty()
    }
}

impl Default for VoteSpacing {
    fn default() -> Self {
        Self::new()
    }
}
