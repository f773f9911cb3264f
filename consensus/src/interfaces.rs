//! Injected collaborator capabilities.
//!
//! Elections and the block processor never hold references to the node;
//! every outward dependency is one of these traits, wired at
//! construction. This keeps the processor/election/table cycle broken
//! and lets tests substitute recording fakes.

use quill_ledger::Block;
use quill_types::{Account, BlockHash, QualifiedRoot};

/// Weighted-voter oracle: representative weights and the quorum
/// parameters derived from trended online weight.
pub trait RepWeightOracle: Send + Sync {
    /// Current ledger voting weight of `representative`.
    fn weight(&self, representative: &Account) -> u128;

    /// Smoothed estimate of total currently-participating weight.
    fn trended_weight(&self) -> u128;

    /// Minimum margin between the top two candidates required to
    /// declare a winner.
    fn quorum_delta(&self) -> u128;

    /// Weight floor below which a voter's ballots are discarded.
    fn minimum_principal_weight(&self) -> u128;

    /// Whether final votes are required before quorum alone confirms.
    fn final_votes_canary(&self) -> bool;

    /// Dev networks skip the principal weight floor so single-node
    /// tests can vote with arbitrary weights.
    fn is_dev_network(&self) -> bool {
        false
    }
}

/// Capability to push a block onto the processor's forced queue — used
/// by elections when the tallied winner differs from the committed
/// successor and the ledger must switch sides.
pub trait ElectionSink: Send + Sync {
    fn force(&self, block: Block);
}

/// Outbound network surface for an election. All methods are
/// fire-and-forget with no delivery guarantee.
pub trait ConfirmationSolicitor: Send + Sync {
    /// Flood the winning block to peers.
    fn flood_block(&self, block: &Block);

    /// Broadcast this node's current vote for `hash`.
    fn broadcast_vote(&self, hash: &BlockHash, is_final: bool);

    /// Ask peers to confirm their vote for the fork at `root`.
    fn request_confirm(&self, root: &QualifiedRoot, winner: &BlockHash);
}

/// Local voting capability: whether this replica is itself a
/// representative, and vote generation for the hashes it endorses.
pub trait LocalVoting: Send + Sync {
    fn is_representative(&self) -> bool;

    /// Generate and dispatch a vote for `hash`; final votes carry the
    /// sentinel timestamp.
    fn generate_vote(&self, root: &QualifiedRoot, hash: &BlockHash, is_final: bool);
}
