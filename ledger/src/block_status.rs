//! Result taxonomy for ledger block processing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of attempting to commit one block to the ledger.
///
/// `Progress` is the only success; everything else classifies why the
/// block was not committed, and the block processor routes on it
/// (gap statuses feed the unchecked table, `Fork` starts an election).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Block committed to the ledger.
    Progress,
    /// The previous block is not yet in the ledger.
    GapPrevious,
    /// The source block of a receive is not yet in the ledger.
    GapSource,
    /// An epoch open block whose account has no pending funds yet.
    GapEpochOpenPending,
    /// Already in the ledger (or currently queued).
    Old,
    /// Signature does not verify against the account.
    BadSignature,
    /// A send that would increase the sender's balance.
    NegativeSpend,
    /// The referenced pending entry does not exist or is not addressed
    /// to this account.
    Unreceivable,
    /// A competing block already occupies this qualified root.
    Fork,
    /// Attempt to open the burn account's chain.
    OpenedBurnAccount,
    /// Balance transition inconsistent with the amount moved.
    BalanceMismatch,
    /// Representative field changed where it must not.
    RepresentativeMismatch,
    /// Previous block belongs to a different account's chain.
    BlockPosition,
    /// Proof-of-work does not meet the threshold.
    InsufficientWork,
}

impl BlockStatus {
    /// Stable lowercase name, used as a stats/metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Progress => "progress",
            BlockStatus::GapPrevious => "gap_previous",
            BlockStatus::GapSource => "gap_source",
            BlockStatus::GapEpochOpenPending => "gap_epoch_open_pending",
            BlockStatus::Old => "old",
            BlockStatus::BadSignature => "bad_signature",
            BlockStatus::NegativeSpend => "negative_spend",
            BlockStatus::Unreceivable => "unreceivable",
            BlockStatus::Fork => "fork",
            BlockStatus::OpenedBurnAccount => "opened_burn_account",
            BlockStatus::BalanceMismatch => "balance_mismatch",
            BlockStatus::RepresentativeMismatch => "representative_mismatch",
            BlockStatus::BlockPosition => "block_position",
            BlockStatus::InsufficientWork => "insufficient_work",
        }
    }

    /// Whether this status indicates a missing dependency that may
    /// arrive later.
    pub fn is_gap(&self) -> bool {
        matches!(
            self,
            BlockStatus::GapPrevious | BlockStatus::GapSource | BlockStatus::GapEpochOpenPending
        )
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
