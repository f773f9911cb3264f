//! The ledger trait and its single-writer transaction token.

use crate::{Block, BlockStatus, LedgerError};
use quill_types::{Account, BlockHash, QualifiedRoot};
use std::sync::MutexGuard;

/// Exclusive-write token. Holding one proves the caller is the only
/// writer; all mutating ledger operations require it. Batching many
/// commits under one token amortises the acquisition cost.
pub struct WriteTransaction<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(guard: MutexGuard<'a, ()>) -> Self {
        Self { _guard: guard }
    }
}

/// Storage-agnostic ledger interface.
///
/// Reads are lock-free with respect to the write token; writes go
/// through [`WriteTransaction`], of which at most one exists at a time.
pub trait Ledger: Send + Sync {
    /// Acquire the exclusive write token, blocking until available.
    fn begin_write(&self) -> WriteTransaction<'_>;

    /// Validate `block` against the current state and commit it if
    /// valid. Never returns an error: every rejection is a
    /// [`BlockStatus`] classification the caller routes on.
    fn process(&self, tx: &mut WriteTransaction<'_>, block: &Block) -> BlockStatus;

    /// Remove `hash` and everything that depends on it from the
    /// ledger, in dependency order. Returns the rolled-back blocks,
    /// the target last. Fails if any of them is already confirmed.
    fn rollback(
        &self,
        tx: &mut WriteTransaction<'_>,
        hash: &BlockHash,
    ) -> Result<Vec<Block>, LedgerError>;

    /// Mark `hash` as cemented. Confirmed blocks can never be rolled
    /// back.
    fn confirm(&self, tx: &mut WriteTransaction<'_>, hash: &BlockHash) -> Result<(), LedgerError>;

    /// Fetch a block by hash.
    fn block(&self, hash: &BlockHash) -> Option<Block>;

    fn block_exists(&self, hash: &BlockHash) -> bool {
        self.block(hash).is_some()
    }

    /// The committed block occupying `root`, if any. A processed block
    /// whose qualified root has a different successor is a fork.
    fn successor(&self, root: &QualifiedRoot) -> Option<Block>;

    fn is_confirmed(&self, hash: &BlockHash) -> bool;

    /// Voting weight delegated to `representative`.
    fn weight(&self, representative: &Account) -> u128;
}
