use quill_types::BlockHash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("block not found: {0}")]
    BlockNotFound(BlockHash),

    #[error("cannot roll back confirmed block {0}")]
    RollbackConfirmed(BlockHash),

    #[error("ledger state inconsistent: {0}")]
    Corrupt(String),
}
