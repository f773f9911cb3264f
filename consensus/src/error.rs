use quill_types::BlockHash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("election already settled (state {state})")]
    AlreadySettled { state: &'static str },

    #[error("candidate set full, block {0} not accepted")]
    CandidatesFull(BlockHash),
}
