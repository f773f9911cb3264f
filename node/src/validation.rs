//! Signature / proof-of-work validation oracle.
//!
//! Cryptographic verification is an external concern: the processor
//! consults a synchronous pass/fail oracle before enqueueing (work) and
//! during batch verification (signatures). The ledger additionally
//! rejects structurally invalid attestations, so the oracle only needs
//! to answer for well-formed blocks.

use quill_ledger::Block;

pub trait BlockValidator: Send + Sync {
    /// Whether the block's proof-of-work nonce meets the difficulty
    /// threshold.
    fn work_ok(&self, block: &Block) -> bool;

    /// Whether the block's signature verifies against its account.
    fn signature_ok(&self, block: &Block) -> bool;
}

/// Pass-through oracle for dev networks and tests; blocks carrying a
/// zero nonce or zero signature still fail (the sentinel invalid
/// values).
pub struct AcceptAll;

impl BlockValidator for AcceptAll {
    fn work_ok(&self, block: &Block) -> bool {
        block.work.0 != 0
    }

    fn signature_ok(&self, block: &Block) -> bool {
        !block.signature.is_zero()
    }
}
