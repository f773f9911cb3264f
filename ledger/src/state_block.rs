//! State block — the unified block format for Quill's block-lattice.
//!
//! Every block carries the full account state after the operation, so a
//! single format covers opens, sends, receives and representative
//! changes.

use blake2::digest::Digest;
use blake2::Blake2s256;
use quill_types::{Account, BlockHash, QualifiedRoot, Signature, Timestamp, WorkNonce};
use serde::{Deserialize, Serialize};

/// Address of the burn account. Funds sent here are destroyed; opening
/// a chain for it is rejected outright.
pub const BURN_ACCOUNT: &str = "qll_burn";

/// The operation a block performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// First block in an account chain. Receives from `link`, or mints
    /// when `link` is zero (genesis-style bootstrap).
    Open,
    /// Transfer out; `link` names the destination account.
    Send,
    /// Claim a pending send; `link` is the send block hash.
    Receive,
    /// Representative change only; balance untouched, `link` zero.
    Change,
}

/// A state block in Quill's block-lattice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The operation this block performs.
    pub kind: BlockKind,

    /// The account this block belongs to.
    pub account: Account,

    /// Hash of the previous block in this account's chain (zero for the
    /// first block).
    pub previous: BlockHash,

    /// The account's consensus representative.
    pub representative: Account,

    /// Balance after this block.
    pub balance: u128,

    /// Link field — context-dependent:
    /// - for a receive (or receiving open): the send block hash
    /// - for a send: the destination account link ([`account_link`])
    /// - zero otherwise
    pub link: BlockHash,

    /// Block timestamp.
    pub timestamp: Timestamp,

    /// Proof-of-work nonce (anti-spam).
    pub work: WorkNonce,

    /// Signature by the account holder.
    pub signature: Signature,

    /// The computed hash of this block.
    pub hash: BlockHash,
}

/// Derive the link value naming `account` as a send destination.
pub fn account_link(account: &Account) -> BlockHash {
    let digest = Blake2s256::digest(account.as_str().as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    BlockHash::new(bytes)
}

impl Block {
    /// Compute the content hash of this block. Canonical field order,
    /// Blake2s-256. The signature and nonce are excluded: they attest
    /// to the hash, they are not part of it.
    pub fn compute_hash(&self) -> BlockHash {
        let mut hasher = Blake2s256::new();
        hasher.update([self.kind as u8]);
        hasher.update(self.account.as_str().as_bytes());
        hasher.update(self.previous.as_bytes());
        hasher.update(self.representative.as_str().as_bytes());
        hasher.update(self.balance.to_be_bytes());
        hasher.update(self.link.as_bytes());
        hasher.update(self.timestamp.as_secs().to_be_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        BlockHash::new(bytes)
    }

    /// Seal the block: fill in `hash` from the current contents.
    pub fn seal(mut self) -> Self {
        self.hash = self.compute_hash();
        self
    }

    /// Whether this is the first block in an account chain.
    pub fn is_open(&self) -> bool {
        self.kind == BlockKind::Open
    }

    /// The block's root: the previous hash, or a zero hash for the
    /// first block of a chain.
    pub fn root(&self) -> BlockHash {
        self.previous
    }

    /// The qualified root identifying the fork slot this block competes
    /// for. At most one block per qualified root can be committed.
    pub fn qualified_root(&self) -> QualifiedRoot {
        QualifiedRoot::new(self.account.clone(), self.previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Block {
        Block {
            kind: BlockKind::Open,
            account: Account::new("qll_alice"),
            previous: BlockHash::ZERO,
            representative: Account::new("qll_rep1"),
            balance: 100,
            link: BlockHash::ZERO,
            timestamp: Timestamp::new(1_700_000_000),
            work: WorkNonce(1),
            signature: Signature([1u8; 64]),
            hash: BlockHash::ZERO,
        }
        .seal()
    }

    #[test]
    fn hash_is_deterministic() {
        let a = block();
        let b = block();
        assert_eq!(a.hash, b.hash);
        assert!(!a.hash.is_zero());
    }

    #[test]
    fn hash_covers_contents_not_attestation() {
        let a = block();
        let mut b = block();
        b.work = WorkNonce(999);
        b.signature = Signature([7u8; 64]);
        assert_eq!(a.hash, b.compute_hash());

        let mut c = block();
        c.balance = 101;
        assert_ne!(a.hash, c.compute_hash());
    }

    #[test]
    fn qualified_root_pins_the_fork_slot() {
        let open = block();
        assert!(open.is_open());
        let mut successor = block();
        successor.kind = BlockKind::Send;
        successor.previous = open.hash;
        let successor = successor.seal();
        assert_eq!(
            successor.qualified_root(),
            QualifiedRoot::new(Account::new("qll_alice"), open.hash)
        );
        assert_ne!(open.qualified_root(), successor.qualified_root());
    }

    #[test]
    fn account_links_are_distinct() {
        let a = account_link(&Account::new("qll_alice"));
        let b = account_link(&Account::new("qll_bob"));
        assert_ne!(a, b);
        assert_eq!(a, account_link(&Account::new("qll_alice")));
    }
}
