//! Fork root — the key under which competing blocks are grouped.

use crate::account::Account;
use crate::hash::BlockHash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The identifier of an account-chain position where forks may occur.
///
/// Two blocks that share the same qualified root are competing for the same
/// slot: both claim to succeed `previous` on `account`'s chain (for the first
/// block of a chain `previous` is the zero hash). One root maps to at most
/// one active election.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedRoot {
    pub account: Account,
    pub previous: BlockHash,
}

impl QualifiedRoot {
    pub fn new(account: Account, previous: BlockHash) -> Self {
        Self { account, previous }
    }
}

impl fmt::Display for QualifiedRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account, self.previous)
    }
}
