//! Fundamental types for the Quill protocol.
//!
//! This crate defines the core types shared across every other crate in the
//! workspace: accounts, hashes, fork roots, timestamps, and signatures.

pub mod account;
pub mod hash;
pub mod keys;
pub mod root;
pub mod time;

pub use account::{Account, InvalidAddress};
pub use hash::BlockHash;
pub use keys::{Signature, WorkNonce};
pub use root::QualifiedRoot;
pub use time::Timestamp;

/// Sentinel vote timestamp signalling a final (irrevocable) vote.
///
/// A vote carrying this timestamp is never superseded and is exempt from the
/// per-voter revote cooldown.
pub const VOTE_TIMESTAMP_FINAL: u64 = u64::MAX;
