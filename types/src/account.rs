//! Account address type with `qll_` prefix.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;

/// Rejected account address string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid account address: {0:?}")]
pub struct InvalidAddress(pub String);

/// A Quill account address, always prefixed with `qll_`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Account(String);

impl Account {
    /// The standard prefix for all Quill account addresses.
    pub const PREFIX: &'static str = "qll_";

    /// Create a new account address from a raw string.
    ///
    /// # Panics
    /// Panics if the string does not start with `qll_`.
    pub fn new(raw: impl Into<String>) -> Self {
        let s = raw.into();
        assert!(s.starts_with(Self::PREFIX), "address must start with qll_");
        Self(s)
    }

    /// Fallible constructor for untrusted input. Enforces the same
    /// shape [`is_valid`](Self::is_valid) checks.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidAddress> {
        let s = raw.into();
        if s.starts_with(Self::PREFIX) && s.len() > Self::PREFIX.len() {
            Ok(Self(s))
        } else {
            Err(InvalidAddress(s))
        }
    }

    /// Return the raw address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate that this address is well-formed.
    pub fn is_valid(&self) -> bool {
        self.0.starts_with(Self::PREFIX) && self.0.len() > Self::PREFIX.len()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Account {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// Deserialization takes the validating path, so decoded input cannot
// carry an address `is_valid` would reject.
impl<'de> Deserialize<'de> for Account {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}
