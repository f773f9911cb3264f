//! Block-lattice ledger.
//!
//! Each account has its own chain; blocks commit asynchronously and
//! consensus is only needed to resolve forks (competing successors of
//! the same qualified root).

pub mod block_status;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod state_block;

pub use block_status::BlockStatus;
pub use error::LedgerError;
pub use ledger::{Ledger, WriteTransaction};
pub use memory::MemoryLedger;
pub use state_block::{account_link, Block, BlockKind, BURN_ACCOUNT};
