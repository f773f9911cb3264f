//! Quill node — the block processing pipeline and the election table.
//!
//! Incoming blocks flow through the [`block_processor`] queue into
//! batched ledger commits; commit results are routed to the
//! [`unchecked`] gap table and to the [`active_elections`] table, which
//! starts and advances per-fork elections. Votes flow to a live
//! election when one exists, otherwise into the consensus vote cache.
//!
//! ## Module overview
//!
//! - [`block_processor`] — queued, batched block commits with
//!   backpressure, gap routing, and fork displacement.
//! - [`unchecked`] — blocks parked on a missing dependency.
//! - [`active_elections`] — election table keyed by qualified root.
//! - [`node`] — wiring of the above into one runnable assembly.
//! - [`config`] / [`logging`] / [`metrics`] / [`error`] — ambient stack.

pub mod active_elections;
pub mod block_processor;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod unchecked;
pub mod validation;

pub use active_elections::{ActiveElections, ActiveElectionsConfig};
pub use block_processor::{BlockProcessor, BlockProcessorConfig, ProcessorStats};
pub use config::NodeConfig;
pub use error::NodeError;
pub use logging::{init_logging, LogFormat};
pub use metrics::NodeMetrics;
pub use node::{Node, NodeWeightOracle};
pub use unchecked::UncheckedMap;
pub use validation::{AcceptAll, BlockValidator};
