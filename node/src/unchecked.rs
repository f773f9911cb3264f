//! Unchecked map — blocks parked on a missing dependency.
//!
//! A block that arrives before its previous block (or the send it
//! receives from) cannot commit yet. It is stored here keyed by the
//! missing dependency's hash and released back into the processor queue
//! when that hash is triggered, i.e. when the dependency commits.

use quill_ledger::Block;
use quill_types::BlockHash;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, trace};

pub const DEFAULT_MAX_UNCHECKED: usize = 65536;

struct UncheckedInner {
    by_dependency: HashMap<BlockHash, Vec<Block>>,
    /// Dependency keys in insertion order; the front is dropped first
    /// under memory pressure.
    insertion_order: VecDeque<BlockHash>,
    count: usize,
}

/// Bounded holding area for blocks whose dependency has not committed.
pub struct UncheckedMap {
    max_size: usize,
    inner: Mutex<UncheckedInner>,
}

impl Default for UncheckedMap {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNCHECKED)
    }
}

impl UncheckedMap {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(UncheckedInner {
                by_dependency: HashMap::new(),
                insertion_order: VecDeque::new(),
                count: 0,
            }),
        }
    }

    /// Park `block` until `dependency` is satisfied. When full, the
    /// oldest dependency bucket is dropped to make room.
    pub fn put(&self, dependency: BlockHash, block: Block) {
        let mut inner = self.inner.lock().unwrap();
        if inner.count >= self.max_size {
            if let Some(oldest) = inner.insertion_order.pop_front() {
                if let Some(dropped) = inner.by_dependency.remove(&oldest) {
                    inner.count -= dropped.len();
                    debug!(dependency = %oldest, dropped = dropped.len(),
                        "unchecked map full, dropping oldest bucket");
                }
            }
        }
        let bucket = inner.by_dependency.entry(dependency).or_default();
        if bucket.iter().any(|b| b.hash == block.hash) {
            return;
        }
        let first = bucket.is_empty();
        trace!(%dependency, hash = %block.hash, "block parked on missing dependency");
        bucket.push(block);
        inner.count += 1;
        if first {
            inner.insertion_order.push_back(dependency);
        }
    }

    /// Release every block waiting on `dependency`.
    pub fn trigger(&self, dependency: &BlockHash) -> Vec<Block> {
        let mut inner = self.inner.lock().unwrap();
        match inner.by_dependency.remove(dependency) {
            Some(blocks) => {
                inner.count -= blocks.len();
                inner.insertion_order.retain(|d| d != dependency);
                blocks
            }
            None => Vec::new(),
        }
    }

    pub fn get(&self, dependency: &BlockHash) -> Vec<Block> {
        self.inner
            .lock()
            .unwrap()
            .by_dependency
            .get(dependency)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_ledger::BlockKind;
    use quill_types::{Account, Signature, Timestamp, WorkNonce};

    fn block(byte: u8) -> Block {
        Block {
            kind: BlockKind::Send,
            account: Account::new("qll_alice"),
            previous: BlockHash::new([7; 32]),
            representative: Account::new("qll_rep1"),
            balance: byte as u128,
            link: BlockHash::ZERO,
            timestamp: Timestamp::new(1_700_000_000),
            work: WorkNonce(1),
            signature: Signature([1; 64]),
            hash: BlockHash::new([byte; 32]),
        }
    }

    #[test]
    fn put_then_trigger_releases() {
        let map = UncheckedMap::new(16);
        let dep = BlockHash::new([9; 32]);
        map.put(dep, block(1));
        map.put(dep, block(2));
        map.put(dep, block(2)); // duplicate hash ignored
        assert_eq!(map.len(), 2);

        let released = map.trigger(&dep);
        assert_eq!(released.len(), 2);
        assert!(map.is_empty());
        assert!(map.trigger(&dep).is_empty());
    }

    #[test]
    fn overflow_drops_oldest_bucket() {
        let map = UncheckedMap::new(2);
        map.put(BlockHash::new([8; 32]), block(1));
        map.put(BlockHash::new([9; 32]), block(2));
        map.put(BlockHash::new([10; 32]), block(3));
        assert!(map.len() <= 2);
        assert!(map.get(&BlockHash::new([8; 32])).is_empty());
        assert_eq!(map.get(&BlockHash::new([10; 32])).len(), 1);
    }
}
