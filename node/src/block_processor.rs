//! Block processor — serializes block commits into the ledger.
//!
//! Producers enqueue from any thread; one dedicated worker drains the
//! queues in batches, each batch under a single ledger write
//! transaction. The forced queue takes priority and carries fork
//! replacements: before committing a forced block, any competing
//! successor already occupying its root is rolled back.
//!
//! Backpressure is the caller's job: network ingress must consult
//! [`BlockProcessor::full`] before accepting more blocks; `add` on a
//! full queue drops silently and counts.

use crate::unchecked::UncheckedMap;
use crate::validation::BlockValidator;
use quill_ledger::{Block, BlockStatus, Ledger, WriteTransaction};
use quill_types::BlockHash;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

#[derive(Clone, Debug)]
pub struct BlockProcessorConfig {
    /// Total pending blocks (normal + forced) before `add` drops.
    pub full_size: usize,
    /// Upper bound on blocks committed per write transaction.
    pub batch_max_count: usize,
    /// Deadline per batch; the write transaction is released when it
    /// passes even if the batch count was not reached.
    pub batch_max_time: Duration,
    /// How long `add_blocking` waits for its commit result.
    pub add_timeout: Duration,
}

impl Default for BlockProcessorConfig {
    fn default() -> Self {
        Self {
            full_size: 65536,
            batch_max_count: 256,
            batch_max_time: Duration::from_millis(500),
            add_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters surfaced for metrics; every rejection is silent apart from
/// these.
#[derive(Default)]
pub struct ProcessorStats {
    /// `add` calls dropped because the queue was at capacity.
    pub overfill: AtomicU64,
    /// `add` calls dropped by the proof-of-work check.
    pub insufficient_work: AtomicU64,
    /// Successful competitor rollbacks during fork replacement.
    pub rollbacks: AtomicU64,
    /// Fork replacements abandoned because the competitor was already
    /// confirmed.
    pub rollback_failures: AtomicU64,
    results: Mutex<HashMap<BlockStatus, u64>>,
}

impl ProcessorStats {
    fn record(&self, status: BlockStatus) {
        *self.results.lock().unwrap().entry(status).or_default() += 1;
    }

    pub fn result_count(&self, status: BlockStatus) -> u64 {
        self.results
            .lock()
            .unwrap()
            .get(&status)
            .copied()
            .unwrap_or_default()
    }
}

struct ProcessorState {
    blocks: VecDeque<Block>,
    forced: VecDeque<Block>,
    /// Hashes first observed locally (wallet / RPC); consumers suppress
    /// the network echo for these.
    local_origin: HashSet<BlockHash>,
    processing: bool,
    stopped: bool,
}

type ProcessedObserver = Box<dyn Fn(&[(BlockStatus, Block)]) + Send + Sync>;
type RolledBackObserver = Box<dyn Fn(&[Block]) + Send + Sync>;

pub struct BlockProcessor {
    config: BlockProcessorConfig,
    ledger: Arc<dyn Ledger>,
    unchecked: Arc<UncheckedMap>,
    validator: Arc<dyn BlockValidator>,
    state: Mutex<ProcessorState>,
    condition: Condvar,
    waiters: Mutex<HashMap<BlockHash, Vec<SyncSender<BlockStatus>>>>,
    processed_observers: Mutex<Vec<ProcessedObserver>>,
    rolled_back_observers: Mutex<Vec<RolledBackObserver>>,
    pub stats: ProcessorStats,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BlockProcessor {
    pub fn new(
        config: BlockProcessorConfig,
        ledger: Arc<dyn Ledger>,
        unchecked: Arc<UncheckedMap>,
        validator: Arc<dyn BlockValidator>,
    ) -> Self {
        Self {
            config,
            ledger,
            unchecked,
            validator,
            state: Mutex::new(ProcessorState {
                blocks: VecDeque::new(),
                forced: VecDeque::new(),
                local_origin: HashSet::new(),
                processing: false,
                stopped: false,
            }),
            condition: Condvar::new(),
            waiters: Mutex::new(HashMap::new()),
            processed_observers: Mutex::new(Vec::new()),
            rolled_back_observers: Mutex::new(Vec::new()),
            stats: ProcessorStats::default(),
            thread: Mutex::new(None),
        }
    }

    /// Register for the per-batch (status, block) notification stream.
    pub fn on_batch_processed(&self, observer: ProcessedObserver) {
        self.processed_observers.lock().unwrap().push(observer);
    }

    /// Register for blocks removed from the ledger by fork replacement.
    pub fn on_rolled_back(&self, observer: RolledBackObserver) {
        self.rolled_back_observers.lock().unwrap().push(observer);
    }

    /// Spawn the worker thread. Idempotent per processor instance.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.thread.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let processor = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("block_proc".into())
            .spawn(move || processor.run());
        match spawned {
            Ok(h) => *handle = Some(h),
            Err(e) => error!(error = %e, "failed to spawn block processor thread"),
        }
    }

    /// Stop the worker and wake every blocked caller.
    pub fn stop(&self) {
        {
            let mut guard = self.state.lock().unwrap();
            guard.stopped = true;
        }
        self.condition.notify_all();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("block processor thread panicked");
            }
        }
    }

    pub fn size(&self) -> usize {
        let guard = self.state.lock().unwrap();
        guard.blocks.len() + guard.forced.len()
    }

    pub fn full(&self) -> bool {
        self.size() >= self.config.full_size
    }

    pub fn half_full(&self) -> bool {
        self.size() >= self.config.full_size / 2
    }

    /// Enqueue for commit. Drops silently (with a counter) when the
    /// queue is at capacity or the work check fails.
    pub fn add(&self, block: Block) -> bool {
        if !self.validator.work_ok(&block) {
            self.stats.insufficient_work.fetch_add(1, Ordering::Relaxed);
            debug!(hash = %block.hash, "block dropped, insufficient work");
            return false;
        }
        {
            let mut guard = self.state.lock().unwrap();
            if guard.stopped {
                return false;
            }
            if guard.blocks.len() + guard.forced.len() >= self.config.full_size {
                self.stats.overfill.fetch_add(1, Ordering::Relaxed);
                trace!(hash = %block.hash, "block dropped, processor full");
                return false;
            }
            guard.blocks.push_back(block);
        }
        self.condition.notify_all();
        true
    }

    /// Enqueue and wait for the commit result, up to the configured
    /// timeout. `None` means the result was not available in time (or
    /// the block was dropped); the block may still commit later.
    pub fn add_blocking(&self, block: Block) -> Option<BlockStatus> {
        let hash = block.hash;
        let (sender, receiver) = sync_channel(1);
        self.waiters
            .lock()
            .unwrap()
            .entry(hash)
            .or_default()
            .push(sender);
        if !self.add(block) {
            self.remove_waiter(&hash);
            return None;
        }
        match receiver.recv_timeout(self.config.add_timeout) {
            Ok(status) => Some(status),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.remove_waiter(&hash);
                debug!(%hash, "add_blocking timed out");
                None
            }
        }
    }

    /// Enqueue onto the forced queue: the block displaces whatever
    /// currently occupies its fork root.
    pub fn force(&self, block: Block) {
        {
            let mut guard = self.state.lock().unwrap();
            if guard.stopped {
                return;
            }
            guard.forced.push_back(block);
        }
        self.condition.notify_all();
    }

    /// Mark the block as locally observed before enqueueing, so the
    /// eventual network echo is not treated as news.
    pub fn process_active(&self, block: Block) -> bool {
        {
            let mut guard = self.state.lock().unwrap();
            guard.local_origin.insert(block.hash);
        }
        self.add(block)
    }

    /// Consume the local-origin mark for `hash`.
    pub fn take_local(&self, hash: &BlockHash) -> bool {
        self.state.lock().unwrap().local_origin.remove(hash)
    }

    /// Block until both queues are empty and no batch is in progress.
    pub fn flush(&self) {
        let mut guard = self.state.lock().unwrap();
        while !guard.stopped
            && (!guard.blocks.is_empty() || !guard.forced.is_empty() || guard.processing)
        {
            guard = self.condition.wait(guard).unwrap();
        }
    }

    fn remove_waiter(&self, hash: &BlockHash) {
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(list) = waiters.get_mut(hash) {
            list.pop();
            if list.is_empty() {
                waiters.remove(hash);
            }
        }
    }

    fn run(self: Arc<Self>) {
        info!("block processor started");
        let mut guard = self.state.lock().unwrap();
        loop {
            if guard.stopped {
                break;
            }
            if guard.blocks.is_empty() && guard.forced.is_empty() {
                guard.processing = false;
                self.condition.notify_all();
                guard = self.condition.wait(guard).unwrap();
                continue;
            }
            guard.processing = true;
            drop(guard);

            let results = self.process_batch();
            if !results.is_empty() {
                for observer in self.processed_observers.lock().unwrap().iter() {
                    observer(&results);
                }
            }

            guard = self.state.lock().unwrap();
        }
        guard.processing = false;
        drop(guard);
        self.condition.notify_all();
        info!("block processor stopped");
    }

    /// Drain both queues (forced first) under one write transaction,
    /// bounded by batch count and deadline.
    fn process_batch(&self) -> Vec<(BlockStatus, Block)> {
        let deadline = Instant::now() + self.config.batch_max_time;
        let mut results = Vec::new();
        let mut tx = self.ledger.begin_write();
        while results.len() < self.config.batch_max_count && Instant::now() < deadline {
            let (block, forced) = {
                let mut guard = self.state.lock().unwrap();
                if let Some(block) = guard.forced.pop_front() {
                    (block, true)
                } else if let Some(block) = guard.blocks.pop_front() {
                    (block, false)
                } else {
                    break;
                }
            };
            let status = self.process_one(&mut tx, &block, forced);
            results.push((status, block));
        }
        results
    }

    fn process_one(
        &self,
        tx: &mut WriteTransaction<'_>,
        block: &Block,
        forced: bool,
    ) -> BlockStatus {
        if forced {
            self.rollback_competitor(tx, block);
        }
        let status = if self.validator.signature_ok(block) {
            self.ledger.process(tx, block)
        } else {
            BlockStatus::BadSignature
        };
        self.stats.record(status);

        match status {
            BlockStatus::Progress => {
                trace!(hash = %block.hash, "block committed");
                // The committed block may itself be the dependency
                // another parked block waits on.
                let released = self.unchecked.trigger(&block.hash);
                if !released.is_empty() {
                    debug!(hash = %block.hash, released = released.len(),
                        "dependency satisfied, requeueing parked blocks");
                    let mut guard = self.state.lock().unwrap();
                    guard.blocks.extend(released);
                }
            }
            BlockStatus::GapPrevious => {
                self.unchecked.put(block.previous, block.clone());
            }
            BlockStatus::GapSource | BlockStatus::GapEpochOpenPending => {
                self.unchecked.put(block.link, block.clone());
            }
            other => {
                debug!(hash = %block.hash, status = %other, "block not committed");
            }
        }

        if let Some(senders) = self.waiters.lock().unwrap().remove(&block.hash) {
            for sender in senders {
                let _ = sender.send(status);
            }
        }
        status
    }

    /// Forced blocks displace the committed occupant of their fork
    /// root. Rolling back an already-confirmed competitor is a race we
    /// log and abandon; the process continues.
    fn rollback_competitor(&self, tx: &mut WriteTransaction<'_>, block: &Block) {
        let root = block.qualified_root();
        let Some(successor) = self.ledger.successor(&root) else {
            return;
        };
        if successor.hash == block.hash {
            return;
        }
        debug!(%root, competitor = %successor.hash, replacement = %block.hash,
            "rolling back fork competitor");
        match self.ledger.rollback(tx, &successor.hash) {
            Ok(rolled_back) => {
                self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
                for observer in self.rolled_back_observers.lock().unwrap().iter() {
                    observer(&rolled_back);
                }
            }
            Err(e) => {
                self.stats.rollback_failures.fetch_add(1, Ordering::Relaxed);
                error!(%root, competitor = %successor.hash, error = %e,
                    "failed to roll back fork competitor");
            }
        }
    }
}

impl Drop for BlockProcessor {
    fn drop(&mut self) {
        let stopped = self.state.lock().unwrap().stopped;
        if !stopped {
            warn!("block processor dropped without stop()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::AcceptAll;
    use quill_ledger::{account_link, BlockKind, MemoryLedger};
    use quill_types::{Account, Signature, Timestamp, WorkNonce};

    fn raw_block(kind: BlockKind, account: &str, previous: BlockHash, balance: u128) -> Block {
        Block {
            kind,
            account: Account::new(account),
            previous,
            representative: Account::new("qll_rep1"),
            balance,
            link: BlockHash::ZERO,
            timestamp: Timestamp::new(1_700_000_000),
            work: WorkNonce(1),
            signature: Signature([1u8; 64]),
            hash: BlockHash::ZERO,
        }
    }

    fn open(account: &str, balance: u128) -> Block {
        raw_block(BlockKind::Open, account, BlockHash::ZERO, balance).seal()
    }

    fn send(account: &str, previous: BlockHash, balance: u128, dest: &str) -> Block {
        let mut b = raw_block(BlockKind::Send, account, previous, balance);
        b.link = account_link(&Account::new(dest));
        b.seal()
    }

    fn processor(config: BlockProcessorConfig) -> (Arc<BlockProcessor>, Arc<dyn Ledger>) {
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
        let unchecked = Arc::new(UncheckedMap::default());
        let proc = Arc::new(BlockProcessor::new(
            config,
            Arc::clone(&ledger),
            unchecked,
            Arc::new(AcceptAll),
        ));
        (proc, ledger)
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (proc, _) = processor(BlockProcessorConfig {
            full_size: 1,
            ..Default::default()
        });
        assert!(proc.add(open("qll_alice", 100)));
        assert!(proc.full());
        assert!(!proc.add(open("qll_bob", 100)));
        assert_eq!(proc.stats.overfill.load(Ordering::Relaxed), 1);
        assert_eq!(proc.size(), 1);
        proc.stop();
    }

    #[test]
    fn zero_work_rejected_before_queueing() {
        let (proc, _) = processor(Default::default());
        let mut block = open("qll_alice", 100);
        block.work = WorkNonce(0);
        assert!(!proc.add(block));
        assert_eq!(proc.stats.insufficient_work.load(Ordering::Relaxed), 1);
        assert_eq!(proc.size(), 0);
        proc.stop();
    }

    #[test]
    fn batch_commits_and_notifies_observers() {
        let (proc, ledger) = processor(Default::default());
        let seen: Arc<Mutex<Vec<(BlockStatus, BlockHash)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        proc.on_batch_processed(Box::new(move |results| {
            let mut sink = sink.lock().unwrap();
            sink.extend(results.iter().map(|(s, b)| (*s, b.hash)));
        }));
        proc.start();

        let genesis = open("qll_alice", 100);
        assert!(proc.add(genesis.clone()));
        proc.flush();

        assert!(ledger.block_exists(&genesis.hash));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(BlockStatus::Progress, genesis.hash)]
        );
        proc.stop();
    }

    #[test]
    fn add_blocking_returns_commit_status() {
        let (proc, _) = processor(Default::default());
        proc.start();
        let genesis = open("qll_alice", 100);
        assert_eq!(proc.add_blocking(genesis), Some(BlockStatus::Progress));
        proc.stop();
    }

    #[test]
    fn add_blocking_times_out_but_block_still_commits() {
        let (proc, ledger) = processor(BlockProcessorConfig {
            add_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        // No worker yet, so the wait must expire.
        let genesis = open("qll_alice", 100);
        assert_eq!(proc.add_blocking(genesis.clone()), None);

        proc.start();
        proc.flush();
        assert!(ledger.block_exists(&genesis.hash));
        proc.stop();
    }

    #[test]
    fn gap_parks_then_dependency_releases() {
        let (proc, ledger) = processor(Default::default());
        proc.start();

        let genesis = open("qll_alice", 100);
        let s = send("qll_alice", genesis.hash, 60, "qll_bob");

        assert!(proc.add(s.clone()));
        proc.flush();
        assert!(!ledger.block_exists(&s.hash));
        assert_eq!(proc.stats.result_count(BlockStatus::GapPrevious), 1);

        assert!(proc.add(genesis.clone()));
        proc.flush();
        assert!(ledger.block_exists(&genesis.hash));
        assert!(ledger.block_exists(&s.hash));
        proc.stop();
    }

    #[test]
    fn forced_block_rolls_back_competitor() {
        let (proc, ledger) = processor(Default::default());
        let rolled: Arc<Mutex<Vec<BlockHash>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&rolled);
        proc.on_rolled_back(Box::new(move |blocks| {
            sink.lock().unwrap().extend(blocks.iter().map(|b| b.hash));
        }));
        proc.start();

        let genesis = open("qll_alice", 100);
        let loser = send("qll_alice", genesis.hash, 60, "qll_bob");
        let winner = send("qll_alice", genesis.hash, 50, "qll_carol");

        assert_eq!(proc.add_blocking(genesis), Some(BlockStatus::Progress));
        assert_eq!(proc.add_blocking(loser.clone()), Some(BlockStatus::Progress));

        proc.force(winner.clone());
        proc.flush();

        assert!(!ledger.block_exists(&loser.hash));
        assert!(ledger.block_exists(&winner.hash));
        assert_eq!(rolled.lock().unwrap().as_slice(), &[loser.hash]);
        assert_eq!(proc.stats.rollbacks.load(Ordering::Relaxed), 1);
        proc.stop();
    }

    #[test]
    fn confirmed_competitor_survives_forced_replacement() {
        let (proc, ledger) = processor(Default::default());
        proc.start();

        let genesis = open("qll_alice", 100);
        let committed = send("qll_alice", genesis.hash, 60, "qll_bob");
        let challenger = send("qll_alice", genesis.hash, 50, "qll_carol");

        assert_eq!(proc.add_blocking(genesis.clone()), Some(BlockStatus::Progress));
        assert_eq!(
            proc.add_blocking(committed.clone()),
            Some(BlockStatus::Progress)
        );
        {
            let mut tx = ledger.begin_write();
            ledger.confirm(&mut tx, &committed.hash).unwrap();
        }

        proc.force(challenger.clone());
        proc.flush();

        assert!(ledger.block_exists(&committed.hash));
        assert!(!ledger.block_exists(&challenger.hash));
        assert_eq!(proc.stats.rollback_failures.load(Ordering::Relaxed), 1);

        // The processor keeps going after the abandoned replacement.
        let bob = open("qll_bob", 1);
        assert_eq!(proc.add_blocking(bob), Some(BlockStatus::Progress));
        proc.stop();
    }

    #[test]
    fn local_origin_mark_is_consumed_once() {
        let (proc, _) = processor(Default::default());
        let genesis = open("qll_alice", 100);
        assert!(proc.process_active(genesis.clone()));
        assert!(proc.take_local(&genesis.hash));
        assert!(!proc.take_local(&genesis.hash));
        proc.stop();
    }
}
