//! Node assembly: wires the ledger, block processor, election table,
//! vote cache and hinted scheduler together from a [`NodeConfig`].
//!
//! The node owns no network stack; the confirmation solicitor and
//! local-voting capability are injected so the same assembly serves
//! both production wiring and tests.

use crate::active_elections::{ActiveElections, ActiveElectionsConfig};
use crate::block_processor::BlockProcessor;
use crate::config::NodeConfig;
use crate::metrics::NodeMetrics;
use crate::unchecked::UncheckedMap;
use crate::validation::BlockValidator;
use quill_consensus::{
    ConfirmationSolicitor, ElectionSink, ElectionTimings, HintedScheduler, LocalVoting,
    RepWeightOracle, Vote, VoteCache, VoteResult, VoteSpacing,
};
use quill_ledger::{Block, BlockStatus, Ledger, MemoryLedger};
use quill_types::{Account, BlockHash, QualifiedRoot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Ledger-backed weight oracle. Trended online weight and the quorum
/// percentage come from configuration; per-representative weights are
/// read live from the ledger.
pub struct NodeWeightOracle {
    ledger: Arc<dyn Ledger>,
    trended_weight: u128,
    quorum_percent: u8,
    canary: AtomicBool,
    dev_network: bool,
}

impl NodeWeightOracle {
    pub fn new(ledger: Arc<dyn Ledger>, config: &NodeConfig) -> Self {
        Self {
            ledger,
            trended_weight: config.trended_weight,
            quorum_percent: config.quorum_percent,
            canary: AtomicBool::new(false),
            dev_network: config.dev_network,
        }
    }

    /// Raise (or lower) the final-votes canary. Once raised, elections
    /// require a quorum of final votes before confirming.
    pub fn set_final_votes_canary(&self, value: bool) {
        self.canary.store(value, Ordering::Release);
    }
}

impl RepWeightOracle for NodeWeightOracle {
    fn weight(&self, representative: &Account) -> u128 {
        self.ledger.weight(representative)
    }

    fn trended_weight(&self) -> u128 {
        self.trended_weight
    }

    fn quorum_delta(&self) -> u128 {
        self.trended_weight / 100 * self.quorum_percent as u128
    }

    /// One tenth of a percent of trended weight, the conventional
    /// principal-representative floor.
    fn minimum_principal_weight(&self) -> u128 {
        self.trended_weight / 1000
    }

    fn final_votes_canary(&self) -> bool {
        self.canary.load(Ordering::Acquire)
    }

    fn is_dev_network(&self) -> bool {
        self.dev_network
    }
}

/// Election-to-processor bridge: a winning fork is committed by forcing
/// it through the processor's rollback path.
struct ProcessorSink {
    processor: Arc<BlockProcessor>,
}

impl ElectionSink for ProcessorSink {
    fn force(&self, block: Block) {
        self.processor.force(block);
    }
}

/// Flip-flop damper around the injected voting capability: a vote
/// change for a root within the spacing window is suppressed; re-voting
/// for the same block always passes.
struct SpacedVoting {
    inner: Arc<dyn LocalVoting>,
    spacing: Mutex<VoteSpacing>,
}

impl LocalVoting for SpacedVoting {
    fn is_representative(&self) -> bool {
        self.inner.is_representative()
    }

    fn generate_vote(&self, root: &QualifiedRoot, hash: &BlockHash, is_final: bool) {
        {
            let mut spacing = self.spacing.lock().unwrap();
            if !spacing.votable(root, hash) {
                return;
            }
            spacing.record(root.clone(), *hash);
        }
        self.inner.generate_vote(root, hash, is_final);
    }
}

pub struct Node {
    pub config: NodeConfig,
    pub ledger: Arc<dyn Ledger>,
    pub oracle: Arc<NodeWeightOracle>,
    pub unchecked: Arc<UncheckedMap>,
    pub vote_cache: Arc<Mutex<VoteCache>>,
    pub processor: Arc<BlockProcessor>,
    pub elections: Arc<ActiveElections>,
    pub hinted: HintedScheduler,
    pub metrics: Arc<NodeMetrics>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        validator: Arc<dyn BlockValidator>,
        solicitor: Arc<dyn ConfirmationSolicitor>,
        voting: Arc<dyn LocalVoting>,
    ) -> Self {
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
        let metrics = Arc::new(NodeMetrics::new());
        let oracle = Arc::new(NodeWeightOracle::new(Arc::clone(&ledger), &config));
        let unchecked = Arc::new(UncheckedMap::new(config.processor_full_size));
        let vote_cache = Arc::new(Mutex::new(VoteCache::new(config.vote_cache_config())));

        let processor = Arc::new(BlockProcessor::new(
            config.processor_config(),
            Arc::clone(&ledger),
            Arc::clone(&unchecked),
            validator,
        ));

        let timings = if config.dev_network {
            ElectionTimings::dev()
        } else {
            ElectionTimings::production()
        };
        let voting: Arc<dyn LocalVoting> = Arc::new(SpacedVoting {
            inner: voting,
            spacing: Mutex::new(VoteSpacing::new()),
        });
        let elections = Arc::new(ActiveElections::new(
            ActiveElectionsConfig {
                max_elections: config.max_elections,
            },
            timings,
            Arc::clone(&oracle) as Arc<dyn RepWeightOracle>,
            Arc::clone(&ledger),
            Arc::new(ProcessorSink {
                processor: Arc::clone(&processor),
            }),
            solicitor,
            voting,
            Arc::clone(&vote_cache),
            Arc::clone(&metrics),
        ));

        // Every batch leaving the processor feeds the election table.
        {
            let elections = Arc::clone(&elections);
            let metrics = Arc::clone(&metrics);
            let processor_handle = Arc::downgrade(&processor);
            let unchecked_handle = Arc::clone(&unchecked);
            processor.on_batch_processed(Box::new(move |results| {
                elections.handle_processed(results);
                if let Some(processor) = processor_handle.upgrade() {
                    metrics.processor_queue.set(processor.size() as i64);
                    let dropped = processor.stats.overfill.load(Ordering::Relaxed);
                    let exported = metrics.processor_overfill.get();
                    if dropped > exported {
                        metrics.processor_overfill.inc_by(dropped - exported);
                    }
                }
                metrics.unchecked_count.set(unchecked_handle.len() as i64);
            }));
        }

        let hinted = HintedScheduler::new(
            config.hinted_config(),
            Arc::clone(&oracle) as Arc<dyn RepWeightOracle>,
            Arc::clone(&ledger),
            Arc::clone(&vote_cache),
        );

        Self {
            config,
            ledger,
            oracle,
            unchecked,
            vote_cache,
            processor,
            elections,
            hinted,
            metrics,
        }
    }

    /// Start background workers.
    pub fn start(&self) {
        self.processor.start();
        info!(dev_network = self.config.dev_network, "node started");
    }

    /// Stop background workers and wake blocked callers.
    pub fn stop(&self) {
        self.processor.stop();
        info!("node stopped");
    }

    /// Submit a block received from the network.
    pub fn process(&self, block: Block) -> bool {
        self.processor.add(block)
    }

    /// Submit a block and wait for its commit result.
    pub fn process_blocking(&self, block: Block) -> Option<BlockStatus> {
        self.processor.add_blocking(block)
    }

    /// Submit a locally originated block (wallet, RPC).
    pub fn process_local(&self, block: Block) -> bool {
        self.processor.process_active(block)
    }

    /// Feed a live vote into consensus.
    pub fn vote(&self, vote: &Vote) -> VoteResult {
        self.elections.vote(vote)
    }

    /// Drive one round of periodic work: election timers plus the
    /// hinted scheduler.
    pub fn tick(&self) -> usize {
        let reaped = self.elections.tick();
        self.hinted.run_once(&*self.elections);
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::AcceptAll;
    use quill_consensus::{ElectionBehavior, VoteSource};
    use quill_ledger::{BlockKind, LedgerError};
    use quill_types::{
        BlockHash, QualifiedRoot, Signature, Timestamp, WorkNonce, VOTE_TIMESTAMP_FINAL,
    };

    struct NullSolicitor;

    impl ConfirmationSolicitor for NullSolicitor {
        fn flood_block(&self, _block: &Block) {}
        fn broadcast_vote(&self, _hash: &BlockHash, _is_final: bool) {}
        fn request_confirm(&self, _root: &QualifiedRoot, _winner: &BlockHash) {}
    }

    struct Observer;

    impl LocalVoting for Observer {
        fn is_representative(&self) -> bool {
            false
        }
        fn generate_vote(&self, _root: &QualifiedRoot, _hash: &BlockHash, _is_final: bool) {}
    }

    fn dev_node() -> Node {
        let config = NodeConfig {
            dev_network: true,
            trended_weight: 1000,
            quorum_percent: 10,
            add_timeout_ms: 5000,
            ..Default::default()
        };
        Node::new(
            config,
            Arc::new(AcceptAll),
            Arc::new(NullSolicitor),
            Arc::new(Observer),
        )
    }

    fn open(account: &str, balance: u128) -> Block {
        Block {
            kind: BlockKind::Open,
            account: Account::new(account),
            previous: BlockHash::ZERO,
            representative: Account::new(account),
            balance,
            link: BlockHash::ZERO,
            timestamp: Timestamp::new(1_700_000_000),
            work: WorkNonce(1),
            signature: Signature([1u8; 64]),
            hash: BlockHash::ZERO,
        }
        .seal()
    }

    #[derive(Default)]
    struct RecordingVoting {
        votes: Mutex<Vec<BlockHash>>,
    }

    impl LocalVoting for RecordingVoting {
        fn is_representative(&self) -> bool {
            true
        }
        fn generate_vote(&self, _root: &QualifiedRoot, hash: &BlockHash, _is_final: bool) {
            self.votes.lock().unwrap().push(*hash);
        }
    }

    #[test]
    fn spaced_voting_suppresses_immediate_flip() {
        let inner = Arc::new(RecordingVoting::default());
        let spaced = SpacedVoting {
            inner: Arc::clone(&inner) as Arc<dyn LocalVoting>,
            spacing: Mutex::new(VoteSpacing::new()),
        };
        let root = QualifiedRoot::new(Account::new("qll_alice"), BlockHash::ZERO);
        let a = BlockHash::new([1; 32]);
        let b = BlockHash::new([2; 32]);

        spaced.generate_vote(&root, &a, false);
        spaced.generate_vote(&root, &b, false); // flip inside the window
        spaced.generate_vote(&root, &a, true); // same block passes

        assert_eq!(inner.votes.lock().unwrap().as_slice(), &[a, a]);
    }

    #[test]
    fn oracle_reads_weight_from_ledger() {
        let node = dev_node();
        node.start();
        let genesis = open("qll_rep1", 500);
        assert_eq!(node.process_blocking(genesis), Some(BlockStatus::Progress));
        node.stop();

        let rep = Account::new("qll_rep1");
        assert_eq!(node.oracle.weight(&rep), 500);
        assert_eq!(node.oracle.quorum_delta(), 100);
        assert_eq!(node.oracle.minimum_principal_weight(), 1);
    }

    #[test]
    fn overfill_drops_reach_exported_counter() {
        let config = NodeConfig {
            dev_network: true,
            processor_full_size: 1,
            trended_weight: 1000,
            quorum_percent: 10,
            add_timeout_ms: 5000,
            ..Default::default()
        };
        let node = Node::new(
            config,
            Arc::new(AcceptAll),
            Arc::new(NullSolicitor),
            Arc::new(Observer),
        );

        // Worker not started yet, so the queue fills deterministically.
        assert!(node.process(open("qll_alice", 100)));
        assert!(!node.process(open("qll_bob", 100)));

        node.start();
        node.processor.flush();
        assert_eq!(node.metrics.processor_overfill.get(), 1);
        node.stop();
    }

    #[test]
    fn canary_toggles_final_vote_requirement() {
        let node = dev_node();
        assert!(!node.oracle.final_votes_canary());
        node.oracle.set_final_votes_canary(true);
        assert!(node.oracle.final_votes_canary());
    }

    #[test]
    fn committed_block_can_win_an_election_end_to_end() {
        let node = dev_node();
        node.start();

        let genesis = open("qll_rep1", 500);
        assert_eq!(
            node.process_blocking(genesis.clone()),
            Some(BlockStatus::Progress)
        );

        node.elections
            .insert(genesis.clone(), ElectionBehavior::Normal)
            .unwrap();
        let result = node.vote(&Vote::new(
            Account::new("qll_rep1"),
            VOTE_TIMESTAMP_FINAL,
            genesis.hash,
            Signature([2u8; 64]),
        ));
        assert!(result.processed);
        assert!(node.ledger.is_confirmed(&genesis.hash));
        node.stop();
    }

    #[test]
    fn election_winner_is_recommitted_through_forced_queue() {
        let node = dev_node();
        node.start();

        let genesis = open("qll_rep1", 500);
        assert_eq!(
            node.process_blocking(genesis.clone()),
            Some(BlockStatus::Progress)
        );

        let committed = Block {
            kind: BlockKind::Send,
            account: Account::new("qll_rep1"),
            previous: genesis.hash,
            representative: Account::new("qll_rep1"),
            balance: 400,
            link: quill_ledger::account_link(&Account::new("qll_bob")),
            timestamp: Timestamp::new(1_700_000_001),
            work: WorkNonce(1),
            signature: Signature([1u8; 64]),
            hash: BlockHash::ZERO,
        }
        .seal();
        let challenger = Block {
            balance: 300,
            link: quill_ledger::account_link(&Account::new("qll_carol")),
            ..committed.clone()
        }
        .seal();
        assert_eq!(
            node.process_blocking(committed.clone()),
            Some(BlockStatus::Progress)
        );

        // The network reports the losing side of the fork; consensus
        // picks it, and the ledger must switch.
        node.process(challenger.clone());
        node.processor.flush();
        let election = node.elections.election(&committed.qualified_root()).unwrap();
        election.vote(
            &Account::new("qll_rep1"),
            VOTE_TIMESTAMP_FINAL,
            challenger.hash,
            VoteSource::Live,
        );
        node.processor.flush();

        assert!(node.ledger.block_exists(&challenger.hash));
        assert!(!node.ledger.block_exists(&committed.hash));
        assert!(node.ledger.is_confirmed(&challenger.hash));
        let rollback = node
            .ledger
            .rollback(&mut node.ledger.begin_write(), &challenger.hash);
        assert!(matches!(
            rollback,
            Err(LedgerError::RollbackConfirmed(hash)) if hash == challenger.hash
        ));
        node.stop();
    }
}
