//! In-memory ledger backend.
//!
//! Keeps the whole lattice in hash maps behind one `RwLock`. Reads take
//! the read lock only; mutations additionally require the exclusive
//! write token, so at most one writer exists even across batches.

use crate::ledger::{Ledger, WriteTransaction};
use crate::state_block::{account_link, Block, BlockKind, BURN_ACCOUNT};
use crate::{BlockStatus, LedgerError};
use quill_types::{Account, BlockHash, QualifiedRoot};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Clone, Debug)]
struct PendingInfo {
    /// Account link of the destination ([`account_link`]).
    destination: BlockHash,
    amount: u128,
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<BlockHash, Block>,
    /// Committed successor per fork slot.
    successors: HashMap<QualifiedRoot, BlockHash>,
    /// Head block per account chain.
    frontiers: HashMap<Account, BlockHash>,
    /// Unclaimed sends, keyed by send block hash.
    pending: HashMap<BlockHash, PendingInfo>,
    /// Which receive claimed a given send; drives rollback cascades.
    received_by: HashMap<BlockHash, BlockHash>,
    confirmed: HashSet<BlockHash>,
    /// Voting weight per representative.
    weights: HashMap<Account, u128>,
}

pub struct MemoryLedger {
    write_lock: Mutex<()>,
    inner: RwLock<Inner>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            write_lock: Mutex::new(()),
            inner: RwLock::new(Inner::default()),
        }
    }

    fn validate(inner: &Inner, block: &Block) -> BlockStatus {
        if inner.blocks.contains_key(&block.hash) {
            return BlockStatus::Old;
        }
        if block.signature.is_zero() {
            return BlockStatus::BadSignature;
        }
        if block.work.0 == 0 {
            return BlockStatus::InsufficientWork;
        }
        match block.kind {
            BlockKind::Open => Self::validate_open(inner, block),
            _ => Self::validate_successor(inner, block),
        }
    }

    fn validate_open(inner: &Inner, block: &Block) -> BlockStatus {
        if !block.previous.is_zero() {
            return BlockStatus::BlockPosition;
        }
        if block.account.as_str() == BURN_ACCOUNT {
            return BlockStatus::OpenedBurnAccount;
        }
        if inner.frontiers.contains_key(&block.account) {
            return BlockStatus::Fork;
        }
        if block.link.is_zero() {
            // Genesis-style mint; any balance is accepted.
            return BlockStatus::Progress;
        }
        Self::validate_receive(inner, block, 0)
    }

    fn validate_successor(inner: &Inner, block: &Block) -> BlockStatus {
        let Some(prev) = inner.blocks.get(&block.previous) else {
            return BlockStatus::GapPrevious;
        };
        if prev.account != block.account {
            return BlockStatus::BlockPosition;
        }
        if inner.successors.contains_key(&block.qualified_root()) {
            return BlockStatus::Fork;
        }
        match block.kind {
            BlockKind::Send => {
                if block.balance >= prev.balance {
                    return BlockStatus::NegativeSpend;
                }
                BlockStatus::Progress
            }
            BlockKind::Receive => Self::validate_receive(inner, block, prev.balance),
            BlockKind::Change => {
                if block.balance != prev.balance || !block.link.is_zero() {
                    return BlockStatus::BalanceMismatch;
                }
                BlockStatus::Progress
            }
            BlockKind::Open => BlockStatus::BlockPosition,
        }
    }

    fn validate_receive(inner: &Inner, block: &Block, prev_balance: u128) -> BlockStatus {
        if !inner.blocks.contains_key(&block.link) {
            return BlockStatus::GapSource;
        }
        let Some(pending) = inner.pending.get(&block.link) else {
            return BlockStatus::Unreceivable;
        };
        if pending.destination != account_link(&block.account) {
            return BlockStatus::Unreceivable;
        }
        if prev_balance.saturating_add(pending.amount) != block.balance {
            return BlockStatus::BalanceMismatch;
        }
        BlockStatus::Progress
    }

    /// Apply an already-validated block. Weight moves with the balance
    /// delta; the inverse is [`Self::undo`].
    fn commit(inner: &mut Inner, block: &Block) {
        if let Some(prev) = inner.blocks.get(&block.previous).cloned() {
            let w = inner.weights.entry(prev.representative).or_default();
            *w = w.saturating_sub(prev.balance);
        }
        *inner.weights.entry(block.representative.clone()).or_default() += block.balance;

        match block.kind {
            BlockKind::Send => {
                let prev_balance = inner
                    .blocks
                    .get(&block.previous)
                    .map(|b| b.balance)
                    .unwrap_or_default();
                inner.pending.insert(
                    block.hash,
                    PendingInfo {
                        destination: block.link,
                        amount: prev_balance - block.balance,
                    },
                );
            }
            BlockKind::Open | BlockKind::Receive => {
                if !block.link.is_zero() {
                    inner.pending.remove(&block.link);
                    inner.received_by.insert(block.link, block.hash);
                }
            }
            BlockKind::Change => {}
        }

        inner.successors.insert(block.qualified_root(), block.hash);
        inner.frontiers.insert(block.account.clone(), block.hash);
        inner.blocks.insert(block.hash, block.clone());
    }

    /// Remove a chain head, restoring the state before it. Caller has
    /// already verified `head` is the frontier of its account and not
    /// confirmed.
    fn undo(inner: &mut Inner, head: &Block) {
        let w = inner.weights.entry(head.representative.clone()).or_default();
        *w = w.saturating_sub(head.balance);
        let prev = inner.blocks.get(&head.previous).cloned();
        if let Some(prev) = &prev {
            *inner.weights.entry(prev.representative.clone()).or_default() += prev.balance;
        }

        match head.kind {
            BlockKind::Send => {
                inner.pending.remove(&head.hash);
            }
            BlockKind::Open | BlockKind::Receive => {
                if !head.link.is_zero() {
                    let prev_balance = prev.as_ref().map(|b| b.balance).unwrap_or_default();
                    inner.pending.insert(
                        head.link,
                        PendingInfo {
                            destination: account_link(&head.account),
                            amount: head.balance - prev_balance,
                        },
                    );
                    inner.received_by.remove(&head.link);
                }
            }
            BlockKind::Change => {}
        }

        inner.successors.remove(&head.qualified_root());
        if head.previous.is_zero() {
            inner.frontiers.remove(&head.account);
        } else {
            inner.frontiers.insert(head.account.clone(), head.previous);
        }
        inner.blocks.remove(&head.hash);
    }

    /// Walk the cascade that rolling back `target` would undo, without
    /// touching anything, and fail if any block in it is confirmed. Lets
    /// `rollback` refuse up front instead of stopping halfway through.
    fn scan_for_confirmed(inner: &Inner, target: &BlockHash) -> Result<(), LedgerError> {
        let account = inner
            .blocks
            .get(target)
            .map(|b| b.account.clone())
            .ok_or(LedgerError::BlockNotFound(*target))?;
        let mut hash = *inner
            .frontiers
            .get(&account)
            .ok_or_else(|| LedgerError::Corrupt(format!("no frontier for {account}")))?;
        loop {
            let block = inner
                .blocks
                .get(&hash)
                .ok_or_else(|| LedgerError::Corrupt(format!("dangling frontier {hash}")))?;
            if inner.confirmed.contains(&hash) {
                return Err(LedgerError::RollbackConfirmed(hash));
            }
            if block.kind == BlockKind::Send {
                if let Some(receiver) = inner.received_by.get(&hash).copied() {
                    Self::scan_for_confirmed(inner, &receiver)?;
                }
            }
            if hash == *target {
                return Ok(());
            }
            hash = block.previous;
        }
    }

    /// Pop blocks from `target`'s chain frontier down to and including
    /// `target`, cascading through receives of any rolled-back send.
    /// `scan_for_confirmed` has already cleared the whole cascade.
    fn rollback_inner(
        inner: &mut Inner,
        target: &BlockHash,
        out: &mut Vec<Block>,
    ) -> Result<(), LedgerError> {
        let account = inner
            .blocks
            .get(target)
            .map(|b| b.account.clone())
            .ok_or(LedgerError::BlockNotFound(*target))?;
        loop {
            let head_hash = *inner
                .frontiers
                .get(&account)
                .ok_or_else(|| LedgerError::Corrupt(format!("no frontier for {account}")))?;
            let head = inner
                .blocks
                .get(&head_hash)
                .cloned()
                .ok_or_else(|| LedgerError::Corrupt(format!("dangling frontier {head_hash}")))?;
            if inner.confirmed.contains(&head.hash) {
                return Err(LedgerError::RollbackConfirmed(head.hash));
            }
            if head.kind == BlockKind::Send {
                if let Some(receiver) = inner.received_by.get(&head.hash).copied() {
                    Self::rollback_inner(inner, &receiver, out)?;
                }
            }
            Self::undo(inner, &head);
            let done = head.hash == *target;
            out.push(head);
            if done {
                return Ok(());
            }
        }
    }
}

impl Ledger for MemoryLedger {
    fn begin_write(&self) -> WriteTransaction<'_> {
        WriteTransaction::new(self.write_lock.lock().unwrap())
    }

    fn process(&self, _tx: &mut WriteTransaction<'_>, block: &Block) -> BlockStatus {
        let mut inner = self.inner.write().unwrap();
        let status = Self::validate(&inner, block);
        if status == BlockStatus::Progress {
            Self::commit(&mut inner, block);
            debug!(hash = %block.hash, account = %block.account, "block committed");
        }
        status
    }

    fn rollback(
        &self,
        _tx: &mut WriteTransaction<'_>,
        hash: &BlockHash,
    ) -> Result<Vec<Block>, LedgerError> {
        let mut inner = self.inner.write().unwrap();
        Self::scan_for_confirmed(&inner, hash)?;
        let mut out = Vec::new();
        Self::rollback_inner(&mut inner, hash, &mut out)?;
        debug!(target = %hash, count = out.len(), "rolled back");
        Ok(out)
    }

    fn confirm(&self, _tx: &mut WriteTransaction<'_>, hash: &BlockHash) -> Result<(), LedgerError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.blocks.contains_key(hash) {
            return Err(LedgerError::BlockNotFound(*hash));
        }
        inner.confirmed.insert(*hash);
        Ok(())
    }

    fn block(&self, hash: &BlockHash) -> Option<Block> {
        self.inner.read().unwrap().blocks.get(hash).cloned()
    }

    fn successor(&self, root: &QualifiedRoot) -> Option<Block> {
        let inner = self.inner.read().unwrap();
        let hash = inner.successors.get(root)?;
        inner.blocks.get(hash).cloned()
    }

    fn is_confirmed(&self, hash: &BlockHash) -> bool {
        self.inner.read().unwrap().confirmed.contains(hash)
    }

    fn weight(&self, representative: &Account) -> u128 {
        self.inner
            .read()
            .unwrap()
            .weights
            .get(representative)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_types::{Signature, Timestamp, WorkNonce};

    fn rep() -> Account {
        Account::new("qll_rep1")
    }

    fn raw_block(kind: BlockKind, account: &str, previous: BlockHash, balance: u128) -> Block {
        Block {
            kind,
            account: Account::new(account),
            previous,
            representative: rep(),
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

    fn receive(account: &str, previous: BlockHash, balance: u128, source: BlockHash) -> Block {
        let mut b = raw_block(BlockKind::Receive, account, previous, balance);
        b.link = source;
        b.seal()
    }

    fn process(ledger: &MemoryLedger, block: &Block) -> BlockStatus {
        let mut tx = ledger.begin_write();
        ledger.process(&mut tx, block)
    }

    #[test]
    fn open_send_receive_lifecycle() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        assert_eq!(process(&ledger, &genesis), BlockStatus::Progress);

        let s = send("qll_alice", genesis.hash, 60, "qll_bob");
        assert_eq!(process(&ledger, &s), BlockStatus::Progress);

        let bob_open = receive("qll_bob", BlockHash::ZERO, 40, s.hash);
        let bob_open = Block {
            kind: BlockKind::Open,
            ..bob_open
        }
        .seal();
        assert_eq!(process(&ledger, &bob_open), BlockStatus::Progress);
        assert_eq!(ledger.weight(&rep()), 100);
        assert!(ledger.block_exists(&bob_open.hash));
    }

    #[test]
    fn duplicate_is_old() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        assert_eq!(process(&ledger, &genesis), BlockStatus::Progress);
        assert_eq!(process(&ledger, &genesis), BlockStatus::Old);
    }

    #[test]
    fn missing_previous_is_gap() {
        let ledger = MemoryLedger::new();
        let s = send("qll_alice", BlockHash::new([9; 32]), 60, "qll_bob");
        assert_eq!(process(&ledger, &s), BlockStatus::GapPrevious);
    }

    #[test]
    fn missing_source_is_gap() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        process(&ledger, &genesis);
        let r = receive("qll_alice", genesis.hash, 150, BlockHash::new([9; 32]));
        assert_eq!(process(&ledger, &r), BlockStatus::GapSource);
    }

    #[test]
    fn receive_to_wrong_account_is_unreceivable() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        process(&ledger, &genesis);
        let s = send("qll_alice", genesis.hash, 60, "qll_bob");
        process(&ledger, &s);

        let eve = open("qll_eve", 0);
        process(&ledger, &eve);
        let theft = receive("qll_eve", eve.hash, 40, s.hash);
        assert_eq!(process(&ledger, &theft), BlockStatus::Unreceivable);
    }

    #[test]
    fn double_receive_is_unreceivable() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        process(&ledger, &genesis);
        let s = send("qll_alice", genesis.hash, 60, "qll_bob");
        process(&ledger, &s);
        let bob = Block {
            kind: BlockKind::Open,
            ..receive("qll_bob", BlockHash::ZERO, 40, s.hash)
        }
        .seal();
        process(&ledger, &bob);
        let again = receive("qll_bob", bob.hash, 80, s.hash);
        assert_eq!(process(&ledger, &again), BlockStatus::Unreceivable);
    }

    #[test]
    fn wrong_amount_is_balance_mismatch() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        process(&ledger, &genesis);
        let s = send("qll_alice", genesis.hash, 60, "qll_bob");
        process(&ledger, &s);
        let bob = Block {
            kind: BlockKind::Open,
            ..receive("qll_bob", BlockHash::ZERO, 41, s.hash)
        }
        .seal();
        assert_eq!(process(&ledger, &bob), BlockStatus::BalanceMismatch);
    }

    #[test]
    fn send_gaining_funds_is_negative_spend() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        process(&ledger, &genesis);
        let s = send("qll_alice", genesis.hash, 150, "qll_bob");
        assert_eq!(process(&ledger, &s), BlockStatus::NegativeSpend);
    }

    #[test]
    fn competing_successor_is_fork() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        process(&ledger, &genesis);
        let a = send("qll_alice", genesis.hash, 60, "qll_bob");
        let b = send("qll_alice", genesis.hash, 50, "qll_eve");
        assert_eq!(process(&ledger, &a), BlockStatus::Progress);
        assert_eq!(process(&ledger, &b), BlockStatus::Fork);
        assert_eq!(
            ledger.successor(&b.qualified_root()).map(|blk| blk.hash),
            Some(a.hash)
        );
    }

    #[test]
    fn burn_account_cannot_open() {
        let ledger = MemoryLedger::new();
        let b = open(BURN_ACCOUNT, 1);
        assert_eq!(process(&ledger, &b), BlockStatus::OpenedBurnAccount);
    }

    #[test]
    fn zero_work_rejected() {
        let ledger = MemoryLedger::new();
        let mut b = open("qll_alice", 100);
        b.work = WorkNonce(0);
        assert_eq!(process(&ledger, &b), BlockStatus::InsufficientWork);
    }

    #[test]
    fn rollback_restores_pending_and_cascades() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        process(&ledger, &genesis);
        let s = send("qll_alice", genesis.hash, 60, "qll_bob");
        process(&ledger, &s);
        let bob = Block {
            kind: BlockKind::Open,
            ..receive("qll_bob", BlockHash::ZERO, 40, s.hash)
        }
        .seal();
        process(&ledger, &bob);

        // Rolling back the send must drag bob's receive with it.
        let mut tx = ledger.begin_write();
        let rolled = ledger.rollback(&mut tx, &s.hash).unwrap();
        drop(tx);
        let hashes: Vec<_> = rolled.iter().map(|b| b.hash).collect();
        assert_eq!(hashes, vec![bob.hash, s.hash]);
        assert!(!ledger.block_exists(&s.hash));
        assert!(!ledger.block_exists(&bob.hash));
        assert!(ledger.block_exists(&genesis.hash));

        // The slot is free again.
        let b2 = send("qll_alice", genesis.hash, 50, "qll_eve");
        assert_eq!(process(&ledger, &b2), BlockStatus::Progress);
    }

    #[test]
    fn confirmed_blocks_cannot_roll_back() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        process(&ledger, &genesis);
        let s = send("qll_alice", genesis.hash, 60, "qll_bob");
        process(&ledger, &s);
        let mut tx = ledger.begin_write();
        ledger.confirm(&mut tx, &s.hash).unwrap();
        let err = ledger.rollback(&mut tx, &s.hash).unwrap_err();
        assert!(matches!(err, LedgerError::RollbackConfirmed(h) if h == s.hash));
        assert!(ledger.block_exists(&s.hash));
    }

    #[test]
    fn rollback_past_confirmed_block_leaves_chain_intact() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        process(&ledger, &genesis);
        let s1 = send("qll_alice", genesis.hash, 80, "qll_bob");
        process(&ledger, &s1);
        let s2 = send("qll_alice", s1.hash, 60, "qll_eve");
        process(&ledger, &s2);

        let mut tx = ledger.begin_write();
        ledger.confirm(&mut tx, &s1.hash).unwrap();

        // The cascade would have to pop s2 before hitting the confirmed
        // s1. Nothing may be undone.
        let err = ledger.rollback(&mut tx, &genesis.hash).unwrap_err();
        assert!(matches!(err, LedgerError::RollbackConfirmed(h) if h == s1.hash));
        assert!(ledger.block_exists(&s2.hash));
        assert!(ledger.block_exists(&s1.hash));
        assert!(ledger.block_exists(&genesis.hash));
    }

    #[test]
    fn weight_follows_representative_change() {
        let ledger = MemoryLedger::new();
        let genesis = open("qll_alice", 100);
        process(&ledger, &genesis);
        assert_eq!(ledger.weight(&rep()), 100);

        let mut change = raw_block(BlockKind::Change, "qll_alice", genesis.hash, 100);
        change.representative = Account::new("qll_rep2");
        let change = change.seal();
        assert_eq!(process(&ledger, &change), BlockStatus::Progress);
        assert_eq!(ledger.weight(&rep()), 0);
        assert_eq!(ledger.weight(&Account::new("qll_rep2")), 100);
    }
}
