//! In-memory ledger.
//!
//! Backs the round engine in tests and tooling. Commits are all-or-nothing:
//! ops apply to a copy of the state which replaces the original only once
//! every op has succeeded.

use crate::ops::{apply_merge, recalc_votes, StoreBatch, StoreOp};
use crate::{AccountFilter, AccountStore, BlockStore, Ledger, RoundSummary, StorageError};
use anyhow::Result;
use karst_types::{Block, BlockId, DelegateAccount, Height, PublicKey, RoundId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct Inner {
    /// Delegate rows keyed by address.
    accounts: BTreeMap<String, DelegateAccount>,
    blocks: BTreeMap<Height, Block>,
    by_id: HashMap<BlockId, Height>,
    /// Vote relation: voter address to voted-for delegate public keys.
    votes: BTreeMap<String, Vec<PublicKey>>,
    /// Round transition stamps keyed by ticked height.
    round_stamps: BTreeMap<Height, BlockId>,
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: RwLock<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot every account row, keyed by address. Test helper for
    /// deep-equality assertions across tick/backward-tick sequences.
    pub fn accounts_snapshot(&self) -> BTreeMap<String, DelegateAccount> {
        self.inner.read().accounts.clone()
    }
}

fn apply_op(inner: &mut Inner, op: &StoreOp) -> Result<(), StorageError> {
    match op {
        StoreOp::MergeAccount { address, diff } => {
            let account = inner
                .accounts
                .get_mut(address)
                .ok_or_else(|| StorageError::AccountNotFound(address.clone()))?;
            apply_merge(account, diff)
        }
        StoreOp::RecalcVotes { round } => {
            debug!(target: "storage", round, "recomputing vote weights");
            recalc_votes(&mut inner.accounts, &inner.votes)
        }
        StoreOp::MarkBlockId { height, id } => {
            inner.round_stamps.insert(*height, *id);
            Ok(())
        }
        StoreOp::TruncateBlocks { from_height } => {
            let dropped = inner.blocks.split_off(from_height);
            for block in dropped.values() {
                inner.by_id.remove(&block.id);
            }
            inner.round_stamps.split_off(from_height);
            Ok(())
        }
    }
}

impl Ledger for MemoryLedger {
    fn commit(&self, batch: StoreBatch) -> Result<()> {
        let mut inner = self.inner.write();
        let mut next = inner.clone();
        for op in batch.ops() {
            apply_op(&mut next, op)?;
        }
        *inner = next;
        Ok(())
    }

    fn store_block(&self, block: &Block) -> Result<()> {
        let mut inner = self.inner.write();
        inner.by_id.insert(block.id, block.height);
        inner.blocks.insert(block.height, block.clone());
        Ok(())
    }

    fn put_account(&self, account: DelegateAccount) -> Result<()> {
        self.inner
            .write()
            .accounts
            .insert(account.address.clone(), account);
        Ok(())
    }

    fn set_votes(&self, voter: &str, delegates: Vec<PublicKey>) -> Result<()> {
        self.inner.write().votes.insert(voter.to_string(), delegates);
        Ok(())
    }
}

impl AccountStore for MemoryLedger {
    fn get(&self, filter: &AccountFilter) -> Result<Option<DelegateAccount>> {
        let inner = self.inner.read();
        if let Some(address) = &filter.address {
            return Ok(inner.accounts.get(address).filter(|a| filter.matches(a)).cloned());
        }
        Ok(inner
            .accounts
            .values()
            .find(|account| filter.matches(account))
            .cloned())
    }

    fn get_all(&self, filter: &AccountFilter) -> Result<Vec<DelegateAccount>> {
        let inner = self.inner.read();
        Ok(inner
            .accounts
            .values()
            .filter(|account| filter.matches(account))
            .cloned()
            .collect())
    }
}

impl BlockStore for MemoryLedger {
    fn find_by_height(&self, height: Height) -> Result<Option<Block>> {
        Ok(self.inner.read().blocks.get(&height).cloned())
    }

    fn find_by_id(&self, id: &BlockId) -> Result<Option<Block>> {
        let inner = self.inner.read();
        Ok(inner
            .by_id
            .get(id)
            .and_then(|height| inner.blocks.get(height))
            .cloned())
    }

    fn latest_height(&self) -> Result<Height> {
        Ok(self
            .inner
            .read()
            .blocks
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    fn sum_round(&self, active_delegates: u64, round: RoundId) -> Result<RoundSummary> {
        let inner = self.inner.read();
        // Height 1 settles alone at its own tick and never re-enters the
        // round-1 totals.
        let first = ((round - 1) * active_delegates + 1).max(2);
        let last = round * active_delegates;

        let mut summary = RoundSummary::empty();
        for (_, block) in inner.blocks.range(first..=last) {
            summary.fees = summary
                .fees
                .checked_add(block.total_fee)
                .ok_or(StorageError::FeeOverflow(round))?;
            summary.rewards.push(block.reward);
            summary.delegates.push(block.generator_public_key);
        }
        Ok(summary)
    }

    fn round_stamp(&self, height: Height) -> Result<Option<BlockId>> {
        Ok(self.inner.read().round_stamps.get(&height).copied())
    }
}
