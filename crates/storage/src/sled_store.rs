//! Sled-backed persistent ledger.
//!
//! Rows are serde_json-encoded. Account and vote mutations are staged in
//! memory while the batch is replayed, then written through a single
//! multi-tree sled transaction, so a committed batch lands entirely or not
//! at all. A process-wide commit lock serializes writers; the surrounding
//! block pipeline already applies blocks one at a time.

use crate::ops::{apply_merge, recalc_votes, StoreBatch, StoreOp};
use crate::{AccountFilter, AccountStore, BlockStore, Ledger, RoundSummary, StorageError};
use anyhow::Result;
use karst_types::{Block, BlockId, DelegateAccount, Height, PublicKey, RoundId};
use parking_lot::Mutex;
use sled::transaction::TransactionError;
use sled::{Db, Transactional, Tree};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

const LATEST_HEIGHT_KEY: &[u8] = b"latest_height";
const STAMP_PREFIX: &[u8] = b"round_stamp_";

pub struct SledLedger {
    db: Db,
    accounts: Tree,
    blocks: Tree,
    heights: Tree,
    votes: Tree,
    metadata: Tree,
    commit_lock: Mutex<()>,
}

fn height_key(height: Height) -> [u8; 8] {
    height.to_be_bytes()
}

fn stamp_key(height: Height) -> Vec<u8> {
    let mut key = Vec::with_capacity(STAMP_PREFIX.len() + 8);
    key.extend_from_slice(STAMP_PREFIX);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn block_id_from(bytes: &[u8]) -> Result<BlockId> {
    let id: BlockId = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("stored block id has wrong length"))?;
    Ok(id)
}

impl SledLedger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let accounts = db.open_tree("accounts")?;
        let blocks = db.open_tree("blocks")?;
        let heights = db.open_tree("heights")?;
        let votes = db.open_tree("votes")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            accounts,
            blocks,
            heights,
            votes,
            metadata,
            commit_lock: Mutex::new(()),
        })
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn load_accounts(&self) -> Result<BTreeMap<String, DelegateAccount>> {
        let mut table = BTreeMap::new();
        for entry in self.accounts.iter() {
            let (key, value) = entry?;
            let address = String::from_utf8(key.to_vec())
                .map_err(|_| anyhow::anyhow!("non-utf8 account key"))?;
            let account: DelegateAccount = serde_json::from_slice(&value)?;
            table.insert(address, account);
        }
        Ok(table)
    }

    fn load_votes(&self) -> Result<BTreeMap<String, Vec<PublicKey>>> {
        let mut table = BTreeMap::new();
        for entry in self.votes.iter() {
            let (key, value) = entry?;
            let voter = String::from_utf8(key.to_vec())
                .map_err(|_| anyhow::anyhow!("non-utf8 voter key"))?;
            let targets: Vec<PublicKey> = serde_json::from_slice(&value)?;
            table.insert(voter, targets);
        }
        Ok(table)
    }

    fn block_at(&self, height: Height) -> Result<Option<Block>> {
        let Some(id_bytes) = self.heights.get(height_key(height))? else {
            return Ok(None);
        };
        let Some(value) = self.blocks.get(&id_bytes)? else {
            return Ok(None);
        };
        let block: Block = serde_json::from_slice(&value)?;
        Ok(Some(block))
    }

    fn stored_latest_height(&self) -> Result<Height> {
        let Some(value) = self.metadata.get(LATEST_HEIGHT_KEY)? else {
            return Ok(0);
        };
        let bytes: [u8; 8] = value
            .as_ref()
            .try_into()
            .map_err(|_| anyhow::anyhow!("corrupt latest_height metadata"))?;
        Ok(Height::from_be_bytes(bytes))
    }
}

impl Ledger for SledLedger {
    fn commit(&self, batch: StoreBatch) -> Result<()> {
        let _guard = self.commit_lock.lock();

        let needs_accounts = batch.ops().iter().any(|op| {
            matches!(op, StoreOp::MergeAccount { .. } | StoreOp::RecalcVotes { .. })
        });
        let needs_votes = batch
            .ops()
            .iter()
            .any(|op| matches!(op, StoreOp::RecalcVotes { .. }));

        let mut accounts = if needs_accounts {
            self.load_accounts()?
        } else {
            BTreeMap::new()
        };
        let votes = if needs_votes {
            self.load_votes()?
        } else {
            BTreeMap::new()
        };

        // Replay the ops against the staged table.
        let mut dirty: BTreeSet<String> = BTreeSet::new();
        let mut all_dirty = false;
        let mut stamps: Vec<(Height, BlockId)> = Vec::new();
        let mut truncate_from: Option<Height> = None;
        for op in batch.ops() {
            match op {
                StoreOp::MergeAccount { address, diff } => {
                    let account = accounts
                        .get_mut(address)
                        .ok_or_else(|| StorageError::AccountNotFound(address.clone()))?;
                    apply_merge(account, diff)?;
                    dirty.insert(address.clone());
                }
                StoreOp::RecalcVotes { round } => {
                    debug!(target: "storage", round, "recomputing vote weights");
                    recalc_votes(&mut accounts, &votes)?;
                    all_dirty = true;
                }
                StoreOp::MarkBlockId { height, id } => stamps.push((*height, *id)),
                StoreOp::TruncateBlocks { from_height } => {
                    truncate_from = Some(
                        truncate_from.map_or(*from_height, |existing| existing.min(*from_height)),
                    );
                }
            }
        }

        // Pre-encode every write so the transaction closure stays pure.
        let mut account_puts: Vec<(String, Vec<u8>)> = Vec::new();
        for (address, account) in &accounts {
            if all_dirty || dirty.contains(address) {
                account_puts.push((address.clone(), serde_json::to_vec(account)?));
            }
        }
        let stamp_puts: Vec<(Vec<u8>, BlockId)> = stamps
            .iter()
            .map(|(height, id)| (stamp_key(*height), *id))
            .collect();

        let mut height_removals: Vec<([u8; 8], sled::IVec)> = Vec::new();
        let mut stamp_removals: Vec<Vec<u8>> = Vec::new();
        let mut new_latest: Option<Height> = None;
        if let Some(from) = truncate_from {
            for entry in self.heights.range(height_key(from)..) {
                let (key, id_bytes) = entry?;
                let key: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("corrupt height key"))?;
                height_removals.push((key, id_bytes));
                stamp_removals.push(stamp_key(Height::from_be_bytes(key)));
            }
            if self.stored_latest_height()? >= from {
                new_latest = Some(from.saturating_sub(1));
            }
        }

        (&self.accounts, &self.blocks, &self.heights, &self.metadata)
            .transaction(|(ta, tb, th, tm)| {
                for (address, value) in &account_puts {
                    ta.insert(address.as_bytes(), value.clone())?;
                }
                for (key, id) in &stamp_puts {
                    tm.insert(key.clone(), &id[..])?;
                }
                for (height, id_bytes) in &height_removals {
                    th.remove(&height[..])?;
                    tb.remove(id_bytes)?;
                }
                for key in &stamp_removals {
                    tm.remove(key.clone())?;
                }
                if let Some(latest) = new_latest {
                    tm.insert(LATEST_HEIGHT_KEY, latest.to_be_bytes().to_vec())?;
                }
                Ok(())
            })
            .map_err(|err: TransactionError<()>| match err {
                TransactionError::Abort(()) => anyhow::anyhow!("ledger commit aborted"),
                TransactionError::Storage(e) => StorageError::Database(e).into(),
            })?;

        debug!(target: "storage", ops = batch.len(), "committed batch");
        Ok(())
    }

    fn store_block(&self, block: &Block) -> Result<()> {
        let _guard = self.commit_lock.lock();
        let value = serde_json::to_vec(block)?;
        self.blocks.insert(&block.id[..], value)?;
        self.heights.insert(height_key(block.height), &block.id[..])?;
        let latest = self.stored_latest_height()?.max(block.height);
        self.metadata
            .insert(LATEST_HEIGHT_KEY, latest.to_be_bytes().to_vec())?;
        Ok(())
    }

    fn put_account(&self, account: DelegateAccount) -> Result<()> {
        let value = serde_json::to_vec(&account)?;
        self.accounts.insert(account.address.as_bytes(), value)?;
        Ok(())
    }

    fn set_votes(&self, voter: &str, delegates: Vec<PublicKey>) -> Result<()> {
        let value = serde_json::to_vec(&delegates)?;
        self.votes.insert(voter.as_bytes(), value)?;
        Ok(())
    }
}

impl AccountStore for SledLedger {
    fn get(&self, filter: &AccountFilter) -> Result<Option<DelegateAccount>> {
        if let Some(address) = &filter.address {
            let Some(value) = self.accounts.get(address.as_bytes())? else {
                return Ok(None);
            };
            let account: DelegateAccount = serde_json::from_slice(&value)?;
            return Ok(Some(account).filter(|a| filter.matches(a)));
        }

        for entry in self.accounts.iter() {
            let (_, value) = entry?;
            let account: DelegateAccount = serde_json::from_slice(&value)?;
            if filter.matches(&account) {
                return Ok(Some(account));
            }
        }
        Ok(None)
    }

    fn get_all(&self, filter: &AccountFilter) -> Result<Vec<DelegateAccount>> {
        let mut matched = Vec::new();
        for entry in self.accounts.iter() {
            let (_, value) = entry?;
            let account: DelegateAccount = serde_json::from_slice(&value)?;
            if filter.matches(&account) {
                matched.push(account);
            }
        }
        Ok(matched)
    }
}

impl BlockStore for SledLedger {
    fn find_by_height(&self, height: Height) -> Result<Option<Block>> {
        self.block_at(height)
    }

    fn find_by_id(&self, id: &BlockId) -> Result<Option<Block>> {
        let Some(value) = self.blocks.get(&id[..])? else {
            return Ok(None);
        };
        let block: Block = serde_json::from_slice(&value)?;
        Ok(Some(block))
    }

    fn latest_height(&self) -> Result<Height> {
        self.stored_latest_height()
    }

    fn sum_round(&self, active_delegates: u64, round: RoundId) -> Result<RoundSummary> {
        // Height 1 settles alone at its own tick and never re-enters the
        // round-1 totals.
        let first = ((round - 1) * active_delegates + 1).max(2);
        let last = round * active_delegates;

        let mut summary = RoundSummary::empty();
        for height in first..=last {
            let Some(block) = self.block_at(height)? else {
                continue;
            };
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
        let Some(value) = self.metadata.get(stamp_key(height))? else {
            return Ok(None);
        };
        Ok(Some(block_id_from(&value)?))
    }
}
