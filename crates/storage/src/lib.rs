//! Ledger interfaces for the karst node.
//!
//! The round engine consumes the [`AccountStore`] and [`BlockStore`] traits
//! and queues every mutation as a typed op; [`Ledger::commit`] applies one
//! batch atomically. Two implementations ship here: an in-memory ledger for
//! tests and tooling, and a sled-backed ledger for nodes.

use anyhow::Result;
use karst_types::{address_from_public_key, Block, BlockId, DelegateAccount, Height, PublicKey, RoundId, Satoshi};

pub mod memory;
pub mod ops;
pub mod sled_store;

pub use memory::MemoryLedger;
pub use ops::{AccountDiff, RoundAudit, StoreBatch, StoreOp};
pub use sled_store::SledLedger;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("block at height {0} not found")]
    BlockNotFound(Height),
    #[error("account {0} not found")]
    AccountNotFound(String),
    #[error("arithmetic overflow applying diff to account {0}")]
    DiffOverflow(String),
    #[error("negative balance computed for account {0}")]
    NegativeBalance(String),
    #[error("round audit mismatch for account {address}: expected pop of round {round}")]
    AuditMismatch { address: String, round: RoundId },
    #[error("fee total overflowed while summing round {0}")]
    FeeOverflow(RoundId),
}

/// Filter for delegate account queries.
#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    pub address: Option<String>,
    pub public_key: Option<PublicKey>,
    /// Keep only accounts with `vote` strictly above this value.
    pub vote_above: Option<Satoshi>,
    /// Keep only accounts with `votes_weight` strictly above this value.
    pub votes_weight_above: Option<Satoshi>,
    pub exclude_banned: bool,
}

impl AccountFilter {
    pub fn by_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn by_public_key(public_key: PublicKey) -> Self {
        Self {
            public_key: Some(public_key),
            ..Self::default()
        }
    }

    /// Does the account pass this filter?
    pub fn matches(&self, account: &DelegateAccount) -> bool {
        if let Some(address) = &self.address {
            if &account.address != address {
                return false;
            }
        }
        if let Some(public_key) = &self.public_key {
            if &account.public_key != public_key {
                return false;
            }
        }
        if let Some(floor) = self.vote_above {
            if account.vote <= floor {
                return false;
            }
        }
        if let Some(floor) = self.votes_weight_above {
            if account.votes_weight <= floor {
                return false;
            }
        }
        if self.exclude_banned && account.banned {
            return false;
        }
        true
    }
}

/// Aggregated totals of one round's persisted blocks, height-ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSummary {
    /// Sum of the round's block fees.
    pub fees: Satoshi,
    /// Per-slot rewards, one entry per persisted block.
    pub rewards: Vec<Satoshi>,
    /// Per-slot generator public keys, parallel to `rewards`.
    pub delegates: Vec<PublicKey>,
}

impl RoundSummary {
    pub fn empty() -> Self {
        Self {
            fees: Satoshi::ZERO,
            rewards: Vec::new(),
            delegates: Vec::new(),
        }
    }
}

/// Read access to delegate accounts.
///
/// Mutation happens exclusively through [`StoreOp`]s committed via
/// [`Ledger::commit`]; the trait itself is read-only.
pub trait AccountStore: Send + Sync {
    fn get(&self, filter: &AccountFilter) -> Result<Option<DelegateAccount>>;

    fn get_all(&self, filter: &AccountFilter) -> Result<Vec<DelegateAccount>>;

    /// Derive the address for a public key.
    fn generate_address(&self, public_key: &PublicKey) -> String {
        address_from_public_key(public_key)
    }
}

/// Read access to persisted blocks plus the round aggregation query.
pub trait BlockStore: Send + Sync {
    fn find_by_height(&self, height: Height) -> Result<Option<Block>>;

    fn find_by_id(&self, id: &BlockId) -> Result<Option<Block>>;

    fn latest_height(&self) -> Result<Height>;

    /// Sum the persisted blocks of `round`, height-ascending: total fees,
    /// per-slot rewards and per-slot generators. Height 1 is always
    /// excluded; the genesis block settles alone at its own tick and must
    /// not be paid a second time when round 1 closes. Fee accumulation is
    /// checked integer arithmetic; this is the point where stored totals
    /// become exact `Satoshi` values.
    fn sum_round(&self, active_delegates: u64, round: RoundId) -> Result<RoundSummary>;

    /// The block id stamped at `height` by a round transition, if any.
    fn round_stamp(&self, height: Height) -> Result<Option<BlockId>>;
}

/// A combined account + block store with an atomic commit.
pub trait Ledger: AccountStore + BlockStore {
    /// Apply a batch of ops: all of them or none of them.
    fn commit(&self, batch: StoreBatch) -> Result<()>;

    /// Persist a block. Blocks are written by the block pipeline before the
    /// round engine ticks, so this is a direct write, not a batch op.
    fn store_block(&self, block: &Block) -> Result<()>;

    /// Insert or replace an account row. Account creation is external to the
    /// round engine.
    fn put_account(&self, account: DelegateAccount) -> Result<()>;

    /// Replace the vote edges of a voter. Edges mutate only via vote
    /// transactions, which are processed outside the round engine.
    fn set_votes(&self, voter: &str, delegates: Vec<PublicKey>) -> Result<()>;
}
