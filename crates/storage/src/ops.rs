//! Typed store operations.
//!
//! Everything the round engine does to persisted state is expressed as a
//! value in this closed op set, queued into a caller-owned [`StoreBatch`].
//! Nothing is applied eagerly: a ledger's `commit` is the transactional
//! envelope, and a batch that is dropped instead of committed has no effect.

use crate::StorageError;
use karst_types::{address_from_public_key, BlockId, DelegateAccount, Height, PublicKey, RoundId, Satoshi};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Round-audit mutation carried by an account merge.
///
/// `Push` records that the account forged a block during the round; `Pop`
/// removes the most recent entry again when that block is rolled back. A pop
/// whose tag does not match the top of the list indicates corrupt state and
/// fails the commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundAudit {
    #[default]
    None,
    Push(RoundId),
    Pop(RoundId),
}

/// Additive field deltas for one delegate account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDiff {
    pub balance: Satoshi,
    pub u_balance: Satoshi,
    pub vote: Satoshi,
    pub votes_weight: Satoshi,
    pub produced_blocks: i64,
    pub missed_blocks: i64,
    pub fees: Satoshi,
    pub rewards: Satoshi,
    pub round_audit: RoundAudit,
}

impl AccountDiff {
    /// The exact inverse of this diff. `None` on negation overflow.
    pub fn negated(&self) -> Option<AccountDiff> {
        Some(AccountDiff {
            balance: self.balance.checked_neg()?,
            u_balance: self.u_balance.checked_neg()?,
            vote: self.vote.checked_neg()?,
            votes_weight: self.votes_weight.checked_neg()?,
            produced_blocks: self.produced_blocks.checked_neg()?,
            missed_blocks: self.missed_blocks.checked_neg()?,
            fees: self.fees.checked_neg()?,
            rewards: self.rewards.checked_neg()?,
            round_audit: match self.round_audit {
                RoundAudit::None => RoundAudit::None,
                RoundAudit::Push(round) => RoundAudit::Pop(round),
                RoundAudit::Pop(round) => RoundAudit::Push(round),
            },
        })
    }
}

/// One element of the transactional op stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    /// Merge additive deltas into a delegate account row.
    MergeAccount { address: String, diff: AccountDiff },
    /// Recompute `vote` and `votes_weight` of every delegate from the vote
    /// relation and current balances.
    RecalcVotes { round: RoundId },
    /// Stamp the block id that drove a round transition at the given height.
    MarkBlockId { height: Height, id: BlockId },
    /// Drop all blocks at or above the given height (snapshot rebuilds).
    TruncateBlocks { from_height: Height },
}

/// Ordered batch of ops committed atomically by a ledger.
#[derive(Debug, Default)]
pub struct StoreBatch {
    ops: Vec<StoreOp>,
}

impl StoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: StoreOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

fn checked_counter(counter: u64, delta: i64, address: &str) -> Result<u64, StorageError> {
    counter
        .checked_add_signed(delta)
        .ok_or_else(|| StorageError::DiffOverflow(address.to_string()))
}

/// Merge an additive diff into an account row.
///
/// Every addition is checked, a resulting negative balance fails the commit,
/// and an audit pop must match the top of the audit list.
pub(crate) fn apply_merge(
    account: &mut DelegateAccount,
    diff: &AccountDiff,
) -> Result<(), StorageError> {
    let address = account.address.clone();

    let balance = account
        .balance
        .checked_add(diff.balance)
        .ok_or_else(|| StorageError::DiffOverflow(address.clone()))?;
    let u_balance = account
        .u_balance
        .checked_add(diff.u_balance)
        .ok_or_else(|| StorageError::DiffOverflow(address.clone()))?;
    if balance.is_negative() || u_balance.is_negative() {
        return Err(StorageError::NegativeBalance(address));
    }

    account.vote = account
        .vote
        .checked_add(diff.vote)
        .ok_or_else(|| StorageError::DiffOverflow(address.clone()))?;
    account.votes_weight = account
        .votes_weight
        .checked_add(diff.votes_weight)
        .ok_or_else(|| StorageError::DiffOverflow(address.clone()))?;
    account.fees = account
        .fees
        .checked_add(diff.fees)
        .ok_or_else(|| StorageError::DiffOverflow(address.clone()))?;
    account.rewards = account
        .rewards
        .checked_add(diff.rewards)
        .ok_or_else(|| StorageError::DiffOverflow(address.clone()))?;
    account.produced_blocks = checked_counter(account.produced_blocks, diff.produced_blocks, &address)?;
    account.missed_blocks = checked_counter(account.missed_blocks, diff.missed_blocks, &address)?;

    match diff.round_audit {
        RoundAudit::None => {}
        RoundAudit::Push(round) => account.round_audit.push(round),
        RoundAudit::Pop(round) => {
            if account.round_audit.last() != Some(&round) {
                return Err(StorageError::AuditMismatch { address, round });
            }
            account.round_audit.pop();
        }
    }

    account.balance = balance;
    account.u_balance = u_balance;
    Ok(())
}

/// Recompute `vote` and `votes_weight` of every account from the vote
/// relation and current balances.
///
/// A delegate's vote is the sum of its voters' confirmed balances. Edges
/// whose voter or target row is missing are skipped, matching relational
/// join semantics. The recomputation is a pure function of the account
/// table, which is what makes round reversal work without a snapshot: undo
/// the balance merges, recompute, and the prior values reappear.
pub(crate) fn recalc_votes(
    accounts: &mut BTreeMap<String, DelegateAccount>,
    votes: &BTreeMap<String, Vec<PublicKey>>,
) -> Result<(), StorageError> {
    let mut tallies: BTreeMap<String, Satoshi> = BTreeMap::new();
    for (voter, targets) in votes {
        let Some(balance) = accounts.get(voter).map(|account| account.balance) else {
            continue;
        };
        for target in targets {
            let target_address = address_from_public_key(target);
            if !accounts.contains_key(&target_address) {
                continue;
            }
            let tally = tallies.entry(target_address.clone()).or_insert(Satoshi::ZERO);
            *tally = tally
                .checked_add(balance)
                .ok_or(StorageError::DiffOverflow(target_address))?;
        }
    }

    for (address, account) in accounts.iter_mut() {
        let tally = tallies.get(address).copied().unwrap_or(Satoshi::ZERO);
        account.vote = tally;
        account.votes_weight = tally;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negation_inverts_every_field() {
        let diff = AccountDiff {
            balance: Satoshi(10),
            u_balance: Satoshi(10),
            vote: Satoshi(-3),
            votes_weight: Satoshi(-3),
            produced_blocks: 1,
            missed_blocks: 2,
            fees: Satoshi(4),
            rewards: Satoshi(5),
            round_audit: RoundAudit::Push(7),
        };
        let negated = diff.negated().unwrap();
        assert_eq!(negated.balance, Satoshi(-10));
        assert_eq!(negated.produced_blocks, -1);
        assert_eq!(negated.missed_blocks, -2);
        assert_eq!(negated.round_audit, RoundAudit::Pop(7));
        assert_eq!(negated.negated().unwrap(), diff);
    }

    #[test]
    fn batch_preserves_order() {
        let mut batch = StoreBatch::new();
        batch.push(StoreOp::RecalcVotes { round: 1 });
        batch.push(StoreOp::MarkBlockId {
            height: 5,
            id: [0u8; 32],
        });
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops()[0], StoreOp::RecalcVotes { round: 1 }));
        assert!(matches!(batch.ops()[1], StoreOp::MarkBlockId { height: 5, .. }));
    }
}
