//! Round op emission.
//!
//! [`RoundContext`] turns one tick into an ordered sequence of typed store
//! ops. The order is fixed: the generator merge, then (at a round end) the
//! settlement or its reversal, then the block-id stamp, then the snapshot
//! truncation if armed. The engine queues the sequence into the caller's
//! batch; nothing here touches state.

use crate::math;
use crate::RoundsError;
use karst_storage::{AccountDiff, AccountStore, RoundAudit, StoreOp};
use karst_types::{Block, BlockId, PublicKey, RoundId, Satoshi};

/// Everything needed to emit the ops of one tick.
pub struct RoundContext<'a> {
    pub round: RoundId,
    pub backwards: bool,
    pub finish_round: bool,
    /// Fork flag: the ticked height is governed by v2 slate selection.
    pub dpos_v2: bool,
    pub block: &'a Block,
    /// Id stamped at the ticked height: the block itself going forward, its
    /// parent going backward.
    pub mark_id: BlockId,
    pub round_fees: Satoshi,
    /// Per-slot rewards, parallel to `round_delegates`.
    pub round_rewards: Vec<Satoshi>,
    /// Per-slot generators, height-ascending; the last entry forged the
    /// round's last block and receives the fee remainder.
    pub round_delegates: Vec<PublicKey>,
    /// Addresses of slate members that forged nothing this round.
    pub round_outsiders: Vec<String>,
    pub active_delegates: u64,
    pub snapshot_round: Option<RoundId>,
}

impl RoundContext<'_> {
    /// Emit the ordered op sequence for this tick.
    pub fn ops(&self, accounts: &dyn AccountStore) -> Result<Vec<StoreOp>, RoundsError> {
        let mut ops = Vec::new();
        ops.push(self.merge_block_generator(accounts));
        if self.finish_round {
            if self.backwards {
                ops.extend(self.undo(accounts)?);
            } else {
                ops.extend(self.apply(accounts)?);
            }
        }
        ops.push(self.mark_block_id());
        if let Some(truncate) = self.truncate_blocks() {
            ops.push(truncate);
        }
        Ok(ops)
    }

    /// Per-block bookkeeping for the block's generator: the produced-blocks
    /// counter and the round audit entry that makes the tick reversible.
    fn merge_block_generator(&self, accounts: &dyn AccountStore) -> StoreOp {
        let address = accounts.generate_address(&self.block.generator_public_key);
        let (produced, audit) = if self.backwards {
            (-1, RoundAudit::Pop(self.round))
        } else {
            (1, RoundAudit::Push(self.round))
        };
        StoreOp::MergeAccount {
            address,
            diff: AccountDiff {
                produced_blocks: produced,
                round_audit: audit,
                ..AccountDiff::default()
            },
        }
    }

    /// Forward settlement merges, index-ascending: every slot's delegate
    /// receives its reward plus an equal fee share, the last forger also
    /// absorbs whatever the per-slot shares leave undistributed, and each
    /// outsider's missed-blocks counter increments.
    fn settlement_merges(
        &self,
        accounts: &dyn AccountStore,
    ) -> Result<Vec<StoreOp>, RoundsError> {
        if self.round_rewards.len() != self.round_delegates.len() {
            return Err(RoundsError::Invariant(format!(
                "round {}: {} rewards for {} delegates",
                self.round,
                self.round_rewards.len(),
                self.round_delegates.len()
            )));
        }

        let (per_fee, _) = math::split_fees(self.round_fees, self.active_delegates)
            .ok_or(RoundsError::Arithmetic("fee split"))?;
        // The remainder is everything the per-slot shares do not cover.
        // Equal to `round_fees mod N` for a full round; round 1 sums one
        // slot fewer because genesis settles at its own tick.
        let slots = i64::try_from(self.round_delegates.len())
            .map_err(|_| RoundsError::Arithmetic("slot count"))?;
        let remainder = self
            .round_fees
            .checked_sub(
                per_fee
                    .checked_mul(slots)
                    .ok_or(RoundsError::Arithmetic("fee distribution"))?,
            )
            .ok_or(RoundsError::Arithmetic("fee remainder"))?;

        let mut ops = Vec::with_capacity(self.round_delegates.len() + self.round_outsiders.len());
        let last_index = self.round_delegates.len().checked_sub(1);
        for (index, public_key) in self.round_delegates.iter().enumerate() {
            let mut fee_share = per_fee;
            if Some(index) == last_index {
                fee_share = fee_share
                    .checked_add(remainder)
                    .ok_or(RoundsError::Arithmetic("fee remainder"))?;
            }
            let reward = self.round_rewards[index];
            let income = fee_share
                .checked_add(reward)
                .ok_or(RoundsError::Arithmetic("delegate income"))?;

            ops.push(StoreOp::MergeAccount {
                address: accounts.generate_address(public_key),
                diff: AccountDiff {
                    balance: income,
                    u_balance: income,
                    fees: fee_share,
                    rewards: reward,
                    ..AccountDiff::default()
                },
            });
        }

        for outsider in &self.round_outsiders {
            ops.push(StoreOp::MergeAccount {
                address: outsider.clone(),
                diff: AccountDiff {
                    missed_blocks: 1,
                    ..AccountDiff::default()
                },
            });
        }
        Ok(ops)
    }

    /// Round-end settlement: the merges, then the vote recomputation that
    /// re-ranks the delegate table on the settled balances.
    fn apply(&self, accounts: &dyn AccountStore) -> Result<Vec<StoreOp>, RoundsError> {
        let mut ops = self.settlement_merges(accounts)?;
        ops.push(StoreOp::RecalcVotes { round: self.round });
        Ok(ops)
    }

    /// Exact reversal of [`Self::apply`]: every merge negated, in reverse
    /// order, so outsiders decrement first and delegates un-settle in
    /// descending index order. The vote recomputation runs last, against
    /// the restored balances, which reproduces the pre-round values.
    fn undo(&self, accounts: &dyn AccountStore) -> Result<Vec<StoreOp>, RoundsError> {
        let forward = self.settlement_merges(accounts)?;
        let mut ops = Vec::with_capacity(forward.len() + 1);
        for op in forward.into_iter().rev() {
            match op {
                StoreOp::MergeAccount { address, diff } => {
                    let diff = diff
                        .negated()
                        .ok_or(RoundsError::Arithmetic("settlement negation"))?;
                    ops.push(StoreOp::MergeAccount { address, diff });
                }
                other => {
                    return Err(RoundsError::Invariant(format!(
                        "unexpected op in settlement reversal: {other:?}"
                    )))
                }
            }
        }
        ops.push(StoreOp::RecalcVotes { round: self.round });
        Ok(ops)
    }

    fn mark_block_id(&self) -> StoreOp {
        StoreOp::MarkBlockId {
            height: self.block.height,
            id: self.mark_id,
        }
    }

    /// Snapshot rebuilds cut the chain at the snapshot round's boundary,
    /// atomically with the settlement that closed it.
    fn truncate_blocks(&self) -> Option<StoreOp> {
        let snapshot = self.snapshot_round?;
        if self.backwards || !self.finish_round || snapshot != self.round {
            return None;
        }
        Some(StoreOp::TruncateBlocks {
            from_height: math::last_in_round(self.round, self.active_delegates) + 1,
        })
    }
}
