//! Round engine orchestration.
//!
//! The block pipeline calls [`RoundEngine::tick`] after persisting each
//! block and [`RoundEngine::backward_tick`] while rolling back. The engine
//! detects round boundaries, sums the finished round, computes outsiders,
//! and queues the resulting typed ops into the caller's batch. It holds no
//! round state of its own; everything it needs is re-read from the stores,
//! which is what makes ticks replayable and reversible.

use crate::config::RoundsConfig;
use crate::events::{EventBus, RoundEvent};
use crate::math;
use crate::ops::RoundContext;
use crate::slate::DelegatesProvider;
use crate::state::AppState;
use crate::RoundsError;
use karst_storage::{AccountStore, BlockStore, RoundSummary, StoreBatch};
use karst_types::{Block, Height, PublicKey, RoundId, Satoshi};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct RoundEngine {
    config: RoundsConfig,
    accounts: Arc<dyn AccountStore>,
    blocks: Arc<dyn BlockStore>,
    delegates: Arc<dyn DelegatesProvider>,
    state: Arc<AppState>,
    events: EventBus,
}

/// Clears `rounds.is_ticking` on every exit path, error unwinds included.
struct TickGuard<'a> {
    state: &'a AppState,
}

impl<'a> TickGuard<'a> {
    fn acquire(state: &'a AppState) -> Result<Self, RoundsError> {
        if !state.begin_tick() {
            return Err(RoundsError::TickInProgress);
        }
        Ok(Self { state })
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.state.end_tick();
    }
}

impl RoundEngine {
    pub fn new(
        config: RoundsConfig,
        accounts: Arc<dyn AccountStore>,
        blocks: Arc<dyn BlockStore>,
        delegates: Arc<dyn DelegatesProvider>,
        state: Arc<AppState>,
        events: EventBus,
    ) -> Result<Self, RoundsError> {
        config.validate()?;
        Ok(Self {
            config,
            accounts,
            blocks,
            delegates,
            state,
            events,
        })
    }

    pub fn app_state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Apply the round-level effects of a freshly persisted block.
    ///
    /// Ops are queued into `batch` in emission order; the caller commits the
    /// batch (or drops it, in which case the tick had no durable effect).
    pub fn tick(&self, block: &Block, batch: &mut StoreBatch) -> Result<(), RoundsError> {
        let _guard = TickGuard::acquire(&self.state)?;
        let result = self.run(block, block.id, false, batch);
        if let Err(err) = &result {
            error!(target: "rounds", height = block.height, %err, "tick failed");
        }
        result
    }

    /// Revert the round-level effects of `block`; `previous` is its parent.
    /// After the batch commits, persisted delegate state equals the state at
    /// `previous.height`.
    pub fn backward_tick(
        &self,
        block: &Block,
        previous: &Block,
        batch: &mut StoreBatch,
    ) -> Result<(), RoundsError> {
        self.events.emit(RoundEvent::BackwardTick {
            height: block.height,
            id: block.id,
        });
        if previous.height + 1 != block.height {
            return Err(RoundsError::Invariant(format!(
                "backward tick of height {} against previous height {}",
                block.height, previous.height
            )));
        }

        let _guard = TickGuard::acquire(&self.state)?;
        let result = self.run(block, previous.id, true, batch);
        if let Err(err) = &result {
            error!(target: "rounds", height = block.height, %err, "backward tick failed");
        }
        result
    }

    fn run(
        &self,
        block: &Block,
        mark_id: [u8; 32],
        backwards: bool,
        batch: &mut StoreBatch,
    ) -> Result<(), RoundsError> {
        let n = self.config.active_delegates;
        let round = math::round_of(block.height, n);
        let finish_round = math::is_round_end(block.height, n);
        debug!(
            target: "rounds",
            height = block.height,
            round,
            finish_round,
            backwards,
            "processing tick"
        );

        let (summary, outsiders) = if finish_round {
            let summary = self.round_summary(round, block)?;
            let outsiders = self.round_outsiders(block.height, &summary)?;
            (summary, outsiders)
        } else {
            (RoundSummary::empty(), Vec::new())
        };

        let context = RoundContext {
            round,
            backwards,
            finish_round,
            dpos_v2: block.height >= self.config.dposv2_first_block,
            block,
            mark_id,
            round_fees: summary.fees,
            round_rewards: summary.rewards,
            round_delegates: summary.delegates,
            round_outsiders: outsiders,
            active_delegates: n,
            snapshot_round: self.state.snapshot_round(),
        };

        for op in context.ops(self.accounts.as_ref())? {
            batch.push(op);
        }

        if finish_round && !backwards {
            info!(
                target: "rounds",
                round,
                fees = %context.round_fees,
                slots = context.round_delegates.len(),
                outsiders = context.round_outsiders.len(),
                "round finished"
            );
            self.events.emit(RoundEvent::FinishRound { round });
        }
        Ok(())
    }

    fn round_summary(
        &self,
        round: RoundId,
        block: &Block,
    ) -> Result<RoundSummary, RoundsError> {
        let mut summary = self.blocks.sum_round(self.config.active_delegates, round)?;
        // The genesis block settles alone; a lineage whose store reports
        // anything else at height 1 gets the canonical correction.
        if block.height == 1 && summary.delegates.len() != 1 {
            summary = RoundSummary {
                fees: Satoshi::ZERO,
                rewards: vec![Satoshi::ZERO],
                delegates: vec![block.generator_public_key],
            };
        }
        Ok(summary)
    }

    /// Slate members that forged nothing this round, as addresses.
    fn round_outsiders(
        &self,
        height: Height,
        summary: &RoundSummary,
    ) -> Result<Vec<String>, RoundsError> {
        if height == 1 {
            // Nobody can have missed a slot at genesis.
            return Ok(Vec::new());
        }
        let expected = self.delegates.generate_delegate_list(height)?;
        let mut forged: HashSet<PublicKey> = summary.delegates.iter().copied().collect();
        if math::round_of(height, self.config.active_delegates) == 1 {
            // The genesis block is excluded from the round sums, but its
            // generator did forge a round-1 slot.
            if let Some(genesis) = self.blocks.find_by_height(1)? {
                forged.insert(genesis.generator_public_key);
            }
        }
        Ok(expected
            .iter()
            .filter(|public_key| !forged.contains(*public_key))
            .map(|public_key| self.accounts.generate_address(public_key))
            .collect())
    }

    /// Pipeline bootstrap hook: rounds are replayable from here on.
    pub fn on_blockchain_ready(&self) {
        self.state.set_loaded(true);
    }

    /// Publishes the `rounds/change` notification for real-time consumers.
    pub fn on_finish_round(&self, round: RoundId) {
        self.events.emit(RoundEvent::RoundChanged { number: round });
    }

    pub fn cleanup(&self) {
        self.state.set_loaded(false);
    }
}
