//! Milestone-based block reward schedule.
//!
//! Rewards start after an activation offset and step down through a list of
//! milestones, one step every `distance` blocks. Block producers stamp the
//! scheduled reward into each block they forge; the round engine only ever
//! reads the stamped value back out of the block store.

use crate::amount::Satoshi;
use crate::block::Height;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardSchedule {
    /// Reward per block at each milestone, highest first.
    pub milestones: Vec<Satoshi>,
    /// Height of the first rewarded block.
    pub offset: Height,
    /// Number of blocks between milestone steps.
    pub distance: u64,
}

impl Default for RewardSchedule {
    fn default() -> Self {
        Self {
            milestones: vec![
                Satoshi(500_000_000),
                Satoshi(400_000_000),
                Satoshi(300_000_000),
                Satoshi(200_000_000),
                Satoshi(100_000_000),
            ],
            offset: 2_160,
            distance: 3_000_000,
        }
    }
}

impl RewardSchedule {
    /// Index of the milestone in effect at the given height.
    pub fn milestone_at(&self, height: Height) -> usize {
        if height < self.offset || self.distance == 0 {
            return 0;
        }
        let steps = ((height - self.offset) / self.distance) as usize;
        steps.min(self.milestones.len().saturating_sub(1))
    }

    /// Scheduled reward for a block at the given height.
    pub fn reward_at(&self, height: Height) -> Satoshi {
        if height < self.offset || self.milestones.is_empty() {
            return Satoshi::ZERO;
        }
        self.milestones[self.milestone_at(height)]
    }

    /// Total rewards emitted for heights `1..=height`.
    ///
    /// Returns `None` on accumulator overflow.
    pub fn supply_at(&self, height: Height) -> Option<Satoshi> {
        if height < self.offset || self.milestones.is_empty() || self.distance == 0 {
            return Some(Satoshi::ZERO);
        }

        let mut total = Satoshi::ZERO;
        let mut step_start = self.offset;
        for (index, milestone) in self.milestones.iter().enumerate() {
            let last_of_step = if index + 1 == self.milestones.len() {
                // Final milestone runs forever.
                height
            } else {
                (step_start + self.distance - 1).min(height)
            };
            if step_start > height {
                break;
            }
            let blocks = last_of_step - step_start + 1;
            let emitted = milestone.checked_mul(i64::try_from(blocks).ok()?)?;
            total = total.checked_add(emitted)?;
            step_start = last_of_step + 1;
        }
        Some(total)
    }
}
