//! Block reward policies.

use rand::Rng;

/// Source of the block reward credited for a completed task. Called once
/// per task that finishes successfully.
pub trait RewardPolicy: Send + Sync {
    fn block_reward(&self) -> u64;
}

/// Uniformly random reward in `min..=max`.
#[derive(Debug, Clone)]
pub struct RandomBlockReward {
    min: u64,
    max: u64,
}

impl RandomBlockReward {
    pub fn new(min: u64, max: u64) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }
}

impl Default for RandomBlockReward {
    fn default() -> Self {
        Self::new(1, 100)
    }
}

impl RewardPolicy for RandomBlockReward {
    fn block_reward(&self) -> u64 {
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

/// Constant reward.
#[derive(Debug, Clone, Copy)]
pub struct FixedBlockReward(pub u64);

impl RewardPolicy for FixedBlockReward {
    fn block_reward(&self) -> u64 {
        self.0
    }
}
