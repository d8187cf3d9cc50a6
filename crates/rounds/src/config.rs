use crate::RoundsError;
use karst_types::{Height, RewardSchedule};
use serde::{Deserialize, Serialize};

/// Round engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundsConfig {
    /// Number of active delegates per round (N).
    pub active_delegates: u64,
    /// Height at and after which v2 slate selection applies.
    pub dposv2_first_block: Height,
    /// Per-height reward schedule. Block producers stamp the scheduled
    /// reward into each block; the engine reads it back via the block store.
    pub rewards: RewardSchedule,
}

impl Default for RoundsConfig {
    fn default() -> Self {
        Self {
            active_delegates: 101,
            // Mainnet launches on v1; the fork height is set by governance.
            dposv2_first_block: Height::MAX,
            rewards: RewardSchedule::default(),
        }
    }
}

impl RoundsConfig {
    pub fn validate(&self) -> Result<(), RoundsError> {
        if self.active_delegates == 0 {
            return Err(RoundsError::Invariant(
                "active_delegates must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RoundsConfig::default();
        assert_eq!(config.active_delegates, 101);
        config.validate().unwrap();
    }

    #[test]
    fn zero_delegates_rejected() {
        let config = RoundsConfig {
            active_delegates: 0,
            ..RoundsConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: RoundsConfig = serde_json::from_str(r#"{"active_delegates":5}"#).unwrap();
        assert_eq!(config.active_delegates, 5);
        assert_eq!(config.dposv2_first_block, Height::MAX);
    }
}
