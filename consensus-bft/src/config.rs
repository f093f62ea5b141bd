//! Consensus timing and tuning parameters.
//!
//! All step timeouts are in milliseconds and escalate linearly with the
//! round number (`base + delta * round`) so that partitioned rounds back
//! off instead of spinning.

use {std::time::Duration, thiserror::Error};

/// Configuration for the consensus core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base timeout for the propose step. Default: 3000.
    pub propose_timeout_ms: u64,
    /// Additional propose timeout per round. Default: 500.
    pub propose_timeout_delta_ms: u64,

    /// Base timeout for the prevote-wait step. Default: 1000.
    pub prevote_timeout_ms: u64,
    /// Additional prevote-wait timeout per round. Default: 500.
    pub prevote_timeout_delta_ms: u64,

    /// Base timeout for the precommit-wait step. Default: 1000.
    pub precommit_timeout_ms: u64,
    /// Additional precommit-wait timeout per round. Default: 500.
    pub precommit_timeout_delta_ms: u64,

    /// Gap between deciding a commit and starting round 0 of the next
    /// height, giving the host time to gather work. Default: 1000.
    pub commit_timeout_ms: u64,

    /// Skip the commit gap once every precommit of the closing round has
    /// arrived. Default: false.
    pub skip_timeout_commit: bool,

    /// How often to poll a neighbour for missing votes while in a fetch
    /// step. Default: 1000.
    pub fetch_interval_ms: u64,

    /// Capacity of the inbound message queue. Default: 1000.
    pub msg_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            propose_timeout_ms: 3_000,
            propose_timeout_delta_ms: 500,
            prevote_timeout_ms: 1_000,
            prevote_timeout_delta_ms: 500,
            precommit_timeout_ms: 1_000,
            precommit_timeout_delta_ms: 500,
            commit_timeout_ms: 1_000,
            skip_timeout_commit: false,
            fetch_interval_ms: 1_000,
            msg_queue_size: 1_000,
        }
    }
}

impl Config {
    /// How long to wait for a proposal in `round`.
    pub fn propose(&self, round: u32) -> Duration {
        Duration::from_millis(self.propose_timeout_ms + self.propose_timeout_delta_ms * round as u64)
    }

    /// How long to wait for the remaining prevotes in `round` after
    /// seeing +2/3 of any.
    pub fn prevote(&self, round: u32) -> Duration {
        Duration::from_millis(self.prevote_timeout_ms + self.prevote_timeout_delta_ms * round as u64)
    }

    /// How long to wait for the remaining precommits in `round` after
    /// seeing +2/3 of any.
    pub fn precommit(&self, round: u32) -> Duration {
        Duration::from_millis(
            self.precommit_timeout_ms + self.precommit_timeout_delta_ms * round as u64,
        )
    }

    /// Earliest start time (Unix milliseconds) of the next height's
    /// round 0 given the commit decision time.
    pub fn commit(&self, commit_time_ms: i64) -> i64 {
        commit_time_ms + self.commit_timeout_ms as i64
    }

    /// Polling interval of the vote-fetch loop.
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.propose_timeout_ms == 0 {
            return Err(ConfigError::InvalidProposeTimeout);
        }
        if self.fetch_interval_ms == 0 {
            return Err(ConfigError::InvalidFetchInterval);
        }
        if self.msg_queue_size == 0 {
            return Err(ConfigError::InvalidQueueSize);
        }
        Ok(())
    }

    /// A config suitable for local testing: short timeouts, commit gap
    /// skipping enabled.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            propose_timeout_ms: 500,
            propose_timeout_delta_ms: 150,
            prevote_timeout_ms: 150,
            prevote_timeout_delta_ms: 50,
            precommit_timeout_ms: 150,
            precommit_timeout_delta_ms: 50,
            commit_timeout_ms: 300,
            skip_timeout_commit: true,
            fetch_interval_ms: 100,
            msg_queue_size: 1_000,
        }
    }
}

/// Errors in consensus configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("propose_timeout_ms must be > 0")]
    InvalidProposeTimeout,
    #[error("fetch_interval_ms must be > 0")]
    InvalidFetchInterval,
    #[error("msg_queue_size must be > 0")]
    InvalidQueueSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.propose_timeout_ms, 3_000);
        assert_eq!(config.prevote_timeout_ms, 1_000);
        assert_eq!(config.precommit_timeout_ms, 1_000);
        assert!(!config.skip_timeout_commit);
    }

    #[test]
    fn test_timeouts_escalate_with_round() {
        let config = Config::default();
        assert_eq!(config.propose(0), Duration::from_millis(3_000));
        assert_eq!(config.propose(1), Duration::from_millis(3_500));
        assert_eq!(config.propose(4), Duration::from_millis(5_000));
        assert!(config.prevote(2) > config.prevote(0));
        assert!(config.precommit(3) > config.precommit(1));
    }

    #[test]
    fn test_commit_offsets_start_time() {
        let config = Config::default();
        assert_eq!(config.commit(10_000), 11_000);
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = Config::default();
        config.propose_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProposeTimeout)
        ));

        let mut config = Config::default();
        config.fetch_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFetchInterval)
        ));

        let mut config = Config::default();
        config.msg_queue_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidQueueSize)));
    }

    #[test]
    fn test_dev_default_skips_commit_gap() {
        let config = Config::dev_default();
        assert!(config.skip_timeout_commit);
        assert!(config.validate().is_ok());
    }
}
