//! Raft configuration

use rand::Rng;
use std::time::Duration;

/// Configuration for a Raft node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Minimum election timeout
    ///
    /// This is the minimum time a follower waits before starting an election.
    /// The actual timeout is randomized between min and max to avoid split votes.
    pub election_timeout_min: Duration,

    /// Maximum election timeout
    pub election_timeout_max: Duration,

    /// Heartbeat interval (how often a leader sends AppendEntries)
    ///
    /// Must be strictly smaller than the minimum election timeout, or
    /// followers time out and re-elect under a healthy leader.
    pub heartbeat_interval: Duration,

    /// Per-RPC timeout; an expired RPC is a soft failure retried on the
    /// next periodic cycle
    pub rpc_timeout: Duration,

    /// Maximum number of entries to send in a single AppendEntries RPC
    pub max_append_entries: usize,

    /// Snapshot threshold - snapshot once this many entries have been
    /// applied since the last snapshot
    ///
    /// Set to 0 to disable automatic snapshotting
    pub snapshot_threshold: u64,

    /// Number of entries to keep behind the snapshot for cheap follower
    /// catch-up
    pub snapshot_trailing: u64,

    /// Seed for the node's RNG (election jitter)
    ///
    /// `None` seeds from entropy; tests set this for reproducible runs.
    pub seed: Option<u64>,
}

impl RaftConfig {
    /// Draw a randomized election timeout in `[min, max)`.
    pub fn random_election_timeout<R: Rng>(&self, rng: &mut R) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rng.gen_range(min..max))
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            // Election timeout between 150-300ms (Raft paper recommendation)
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),

            // Heartbeat every 50ms (well below election timeout minimum)
            heartbeat_interval: Duration::from_millis(50),

            rpc_timeout: Duration::from_millis(50),

            // Send up to 100 entries per RPC
            max_append_entries: 100,

            // Snapshot after 10k applied entries
            snapshot_threshold: 10_000,

            // Keep 1k entries behind the snapshot
            snapshot_trailing: 1_000,

            seed: None,
        }
    }
}

/// Builder for RaftConfig
pub struct RaftConfigBuilder {
    config: RaftConfig,
}

impl RaftConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RaftConfig::default(),
        }
    }

    pub fn election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.config.election_timeout_min = min;
        self.config.election_timeout_max = max;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    pub fn max_append_entries(mut self, max: usize) -> Self {
        self.config.max_append_entries = max;
        self
    }

    pub fn snapshot_threshold(mut self, threshold: u64) -> Self {
        self.config.snapshot_threshold = threshold;
        self
    }

    pub fn snapshot_trailing(mut self, trailing: u64) -> Self {
        self.config.snapshot_trailing = trailing;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn build(self) -> RaftConfig {
        assert!(
            self.config.election_timeout_min < self.config.election_timeout_max,
            "election_timeout_min must be less than election_timeout_max"
        );
        assert!(
            self.config.heartbeat_interval < self.config.election_timeout_min,
            "heartbeat_interval must be less than election_timeout_min"
        );
        assert!(
            self.config.max_append_entries > 0,
            "max_append_entries must be greater than 0"
        );

        self.config
    }
}

impl Default for RaftConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_config_is_valid() {
        let config = RaftConfig::default();
        assert!(config.heartbeat_interval < config.election_timeout_min);
        assert!(config.election_timeout_min < config.election_timeout_max);
    }

    #[test]
    fn builder_overrides() {
        let config = RaftConfigBuilder::new()
            .election_timeout(Duration::from_millis(200), Duration::from_millis(400))
            .heartbeat_interval(Duration::from_millis(100))
            .max_append_entries(50)
            .snapshot_threshold(64)
            .seed(7)
            .build();

        assert_eq!(config.election_timeout_min, Duration::from_millis(200));
        assert_eq!(config.max_append_entries, 50);
        assert_eq!(config.snapshot_threshold, 64);
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    #[should_panic(expected = "heartbeat_interval must be less than election_timeout_min")]
    fn invalid_heartbeat_rejected() {
        RaftConfigBuilder::new()
            .election_timeout(Duration::from_millis(100), Duration::from_millis(200))
            .heartbeat_interval(Duration::from_millis(150))
            .build();
    }

    #[test]
    fn randomized_timeout_stays_in_range() {
        let config = RaftConfig::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let timeout = config.random_election_timeout(&mut rng);
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout < config.election_timeout_max);
        }
    }
}
