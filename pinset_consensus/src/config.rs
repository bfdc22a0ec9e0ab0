use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("heartbeat interval ({heartbeat_ms}ms) must be below the minimum election timeout ({election_min_ms}ms)")]
    HeartbeatTooSlow {
        heartbeat_ms: u64,
        election_min_ms: u64,
    },
    #[error("election timeout range {min_ms}..{max_ms}ms is empty")]
    EmptyElectionRange { min_ms: u64, max_ms: u64 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("rejected by raft: {0}")]
    Rejected(String),
}

/// Largest snapshot sent in a single chunk. Snapshots are verified as a
/// whole, so they are not split.
const SNAPSHOT_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// Timing and compaction knobs of one replica.
///
/// All durations are whole milliseconds so the struct maps directly onto a
/// `[raft]` TOML table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RaftConfig {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Deadline of a single peer RPC.
    pub rpc_timeout_ms: u64,
    /// How long `submit` waits for commit and apply.
    pub submit_timeout_ms: u64,
    /// Applied entries between two automatic snapshots.
    pub snapshot_threshold: u64,
    pub max_entries_per_append: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 100,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 600,
            rpc_timeout_ms: 500,
            submit_timeout_ms: 5000,
            snapshot_threshold: 1000,
            max_entries_per_append: 256,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
            ("submit_timeout_ms", self.submit_timeout_ms),
            ("snapshot_threshold", self.snapshot_threshold),
            ("max_entries_per_append", self.max_entries_per_append),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(ConfigError::EmptyElectionRange {
                min_ms: self.election_timeout_min_ms,
                max_ms: self.election_timeout_max_ms,
            });
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat_ms: self.heartbeat_interval_ms,
                election_min_ms: self.election_timeout_min_ms,
            });
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    /// The openraft configuration these settings describe. Logs are purged
    /// as soon as a snapshot covers them.
    pub fn to_openraft(&self) -> Result<openraft::Config, ConfigError> {
        self.validate()?;
        let config = openraft::Config {
            cluster_name: "pinset".to_string(),
            heartbeat_interval: self.heartbeat_interval_ms,
            election_timeout_min: self.election_timeout_min_ms,
            election_timeout_max: self.election_timeout_max_ms,
            install_snapshot_timeout: self.rpc_timeout_ms,
            max_payload_entries: self.max_entries_per_append,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            snapshot_max_chunk_size: SNAPSHOT_CHUNK_SIZE,
            max_in_snapshot_log_to_keep: 0,
            ..Default::default()
        };
        config
            .validate()
            .map_err(|e| ConfigError::Rejected(e.to_string()))
    }
}
