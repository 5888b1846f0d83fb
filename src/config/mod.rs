//! Configuration module for Shoal.

use crate::error::{Result, ShoalError};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a Shoal master node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Raft consensus configuration.
    pub raft: RaftSettings,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Replication and repair tuning.
    pub replication: ReplicationConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl MasterConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ShoalError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ShoalError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(ShoalError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "Node ID must be non-zero".to_string(),
            });
        }

        if self.replication.replica_num == 0 {
            return Err(ShoalError::InvalidConfig {
                field: "replication.replica_num".to_string(),
                reason: "Replication factor must be non-zero".to_string(),
            });
        }

        if self.replication.chunk_size == 0 {
            return Err(ShoalError::InvalidConfig {
                field: "replication.chunk_size".to_string(),
                reason: "Chunk size must be non-zero".to_string(),
            });
        }

        if self.replication.dead_chunk_copy_threshold == 0 {
            return Err(ShoalError::InvalidConfig {
                field: "replication.dead_chunk_copy_threshold".to_string(),
                reason: "Repair batch size must be non-zero".to_string(),
            });
        }

        if self.replication.chunk_waiting_time == 0 {
            return Err(ShoalError::InvalidConfig {
                field: "replication.chunk_waiting_time".to_string(),
                reason: "Waiting multiplier must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                name: "dev-master".to_string(),
            },
            raft: RaftSettings {
                bind_addr: "127.0.0.1:9400".parse().expect("valid socket address"),
                peers: HashMap::new(),
                ..RaftSettings::default()
            },
            storage: StorageConfig {
                metadata_dir: PathBuf::from("/tmp/shoal/metadata"),
            },
            replication: ReplicationConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique master node identifier.
    pub id: NodeId,
    /// Human-readable node name.
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: "shoal-master".to_string(),
        }
    }
}

/// Raft consensus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftSettings {
    /// Address to bind the raft transport.
    pub bind_addr: SocketAddr,
    /// Peer master node addresses, keyed by node id.
    pub peers: HashMap<NodeId, String>,
    /// Minimum election timeout.
    #[serde(with = "humantime_serde")]
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    #[serde(with = "humantime_serde")]
    pub election_timeout_max: Duration,
    /// Leader heartbeat interval.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Log entries applied before a snapshot is taken.
    pub snapshot_threshold: usize,
    /// Deadline for a submitted command to be applied.
    #[serde(with = "humantime_serde")]
    pub apply_timeout: Duration,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9400".parse().expect("valid socket address"),
            peers: HashMap::new(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            snapshot_threshold: 10000,
            apply_timeout: Duration::from_secs(5),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for raft state and snapshots.
    pub metadata_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            metadata_dir: PathBuf::from("/var/lib/shoal/metadata"),
        }
    }
}

/// Replication and repair tuning.
///
/// These are the recognized knobs of the liveness ladder and the repair
/// loop. Times are wall-clock durations; `chunk_waiting_time` is a bare
/// multiplier applied to `chunk_heartbeat_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Target replication factor per chunk.
    pub replica_num: usize,
    /// Byte size of one chunk (the file-to-chunks split unit).
    pub chunk_size: u64,
    /// Expected interval between data-node heartbeats.
    #[serde(with = "humantime_serde")]
    pub chunk_heartbeat_time: Duration,
    /// Alive -> Waiting after this many missed heartbeat intervals.
    pub chunk_waiting_time: u32,
    /// Waiting -> Dead once silent for this long.
    #[serde(with = "humantime_serde")]
    pub chunk_die_time: Duration,
    /// Liveness scan period.
    #[serde(with = "humantime_serde")]
    pub master_check_time: Duration,
    /// Repair loop scan period.
    #[serde(with = "humantime_serde")]
    pub dead_chunk_check_time: Duration,
    /// Max repair batch size; also the early-wake queue threshold.
    pub dead_chunk_copy_threshold: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_num: 3,
            chunk_size: 64 * 1024 * 1024, // 64MB
            chunk_heartbeat_time: Duration::from_secs(10),
            chunk_waiting_time: 3,
            chunk_die_time: Duration::from_secs(600),
            master_check_time: Duration::from_secs(60),
            dead_chunk_check_time: Duration::from_secs(30),
            dead_chunk_copy_threshold: 64,
        }
    }
}

impl ReplicationConfig {
    /// Silence threshold for the Alive -> Waiting demotion.
    pub fn waiting_threshold(&self) -> Duration {
        self.chunk_heartbeat_time * self.chunk_waiting_time
    }

    /// Number of chunks a file of `size` bytes splits into.
    pub fn chunk_count(&self, size: u64) -> u32 {
        size.div_ceil(self.chunk_size) as u32
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: "0.0.0.0:9409".parse().expect("valid socket address"),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MasterConfig::default();
        assert_eq!(config.node.id, 1);
        assert_eq!(config.replication.replica_num, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_waiting_threshold() {
        let config = ReplicationConfig {
            chunk_heartbeat_time: Duration::from_secs(10),
            chunk_waiting_time: 3,
            ..Default::default()
        };
        assert_eq!(config.waiting_threshold(), Duration::from_secs(30));
    }

    #[test]
    fn test_chunk_count_rounds_up() {
        let config = ReplicationConfig {
            chunk_size: 64 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(config.chunk_count(0), 0);
        assert_eq!(config.chunk_count(1), 1);
        assert_eq!(config.chunk_count(64 * 1024 * 1024), 1);
        assert_eq!(config.chunk_count(100 * 1024 * 1024), 2);
    }

    #[test]
    fn test_validate_rejects_zero_replicas() {
        let mut config = MasterConfig::default();
        config.replication.replica_num = 0;
        assert!(config.validate().is_err());
    }
}
