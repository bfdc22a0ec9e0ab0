use pinset_consensus::RaftConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// On-disk configuration of one pinset node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinsetNodeConfig {
    pub identity: NodeConfigIdentity,
    pub storage: NodeConfigStorage,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub cluster: NodeConfigCluster,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfigIdentity {
    /// Inline key, hex or unpadded base64url. Wins over `secret_key_file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfigStorage {
    /// Directory holding the replicated log. Relative to the config file.
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfigCluster {
    /// Founding members bootstrap the initial membership from `peers`.
    /// Joining nodes leave this off and wait to be added.
    #[serde(default)]
    pub bootstrap: bool,
    /// Other replicas by name, valued by endpoint id.
    #[serde(default)]
    pub peers: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: PinsetNodeConfig = toml::from_str(
            r#"
            [identity]
            secret_key_file = "local.key"

            [storage]
            path = "data"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.identity.secret_key_file.as_deref(),
            Some("local.key")
        );
        assert_eq!(config.raft, RaftConfig::default());
        assert!(!config.cluster.bootstrap);
        assert!(config.cluster.peers.is_empty());
    }

    #[test]
    fn test_parse_cluster_and_raft_overrides() {
        let config: PinsetNodeConfig = toml::from_str(
            r#"
            [identity]
            secret_key = "00"

            [storage]
            path = "/var/lib/pinset"

            [raft]
            heartbeat_interval_ms = 50

            [cluster]
            bootstrap = true
            peers = { b = "bbbb", c = "cccc" }
            "#,
        )
        .unwrap();
        assert_eq!(config.raft.heartbeat_interval_ms, 50);
        assert_eq!(
            config.raft.election_timeout_min_ms,
            RaftConfig::default().election_timeout_min_ms
        );
        assert!(config.cluster.bootstrap);
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.cluster.peers["b"], "bbbb");
    }
}
