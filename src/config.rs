//! Node configuration, loaded from environment variables.
//!
//! Follows the same `env_required`/`env_parse_or`/`env_bool` shape the
//! teacher's load-test config used, adapted to the fields a cluster node
//! needs: data/raft directories, advertise addresses, the cluster secret,
//! an optional master key, and the two encoding/bootstrap toggles the FSM
//! and Raft manager consult at startup.

use std::env;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Node-level configuration for `skorekeeperd`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Human-friendly node label used in log context before the identity
    /// key (and therefore the real `nodeId`) is materialized.
    pub node_label: String,
    pub data_dir: PathBuf,
    pub raft_dir: PathBuf,
    /// Address this node's Raft + cluster API binds to.
    pub raft_bind_addr: String,
    /// Address advertised to peers (defaults to `raft_bind_addr`).
    pub raft_advertise_addr: Option<String>,
    /// Address the app HTTP surface binds to.
    pub http_bind_addr: String,
    /// Address the Prometheus `/metrics` surface binds to.
    pub metrics_bind_addr: String,
    /// Shared secret required on `X-Raft-Secret` for inter-node calls.
    pub cluster_secret: String,
    /// Optional master key (hex) used to encrypt the node's private key
    /// and the key ring's data keys at rest.
    pub master_key_hex: Option<String>,
    /// Whether this node bootstraps a brand-new single-node cluster.
    pub bootstrap: bool,
    /// Static peer list (`nodeId@addr`) used for bring-up; empty for a
    /// node that will instead be `Join`ed by an existing leader.
    pub seed_peers: Vec<String>,
    /// Selects the binary (bincode) log codec instead of JSON (Design
    /// Note: "Two encodings").
    pub use_gob: bool,
    /// Number of old snapshots retained before the inner snapshot store's
    /// own GC kicks in.
    pub snapshot_retain: usize,
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_label = env_or("NODE_ID", "unnamed-node");
        let data_dir = PathBuf::from(env_or("DATA_DIR", "./data"));
        let raft_dir = PathBuf::from(env_or("RAFT_DIR", "./raft"));
        let raft_bind_addr = env_or("RAFT_BIND_ADDR", "0.0.0.0:7420");
        let raft_advertise_addr = env::var("RAFT_ADVERTISE_ADDR").ok();
        let http_bind_addr = env_or("HTTP_BIND_ADDR", "0.0.0.0:8080");
        let metrics_bind_addr = env_or("METRICS_BIND_ADDR", "0.0.0.0:9090");
        let cluster_secret = env_required("CLUSTER_SECRET")?;
        let master_key_hex = env::var("MASTER_KEY_HEX").ok();
        let bootstrap = env_bool("RAFT_BOOTSTRAP", false);
        let seed_peers = env::var("SEED_PEERS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        let use_gob = env_bool("USE_GOB", false);
        let snapshot_retain: usize = env_parse_or("SNAPSHOT_RETAIN", 3usize)?;

        Ok(Self {
            node_label,
            data_dir,
            raft_dir,
            raft_bind_addr,
            raft_advertise_addr,
            http_bind_addr,
            metrics_bind_addr,
            cluster_secret,
            master_key_hex,
            bootstrap,
            seed_peers,
            use_gob,
            snapshot_retain,
        })
    }

    pub fn raft_advertise(&self) -> String {
        self.raft_advertise_addr
            .clone()
            .unwrap_or_else(|| self.raft_bind_addr.clone())
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            node_label: "test-node".into(),
            data_dir: PathBuf::from("/tmp/skorekeeper-test/data"),
            raft_dir: PathBuf::from("/tmp/skorekeeper-test/raft"),
            raft_bind_addr: "127.0.0.1:0".into(),
            raft_advertise_addr: None,
            http_bind_addr: "127.0.0.1:0".into(),
            metrics_bind_addr: "127.0.0.1:0".into(),
            cluster_secret: "test-secret".into(),
            master_key_hex: None,
            bootstrap: true,
            seed_peers: vec![],
            use_gob: false,
            snapshot_retain: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertise_defaults_to_bind_addr() {
        let c = Config::for_testing();
        assert_eq!(c.raft_advertise(), c.raft_bind_addr);
    }

    #[test]
    fn advertise_override_wins() {
        let mut c = Config::for_testing();
        c.raft_advertise_addr = Some("10.0.0.1:7420".into());
        assert_eq!(c.raft_advertise(), "10.0.0.1:7420");
    }

    #[test]
    fn seed_peers_parses_csv() {
        let peers_str = "a@10.0.0.1:7420, b@10.0.0.2:7420";
        let peers: Vec<String> = peers_str
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        assert_eq!(peers.len(), 2);
    }
}
