//! Operator settings
//!
//! Static environment for one replica (directories, identity, seam paths) is
//! read once at startup from the environment. Mutable pooler options arrive
//! later as `ConfigChanged` event payloads and are never read from the
//! environment.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default pooler listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 6432;

/// Environment-derived, immutable per-replica settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the canonical config, per-instance subdirectories
    /// and the credential file.
    pub data_dir: PathBuf,
    /// Root of the per-instance log directories.
    pub log_dir: PathBuf,
    /// This replica's unit name within the peer group.
    pub unit_name: String,
    /// Host under which downstream consumers reach this pooler.
    pub external_host: String,
    /// The pooler application name (used for the monitoring user).
    pub app_name: String,
    /// Shared peer-state document path.
    pub peer_state_path: PathBuf,
    /// File naming the elected leader unit.
    pub leader_file: PathBuf,
    /// Control binary of the service-supervision daemon.
    pub supervisor_ctl: PathBuf,
    /// Unix socket on which lifecycle events are delivered.
    pub control_socket: PathBuf,
    /// Directory for downstream client-relation publications.
    pub client_relations_dir: PathBuf,
    /// Bind address of the health/metrics server.
    pub health_addr: SocketAddr,
    /// Number of pooler instances; `None` means one per detected CPU core.
    pub cores: Option<usize>,
}

impl Settings {
    /// Read settings from the environment, filling defaults for anything
    /// unset. `unit_name` falls back to the hostname.
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(var_or("PGB_OPERATOR_DATA_DIR", "/var/lib/pgbouncer"));
        let local_hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        let unit_name =
            env::var("PGB_OPERATOR_UNIT").unwrap_or_else(|_| local_hostname.clone());

        Self {
            external_host: var_or("PGB_OPERATOR_EXTERNAL_HOST", &local_hostname),
            log_dir: PathBuf::from(var_or("PGB_OPERATOR_LOG_DIR", "/var/log/pgbouncer")),
            unit_name,
            app_name: var_or("PGB_OPERATOR_APP", "pgbouncer"),
            peer_state_path: env::var("PGB_OPERATOR_PEER_STATE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("peer-state.json")),
            leader_file: env::var("PGB_OPERATOR_LEADER_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("leader")),
            supervisor_ctl: PathBuf::from(var_or("PGB_OPERATOR_SUPERVISOR_CTL", "svc-ctl")),
            control_socket: PathBuf::from(var_or(
                "PGB_OPERATOR_CONTROL_SOCKET",
                "/run/pgbouncer-operator.sock",
            )),
            client_relations_dir: env::var("PGB_OPERATOR_CLIENT_RELATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("relations")),
            health_addr: var_or("PGB_OPERATOR_HEALTH_ADDR", "0.0.0.0:8080")
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080))),
            cores: env::var("PGB_OPERATOR_CORES")
                .ok()
                .and_then(|v| v.parse().ok()),
            data_dir,
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Pooling mode applied to every pooler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    Session,
    Transaction,
    Statement,
}

impl PoolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolMode::Session => "session",
            PoolMode::Transaction => "transaction",
            PoolMode::Statement => "statement",
        }
    }
}

/// Operator-mutable pooler options, delivered as the `ConfigChanged` event
/// payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UserConfig {
    pub listen_port: u16,
    pub pool_mode: PoolMode,
    /// Upper bound on backend connections across the whole instance fleet;
    /// 0 means unlimited.
    pub max_db_connections: u32,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            pool_mode: PoolMode::Session,
            max_db_connections: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_config_defaults() {
        let config = UserConfig::default();
        assert_eq!(config.listen_port, 6432);
        assert_eq!(config.pool_mode, PoolMode::Session);
        assert_eq!(config.max_db_connections, 100);
    }

    #[test]
    fn test_user_config_deserializes_kebab_case() {
        let config: UserConfig = serde_json::from_str(
            r#"{"listen-port": 7432, "pool-mode": "transaction", "max-db-connections": 60}"#,
        )
        .unwrap();
        assert_eq!(config.listen_port, 7432);
        assert_eq!(config.pool_mode, PoolMode::Transaction);
        assert_eq!(config.max_db_connections, 60);
    }

    #[test]
    fn test_user_config_partial_payload_fills_defaults() {
        let config: UserConfig = serde_json::from_str(r#"{"pool-mode": "statement"}"#).unwrap();
        assert_eq!(config.listen_port, 6432);
        assert_eq!(config.pool_mode, PoolMode::Statement);
    }
}
