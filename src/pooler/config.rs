//! Canonical pooler configuration
//!
//! Models the pgbouncer.ini document: a `[databases]` section mapping pool
//! names to connection parameters and a `[pgbouncer]` settings section, with
//! the `admin_users`/`stats_users` lists lifted into sets so membership
//! mutation cannot corrupt the comma-joined encoding. Exactly one canonical
//! copy is authoritative per replica group; per-instance copies are derived
//! views overriding only the instance-local path fields.
//!
//! Rendering is deterministic (fixed section order, sorted keys) so that
//! structural equality of two configs and textual equality of their rendered
//! forms coincide. That equivalence is what lets the store detect no-op
//! writes and skip fleet-wide restarts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pooler::instance::ServiceInstance;
use crate::settings::UserConfig;

/// Settings keys mutated outside this module.
pub mod keys {
    pub const AUTH_FILE: &str = "auth_file";
    pub const AUTH_QUERY: &str = "auth_query";
    pub const AUTH_USER: &str = "auth_user";
    pub const LISTEN_PORT: &str = "listen_port";
    pub const POOL_MODE: &str = "pool_mode";
}

const ADMIN_USERS_KEY: &str = "admin_users";
const STATS_USERS_KEY: &str = "stats_users";

/// Instance-local keys overridden in per-instance renders.
const INSTANCE_KEYS: [&str; 3] = ["unix_socket_dir", "logfile", "pidfile"];

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigParseError {
    #[error("line {0} outside of any section: {1:?}")]
    OrphanLine(usize, String),
    #[error("line {0} is not a key-value pair: {1:?}")]
    MalformedPair(usize, String),
    #[error("unknown section {0:?}")]
    UnknownSection(String),
}

/// The canonical pooler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolerConfig {
    /// `[databases]` section: pool name to connection-parameter string.
    pub databases: BTreeMap<String, String>,
    /// Users allowed on the pooler admin console.
    pub admin_users: BTreeSet<String>,
    /// Users allowed to run read-only console stats commands.
    pub stats_users: BTreeSet<String>,
    /// Remaining `[pgbouncer]` settings.
    pub settings: BTreeMap<String, String>,
}

impl PoolerConfig {
    /// A leader-synthesized default when neither local storage nor peer
    /// state holds a canonical config.
    pub fn default_config(user: &UserConfig, data_dir: &Path, log_dir: &Path) -> Self {
        let mut settings = BTreeMap::new();
        let dir = data_dir.display();
        settings.insert("listen_addr".into(), "*".into());
        settings.insert(keys::LISTEN_PORT.into(), user.listen_port.to_string());
        settings.insert("logfile".into(), format!("{}/pgbouncer.log", log_dir.display()));
        settings.insert("pidfile".into(), format!("{dir}/pgbouncer.pid"));
        settings.insert("auth_type".into(), "md5".into());
        settings.insert("user".into(), "postgres".into());
        settings.insert("max_client_conn".into(), "10000".into());
        settings.insert(
            "ignore_startup_parameters".into(),
            "extra_float_digits".into(),
        );
        settings.insert("server_tls_sslmode".into(), "prefer".into());
        // all instances share the listen port
        settings.insert("so_reuseport".into(), "1".into());
        settings.insert("unix_socket_dir".into(), dir.to_string());
        settings.insert(keys::POOL_MODE.into(), user.pool_mode.as_str().into());

        let mut config = Self {
            settings,
            ..Self::default()
        };
        config.set_max_db_connection_derivatives(user.max_db_connections, 1);
        config
    }

    /// Apply the operator-mutable options.
    ///
    /// The listen port is intentionally left to the caller: a port change
    /// must republish client connection info before the key is overwritten.
    pub fn apply_user_config(&mut self, user: &UserConfig, instances: usize) {
        self.settings
            .insert(keys::POOL_MODE.into(), user.pool_mode.as_str().into());
        self.set_max_db_connection_derivatives(user.max_db_connections, instances);
    }

    /// Derive the per-instance connection-limit ladder from the fleet-wide
    /// `max_db_connections` bound. A bound of zero means unlimited, in which
    /// case the stock default pool size is kept.
    pub fn set_max_db_connection_derivatives(&mut self, max_db_connections: u32, instances: usize) {
        let instances = instances.max(1) as u32;
        self.settings
            .insert("max_db_connections".into(), max_db_connections.to_string());

        let default_pool_size = if max_db_connections == 0 {
            20
        } else {
            let effective = max_db_connections / instances;
            effective.div_ceil(2).max(1)
        };
        self.settings
            .insert("default_pool_size".into(), default_pool_size.to_string());
        self.settings
            .insert("min_pool_size".into(), default_pool_size.div_ceil(2).to_string());
        self.settings
            .insert("reserve_pool_size".into(), default_pool_size.div_ceil(4).to_string());
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.settings.get(keys::LISTEN_PORT)?.parse().ok()
    }

    /// Add a user to the stats list (monitoring console access).
    pub fn add_stats_user(&mut self, user: &str) {
        self.stats_users.insert(user.to_string());
    }

    /// Add a user to the admin list.
    pub fn add_admin_user(&mut self, user: &str) {
        self.admin_users.insert(user.to_string());
    }

    /// Remove a user from every user list.
    pub fn remove_user(&mut self, user: &str) {
        self.admin_users.remove(user);
        self.stats_users.remove(user);
    }

    /// Every user named by the config; each must have a credential-file line.
    pub fn user_list(&self) -> BTreeSet<String> {
        self.admin_users.union(&self.stats_users).cloned().collect()
    }

    /// Serialize to pgbouncer.ini text. Deterministic: section order is
    /// fixed and keys are sorted, so equal configs render identically.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[databases]\n");
        for (name, params) in &self.databases {
            push_pair(&mut out, name, params);
        }
        out.push_str("\n[pgbouncer]\n");

        let mut settings = self.settings.clone();
        if !self.admin_users.is_empty() {
            settings.insert(ADMIN_USERS_KEY.into(), join_users(&self.admin_users));
        }
        if !self.stats_users.is_empty() {
            settings.insert(STATS_USERS_KEY.into(), join_users(&self.stats_users));
        }
        for (key, value) in &settings {
            push_pair(&mut out, key, value);
        }
        out
    }

    /// Render the derived config for one instance: identical to canonical
    /// except for the socket directory, log file and pid file.
    pub fn render_for_instance(&self, instance: &ServiceInstance) -> String {
        let mut derived = self.clone();
        derived
            .settings
            .insert("unix_socket_dir".into(), instance.dir.display().to_string());
        derived
            .settings
            .insert("logfile".into(), instance.log_file().display().to_string());
        derived
            .settings
            .insert("pidfile".into(), instance.pid_file().display().to_string());
        derived.render()
    }

    /// Parse previously rendered pgbouncer.ini text.
    pub fn parse(text: &str) -> Result<Self, ConfigParseError> {
        let mut config = Self::default();
        let mut section: Option<Section> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = Some(match name {
                    "databases" => Section::Databases,
                    "pgbouncer" => Section::Pgbouncer,
                    other => return Err(ConfigParseError::UnknownSection(other.to_string())),
                });
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigParseError::MalformedPair(idx + 1, line.to_string()));
            };
            let (key, value) = (key.trim().to_string(), value.trim().to_string());
            match section {
                None => return Err(ConfigParseError::OrphanLine(idx + 1, line.to_string())),
                Some(Section::Databases) => {
                    config.databases.insert(key, value);
                }
                Some(Section::Pgbouncer) => match key.as_str() {
                    ADMIN_USERS_KEY => config.admin_users = split_users(&value),
                    STATS_USERS_KEY => config.stats_users = split_users(&value),
                    _ => {
                        config.settings.insert(key, value);
                    }
                },
            }
        }
        Ok(config)
    }

    /// Keys on which an instance render differs from the canonical render.
    pub fn instance_keys() -> &'static [&'static str] {
        &INSTANCE_KEYS
    }
}

impl fmt::Display for PoolerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

enum Section {
    Databases,
    Pgbouncer,
}

fn push_pair(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push_str(" = ");
    out.push_str(value);
    out.push('\n');
}

fn join_users(users: &BTreeSet<String>) -> String {
    users.iter().cloned().collect::<Vec<_>>().join(",")
}

fn split_users(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}
