//! Pooler service instances
//!
//! PgBouncer is single-threaded, so one process per available CPU core is
//! run to use the whole machine; all instances share the listen port via
//! socket reuse. Each instance gets an isolated directory so pidfiles and
//! logfiles cannot conflict. The fleet is fixed at process start and does
//! not change for the lifetime of the replica.

use std::path::{Path, PathBuf};
use std::thread;

use crate::settings::Settings;

/// Service-name prefix for pooler instances.
pub const POOLER_SERVICE_PREFIX: &str = "pgbouncer";

/// One supervised pooler process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub id: usize,
    /// Working directory, holds the instance config, pidfile and socket.
    pub dir: PathBuf,
    pub log_dir: PathBuf,
}

impl ServiceInstance {
    pub fn new(id: usize, data_dir: &Path, log_root: &Path) -> Self {
        let subdir = format!("instance_{id}");
        Self {
            id,
            dir: data_dir.join(&subdir),
            log_dir: log_root.join(&subdir),
        }
    }

    /// Supervised service name for this instance.
    pub fn service_name(&self) -> String {
        format!("{POOLER_SERVICE_PREFIX}_{}", self.id)
    }

    pub fn ini_path(&self) -> PathBuf {
        self.dir.join("pgbouncer.ini")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("pgbouncer.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("pgbouncer.log")
    }
}

/// Build the fixed instance fleet for this replica, one instance per core.
pub fn instance_fleet(settings: &Settings) -> Vec<ServiceInstance> {
    let cores = settings.cores.unwrap_or_else(detected_cores);
    (0..cores)
        .map(|id| ServiceInstance::new(id, &settings.data_dir, &settings.log_dir))
        .collect()
}

/// Detected CPU core count, minimum one.
pub fn detected_cores() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
