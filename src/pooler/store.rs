//! Canonical and per-instance config persistence
//!
//! All mutation paths funnel through [`ConfigStore::apply`], which compares
//! the new canonical serialization against what is already persisted and
//! skips the write entirely when nothing changed. The fleet fronts N
//! independent processes that all restart to pick up a change, so the
//! skip-on-no-op check is what prevents thundering-herd restarts on
//! unrelated events.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use crate::pooler::config::{ConfigParseError, PoolerConfig};
use crate::pooler::instance::ServiceInstance;

/// Canonical config file name (also used per instance).
pub const INI_FILE: &str = "pgbouncer.ini";
/// Credential file consumed by the pooler's auth mechanism.
pub const AUTH_FILE: &str = "userlist.txt";

const FILE_MODE: u32 = 0o400;
const DIR_MODE: u32 = 0o700;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No canonical config found locally; callers fall back to peer state,
    /// and the leader synthesizes a default.
    #[error("no canonical pooler configuration on disk")]
    Unavailable,

    #[error(transparent)]
    Parse(#[from] ConfigParseError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of an [`ConfigStore::apply`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Serialization identical to what is persisted: no write, no restart
    /// signal.
    Unchanged,
    /// Canonical and per-instance files were rewritten; the caller decides
    /// when to issue the restart (updates may be batched).
    Written,
}

/// Owns the on-disk layout: the canonical config, one directory per
/// instance, and the credential file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    data_dir: PathBuf,
    instances: Vec<ServiceInstance>,
}

impl ConfigStore {
    pub fn new(data_dir: impl Into<PathBuf>, instances: Vec<ServiceInstance>) -> Self {
        Self {
            data_dir: data_dir.into(),
            instances,
        }
    }

    pub fn instances(&self) -> &[ServiceInstance] {
        &self.instances
    }

    pub fn ini_path(&self) -> PathBuf {
        self.data_dir.join(INI_FILE)
    }

    pub fn auth_file_path(&self) -> PathBuf {
        self.data_dir.join(AUTH_FILE)
    }

    /// Create instance and log directories (mode 0o700). Files themselves
    /// are created lazily on the first successful apply.
    pub async fn ensure_layout(&self) -> Result<(), ConfigError> {
        make_private_dir(&self.data_dir).await?;
        for instance in &self.instances {
            make_private_dir(&instance.dir).await?;
            make_private_dir(&instance.log_dir).await?;
        }
        Ok(())
    }

    /// Load the canonical config from disk.
    pub async fn load(&self) -> Result<PoolerConfig, ConfigError> {
        let text = match fs::read_to_string(self.ini_path()).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ConfigError::Unavailable),
            Err(e) => return Err(e.into()),
        };
        Ok(PoolerConfig::parse(&text)?)
    }

    /// Per-instance renders plus the canonical render, as (path, text).
    pub fn render(&self, config: &PoolerConfig) -> Vec<(PathBuf, String)> {
        let mut files: Vec<(PathBuf, String)> = self
            .instances
            .iter()
            .map(|i| (i.ini_path(), config.render_for_instance(i)))
            .collect();
        files.push((self.ini_path(), config.render()));
        files
    }

    /// Persist `config` unless it matches what is already on disk.
    pub async fn apply(&self, config: &PoolerConfig) -> Result<ApplyOutcome, ConfigError> {
        let canonical = config.render();
        match fs::read_to_string(self.ini_path()).await {
            Ok(existing) if existing == canonical => {
                debug!("canonical config unchanged, skipping render");
                return Ok(ApplyOutcome::Unchanged);
            }
            Ok(_) | Err(_) => {}
        }

        self.ensure_layout().await?;
        for (path, text) in self.render(config) {
            write_private(&path, text.as_bytes()).await?;
        }
        info!(
            instances = self.instances.len(),
            "pushed new pooler config files"
        );
        Ok(ApplyOutcome::Written)
    }

    pub async fn read_auth_file(&self) -> Result<Option<String>, ConfigError> {
        match fs::read_to_string(self.auth_file_path()).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the credential file (mode 0o400), skipping identical content.
    pub async fn write_auth_file(&self, blob: &str) -> Result<ApplyOutcome, ConfigError> {
        if self.read_auth_file().await?.as_deref() == Some(blob) {
            return Ok(ApplyOutcome::Unchanged);
        }
        make_private_dir(&self.data_dir).await?;
        write_private(&self.auth_file_path(), blob.as_bytes()).await?;
        info!("pushed new auth file");
        Ok(ApplyOutcome::Written)
    }

    pub async fn delete_auth_file(&self) -> Result<(), ConfigError> {
        match fs::remove_file(self.auth_file_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write a file readable only by the owner. Config and credential files are
/// kept read-only, so a previous copy must be removed first.
async fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::write(path, contents).await?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE)).await
}

async fn make_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if fs::try_exists(path).await? {
        return Ok(());
    }
    fs::create_dir_all(path).await?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(DIR_MODE)).await
}
