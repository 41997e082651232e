//! Downstream client relations
//!
//! Republishes the pooler's listen endpoint to every downstream consumer
//! relation. Publications are guarded by content comparison so an unchanged
//! port produces zero downstream writes; every write triggers a
//! reconciliation on the consumer side, and storms there are as costly as
//! restarts here.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

/// Supported consumer relation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientKind {
    /// Modern client interface.
    Client,
    /// Legacy interface.
    Db,
    /// Legacy interface with admin access.
    DbAdmin,
}

/// One downstream consumer relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRelation {
    pub id: u32,
    pub kind: ClientKind,
}

/// The endpoint information consumers receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub read_only_endpoints: Option<String>,
}

impl ConnectionInfo {
    fn document(&self, kind: ClientKind) -> BTreeMap<String, String> {
        let mut doc = BTreeMap::new();
        doc.insert("host".to_string(), self.host.clone());
        doc.insert("port".to_string(), self.port.to_string());
        if let Some(ro) = &self.read_only_endpoints {
            doc.insert("read-only-endpoints".to_string(), ro.clone());
        }
        if matches!(kind, ClientKind::Db | ClientKind::DbAdmin) {
            // legacy consumers expect a subnet allowance field
            doc.insert("allowed-subnets".to_string(), "0.0.0.0/0".to_string());
        }
        doc
    }
}

/// Writes per-relation publication documents, one JSON file per relation,
/// read by the external relation transport.
pub struct ClientPublisher {
    dir: PathBuf,
}

impl ClientPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn relation_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("client-{id}.json"))
    }

    /// Publish `info` to every relation whose currently published document
    /// differs. Returns the ids actually written. A missing backend means
    /// there is nothing meaningful to publish: silent no-op.
    pub async fn publish(
        &self,
        relations: &[ClientRelation],
        info: &ConnectionInfo,
        backend_present: bool,
    ) -> Result<Vec<u32>, io::Error> {
        if !backend_present || relations.is_empty() {
            return Ok(Vec::new());
        }
        fs::create_dir_all(&self.dir).await?;

        let mut written = Vec::new();
        for relation in relations {
            let doc = serde_json::to_string_pretty(&info.document(relation.kind))?;
            if read_existing(&self.relation_path(relation.id)).await?.as_deref() == Some(&doc) {
                continue;
            }
            fs::write(self.relation_path(relation.id), &doc).await?;
            debug!(relation = relation.id, "published client connection info");
            written.push(relation.id);
        }
        Ok(written)
    }

    /// Drop the publication for a departed relation.
    pub async fn retract(&self, id: u32) -> Result<(), io::Error> {
        match fs::remove_file(self.relation_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn read_existing(path: &Path) -> Result<Option<String>, io::Error> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
