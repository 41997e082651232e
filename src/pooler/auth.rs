//! Pooler authentication credentials
//!
//! Generates random passwords, computes the MD5 challenge hash the pooler's
//! auth mechanism expects, and serializes the credential file (one
//! `"user" "hash"` line per credential, sorted by username). Credentials are
//! content-addressed by username, not by relation, so they survive relation
//! churn until the owning relation is torn down.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use rand::TryRngCore;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::peers::{PeerError, PeerSynchronizer};

const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const PASSWORD_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum CredentialError {
    /// Entropy-source failure. Fatal and non-retryable: it indicates an
    /// environment defect, not a transient condition.
    #[error("entropy source failure: {0}")]
    Entropy(String),

    #[error("malformed credential line {0}: {1:?}")]
    MalformedLine(usize, String),
}

/// Generate a random password from the OS entropy source.
pub fn generate_password() -> Result<String, CredentialError> {
    let mut bytes = [0u8; PASSWORD_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CredentialError::Entropy(e.to_string()))?;
    Ok(bytes
        .iter()
        .map(|b| PASSWORD_CHARSET[*b as usize % PASSWORD_CHARSET.len()] as char)
        .collect())
}

/// The deterministic challenge hash stored in the credential file and set as
/// the backend role password: `md5` followed by hex(md5(password ∥ username)).
pub fn hash_password(username: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    format!("md5{}", hex::encode(hasher.finalize()))
}

/// Generate a fresh credential for `username`.
///
/// Returns the plaintext password (needed once, to build connection strings)
/// and the hash that goes to both the backend role and the credential file.
pub fn provision_user(username: &str) -> Result<(String, String), CredentialError> {
    let password = generate_password()?;
    let hashed = hash_password(username, &password);
    Ok((password, hashed))
}

#[derive(Debug, Error)]
pub enum RotateError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Reuse the peer-shared secret under `key`, generating and publishing it
/// once when absent. A value generated once is reused across reconciliation
/// replays.
pub async fn rotate_or_reuse(
    peers: &PeerSynchronizer,
    key: &str,
) -> Result<String, RotateError> {
    if let Some(existing) = peers.fetch(key).await? {
        return Ok(existing);
    }
    let fresh = generate_password()?;
    peers.publish(key, Some(&fresh)).await?;
    Ok(fresh)
}

/// Serialize credentials to the auth-file format, sorted by username.
pub fn render_auth_file(entries: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (username, hash) in entries {
        out.push_str(&format!("\"{username}\" \"{hash}\"\n"));
    }
    out
}

/// Parse an auth-file blob back into username → hash entries.
pub fn parse_auth_file(blob: &str) -> Result<BTreeMap<String, String>, CredentialError> {
    let mut entries = BTreeMap::new();
    for (idx, raw) in blob.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('"').filter(|f| !f.trim().is_empty());
        match (fields.next(), fields.next()) {
            (Some(username), Some(hash)) => {
                entries.insert(username.to_string(), hash.to_string());
            }
            _ => return Err(CredentialError::MalformedLine(idx + 1, line.to_string())),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_password() {
        let password = generate_password().unwrap();
        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(password.bytes().all(|b| PASSWORD_CHARSET.contains(&b)));
        // Should be different each time
        assert_ne!(password, generate_password().unwrap());
    }

    #[test]
    fn test_hash_password_matches_challenge_format() {
        // Well-known md5(password ∥ username) vector
        let hash = hash_password("postgres", "foo");
        assert_eq!(hash, format!("md5{}", hex::encode(Md5::digest(b"foopostgres"))));
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 3 + 32);
    }

    #[test]
    fn test_credential_round_trip() {
        let (password, hashed) = provision_user("alice").unwrap();
        let entries = BTreeMap::from([("alice".to_string(), hashed.clone())]);
        let blob = render_auth_file(&entries);

        let parsed = parse_auth_file(&blob).unwrap();
        assert_eq!(parsed.get("alice"), Some(&hashed));
        assert_eq!(parsed["alice"], hash_password("alice", &password));
    }

    #[test]
    fn test_render_auth_file_sorted_by_username() {
        let entries = BTreeMap::from([
            ("zoe".to_string(), "md5zzz".to_string()),
            ("amy".to_string(), "md5aaa".to_string()),
        ]);
        let blob = render_auth_file(&entries);
        assert_eq!(blob, "\"amy\" \"md5aaa\"\n\"zoe\" \"md5zzz\"\n");
    }

    #[tokio::test]
    async fn test_rotate_or_reuse_generates_once() {
        use std::sync::Arc;

        use crate::peers::{InMemoryPeerStore, MONITORING_PASSWORD_KEY, StaticLeadership};

        let peers = PeerSynchronizer::new(
            Arc::new(InMemoryPeerStore::default()),
            Arc::new(StaticLeadership(true)),
            "pgbouncer/0",
        );
        let first = rotate_or_reuse(&peers, MONITORING_PASSWORD_KEY).await.unwrap();
        let second = rotate_or_reuse(&peers, MONITORING_PASSWORD_KEY).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            peers.fetch(MONITORING_PASSWORD_KEY).await.unwrap().as_deref(),
            Some(first.as_str())
        );
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(matches!(
            parse_auth_file("\"only-user\""),
            Err(CredentialError::MalformedLine(1, _))
        ));
    }
}
