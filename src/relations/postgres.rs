//! Backend SQL execution
//!
//! Provisions and revokes the auth-bridging machinery on the backend
//! database: the lookup role, and the `get_auth` function that lets the
//! pooler authenticate end users against real credentials without holding
//! them. All DDL is idempotent (`IF NOT EXISTS` / exists-then-alter) so
//! replaying a deferred event is safe.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::relations::backend::BackendData;

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("backend endpoint missing or malformed")]
    Endpoint,

    #[error("unsafe identifier: {0:?}")]
    Identifier(String),
}

/// Seam to the backend database engine (external collaborator).
#[async_trait]
pub trait BackendAuthority: Send + Sync {
    /// Cheap connectivity probe against the maintenance database.
    async fn probe(&self, backend: &BackendData) -> Result<(), SqlError>;

    /// Create (or re-password) a login role carrying the given challenge
    /// hash. The auth-bridging role is made superuser so `get_auth` can read
    /// the credential catalog.
    async fn ensure_auth_user(
        &self,
        backend: &BackendData,
        username: &str,
        hashed_password: &str,
    ) -> Result<(), SqlError>;

    /// Install the credential lookup function owned by `auth_user` in each
    /// named database.
    async fn install_auth_function(
        &self,
        backend: &BackendData,
        auth_user: &str,
        databases: &[String],
    ) -> Result<(), SqlError>;

    /// Remove the lookup function (and its schema) from each named database.
    async fn remove_auth_function(
        &self,
        backend: &BackendData,
        auth_user: &str,
        databases: &[String],
    ) -> Result<(), SqlError>;

    async fn drop_auth_user(&self, backend: &BackendData, username: &str) -> Result<(), SqlError>;
}

/// `tokio-postgres` implementation.
pub struct PgBackendAuthority;

impl PgBackendAuthority {
    async fn connect(
        &self,
        backend: &BackendData,
        database: &str,
    ) -> Result<tokio_postgres::Client, SqlError> {
        let (host, port) = backend.primary_endpoint().ok_or(SqlError::Endpoint)?;
        let (user, password) = match (&backend.username, &backend.password) {
            (Some(u), Some(p)) => (u, p),
            _ => return Err(SqlError::Endpoint),
        };
        let config = format!(
            "host={host} port={port} user={user} password={password} dbname={database} connect_timeout=10"
        );

        let (client, connection) = tokio_postgres::connect(&config, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::trace!(error = %e, "backend connection closed");
            }
        });
        debug!(%host, port, database, "backend connection established");
        Ok(client)
    }
}

#[async_trait]
impl BackendAuthority for PgBackendAuthority {
    async fn probe(&self, backend: &BackendData) -> Result<(), SqlError> {
        let client = self.connect(backend, super::backend::MAINTENANCE_DB).await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn ensure_auth_user(
        &self,
        backend: &BackendData,
        username: &str,
        hashed_password: &str,
    ) -> Result<(), SqlError> {
        validate_identifier(username)?;
        let client = self.connect(backend, super::backend::MAINTENANCE_DB).await?;

        let exists = client
            .query_opt("SELECT 1 FROM pg_roles WHERE rolname = $1", &[&username])
            .await?
            .is_some();
        let sql = if exists {
            format!(
                "ALTER ROLE {} WITH LOGIN SUPERUSER PASSWORD '{}'",
                quote_identifier(username),
                escape_sql_string(hashed_password)
            )
        } else {
            format!(
                "CREATE ROLE {} WITH LOGIN SUPERUSER PASSWORD '{}'",
                quote_identifier(username),
                escape_sql_string(hashed_password)
            )
        };
        client.batch_execute(&sql).await?;
        info!(role = username, "auth user ensured on backend");
        Ok(())
    }

    async fn install_auth_function(
        &self,
        backend: &BackendData,
        auth_user: &str,
        databases: &[String],
    ) -> Result<(), SqlError> {
        validate_identifier(auth_user)?;
        for database in databases {
            let client = self.connect(backend, database).await?;
            client.batch_execute(&install_script(auth_user)).await?;
        }
        info!(role = auth_user, "auth function installed");
        Ok(())
    }

    async fn remove_auth_function(
        &self,
        backend: &BackendData,
        auth_user: &str,
        databases: &[String],
    ) -> Result<(), SqlError> {
        validate_identifier(auth_user)?;
        for database in databases {
            let client = self.connect(backend, database).await?;
            client.batch_execute(&uninstall_script(auth_user)).await?;
        }
        info!(role = auth_user, "auth function removed");
        Ok(())
    }

    async fn drop_auth_user(&self, backend: &BackendData, username: &str) -> Result<(), SqlError> {
        validate_identifier(username)?;
        let client = self.connect(backend, super::backend::MAINTENANCE_DB).await?;
        client
            .batch_execute(&format!("DROP ROLE IF EXISTS {}", quote_identifier(username)))
            .await?;
        info!(role = username, "auth user dropped");
        Ok(())
    }
}

/// DDL installing the lookup function. `SECURITY DEFINER` lets the pooler's
/// auth user read `pg_shadow` through the function without broader access.
fn install_script(auth_user: &str) -> String {
    let schema = quote_identifier(auth_user);
    format!(
        r#"CREATE SCHEMA IF NOT EXISTS {schema};
CREATE OR REPLACE FUNCTION {schema}.get_auth(p_usename TEXT)
RETURNS TABLE (username TEXT, password TEXT) AS $$
BEGIN
    RETURN QUERY SELECT usename::TEXT, passwd::TEXT
    FROM pg_catalog.pg_shadow
    WHERE usename = p_usename;
END;
$$ LANGUAGE plpgsql SECURITY DEFINER;
REVOKE ALL ON FUNCTION {schema}.get_auth(p_usename TEXT) FROM PUBLIC;
GRANT EXECUTE ON FUNCTION {schema}.get_auth(p_usename TEXT) TO {schema};
"#
    )
}

fn uninstall_script(auth_user: &str) -> String {
    let schema = quote_identifier(auth_user);
    format!(
        "DROP FUNCTION IF EXISTS {schema}.get_auth(p_usename TEXT);\nDROP SCHEMA IF EXISTS {schema} CASCADE;"
    )
}

/// Quote a SQL identifier with PostgreSQL double-quote escaping.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape a SQL string literal by doubling single quotes.
pub fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Role names this module generates must already be safe identifiers;
/// anything else indicates corrupted relation data.
pub fn is_valid_identifier(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn validate_identifier(name: &str) -> Result<(), SqlError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(SqlError::Identifier(name.to_string()))
    }
}

/// Test double recording every call; used by the scenario tests.
#[derive(Default)]
pub struct RecordingAuthority {
    calls: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl RecordingAuthority {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("authority lock").clone()
    }

    /// Make the named operation (`probe`, `install_auth_function`, …) fail.
    pub fn fail_on(&self, operation: &str) {
        self.failing
            .lock()
            .expect("authority lock")
            .insert(operation.to_string());
    }

    fn record(&self, call: String, operation: &str) -> Result<(), SqlError> {
        if self.failing.lock().expect("authority lock").contains(operation) {
            return Err(SqlError::Endpoint);
        }
        self.calls.lock().expect("authority lock").push(call);
        Ok(())
    }
}

#[async_trait]
impl BackendAuthority for RecordingAuthority {
    async fn probe(&self, _backend: &BackendData) -> Result<(), SqlError> {
        self.record("probe".to_string(), "probe")
    }

    async fn ensure_auth_user(
        &self,
        _backend: &BackendData,
        username: &str,
        _hashed_password: &str,
    ) -> Result<(), SqlError> {
        self.record(format!("ensure_auth_user {username}"), "ensure_auth_user")
    }

    async fn install_auth_function(
        &self,
        _backend: &BackendData,
        auth_user: &str,
        databases: &[String],
    ) -> Result<(), SqlError> {
        self.record(
            format!("install_auth_function {auth_user} [{}]", databases.join(",")),
            "install_auth_function",
        )
    }

    async fn remove_auth_function(
        &self,
        _backend: &BackendData,
        auth_user: &str,
        databases: &[String],
    ) -> Result<(), SqlError> {
        self.record(
            format!("remove_auth_function {auth_user} [{}]", databases.join(",")),
            "remove_auth_function",
        )
    }

    async fn drop_auth_user(&self, _backend: &BackendData, username: &str) -> Result<(), SqlError> {
        self.record(format!("drop_auth_user {username}"), "drop_auth_user")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("simple"), "\"simple\"");
        assert_eq!(quote_identifier("with\"quote"), "\"with\"\"quote\"");
    }

    #[test]
    fn test_escape_sql_string() {
        assert_eq!(escape_sql_string("simple"), "simple");
        assert_eq!(escape_sql_string("it's"), "it''s");
        assert_eq!(
            escape_sql_string("'; DROP TABLE users;--"),
            "''; DROP TABLE users;--"
        );
    }

    #[test]
    fn test_is_valid_identifier() {
        assert!(is_valid_identifier("pgbouncer_auth_relation_18"));
        assert!(is_valid_identifier("_private"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("18relation"));
        assert!(!is_valid_identifier("with-hyphen"));
        assert!(!is_valid_identifier("MixedCase"));
        assert!(!is_valid_identifier(&"a".repeat(64)));
        assert!(is_valid_identifier(&"a".repeat(63)));
    }

    #[test]
    fn test_install_script_references_auth_schema() {
        let script = install_script("pgbouncer_auth_u1");
        assert!(script.contains("CREATE SCHEMA IF NOT EXISTS \"pgbouncer_auth_u1\""));
        assert!(script.contains("SECURITY DEFINER"));
        assert!(script.contains("pg_catalog.pg_shadow"));

        let uninstall = uninstall_script("pgbouncer_auth_u1");
        assert!(uninstall.contains("DROP FUNCTION IF EXISTS \"pgbouncer_auth_u1\".get_auth"));
    }
}
