//! Backend-database relation record
//!
//! The backend side publishes connection endpoints and generated
//! credentials; this module holds the relation record, derives the
//! auth-bridging and monitoring usernames, folds backend endpoints into the
//! canonical config, and decides, from one consistent snapshot, whether a
//! departing unit means a local scale-down, a backend scale-down, or a true
//! relation teardown.

use serde::{Deserialize, Serialize};

use crate::controller::state_machine::RelationPhase;
use crate::pooler::config::{PoolerConfig, keys};

/// Maintenance database the auth function is additionally installed in, so
/// console connections can authenticate too.
pub const MAINTENANCE_DB: &str = "postgres";

/// Logical database requested from the backend.
pub const REQUESTED_DATABASE: &str = "pgbouncer";

/// Backend application name assumed until the relation reports one.
pub const DEFAULT_BACKEND_APP: &str = "postgresql";

/// Remote-side relation data, as published by the backend application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BackendData {
    /// Primary endpoint(s), `host:port`, comma-joined when multiple.
    pub endpoints: Option<String>,
    pub read_only_endpoints: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub extra_user_roles: Option<String>,
    pub version: Option<String>,
}

impl BackendData {
    /// Whether enough data is present to connect and provision.
    pub fn is_complete(&self) -> bool {
        self.endpoints.is_some() && self.username.is_some() && self.password.is_some()
    }

    /// First primary endpoint as (host, port).
    pub fn primary_endpoint(&self) -> Option<(String, u16)> {
        let first = self.endpoints.as_ref()?.split(',').next()?.trim();
        let (host, port) = first.split_once(':')?;
        Some((host.to_string(), port.parse().ok()?))
    }

    /// First read-only endpoint as (host, port).
    pub fn read_only_endpoint(&self) -> Option<(String, u16)> {
        let first = self.read_only_endpoints.as_ref()?.split(',').next()?.trim();
        let (host, port) = first.split_once(':')?;
        Some((host.to_string(), port.parse().ok()?))
    }
}

/// One backend-database relation instance.
#[derive(Debug, Clone, Default)]
pub struct BackendRelation {
    pub id: Option<u32>,
    pub phase: RelationPhase,
    /// Remote application name, once the relation reports it.
    pub app: Option<String>,
    pub data: BackendData,
}

impl BackendRelation {
    pub fn exists(&self) -> bool {
        self.id.is_some()
    }

    pub fn app_name(&self) -> &str {
        self.app.as_deref().unwrap_or(DEFAULT_BACKEND_APP)
    }

    /// The role used solely to execute the credential lookup function.
    pub fn auth_user(&self) -> Option<String> {
        let username = self.data.username.as_ref()?;
        Some(format!("pgbouncer_auth_{}", username.replace('-', "_")))
    }

    /// The monitoring (stats console) user for this pooler application.
    pub fn stats_user(app_name: &str) -> String {
        format!("pgbouncer_stats_{}", app_name.replace('-', "_"))
    }

    /// The lookup query the pooler runs through the auth-bridging user.
    pub fn auth_query(&self) -> Option<String> {
        let auth_user = self.auth_user()?;
        Some(format!(
            "SELECT username, password FROM {auth_user}.get_auth($1)"
        ))
    }

    /// Fold the backend endpoints into the canonical `[databases]` section:
    /// the requested database pointing at the primary, and a `_standby`
    /// entry when read-only endpoints exist.
    pub fn refresh_database_entries(&self, config: &mut PoolerConfig) {
        let database = self
            .data
            .database
            .clone()
            .unwrap_or_else(|| REQUESTED_DATABASE.to_string());

        if let Some((host, port)) = self.data.primary_endpoint() {
            config.databases.insert(
                database.clone(),
                format!("host={host} port={port} dbname={database}"),
            );
        }
        match self.data.read_only_endpoint() {
            Some((host, port)) => {
                config.databases.insert(
                    format!("{database}_standby"),
                    format!("host={host} port={port} dbname={database}"),
                );
            }
            None => {
                config.databases.remove(&format!("{database}_standby"));
            }
        }
    }

    /// Remove every trace of this relation from the canonical config:
    /// its users, the auth keys and its database entries.
    pub fn strip_auth_artifacts(&self, config: &mut PoolerConfig, app_name: &str) {
        if let Some(username) = &self.data.username {
            config.remove_user(username);
        }
        if let Some(auth_user) = self.auth_user() {
            config.remove_user(&auth_user);
        }
        config.remove_user(&Self::stats_user(app_name));
        config.settings.remove(keys::AUTH_USER);
        config.settings.remove(keys::AUTH_QUERY);
        config.settings.remove(keys::AUTH_FILE);

        let database = self
            .data
            .database
            .clone()
            .unwrap_or_else(|| REQUESTED_DATABASE.to_string());
        config.databases.remove(&database);
        config.databases.remove(&format!("{database}_standby"));
    }

    /// Databases the auth function must exist in.
    pub fn auth_function_databases(&self) -> Vec<String> {
        let database = self
            .data
            .database
            .clone()
            .unwrap_or_else(|| REQUESTED_DATABASE.to_string());
        vec![database, MAINTENANCE_DB.to_string()]
    }
}

/// A relation-departed event as delivered by the event source. The planned
/// unit count arrives in the payload so the scale-down comparison uses one
/// consistent snapshot rather than two independent reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DepartureEvent {
    pub departing_unit: String,
    pub departing_app: String,
    pub planned_units: u32,
}

/// What a relation-departed event requires of this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartureAction {
    /// The local replica itself is being removed: flag it and do nothing
    /// else: this is a scale-down of this replica, not a teardown.
    MarkLocalDeparting,
    /// Not this replica's decision (follower, or an unrelated application).
    Ignore,
    /// The backend is scaling down but staying connected: keep the auth
    /// artifacts untouched.
    SkipScaleDown,
    /// True teardown: revoke the auth function now, while the backend
    /// connection still exists; by relation-broken it may be unusable.
    RevokeAuth,
}

/// Disambiguate scale-down from teardown against a single peer-membership
/// snapshot.
pub fn departure_action(
    event: &DepartureEvent,
    local_unit: &str,
    backend_app: &str,
    is_leader: bool,
    peer_units: usize,
) -> DepartureAction {
    if event.departing_unit == local_unit {
        return DepartureAction::MarkLocalDeparting;
    }
    if event.departing_app != backend_app || !is_leader {
        return DepartureAction::Ignore;
    }
    let planned = event.planned_units as usize;
    if planned > 0 && planned < peer_units {
        return DepartureAction::SkipScaleDown;
    }
    DepartureAction::RevokeAuth
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_data() -> BackendData {
        BackendData {
            endpoints: Some("db-0.internal:5432".into()),
            read_only_endpoints: Some("db-1.internal:5432,db-2.internal:5432".into()),
            username: Some("relation-18".into()),
            password: Some("18cqKCp19xOPBhk9".into()),
            database: Some("pgbouncer".into()),
            extra_user_roles: Some("SUPERUSER".into()),
            version: Some("14.9".into()),
        }
    }

    fn relation() -> BackendRelation {
        BackendRelation {
            id: Some(18),
            phase: RelationPhase::Created,
            app: Some("postgresql".into()),
            data: complete_data(),
        }
    }

    #[test]
    fn test_completeness_and_endpoints() {
        assert!(complete_data().is_complete());
        assert!(!BackendData::default().is_complete());

        let data = complete_data();
        assert_eq!(
            data.primary_endpoint(),
            Some(("db-0.internal".to_string(), 5432))
        );
        // first of the comma-joined set
        assert_eq!(
            data.read_only_endpoint(),
            Some(("db-1.internal".to_string(), 5432))
        );
    }

    #[test]
    fn test_user_derivation() {
        let relation = relation();
        assert_eq!(relation.auth_user().as_deref(), Some("pgbouncer_auth_relation_18"));
        assert_eq!(
            BackendRelation::stats_user("pgbouncer-fleet"),
            "pgbouncer_stats_pgbouncer_fleet"
        );
        assert_eq!(
            relation.auth_query().as_deref(),
            Some("SELECT username, password FROM pgbouncer_auth_relation_18.get_auth($1)")
        );
    }

    #[test]
    fn test_refresh_and_strip_database_entries() {
        let relation = relation();
        let mut config = PoolerConfig::default();
        relation.refresh_database_entries(&mut config);
        assert_eq!(
            config.databases["pgbouncer"],
            "host=db-0.internal port=5432 dbname=pgbouncer"
        );
        assert_eq!(
            config.databases["pgbouncer_standby"],
            "host=db-1.internal port=5432 dbname=pgbouncer"
        );

        relation.strip_auth_artifacts(&mut config, "pgbouncer");
        assert!(config.databases.is_empty());
    }

    #[test]
    fn test_strip_auth_artifacts_removes_users_and_keys() {
        let relation = relation();
        let mut config = PoolerConfig::default();
        config.add_admin_user("pgbouncer_auth_relation_18");
        config.add_stats_user("pgbouncer_stats_pgbouncer");
        config
            .settings
            .insert(keys::AUTH_QUERY.into(), relation.auth_query().unwrap());
        config
            .settings
            .insert(keys::AUTH_FILE.into(), "/var/lib/pgbouncer/userlist.txt".into());

        relation.strip_auth_artifacts(&mut config, "pgbouncer");
        assert!(config.user_list().is_empty());
        assert!(!config.settings.contains_key(keys::AUTH_QUERY));
        assert!(!config.settings.contains_key(keys::AUTH_FILE));
    }

    #[test]
    fn test_departure_action_local_unit() {
        let event = DepartureEvent {
            departing_unit: "pgbouncer/2".into(),
            departing_app: "pgbouncer".into(),
            planned_units: 2,
        };
        assert_eq!(
            departure_action(&event, "pgbouncer/2", "postgresql", true, 3),
            DepartureAction::MarkLocalDeparting
        );
    }

    #[test]
    fn test_departure_action_scale_down_keeps_auth() {
        // 0 < planned < peer count: backend scaling down, not disconnecting
        let event = DepartureEvent {
            departing_unit: "postgresql/2".into(),
            departing_app: "postgresql".into(),
            planned_units: 2,
        };
        assert_eq!(
            departure_action(&event, "pgbouncer/0", "postgresql", true, 3),
            DepartureAction::SkipScaleDown
        );
    }

    #[test]
    fn test_departure_action_teardown_revokes() {
        let event = DepartureEvent {
            departing_unit: "postgresql/0".into(),
            departing_app: "postgresql".into(),
            planned_units: 0,
        };
        assert_eq!(
            departure_action(&event, "pgbouncer/0", "postgresql", true, 3),
            DepartureAction::RevokeAuth
        );
    }

    #[test]
    fn test_departure_action_followers_and_other_apps_ignore() {
        let event = DepartureEvent {
            departing_unit: "postgresql/0".into(),
            departing_app: "postgresql".into(),
            planned_units: 0,
        };
        assert_eq!(
            departure_action(&event, "pgbouncer/1", "postgresql", false, 3),
            DepartureAction::Ignore
        );

        let unrelated = DepartureEvent {
            departing_unit: "grafana/0".into(),
            departing_app: "grafana".into(),
            planned_units: 0,
        };
        assert_eq!(
            departure_action(&unrelated, "pgbouncer/0", "postgresql", true, 3),
            DepartureAction::Ignore
        );
    }
}
