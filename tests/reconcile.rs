//! End-to-end reconciliation scenarios against in-memory collaborators
//!
//! These drive the controller through the event sequences of real
//! deployments: initialisation, backend provisioning, config changes,
//! scale-down vs. teardown, and follower synchronisation.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use pgbouncer_operator::controller::{Context, Event, Outcome, Reconciler, RelationPhase};
use pgbouncer_operator::health::HealthState;
use pgbouncer_operator::peers::{
    AUTH_FILE_KEY, InMemoryPeerStore, PeerStore, PeerSynchronizer, StaticLeadership,
};
use pgbouncer_operator::pooler::auth::parse_auth_file;
use pgbouncer_operator::pooler::config::keys;
use pgbouncer_operator::pooler::{ConfigStore, instance_fleet};
use pgbouncer_operator::relations::backend::{BackendData, DepartureEvent};
use pgbouncer_operator::relations::clients::{ClientKind, ClientPublisher};
use pgbouncer_operator::relations::postgres::RecordingAuthority;
use pgbouncer_operator::settings::{Settings, UserConfig};
use pgbouncer_operator::supervision::{
    InMemorySupervisor, METRICS_SERVICE, ServiceState, ServiceSupervisor,
};

struct Harness {
    _tmp: TempDir,
    ctx: Arc<Context>,
    supervisor: Arc<InMemorySupervisor>,
    authority: Arc<RecordingAuthority>,
    reconciler: Reconciler,
}

fn test_settings(dir: &Path, unit: &str, cores: usize) -> Settings {
    Settings {
        data_dir: dir.join("data"),
        log_dir: dir.join("log"),
        unit_name: unit.to_string(),
        external_host: unit.replace('/', "-") + ".internal",
        app_name: "pgbouncer".to_string(),
        peer_state_path: dir.join("peer-state.json"),
        leader_file: dir.join("leader"),
        supervisor_ctl: "svc-ctl".into(),
        control_socket: dir.join("control.sock"),
        client_relations_dir: dir.join("relations"),
        health_addr: "127.0.0.1:0".parse().unwrap(),
        cores: Some(cores),
    }
}

fn harness_with(store: Arc<dyn PeerStore>, leader: bool, unit: &str, cores: usize) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let settings = test_settings(tmp.path(), unit, cores);
    let instances = instance_fleet(&settings);
    let peers = PeerSynchronizer::new(store, Arc::new(StaticLeadership(leader)), unit);
    let supervisor = Arc::new(InMemorySupervisor::default());
    let authority = Arc::new(RecordingAuthority::default());
    let ctx = Arc::new(Context {
        store: ConfigStore::new(&settings.data_dir, instances),
        peers,
        supervisor: supervisor.clone(),
        authority: authority.clone(),
        clients: ClientPublisher::new(&settings.client_relations_dir),
        health: Arc::new(HealthState::new()),
        settings,
    });
    Harness {
        _tmp: tmp,
        reconciler: Reconciler::new(ctx.clone()),
        ctx,
        supervisor,
        authority,
    }
}

fn leader_harness(cores: usize) -> Harness {
    harness_with(
        Arc::new(InMemoryPeerStore::default()),
        true,
        "pgbouncer/0",
        cores,
    )
}

fn backend_data() -> BackendData {
    BackendData {
        endpoints: Some("db-0.internal:5432".into()),
        read_only_endpoints: None,
        username: Some("relation-18".into()),
        password: Some("p1".into()),
        database: Some("pgbouncer".into()),
        extra_user_roles: Some("SUPERUSER".into()),
        version: Some("14.9".into()),
    }
}

async fn handle(h: &mut Harness, event: Event) -> Outcome {
    h.reconciler.handle_event(&event).await.unwrap()
}

/// Drive a fresh leader replica through initialisation and backend
/// provisioning.
async fn provision(h: &mut Harness) {
    assert_eq!(handle(h, Event::PoolerReady).await, Outcome::Done);
    assert_eq!(
        handle(
            h,
            Event::BackendJoined {
                relation: 18,
                app: Some("postgresql".into())
            }
        )
        .await,
        Outcome::Done
    );
    assert_eq!(
        handle(
            h,
            Event::BackendDatabaseCreated {
                relation: 18,
                data: backend_data()
            }
        )
        .await,
        Outcome::Done
    );
}

#[tokio::test]
async fn database_created_provisions_credentials_and_activates() {
    let mut h = leader_harness(2);

    // before the backend relation the replica is blocked
    assert_eq!(handle(&mut h, Event::PoolerReady).await, Outcome::Done);
    h.reconciler.refresh_status().await;
    assert!(!h.ctx.health.status().await.is_active());

    // declared set: one pooler service per core, exporter, log rotation
    let status = h.supervisor.status().await.unwrap();
    assert_eq!(status.len(), 4);
    assert!(status.contains_key("pgbouncer_0"));
    assert!(status.contains_key("pgbouncer_1"));
    assert!(status.contains_key(METRICS_SERVICE));
    assert!(status.contains_key("logrotate"));

    assert_eq!(
        handle(
            &mut h,
            Event::BackendJoined {
                relation: 18,
                app: Some("postgresql".into())
            }
        )
        .await,
        Outcome::Done
    );
    assert_eq!(
        handle(
            &mut h,
            Event::BackendDatabaseCreated {
                relation: 18,
                data: backend_data()
            }
        )
        .await,
        Outcome::Done
    );
    assert_eq!(h.reconciler.backend_phase(), RelationPhase::Ready);

    // credential file carries exactly the auth-bridging and monitoring users
    let blob = h.ctx.store.read_auth_file().await.unwrap().unwrap();
    let entries = parse_auth_file(&blob).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.contains_key("pgbouncer_auth_relation_18"));
    assert!(entries.contains_key("pgbouncer_stats_pgbouncer"));
    assert!(entries.values().all(|hash| hash.starts_with("md5")));

    // canonical config wired to the lookup function
    let config = h.ctx.store.load().await.unwrap();
    assert_eq!(
        config.settings[keys::AUTH_QUERY],
        "SELECT username, password FROM pgbouncer_auth_relation_18.get_auth($1)"
    );
    assert!(config.settings[keys::AUTH_FILE].ends_with("userlist.txt"));
    assert!(config.stats_users.contains("pgbouncer_stats_pgbouncer"));
    assert_eq!(
        config.databases["pgbouncer"],
        "host=db-0.internal port=5432 dbname=pgbouncer"
    );

    // backend got the auth user and the lookup function in both databases
    let calls = h.authority.calls();
    assert!(calls.contains(&"ensure_auth_user pgbouncer_auth_relation_18".to_string()));
    assert!(
        calls.contains(
            &"install_auth_function pgbouncer_auth_relation_18 [pgbouncer,postgres]".to_string()
        )
    );

    // exporter enabled with the monitoring credential embedded
    let exporter = h.supervisor.declared(METRICS_SERVICE).unwrap();
    assert!(exporter.command.contains("pgbouncer_stats_pgbouncer:"));
    assert_eq!(
        h.supervisor.status().await.unwrap()[METRICS_SERVICE],
        ServiceState::Active
    );

    // all N+1 services active: status goes active
    h.reconciler.refresh_status().await;
    assert!(h.ctx.health.status().await.is_active());

    // a stopped instance flips the replica back to blocked
    h.supervisor.set_state("pgbouncer_1", ServiceState::Error);
    h.reconciler.refresh_status().await;
    assert!(!h.ctx.health.status().await.is_active());
}

#[tokio::test]
async fn database_created_defers_until_pooler_runs() {
    let mut h = leader_harness(2);

    // supervision set not declared yet: the event defers, no side effects
    let outcome = handle(
        &mut h,
        Event::BackendDatabaseCreated {
            relation: 18,
            data: backend_data(),
        },
    )
    .await;
    assert!(matches!(outcome, Outcome::Defer(_)));
    assert!(h.authority.calls().is_empty());
    assert!(h.ctx.store.read_auth_file().await.unwrap().is_none());

    // replaying after initialisation succeeds
    assert_eq!(handle(&mut h, Event::PoolerReady).await, Outcome::Done);
    let outcome = handle(
        &mut h,
        Event::BackendDatabaseCreated {
            relation: 18,
            data: backend_data(),
        },
    )
    .await;
    assert_eq!(outcome, Outcome::Done);
    assert_eq!(h.reconciler.backend_phase(), RelationPhase::Ready);
}

#[tokio::test]
async fn repeated_config_apply_skips_restarts() {
    let mut h = leader_harness(2);
    assert_eq!(handle(&mut h, Event::PoolerReady).await, Outcome::Done);

    let user = UserConfig::default();
    assert_eq!(
        handle(&mut h, Event::ConfigChanged { config: user.clone() }).await,
        Outcome::Done
    );
    let restarts_after_first = h.supervisor.restart_log().len();

    // identical config: one persisted state, zero further restart signals
    assert_eq!(
        handle(&mut h, Event::ConfigChanged { config: user }).await,
        Outcome::Done
    );
    assert_eq!(h.supervisor.restart_log().len(), restarts_after_first);

    // an actual change restarts again
    let changed = UserConfig {
        max_db_connections: 60,
        ..UserConfig::default()
    };
    assert_eq!(
        handle(&mut h, Event::ConfigChanged { config: changed }).await,
        Outcome::Done
    );
    assert!(h.supervisor.restart_log().len() > restarts_after_first);
}

#[tokio::test]
async fn backend_scale_down_keeps_auth_artifacts() {
    let store: Arc<dyn PeerStore> = Arc::new(InMemoryPeerStore::default());
    let mut h = harness_with(store.clone(), true, "pgbouncer/0", 2);
    h.ctx.peers.register_unit().await.unwrap();
    // two more peer replicas in the roster
    for unit in ["pgbouncer/1", "pgbouncer/2"] {
        PeerSynchronizer::new(store.clone(), Arc::new(StaticLeadership(false)), unit)
            .register_unit()
            .await
            .unwrap();
    }
    provision(&mut h).await;

    // 0 < planned (2) < peers (3): backend scaling down, skip revocation
    let outcome = handle(
        &mut h,
        Event::BackendUnitDeparted {
            relation: 18,
            departure: DepartureEvent {
                departing_unit: "postgresql/2".into(),
                departing_app: "postgresql".into(),
                planned_units: 2,
            },
        },
    )
    .await;
    assert_eq!(outcome, Outcome::Done);
    let calls = h.authority.calls();
    assert!(!calls.iter().any(|c| c.starts_with("remove_auth_function")));
    let config = h.ctx.store.load().await.unwrap();
    assert!(config.settings.contains_key(keys::AUTH_QUERY));

    // planned == 0: true teardown, revoke while the connection still exists
    let outcome = handle(
        &mut h,
        Event::BackendUnitDeparted {
            relation: 18,
            departure: DepartureEvent {
                departing_unit: "postgresql/0".into(),
                departing_app: "postgresql".into(),
                planned_units: 0,
            },
        },
    )
    .await;
    assert_eq!(outcome, Outcome::Done);
    let calls = h.authority.calls();
    assert!(
        calls.contains(
            &"remove_auth_function pgbouncer_auth_relation_18 [pgbouncer,postgres]".to_string()
        )
    );
    assert!(calls.contains(&"drop_auth_user pgbouncer_auth_relation_18".to_string()));
}

#[tokio::test]
async fn failed_auth_revocation_blocks_but_does_not_abort_teardown() {
    let mut h = leader_harness(1);
    provision(&mut h).await;

    h.authority.fail_on("remove_auth_function");
    let outcome = handle(
        &mut h,
        Event::BackendUnitDeparted {
            relation: 18,
            departure: DepartureEvent {
                departing_unit: "postgresql/0".into(),
                departing_app: "postgresql".into(),
                planned_units: 0,
            },
        },
    )
    .await;
    // best-effort: the failure surfaces as a blocked status, not an error
    assert_eq!(outcome, Outcome::Done);
    assert!(!h.ctx.health.status().await.is_active());

    // relation-broken still completes the local teardown
    assert_eq!(
        handle(&mut h, Event::BackendRelationBroken { relation: 18 }).await,
        Outcome::Done
    );
    assert!(h.ctx.store.read_auth_file().await.unwrap().is_none());
}

#[tokio::test]
async fn relation_broken_strips_config_and_credentials() {
    let mut h = leader_harness(2);
    provision(&mut h).await;

    assert_eq!(
        handle(
            &mut h,
            Event::BackendUnitDeparted {
                relation: 18,
                departure: DepartureEvent {
                    departing_unit: "postgresql/0".into(),
                    departing_app: "postgresql".into(),
                    planned_units: 0,
                },
            }
        )
        .await,
        Outcome::Done
    );
    assert_eq!(
        handle(&mut h, Event::BackendRelationBroken { relation: 18 }).await,
        Outcome::Done
    );
    assert_eq!(h.reconciler.backend_phase(), RelationPhase::Broken);

    let config = h.ctx.store.load().await.unwrap();
    assert!(!config.settings.contains_key(keys::AUTH_QUERY));
    assert!(!config.settings.contains_key(keys::AUTH_FILE));
    assert!(config.user_list().is_empty());
    assert!(config.databases.is_empty());

    assert!(h.ctx.store.read_auth_file().await.unwrap().is_none());
    assert_eq!(h.ctx.peers.fetch(AUTH_FILE_KEY).await.unwrap(), None);
    assert_eq!(
        h.supervisor.status().await.unwrap()[METRICS_SERVICE],
        ServiceState::Inactive
    );
}

#[tokio::test]
async fn locally_departing_replica_leaves_teardown_to_others() {
    let mut h = leader_harness(1);
    provision(&mut h).await;

    // this replica itself is being removed
    assert_eq!(
        handle(
            &mut h,
            Event::BackendUnitDeparted {
                relation: 18,
                departure: DepartureEvent {
                    departing_unit: "pgbouncer/0".into(),
                    departing_app: "pgbouncer".into(),
                    planned_units: 2,
                },
            }
        )
        .await,
        Outcome::Done
    );
    assert_eq!(h.reconciler.backend_phase(), RelationPhase::Departing);
    // no revocation happened
    assert!(
        !h.authority
            .calls()
            .iter()
            .any(|c| c.starts_with("remove_auth_function"))
    );

    // relation-broken then exits without touching the shared artifacts
    assert_eq!(
        handle(&mut h, Event::BackendRelationBroken { relation: 18 }).await,
        Outcome::Done
    );
    assert_eq!(h.reconciler.backend_phase(), RelationPhase::Broken);
    assert!(h.ctx.store.read_auth_file().await.unwrap().is_some());
    let config = h.ctx.store.load().await.unwrap();
    assert!(config.settings.contains_key(keys::AUTH_QUERY));
}

#[tokio::test]
async fn unchanged_port_produces_no_client_writes() {
    let mut h = leader_harness(1);
    provision(&mut h).await;

    assert_eq!(
        handle(
            &mut h,
            Event::ClientJoined {
                relation: 1,
                kind: ClientKind::Client
            }
        )
        .await,
        Outcome::Done
    );
    let published = h.ctx.settings.client_relations_dir.join("client-1.json");
    assert!(published.exists());
    let mtime = std::fs::metadata(&published).unwrap().modified().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    // same port as currently published: zero downstream relation writes
    assert_eq!(handle(&mut h, Event::UpdateStatus).await, Outcome::Done);
    assert_eq!(
        std::fs::metadata(&published).unwrap().modified().unwrap(),
        mtime
    );

    // a real port move rewrites the publication
    let moved = UserConfig {
        listen_port: 7432,
        ..UserConfig::default()
    };
    assert_eq!(
        handle(&mut h, Event::ConfigChanged { config: moved }).await,
        Outcome::Done
    );
    let text = std::fs::read_to_string(&published).unwrap();
    assert!(text.contains("7432"));
}

#[tokio::test]
async fn follower_waits_then_renders_leader_state() {
    let store: Arc<dyn PeerStore> = Arc::new(InMemoryPeerStore::default());

    // a follower alone has nothing to render
    let mut follower = harness_with(store.clone(), false, "pgbouncer/1", 1);
    let outcome = handle(&mut follower, Event::PoolerReady).await;
    assert!(matches!(outcome, Outcome::Defer(_)));

    // the leader initialises and provisions the backend
    let mut leader = harness_with(store.clone(), true, "pgbouncer/0", 1);
    provision(&mut leader).await;

    // replaying pooler-ready now syncs config and credentials from peers
    assert_eq!(handle(&mut follower, Event::PoolerReady).await, Outcome::Done);
    let config = follower.ctx.store.load().await.unwrap();
    assert!(config.settings.contains_key(keys::AUTH_QUERY));
    assert!(follower.ctx.store.read_auth_file().await.unwrap().is_some());

    // follower config changes never mutate shared state
    let before = follower.ctx.peers.version().await.unwrap();
    assert_eq!(
        handle(
            &mut follower,
            Event::ConfigChanged {
                config: UserConfig::default()
            }
        )
        .await,
        Outcome::Done
    );
    assert_eq!(follower.ctx.peers.version().await.unwrap(), before);
}

#[test]
fn events_parse_from_wire_format() {
    let event: Event = serde_json::from_str(
        r#"{"event":"backend-unit-departed","relation":18,"departing-unit":"postgresql/0","departing-app":"postgresql","planned-units":0}"#,
    )
    .unwrap();
    match event {
        Event::BackendUnitDeparted { relation, departure } => {
            assert_eq!(relation, 18);
            assert_eq!(departure.planned_units, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let event: Event = serde_json::from_str(
        r#"{"event":"backend-database-created","relation":3,"data":{"endpoints":"db:5432","username":"u1","password":"p1","database":"app"}}"#,
    )
    .unwrap();
    match event {
        Event::BackendDatabaseCreated { data, .. } => {
            assert!(data.is_complete());
            assert_eq!(data.primary_endpoint(), Some(("db".to_string(), 5432)));
        }
        other => panic!("unexpected event {other:?}"),
    }

    // config-changed payload is optional
    let event: Event = serde_json::from_str(r#"{"event":"config-changed"}"#).unwrap();
    assert!(matches!(event, Event::ConfigChanged { .. }));
}
