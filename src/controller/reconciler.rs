//! Reconciliation controller
//!
//! The top-level control loop. One triggering event is processed to
//! completion before the next is admitted; within a pass the order is
//! strict: config mutation → peer publication → per-instance render →
//! restart requests. Transient unavailability (supervision not up, peer
//! state not populated, backend refusing connections) defers the event:
//! it is re-queued with exponential backoff rather than failed, and every
//! handler is idempotent so replaying a deferred event is safe.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, ErrorContext, Result};
use crate::controller::state_machine::{
    RelationEvent, RelationPhase, RelationStateMachine, TransitionContext, TransitionResult,
};
use crate::controller::status::{CoarseStatus, assess};
use crate::peers::{AUTH_FILE_KEY, CANONICAL_CONFIG_KEY, MONITORING_PASSWORD_KEY, PeerError, PeerSynchronizer};
use crate::pooler::auth;
use crate::pooler::config::{PoolerConfig, keys};
use crate::pooler::store::{ApplyOutcome, ConfigError};
use crate::relations::backend::{
    BackendData, BackendRelation, DepartureAction, DepartureEvent, departure_action,
};
use crate::relations::clients::{ClientKind, ClientRelation, ConnectionInfo};
use crate::settings::UserConfig;
use crate::supervision::{
    METRICS_SERVICE, SupervisionError, fleet_health, logrotate_service, monitoring_service,
    pooler_services,
};

/// External triggering events, as delivered over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// The supervision layer is ready to accept declarations.
    PoolerReady,
    /// Operator-supplied configuration changed.
    ConfigChanged {
        #[serde(default)]
        config: UserConfig,
    },
    /// Periodic status refresh.
    UpdateStatus,
    BackendJoined {
        relation: u32,
        #[serde(default)]
        app: Option<String>,
    },
    BackendDatabaseCreated {
        relation: u32,
        data: BackendData,
    },
    BackendEndpointsChanged {
        relation: u32,
        data: BackendData,
    },
    BackendRelationChanged {
        relation: u32,
        data: BackendData,
    },
    BackendUnitDeparted {
        relation: u32,
        #[serde(flatten)]
        departure: DepartureEvent,
    },
    BackendRelationBroken {
        relation: u32,
    },
    ClientJoined {
        relation: u32,
        kind: ClientKind,
    },
    ClientDeparted {
        relation: u32,
    },
}

/// How a handler left the triggering event.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// A precondition does not hold yet; re-queue and retry later.
    Defer(String),
}

enum TransitionOutcome {
    Moved,
    /// No table entry for the replayed event; benign.
    Stayed,
    Deferred(String),
}

/// Submits events into the controller queue.
#[derive(Clone)]
pub struct EventSender(mpsc::Sender<(Event, u32)>);

impl EventSender {
    pub async fn submit(&self, event: Event) -> bool {
        self.0.send((event, 0)).await.is_ok()
    }

    /// Non-blocking submit for periodic ticks; drops the event when the
    /// queue is full (the next tick will fire anyway).
    pub fn try_submit(&self, event: Event) -> bool {
        self.0.try_send((event, 0)).is_ok()
    }
}

/// The reconciliation controller owning all replica-local mutable state.
pub struct Reconciler {
    ctx: Arc<Context>,
    machine: RelationStateMachine,
    backend: BackendRelation,
    clients: Vec<ClientRelation>,
    user_config: UserConfig,
    /// Peer-state version this replica last rendered from.
    last_synced_version: u64,
    /// Whether the pooler-ready pass has completed on this replica.
    initialised: bool,
    backoff: BackoffConfig,
    errors: ErrorContext,
    tx: mpsc::Sender<(Event, u32)>,
    rx: mpsc::Receiver<(Event, u32)>,
}

impl Reconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self::with_backoff(ctx, BackoffConfig::default())
    }

    pub fn with_backoff(ctx: Arc<Context>, backoff: BackoffConfig) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            ctx,
            machine: RelationStateMachine::new(),
            backend: BackendRelation::default(),
            clients: Vec::new(),
            user_config: UserConfig::default(),
            last_synced_version: 0,
            initialised: false,
            backoff,
            errors: ErrorContext::default(),
            tx,
            rx,
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender(self.tx.clone())
    }

    pub fn backend_phase(&self) -> RelationPhase {
        self.backend.phase
    }

    /// Consume events until every sender is dropped.
    pub async fn run(mut self) {
        info!(unit = %self.ctx.peers.unit(), "reconciliation controller started");
        while let Some((event, attempt)) = self.rx.recv().await {
            debug!(?event, attempt, "processing event");
            match self.handle_event(&event).await {
                Ok(Outcome::Done) => {
                    self.errors.reset();
                    self.ctx.health.metrics.reconciliations_total.inc();
                }
                Ok(Outcome::Defer(reason)) => {
                    info!(%reason, attempt, "deferring event");
                    self.ctx.health.metrics.deferrals_total.inc();
                    self.requeue(event, attempt);
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, attempt, "retryable reconciliation failure");
                    self.errors.record_error(&e);
                    self.ctx.health.metrics.deferrals_total.inc();
                    self.requeue(event, attempt);
                }
                Err(e) => {
                    error!(error = %e, "reconciliation failed");
                    self.errors.record_error(&e);
                    self.ctx.health.metrics.reconciliation_errors_total.inc();
                    self.ctx
                        .health
                        .set_status(CoarseStatus::blocked(e.to_string()))
                        .await;
                }
            }
        }
    }

    /// Synchronise from peers, then dispatch one event. Exposed so tests can
    /// drive the controller without the queue.
    pub async fn handle_event(&mut self, event: &Event) -> Result<Outcome> {
        if let Err(e) = self.sync_from_peers().await {
            warn!(error = %e, "peer synchronisation failed");
        }
        self.dispatch(event).await
    }

    fn requeue(&self, event: Event, attempt: u32) {
        let delay = self.backoff.delay_for_attempt(attempt);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send((event, attempt + 1)).await;
        });
    }

    async fn dispatch(&mut self, event: &Event) -> Result<Outcome> {
        match event {
            Event::PoolerReady => self.on_pooler_ready().await,
            Event::ConfigChanged { config } => self.on_config_changed(config).await,
            Event::UpdateStatus => self.on_update_status().await,
            Event::BackendJoined { relation, app } => {
                self.ensure_backend(*relation, app.as_deref());
                Ok(Outcome::Done)
            }
            Event::BackendDatabaseCreated { relation, data } => {
                self.on_database_created(*relation, data).await
            }
            Event::BackendEndpointsChanged { relation, data } => {
                self.on_endpoints_changed(*relation, data).await
            }
            Event::BackendRelationChanged { relation, data } => {
                self.on_backend_changed(*relation, data).await
            }
            Event::BackendUnitDeparted { relation, departure } => {
                self.on_unit_departed(*relation, departure).await
            }
            Event::BackendRelationBroken { relation } => self.on_relation_broken(*relation).await,
            Event::ClientJoined { relation, kind } => self.on_client_joined(*relation, *kind).await,
            Event::ClientDeparted { relation } => self.on_client_departed(*relation).await,
        }
    }

    // =====================
    //  Peer synchronisation
    // =====================

    /// Pull canonical config and credential file when a newer peer-state
    /// version is observed; a replica must re-render before reporting itself
    /// healthy.
    async fn sync_from_peers(&mut self) -> Result<()> {
        let version = self.ctx.peers.version().await?;
        if version <= self.last_synced_version {
            return Ok(());
        }
        debug!(
            version,
            last = self.last_synced_version,
            "observed newer peer state, re-rendering"
        );

        let mut changed = false;
        if let Some(blob) = self.ctx.peers.fetch(CANONICAL_CONFIG_KEY).await? {
            let config = PoolerConfig::parse(&blob).map_err(ConfigError::from)?;
            if self.ctx.store.apply(&config).await? == ApplyOutcome::Written {
                changed = true;
            }
        }
        match self.ctx.peers.fetch(AUTH_FILE_KEY).await? {
            Some(blob) => {
                if self.ctx.store.write_auth_file(&blob).await? == ApplyOutcome::Written {
                    changed = true;
                }
            }
            None => self.ctx.store.delete_auth_file().await?,
        }

        if changed && self.initialised {
            self.restart_pooler(false).await?;
        }
        self.last_synced_version = version;
        Ok(())
    }

    /// Persist locally and, on the leader, replicate to peers. Restarting is
    /// left to the caller so several mutations can share one restart.
    async fn apply_config(&mut self, config: &PoolerConfig) -> Result<ApplyOutcome> {
        let outcome = self.ctx.store.apply(config).await?;
        if outcome == ApplyOutcome::Written {
            match self
                .ctx
                .peers
                .publish(CANONICAL_CONFIG_KEY, Some(&config.render()))
                .await
            {
                Ok(()) => {}
                // followers render locally; the leader owns replication
                Err(PeerError::NotLeader) => debug!("not leader, skipping canonical publish"),
                Err(e) => return Err(e.into()),
            }
            self.last_synced_version = self.ctx.peers.version().await?;
        }
        Ok(outcome)
    }

    // ==================
    //  Service lifecycle
    // ==================

    fn instance_names(&self) -> Vec<String> {
        self.ctx
            .store
            .instances()
            .iter()
            .map(|i| i.service_name())
            .collect()
    }

    /// Restart the fleet in fixed order: pooler instances first, then the
    /// exporter (its command line embeds credentials that must be valid by
    /// the time it starts).
    async fn restart_pooler(&self, include_exporter: bool) -> Result<(), SupervisionError> {
        let mut names = self.instance_names();
        if include_exporter {
            names.push(METRICS_SERVICE.to_string());
        }
        self.ctx.health.metrics.restarts_total.inc();
        self.ctx.supervisor.restart(&names).await
    }

    /// Declare the full service set: N pooler instances, the exporter
    /// (enabled only with a ready backend) and the log-rotation task.
    async fn declare_services(&self) -> Result<()> {
        let mut services = pooler_services(self.ctx.store.instances());
        services.push(self.monitoring_spec(self.backend.phase == RelationPhase::Ready).await?);
        services.push(logrotate_service(&self.instance_names()));
        self.ctx.supervisor.declare(&services).await?;
        Ok(())
    }

    async fn monitoring_spec(&self, enabled: bool) -> Result<crate::supervision::ServiceSpec> {
        let password = if enabled {
            self.ctx
                .peers
                .fetch(MONITORING_PASSWORD_KEY)
                .await?
                .unwrap_or_default()
        } else {
            String::new()
        };
        let stats_user = BackendRelation::stats_user(&self.ctx.settings.app_name);
        Ok(monitoring_service(
            enabled,
            &stats_user,
            &password,
            self.current_listen_port().await,
            &self.instance_names(),
        ))
    }

    /// Toggle the exporter without removing its declaration.
    async fn declare_monitoring(&self, enabled: bool) -> Result<()> {
        let spec = self.monitoring_spec(enabled).await?;
        self.ctx.supervisor.declare(std::slice::from_ref(&spec)).await?;
        if !enabled {
            match self.ctx.supervisor.stop(METRICS_SERVICE).await {
                Ok(()) | Err(SupervisionError::NotDeclared(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn pooler_running(&self) -> bool {
        match self.ctx.supervisor.status().await {
            Ok(status) => fleet_health(&status, self.ctx.store.instances(), false).is_ok(),
            Err(_) => false,
        }
    }

    async fn current_listen_port(&self) -> u16 {
        match self.ctx.store.load().await {
            Ok(config) => config.listen_port().unwrap_or(self.user_config.listen_port),
            Err(_) => self.user_config.listen_port,
        }
    }

    // ================
    //  Relation state
    // ================

    fn transition(&mut self, event: RelationEvent, ctx: &TransitionContext) -> TransitionOutcome {
        match self.machine.transition(self.backend.phase, event, ctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                info!(%from, %to, %event, description, "backend relation transition");
                self.backend.phase = to;
                TransitionOutcome::Moved
            }
            TransitionResult::InvalidTransition { current, .. } => {
                debug!(phase = %current, %event, "replayed relation event ignored");
                TransitionOutcome::Stayed
            }
            TransitionResult::GuardFailed { reason, .. } => TransitionOutcome::Deferred(reason),
        }
    }

    fn ensure_backend(&mut self, relation: u32, app: Option<&str>) {
        if self.backend.id != Some(relation)
            || matches!(self.backend.phase, RelationPhase::Absent | RelationPhase::Broken)
        {
            self.transition(RelationEvent::Joined, &TransitionContext::default());
            self.backend.id = Some(relation);
            self.backend.data = BackendData::default();
        }
        if let Some(app) = app {
            self.backend.app = Some(app.to_string());
        }
    }

    // ===============
    //  Event handlers
    // ===============

    /// First initialisation of the replica: resolve a canonical config
    /// (disk, then peers, then a leader-synthesized default), lay out the
    /// filesystem and declare the service set.
    async fn on_pooler_ready(&mut self) -> Result<Outcome> {
        let config = match self.ctx.store.load().await {
            Ok(config) => config,
            Err(ConfigError::Unavailable) => {
                match self.ctx.peers.fetch(CANONICAL_CONFIG_KEY).await? {
                    Some(blob) => PoolerConfig::parse(&blob).map_err(ConfigError::from)?,
                    None if self.ctx.peers.is_leader() => PoolerConfig::default_config(
                        &self.user_config,
                        &self.ctx.settings.data_dir,
                        &self.ctx.settings.log_dir,
                    ),
                    // followers wait for the leader to define one
                    None => return Ok(Outcome::Defer("waiting for the leader to define a config".into())),
                }
            }
            Err(e) => return Err(e.into()),
        };

        self.ctx.store.ensure_layout().await?;
        self.apply_config(&config).await?;
        self.declare_services().await?;
        self.initialised = true;

        if self.backend.data.is_complete() {
            self.refresh_backend_endpoints().await?;
        }
        info!(
            instances = self.ctx.store.instances().len(),
            "pooler services initialised"
        );
        Ok(Outcome::Done)
    }

    /// Operator config changed. Leader-only: followers pick the resulting
    /// canonical config up through peer sync.
    async fn on_config_changed(&mut self, user: &UserConfig) -> Result<Outcome> {
        if !self.ctx.peers.is_leader() {
            self.user_config = user.clone();
            return Ok(Outcome::Done);
        }
        let mut config = match self.ctx.store.load().await {
            Ok(config) => config,
            Err(ConfigError::Unavailable) => {
                return Ok(Outcome::Defer("config not yet initialised".into()));
            }
            Err(e) => return Err(e.into()),
        };

        config.apply_user_config(user, self.ctx.store.instances().len());
        if config.listen_port() != Some(user.listen_port) {
            // a port move emits downstream relation updates, so only touch
            // the key when it actually moved
            self.publish_client_info(user.listen_port).await?;
            config
                .settings
                .insert(keys::LISTEN_PORT.into(), user.listen_port.to_string());
        }
        self.user_config = user.clone();

        // batched update: one restart for all of the mutations above
        if self.apply_config(&config).await? == ApplyOutcome::Written && self.initialised {
            self.restart_pooler(false).await?;
        }
        Ok(Outcome::Done)
    }

    /// Periodic pass: refresh client connection info (no event fires when a
    /// leader is removed) and reassess health.
    async fn on_update_status(&mut self) -> Result<Outcome> {
        let port = self.current_listen_port().await;
        self.publish_client_info(port).await?;
        self.refresh_status().await;
        Ok(Outcome::Done)
    }

    /// The backend created our database and published credentials: provision
    /// the auth-bridging machinery and wire the pooler to it.
    async fn on_database_created(&mut self, relation: u32, data: &BackendData) -> Result<Outcome> {
        self.ensure_backend(relation, None);
        self.backend.data = data.clone();

        let pooler_running = self.pooler_running().await;
        let guard_ctx = TransitionContext {
            pooler_running,
            credentials_present: data.is_complete(),
        };
        if let TransitionOutcome::Deferred(reason) =
            self.transition(RelationEvent::CredentialsReceived, &guard_ctx)
        {
            return Ok(Outcome::Defer(reason));
        }
        if !self.ctx.peers.is_leader() {
            // followers receive the auth file and config via peer sync
            return Ok(Outcome::Done);
        }
        if !pooler_running {
            return Ok(Outcome::Defer("pooler instances not yet running".into()));
        }
        let Some(auth_user) = self.backend.auth_user() else {
            return Ok(Outcome::Defer("backend credentials not yet published".into()));
        };

        info!(relation, "initialising backend database relation");

        // auth-bridging user and lookup function on the backend
        let (_password, hashed) = auth::provision_user(&auth_user)?;
        self.ctx
            .authority
            .ensure_auth_user(&self.backend.data, &auth_user, &hashed)
            .await?;
        self.ctx
            .authority
            .install_auth_function(
                &self.backend.data,
                &auth_user,
                &self.backend.auth_function_databases(),
            )
            .await?;

        // monitoring user, reusing the shared secret across replays
        let stats_user = BackendRelation::stats_user(&self.ctx.settings.app_name);
        let monitoring_password =
            auth::rotate_or_reuse(&self.ctx.peers, MONITORING_PASSWORD_KEY).await?;
        let hashed_monitoring = auth::hash_password(&stats_user, &monitoring_password);

        let entries = BTreeMap::from([
            (auth_user.clone(), hashed),
            (stats_user.clone(), hashed_monitoring),
        ]);
        let auth_blob = auth::render_auth_file(&entries);
        self.ctx.store.write_auth_file(&auth_blob).await?;
        match self.ctx.peers.publish(AUTH_FILE_KEY, Some(&auth_blob)).await {
            Ok(()) | Err(PeerError::NotLeader) => {}
            Err(e) => return Err(e.into()),
        }
        self.last_synced_version = self.ctx.peers.version().await?;

        // wire the pooler to the lookup function
        let mut config = match self.ctx.store.load().await {
            Ok(config) => config,
            Err(ConfigError::Unavailable) => {
                return Ok(Outcome::Defer("config not yet initialised".into()));
            }
            Err(e) => return Err(e.into()),
        };
        config.add_stats_user(&stats_user);
        if let Some(query) = self.backend.auth_query() {
            config.settings.insert(keys::AUTH_QUERY.into(), query);
        }
        config.settings.insert(
            keys::AUTH_FILE.into(),
            self.ctx.store.auth_file_path().display().to_string(),
        );
        self.backend.refresh_database_entries(&mut config);
        self.apply_config(&config).await?;

        self.declare_monitoring(true).await?;
        self.restart_pooler(true).await?;

        self.transition(
            RelationEvent::AuthInitialised,
            &TransitionContext {
                pooler_running: true,
                credentials_present: true,
            },
        );
        let port = self.current_listen_port().await;
        self.publish_client_info(port).await?;
        info!("backend database relation initialised");
        Ok(Outcome::Done)
    }

    /// Endpoint changes refresh config and consumers but never change the
    /// relation phase.
    async fn on_endpoints_changed(&mut self, relation: u32, data: &BackendData) -> Result<Outcome> {
        self.ensure_backend(relation, None);
        self.backend.data.endpoints = data.endpoints.clone();
        self.backend.data.read_only_endpoints = data.read_only_endpoints.clone();

        self.refresh_backend_endpoints().await?;
        let port = self.current_listen_port().await;
        self.publish_client_info(port).await?;
        Ok(Outcome::Done)
    }

    async fn on_backend_changed(&mut self, relation: u32, data: &BackendData) -> Result<Outcome> {
        self.ensure_backend(relation, None);
        self.backend.data = data.clone();

        if data.is_complete() {
            let ctx = TransitionContext {
                pooler_running: self.pooler_running().await,
                credentials_present: true,
            };
            self.transition(RelationEvent::CredentialsReceived, &ctx);
        }
        if !self.pooler_running().await {
            debug!("relation-changed early exit: pooler not running");
            return Ok(Outcome::Done);
        }
        self.refresh_backend_endpoints().await?;
        let port = self.current_listen_port().await;
        self.publish_client_info(port).await?;
        Ok(Outcome::Done)
    }

    /// Disambiguate a departing unit against one consistent peer snapshot,
    /// and revoke auth eagerly on true teardown: the backend connection the
    /// revocation needs is only guaranteed to exist until relation-broken.
    async fn on_unit_departed(
        &mut self,
        relation: u32,
        departure: &DepartureEvent,
    ) -> Result<Outcome> {
        self.ensure_backend(relation, None);
        let port = self.current_listen_port().await;
        self.publish_client_info(port).await?;
        self.refresh_backend_endpoints().await?;

        let snapshot = self.ctx.peers.snapshot().await?;
        let action = departure_action(
            departure,
            &self.ctx.settings.unit_name,
            self.backend.app_name(),
            self.ctx.peers.is_leader(),
            snapshot.units.len().max(1),
        );
        match action {
            DepartureAction::MarkLocalDeparting => {
                self.ctx.peers.mark_departing(relation).await?;
                self.transition(RelationEvent::UnitDeparted, &TransitionContext::default());
                info!(relation, "flagged local replica as departing");
                Ok(Outcome::Done)
            }
            DepartureAction::Ignore => Ok(Outcome::Done),
            DepartureAction::SkipScaleDown => {
                debug!(
                    planned = departure.planned_units,
                    peers = snapshot.units.len(),
                    "backend scaling down, keeping auth artifacts"
                );
                Ok(Outcome::Done)
            }
            DepartureAction::RevokeAuth => {
                let Some(auth_user) = self.backend.auth_user() else {
                    return Ok(Outcome::Done);
                };
                info!(relation, "removing auth user before relation break");

                let mut revoke = self
                    .ctx
                    .authority
                    .remove_auth_function(
                        &self.backend.data,
                        &auth_user,
                        &self.backend.auth_function_databases(),
                    )
                    .await;
                if revoke.is_ok() {
                    revoke = self
                        .ctx
                        .authority
                        .drop_auth_user(&self.backend.data, &auth_user)
                        .await;
                }
                if let Err(e) = revoke {
                    // best-effort: teardown continues, the operator sees why
                    error!(error = %e, "failed to remove auth user when disconnecting from backend");
                    self.ctx
                        .health
                        .set_status(CoarseStatus::blocked(
                            "failed to remove auth user when disconnecting from backend",
                        ))
                        .await;
                    return Ok(Outcome::Done);
                }

                let mut config = match self.ctx.store.load().await {
                    Ok(config) => config,
                    Err(ConfigError::Unavailable) => return Ok(Outcome::Done),
                    Err(e) => return Err(e.into()),
                };
                config.remove_user(&auth_user);
                if self.apply_config(&config).await? == ApplyOutcome::Written && self.initialised {
                    self.restart_pooler(false).await?;
                }
                info!("pooler auth user removed");
                Ok(Outcome::Done)
            }
        }
    }

    /// Remove every trace of the relation. Auth revocation already happened
    /// in the departed handler (the backend connection may be gone by now);
    /// here the leader strips config and credentials.
    async fn on_relation_broken(&mut self, relation: u32) -> Result<Outcome> {
        self.ensure_backend(relation, None);
        self.declare_monitoring(false).await?;

        let snapshot = self.ctx.peers.snapshot().await?;
        let departing =
            PeerSynchronizer::is_departing(&snapshot, self.ctx.peers.unit(), relation);
        if departing || !self.ctx.peers.is_leader() {
            info!("exiting relation-broken handler, teardown handled elsewhere");
            self.transition(RelationEvent::RelationBroken, &TransitionContext::default());
            return Ok(Outcome::Done);
        }

        let mut config = match self.ctx.store.load().await {
            Ok(config) => config,
            Err(ConfigError::Unavailable) => {
                return Ok(Outcome::Defer("config not available for teardown".into()));
            }
            Err(e) => return Err(e.into()),
        };
        self.backend
            .strip_auth_artifacts(&mut config, &self.ctx.settings.app_name);
        self.apply_config(&config).await?;

        self.ctx.store.delete_auth_file().await?;
        match self.ctx.peers.publish(AUTH_FILE_KEY, None).await {
            Ok(()) | Err(PeerError::NotLeader) => {}
            Err(e) => return Err(e.into()),
        }
        self.last_synced_version = self.ctx.peers.version().await?;

        if self.initialised {
            self.restart_pooler(false).await?;
        }
        self.transition(RelationEvent::RelationBroken, &TransitionContext::default());
        info!("removed backend relation from pooler config");
        Ok(Outcome::Done)
    }

    async fn on_client_joined(&mut self, relation: u32, kind: ClientKind) -> Result<Outcome> {
        if !self.clients.iter().any(|c| c.id == relation) {
            self.clients.push(ClientRelation { id: relation, kind });
        }
        let port = self.current_listen_port().await;
        self.publish_client_info(port).await?;
        Ok(Outcome::Done)
    }

    async fn on_client_departed(&mut self, relation: u32) -> Result<Outcome> {
        self.clients.retain(|c| c.id != relation);
        self.ctx.clients.retract(relation).await?;
        Ok(Outcome::Done)
    }

    // ========
    //  Status
    // ========

    /// Publish the listen endpoint to every consumer relation; a no-op
    /// without a connectable backend.
    async fn publish_client_info(&self, port: u16) -> Result<()> {
        let info = ConnectionInfo {
            host: self.ctx.settings.external_host.clone(),
            port,
            read_only_endpoints: self.backend.data.read_only_endpoints.clone(),
        };
        let written = self
            .ctx
            .clients
            .publish(&self.clients, &info, self.backend.data.is_complete())
            .await?;
        if !written.is_empty() {
            info!(relations = written.len(), port, "published client connection info");
        }
        Ok(())
    }

    /// Refresh backend endpoint entries in the canonical config
    /// (leader-only, like every canonical mutation).
    async fn refresh_backend_endpoints(&mut self) -> Result<()> {
        if !self.ctx.peers.is_leader() || !self.backend.data.is_complete() {
            return Ok(());
        }
        let mut config = match self.ctx.store.load().await {
            Ok(config) => config,
            Err(ConfigError::Unavailable) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.backend.refresh_database_entries(&mut config);
        if self.apply_config(&config).await? == ApplyOutcome::Written && self.initialised {
            self.restart_pooler(false).await?;
        }
        Ok(())
    }

    /// Backend relation readiness: credentials present, pooler wired to the
    /// lookup function, credential file on disk, backend reachable.
    async fn backend_ready(&self) -> bool {
        if !self.backend.data.is_complete() {
            return false;
        }
        let Ok(config) = self.ctx.store.load().await else {
            return false;
        };
        if !config.settings.contains_key(keys::AUTH_QUERY) {
            return false;
        }
        if !matches!(self.ctx.store.read_auth_file().await, Ok(Some(_))) {
            return false;
        }
        self.ctx.authority.probe(&self.backend.data).await.is_ok()
    }

    /// Derive and publish the coarse replica status.
    pub async fn refresh_status(&self) {
        let supervision = self.ctx.supervisor.status().await;
        let backend_ready = self.backend_ready().await;
        let status = assess(
            self.backend.phase,
            backend_ready,
            &supervision,
            self.ctx.store.instances(),
        );
        self.ctx.health.set_status(status).await;
    }
}
