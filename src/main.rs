use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tracing::{error, info, warn};

use pgbouncer_operator::controller::{Context, Event, EventSender, Reconciler};
use pgbouncer_operator::health::{HealthState, run_health_server};
use pgbouncer_operator::peers::{FileLeadership, FilePeerStore, PeerSynchronizer};
use pgbouncer_operator::pooler::{ConfigStore, instance_fleet};
use pgbouncer_operator::relations::postgres::PgBackendAuthority;
use pgbouncer_operator::relations::clients::ClientPublisher;
use pgbouncer_operator::settings::Settings;
use pgbouncer_operator::supervision::CtlSupervisor;

/// Cadence of the periodic status pass.
const UPDATE_STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pgbouncer_operator=info".parse()?),
        )
        .init();

    let settings = Settings::from_env();
    info!(
        unit = %settings.unit_name,
        data_dir = %settings.data_dir.display(),
        "starting pgbouncer-operator"
    );

    let instances = instance_fleet(&settings);
    info!(instances = instances.len(), "detected pooler instance fleet");

    let peers = PeerSynchronizer::new(
        Arc::new(FilePeerStore::new(&settings.peer_state_path)),
        Arc::new(FileLeadership::new(&settings.leader_file, &settings.unit_name)),
        settings.unit_name.clone(),
    );
    peers.register_unit().await?;

    let health = Arc::new(HealthState::new());
    let ctx = Arc::new(Context {
        store: ConfigStore::new(&settings.data_dir, instances),
        peers,
        supervisor: Arc::new(CtlSupervisor::new(&settings.supervisor_ctl)),
        authority: Arc::new(PgBackendAuthority),
        clients: ClientPublisher::new(&settings.client_relations_dir),
        health: health.clone(),
        settings,
    });

    let reconciler = Reconciler::new(ctx.clone());
    let sender = reconciler.sender();

    // health/metrics endpoint
    let health_addr = ctx.settings.health_addr;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health, health_addr).await {
            error!(error = %e, "health server terminated");
        }
    });

    // lifecycle events arrive over the control socket
    let socket_path = ctx.settings.control_socket.clone();
    let socket_sender = sender.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_control_socket(&socket_path, socket_sender).await {
            error!(error = %e, "control socket terminated");
        }
    });

    // periodic status pass
    let tick_sender = sender.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPDATE_STATUS_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            tick_sender.try_submit(Event::UpdateStatus);
        }
    });

    // kick off initialisation; deferred until the supervision daemon is up
    sender.submit(Event::PoolerReady).await;

    reconciler.run().await;
    Ok(())
}

/// Accept connections on the control socket and feed newline-delimited JSON
/// events into the controller queue.
async fn serve_control_socket(path: &Path, sender: EventSender) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(path)?;
    info!(socket = %path.display(), "control socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let sender = sender.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<Event>(&line) {
                        Ok(event) => {
                            if !sender.submit(event).await {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "discarding malformed event"),
                    },
                    Ok(None) => return,
                    Err(e) => {
                        warn!(error = %e, "control connection read failed");
                        return;
                    }
                }
            }
        });
    }
}
