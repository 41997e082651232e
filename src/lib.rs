//! Operator daemon managing a multi-instance PgBouncer fleet as one logical
//! service: canonical-config reconciliation, leader-authoritative peer
//! replication of config and credentials, supervision of one pooler process
//! per CPU core, and the backend-database relation lifecycle.

pub mod controller;
pub mod health;
pub mod peers;
pub mod pooler;
pub mod relations;
pub mod settings;
pub mod supervision;

pub use controller::{
    CoarseStatus, Context, Error, Event, EventSender, Outcome, Reconciler, RelationPhase, Result,
};
pub use health::{HealthState, run_health_server};
pub use peers::{
    FileLeadership, FilePeerStore, InMemoryPeerStore, LeadershipOracle, PeerState,
    PeerSynchronizer, StaticLeadership,
};
pub use pooler::{ConfigStore, PoolerConfig, ServiceInstance};
pub use settings::{Settings, UserConfig};
pub use supervision::{CtlSupervisor, InMemorySupervisor, ServiceState, ServiceSupervisor};
