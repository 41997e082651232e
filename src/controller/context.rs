//! Shared context for the reconciliation controller

use std::sync::Arc;

use crate::health::HealthState;
use crate::peers::PeerSynchronizer;
use crate::pooler::store::ConfigStore;
use crate::relations::clients::ClientPublisher;
use crate::relations::postgres::BackendAuthority;
use crate::settings::Settings;
use crate::supervision::ServiceSupervisor;

/// Immutable handles shared by every reconciliation pass.
pub struct Context {
    pub settings: Settings,
    pub store: ConfigStore,
    pub peers: PeerSynchronizer,
    pub supervisor: Arc<dyn ServiceSupervisor>,
    pub authority: Arc<dyn BackendAuthority>,
    pub clients: ClientPublisher,
    pub health: Arc<HealthState>,
}
