//! Coarse operator status
//!
//! The externally visible health of one replica: `blocked` (no backend /
//! backend not ready / a named service not running), `waiting` (supervision
//! or connectivity not yet available) or `active` (nominal). Derivation is a
//! pure function over the relation phase and the supervision status map so
//! it can be tested without any collaborator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::controller::state_machine::RelationPhase;
use crate::pooler::instance::ServiceInstance;
use crate::supervision::{ServiceState, SupervisionError, fleet_health};

/// Externally reported replica status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CoarseStatus {
    Blocked { message: String },
    Waiting { message: String },
    Active,
}

impl CoarseStatus {
    pub fn blocked(message: impl Into<String>) -> Self {
        CoarseStatus::Blocked {
            message: message.into(),
        }
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        CoarseStatus::Waiting {
            message: message.into(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, CoarseStatus::Active)
    }
}

/// Derive the coarse status from one pass of observations.
///
/// `supervision` is the status-map result of the supervision adapter; an
/// error there means the control channel is not yet reachable (waiting, not
/// blocked: the daemon may still be starting).
pub fn assess(
    backend_phase: RelationPhase,
    backend_ready: bool,
    supervision: &Result<BTreeMap<String, ServiceState>, SupervisionError>,
    instances: &[ServiceInstance],
) -> CoarseStatus {
    match backend_phase {
        RelationPhase::Absent | RelationPhase::Broken => {
            return CoarseStatus::blocked("waiting for backend database relation to initialise");
        }
        _ if !backend_ready => {
            return CoarseStatus::blocked("backend database relation not ready");
        }
        _ => {}
    }

    let status = match supervision {
        Ok(status) => status,
        Err(e) => return CoarseStatus::waiting(format!("pooler not running: {e}")),
    };

    match fleet_health(status, instances, backend_ready) {
        Ok(()) => CoarseStatus::Active,
        Err(message) => CoarseStatus::blocked(message),
    }
}

/// Status holder recording the last transition time; the timestamp only
/// moves when the status actually changes.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub status: CoarseStatus,
    pub since: DateTime<Utc>,
}

impl StatusReport {
    pub fn new(status: CoarseStatus) -> Self {
        Self {
            status,
            since: Utc::now(),
        }
    }

    /// Update to `status`, keeping `since` when nothing changed.
    pub fn update(&mut self, status: CoarseStatus) {
        if self.status != status {
            self.status = status;
            self.since = Utc::now();
        }
    }
}

impl Default for StatusReport {
    fn default() -> Self {
        Self::new(CoarseStatus::waiting("starting"))
    }
}
