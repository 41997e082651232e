//! Reconciliation controller: event loop, relation state machine, status

pub mod context;
pub mod error;
pub mod reconciler;
pub mod state_machine;
pub mod status;

pub use context::Context;
pub use error::{BackoffConfig, Error, ErrorContext, Result};
pub use reconciler::{Event, EventSender, Outcome, Reconciler};
pub use state_machine::{RelationEvent, RelationPhase, RelationStateMachine, TransitionContext};
pub use status::{CoarseStatus, StatusReport, assess};
