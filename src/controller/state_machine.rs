//! Finite state machine for the backend-database relation lifecycle
//!
//! Every lifecycle transition goes through an explicit transition table with
//! guards, so the set of reachable (phase, event) pairs is checkable by
//! inspection and by tests. Handlers never mutate the phase directly; they
//! ask the machine and act on the result.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of the backend-database relation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationPhase {
    /// No backend relation exists.
    #[default]
    Absent,
    /// Relation joined; waiting for the backend to publish credentials.
    Pending,
    /// Credentials present in the relation record; auth artifacts not yet
    /// provisioned.
    Created,
    /// Auth-bridging user, lookup function and credential file in place.
    Ready,
    /// This replica is being removed (scale-down, not teardown).
    Departing,
    /// Relation torn down; auth artifacts destroyed.
    Broken,
}

impl fmt::Display for RelationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelationPhase::Absent => "Absent",
            RelationPhase::Pending => "Pending",
            RelationPhase::Created => "Created",
            RelationPhase::Ready => "Ready",
            RelationPhase::Departing => "Departing",
            RelationPhase::Broken => "Broken",
        };
        f.write_str(name)
    }
}

/// Events that drive relation phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationEvent {
    /// The backend relation appeared.
    Joined,
    /// The backend published endpoint and credentials.
    CredentialsReceived,
    /// Auth user, lookup function and credential file were provisioned.
    AuthInitialised,
    /// The local replica was named as a departing unit.
    UnitDeparted,
    /// The relation is being torn down.
    RelationBroken,
}

impl fmt::Display for RelationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelationEvent::Joined => "Joined",
            RelationEvent::CredentialsReceived => "CredentialsReceived",
            RelationEvent::AuthInitialised => "AuthInitialised",
            RelationEvent::UnitDeparted => "UnitDeparted",
            RelationEvent::RelationBroken => "RelationBroken",
        };
        f.write_str(name)
    }
}

/// Context consulted by transition guards.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Every pooler instance reports Active.
    pub pooler_running: bool,
    /// Endpoint, username and password are present in the relation record.
    pub credentials_present: bool,
}

/// A transition definition.
#[derive(Debug)]
struct Transition {
    from: RelationPhase,
    to: RelationPhase,
    event: RelationEvent,
    description: &'static str,
}

impl Transition {
    const fn new(
        from: RelationPhase,
        to: RelationPhase,
        event: RelationEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a transition.
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: RelationPhase,
        to: RelationPhase,
        event: RelationEvent,
        description: &'static str,
    },
    /// No table entry for (phase, event); benign on event replay.
    InvalidTransition {
        current: RelationPhase,
        event: RelationEvent,
    },
    /// A precondition does not hold yet; the caller defers the event.
    GuardFailed {
        from: RelationPhase,
        to: RelationPhase,
        event: RelationEvent,
        reason: String,
    },
}

/// The relation lifecycle machine.
pub struct RelationStateMachine {
    transitions: Vec<Transition>,
}

impl Default for RelationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RelationStateMachine {
    pub fn new() -> Self {
        use RelationEvent::*;
        use RelationPhase::*;

        Self {
            transitions: vec![
                Transition::new(Absent, Pending, Joined, "backend relation joined"),
                Transition::new(
                    Pending,
                    Created,
                    CredentialsReceived,
                    "backend published endpoint and credentials",
                ),
                Transition::new(
                    Created,
                    Ready,
                    AuthInitialised,
                    "auth user and credential file provisioned",
                ),
                // scale-down of this replica can begin from any live phase
                Transition::new(Pending, Departing, UnitDeparted, "local replica departing"),
                Transition::new(Created, Departing, UnitDeparted, "local replica departing"),
                Transition::new(Ready, Departing, UnitDeparted, "local replica departing"),
                // teardown
                Transition::new(Pending, Broken, RelationBroken, "relation torn down"),
                Transition::new(Created, Broken, RelationBroken, "relation torn down"),
                Transition::new(Ready, Broken, RelationBroken, "relation torn down"),
                Transition::new(Departing, Broken, RelationBroken, "relation torn down"),
                // a new backend relation after teardown
                Transition::new(Broken, Pending, Joined, "new backend relation joined"),
            ],
        }
    }

    /// Attempt a transition for `event` from `current`.
    pub fn transition(
        &self,
        current: RelationPhase,
        event: RelationEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    /// Whether a table entry exists, ignoring guards.
    pub fn can_transition(&self, from: RelationPhase, event: RelationEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    /// Events with a table entry for `phase`.
    pub fn valid_events(&self, phase: RelationPhase) -> Vec<RelationEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == phase)
            .map(|t| t.event)
            .collect()
    }
}

fn check_guard(transition: &Transition, ctx: &TransitionContext) -> Option<String> {
    match (transition.to, transition.event) {
        (RelationPhase::Created, RelationEvent::CredentialsReceived) => {
            if ctx.credentials_present {
                None
            } else {
                Some("relation record is missing endpoint or credentials".to_string())
            }
        }
        (RelationPhase::Ready, RelationEvent::AuthInitialised) => {
            if !ctx.pooler_running {
                Some("pooler instances are not all running".to_string())
            } else if !ctx.credentials_present {
                Some("relation record is missing endpoint or credentials".to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}
