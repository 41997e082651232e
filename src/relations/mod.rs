//! Relation records and external collaborators

pub mod backend;
pub mod clients;
pub mod postgres;

pub use backend::{BackendData, BackendRelation, DepartureAction, DepartureEvent, departure_action};
pub use clients::{ClientKind, ClientPublisher, ClientRelation, ConnectionInfo};
pub use postgres::{BackendAuthority, PgBackendAuthority, SqlError};
