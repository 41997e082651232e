//! Error types for the reconciliation controller

use std::time::Duration;

use thiserror::Error;

use crate::peers::PeerError;
use crate::pooler::auth::CredentialError;
use crate::pooler::store::ConfigError;
use crate::relations::postgres::SqlError;
use crate::supervision::SupervisionError;

#[derive(Error, Debug)]
pub enum Error {
    /// No canonical config found locally or in peer state. Followers block
    /// until the leader defines one; the leader synthesizes a default.
    #[error("no pooler configuration available locally or in peer state")]
    ConfigUnavailable,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("supervision error: {0}")]
    Supervision(#[from] SupervisionError),

    /// Entropy or hashing failure: environment defect, never retried.
    #[error("credential generation failed: {0}")]
    CredentialGeneration(#[from] CredentialError),

    #[error("peer state error: {0}")]
    Peer(#[from] PeerError),

    #[error("backend connectivity error: {0}")]
    BackendConnectivity(#[from] SqlError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the triggering event should be re-queued.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Transient by design: resolved by deferral once the leader
            // publishes, the daemon comes up, or the backend responds.
            Error::ConfigUnavailable => true,
            Error::Supervision(e) => e.is_retryable(),
            Error::BackendConnectivity(_) => true,
            Error::Io(_) => true,
            Error::Peer(e) => match e {
                // the expected follower branch; handlers take it before it
                // gets here, and it must never loop
                PeerError::NotLeader => false,
                PeerError::Corrupt(_) => false,
                PeerError::Io(_) => true,
            },
            Error::Config(e) => match e {
                ConfigError::Unavailable => true,
                ConfigError::Parse(_) => false,
                ConfigError::Io(_) => true,
            },
            Error::CredentialGeneration(_) => false,
        }
    }
}

impl From<crate::pooler::auth::RotateError> for Error {
    fn from(e: crate::pooler::auth::RotateError) -> Self {
        use crate::pooler::auth::RotateError;
        match e {
            RotateError::Credential(c) => Error::CredentialGeneration(c),
            RotateError::Peer(p) => Error::Peer(p),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff for deferred events.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt.min(16) as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        Duration::from_secs_f64(delay_with_jitter.min(self.max_delay.as_secs_f64()))
    }
}

/// Consecutive-failure tracking across reconciliation passes.
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
}

impl ErrorContext {
    pub fn record_error(&mut self, error: &Error) {
        self.consecutive_errors += 1;
        self.last_error = Some(error.to_string());
    }

    /// Reset on a successful pass.
    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
        self.last_error = None;
    }
}
