//! Error handling for session reconciliation

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use r3alm_auth::AuthError;

use crate::store::StoreError;

/// Unified error type for the session layer
#[derive(Error, Debug)]
pub enum SessionError {
    /// A provider call did not settle before its deadline
    #[error("identity provider did not answer within {0:?}")]
    Timeout(Duration),

    /// The provider answered with a failure (bad credentials, server error, ...)
    #[error("identity provider error: {0}")]
    Provider(#[from] AuthError),

    /// A session was present but its profile could not be confirmed
    #[error("could not derive user from session: {0}")]
    Derivation(#[source] Box<SessionError>),

    #[error("persistence error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// `start` has not been called on the reconciler
    #[error("session reconciler has not been started")]
    NotStarted,

    /// The reconciliation worker is gone
    #[error("session reconciler has shut down")]
    WorkerClosed,
}

impl SessionError {
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        SessionError::Config(msg.to_string())
    }

    pub fn derivation(cause: SessionError) -> Self {
        SessionError::Derivation(Box::new(cause))
    }

    /// Whether the same call could succeed if tried again later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Timeout(_) => true,
            SessionError::Provider(err) => err.is_recoverable(),
            SessionError::Derivation(cause) => cause.is_recoverable(),
            SessionError::Store(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
