use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::AuthError;
use crate::types::{AuthStateChange, Session, UserRecord};

/// The remote identity service as seen by session consumers.
///
/// Calls may be slow or fail transiently; callers are expected to bound
/// them with their own deadline.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The currently persisted session, if any.
    async fn get_session(&self) -> Result<Option<Session>, AuthError>;

    /// Profile of the user owning the current session.
    async fn get_user(&self) -> Result<UserRecord, AuthError>;

    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> Result<Session, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Receiver for auth state changes. Dropping it unsubscribes.
    fn subscribe_state_changes(&self) -> broadcast::Receiver<AuthStateChange>;
}
