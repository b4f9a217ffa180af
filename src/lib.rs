//! Current-user session handling for the r3alm site
//!
//! The page layer asks one question, "who is signed in", while the answer
//! arrives from several places at once: a user cached on disk from the last
//! run, the identity provider's session check, the provider's push stream,
//! and offline demo accounts. [`SessionContext`] owns a
//! [`SessionReconciler`] that folds all of them into a single value and
//! notifies observers whenever it changes.

pub mod config;
pub mod demo;
pub mod error;
pub mod reconciler;
pub mod state;
pub mod store;
pub mod subscribers;
pub mod timeout;
pub mod user;

use std::sync::Arc;

use r3alm_auth::{AuthClient, AuthOptions, IdentityProvider, ProviderConfig};

use crate::config::SessionOptions;
use crate::error::{Result, SessionError};
use crate::store::LocalPersistenceStore;

pub use crate::reconciler::SessionReconciler;
pub use crate::state::SessionState;
pub use crate::subscribers::Subscription;
pub use crate::user::{Role, User};

/// The session context handed to whatever needs the current user
pub struct SessionContext {
    reconciler: Arc<SessionReconciler>,
    options: SessionOptions,
}

impl SessionContext {
    /// Build a context around any identity provider.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use r3alm_session::{SessionContext, config::SessionOptions, store::MemoryStore};
    /// use r3alm_auth::{AuthClient, AuthOptions};
    ///
    /// let provider = AuthClient::new(
    ///     "https://your-project.supabase.co",
    ///     "your-anon-key",
    ///     reqwest::Client::new(),
    ///     AuthOptions::default(),
    /// );
    /// let context = SessionContext::new(
    ///     Arc::new(provider),
    ///     Arc::new(MemoryStore::new()),
    ///     SessionOptions::default(),
    /// )?;
    /// # Ok::<(), r3alm_session::error::SessionError>(())
    /// ```
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn LocalPersistenceStore>,
        options: SessionOptions,
    ) -> Result<Self> {
        let reconciler = SessionReconciler::new(provider, store, options.clone())?;
        Ok(Self {
            reconciler: Arc::new(reconciler),
            options,
        })
    }

    /// Build a context talking to a Supabase project over HTTP.
    pub fn connect(
        config: &ProviderConfig,
        store: Arc<dyn LocalPersistenceStore>,
        options: SessionOptions,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| SessionError::config(format!("could not build HTTP client: {}", e)))?;
        let provider = AuthClient::from_config(config, http_client, AuthOptions::default());
        Self::new(Arc::new(provider), store, options)
    }

    /// Seed, subscribe to the provider and start the initial session check.
    pub fn start(&self) -> Result<()> {
        self.reconciler.start()
    }

    pub fn auth(&self) -> &SessionReconciler {
        &self.reconciler
    }

    /// Shared handle for tasks that outlive a borrow of the context.
    pub fn reconciler(&self) -> Arc<SessionReconciler> {
        self.reconciler.clone()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn current_user(&self) -> Option<User> {
        self.reconciler.current_user()
    }

    /// Role gate for admin and editor pages.
    pub fn can_access(&self, required: Role) -> bool {
        self.current_user()
            .map(|user| user.has_role(required))
            .unwrap_or(false)
    }
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::config::SessionOptions;
    pub use crate::error::SessionError;
    pub use crate::store::{FileStore, LocalPersistenceStore, MemoryStore};
    pub use crate::{Role, SessionContext, SessionReconciler, SessionState, User};
}
