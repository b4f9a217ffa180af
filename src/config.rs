//! Configuration options for the session layer

use std::time::Duration;

use crate::error::{Result, SessionError};

/// Deadline applied to every identity provider call
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Store key holding the last known user
pub const DEFAULT_STORAGE_KEY: &str = "current_user";

/// Configuration options for the session reconciler
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Deadline for `get_session`, `get_user`, sign-in and sign-out
    pub provider_timeout: Duration,

    /// Key under which the current user is persisted
    pub storage_key: String,

    /// Whether the offline demo accounts are accepted by `login`
    pub demo_accounts: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            demo_accounts: true,
        }
    }
}

impl SessionOptions {
    /// Set the provider call deadline
    pub fn with_provider_timeout(mut self, value: Duration) -> Self {
        self.provider_timeout = value;
        self
    }

    /// Set the persistence key
    pub fn with_storage_key(mut self, value: &str) -> Self {
        self.storage_key = value.to_string();
        self
    }

    /// Enable or disable the demo accounts
    pub fn with_demo_accounts(mut self, value: bool) -> Self {
        self.demo_accounts = value;
        self
    }

    /// Defaults overridden by `R3ALM_PROVIDER_TIMEOUT_MS`,
    /// `R3ALM_DEMO_ACCOUNTS` and `R3ALM_STORAGE_KEY` when set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(raw) = lookup("R3ALM_PROVIDER_TIMEOUT_MS") {
            let millis: u64 = raw.trim().parse().map_err(|_| {
                SessionError::config(format!("R3ALM_PROVIDER_TIMEOUT_MS is not a number: {}", raw))
            })?;
            options.provider_timeout = Duration::from_millis(millis);
        }

        if let Some(raw) = lookup("R3ALM_DEMO_ACCOUNTS") {
            options.demo_accounts = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(SessionError::config(format!(
                        "R3ALM_DEMO_ACCOUNTS must be a boolean, got {}",
                        raw
                    )))
                }
            };
        }

        if let Some(raw) = lookup("R3ALM_STORAGE_KEY") {
            if raw.trim().is_empty() {
                return Err(SessionError::config("R3ALM_STORAGE_KEY cannot be empty"));
            }
            options.storage_key = raw.trim().to_string();
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.provider_timeout.is_zero() {
            return Err(SessionError::config("provider timeout must be positive"));
        }
        if self.storage_key.is_empty() {
            return Err(SessionError::config("storage key cannot be empty"));
        }
        Ok(())
    }
}
