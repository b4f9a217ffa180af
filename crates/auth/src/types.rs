//! Types exchanged with the identity provider

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// ユーザー情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// The stable subject identifier
    pub id: String,

    /// The user's email address
    #[serde(default)]
    pub email: Option<String>,

    /// Free-form profile data; carries `role` and `displayName`
    #[serde(default)]
    pub user_metadata: HashMap<String, serde_json::Value>,

    /// Provider-managed metadata
    #[serde(default)]
    pub app_metadata: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub created_at: Option<String>,

    #[serde(default)]
    pub updated_at: Option<String>,
}

impl UserRecord {
    /// Look up a string entry in `user_metadata`.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.user_metadata.get(key).and_then(|v| v.as_str())
    }
}

/// セッション情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: String,

    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Lifetime in seconds at issue time
    #[serde(default)]
    pub expires_in: i64,

    /// Expiry as a unix timestamp
    #[serde(default)]
    pub expires_at: Option<i64>,

    pub user: UserRecord,

    /// Payload fields this client does not model
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    /// The subject the session was issued for.
    pub fn subject_id(&self) -> &str {
        &self.user.id
    }

    pub fn email(&self) -> Option<&str> {
        self.user.email.as_deref()
    }

    /// Fill in `expires_at` from `expires_in` when the provider omitted it.
    pub(crate) fn stamp_expiry(mut self) -> Self {
        if self.expires_at.is_none() && self.expires_in > 0 {
            self.expires_at = Some(Utc::now().timestamp() + self.expires_in);
        }
        self
    }

    /// Check if the session has expired
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now().timestamp() >= expires_at,
            None => false,
        }
    }
}

/// Kind of auth state change delivered on the push stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthChangeEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
}

impl AuthChangeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialSession => "INITIAL_SESSION",
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::UserUpdated => "USER_UPDATED",
            Self::PasswordRecovery => "PASSWORD_RECOVERY",
        }
    }
}

impl std::fmt::Display for AuthChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery on the auth state-change stream
#[derive(Debug, Clone, PartialEq)]
pub struct AuthStateChange {
    pub event: AuthChangeEvent,
    pub session: Option<Session>,
}

impl AuthStateChange {
    pub fn new(event: AuthChangeEvent, session: Option<Session>) -> Self {
        Self { event, session }
    }
}
