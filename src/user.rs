//! The current-user view model and the role hierarchy

use serde::{Deserialize, Serialize};
use std::fmt;

use r3alm_auth::{Session, UserRecord};

/// Site role, ordered `Admin > Editor > User`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Editor,
    #[default]
    User,
}

impl Role {
    /// Exact, case-sensitive parse of the metadata value.
    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "ADMIN" => Some(Role::Admin),
            "EDITOR" => Some(Role::Editor),
            "USER" => Some(Role::User),
            _ => None,
        }
    }

    /// Role carried in profile metadata; anything missing or unrecognized is `User`.
    pub fn from_metadata(value: Option<&serde_json::Value>) -> Role {
        value
            .and_then(|v| v.as_str())
            .and_then(Role::parse)
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Editor => "EDITOR",
            Role::User => "USER",
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Role::Admin => 3,
            Role::Editor => 2,
            Role::User => 1,
        }
    }

    /// Whether a holder of `self` may access something gated on `required`.
    pub fn satisfies(&self, required: Role) -> bool {
        self.level() >= required.level()
    }

    /// `"Admin"`, `"Editor"`, `"User"`
    pub fn capitalized(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Editor => "Editor",
            Role::User => "User",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user as exposed to the page layer and persisted between runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub role: Role,
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl User {
    /// Combine a session with the profile fetched for it.
    pub fn from_session(session: &Session, record: &UserRecord) -> User {
        let display_name = record
            .metadata_str("displayName")
            .or_else(|| record.metadata_str("display_name"))
            .map(str::to_string);

        User {
            id: session.subject_id().to_string(),
            email: session.email().unwrap_or_default().to_string(),
            role: Role::from_metadata(record.user_metadata.get("role")),
            display_name,
        }
    }

    pub fn has_role(&self, required: Role) -> bool {
        self.role.satisfies(required)
    }
}

/// Trim and lower-case an email before it is compared or sent anywhere.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
