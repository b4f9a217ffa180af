use crate::user::User;

/// The canonical answer to "who is signed in"
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No source has reported yet
    #[default]
    Unknown,
    /// Seeded from local storage, not yet confirmed by the provider
    Provisional(User),
    Authenticated(User),
    Anonymous,
}

impl SessionState {
    pub fn user(&self) -> Option<&User> {
        match self {
            SessionState::Provisional(user) | SessionState::Authenticated(user) => Some(user),
            SessionState::Unknown | SessionState::Anonymous => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, SessionState::Provisional(_))
    }

    /// Whether some source other than the local seed has reported.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SessionState::Authenticated(_) | SessionState::Anonymous)
    }

    pub(crate) fn confirmed(user: Option<User>) -> SessionState {
        match user {
            Some(user) => SessionState::Authenticated(user),
            None => SessionState::Anonymous,
        }
    }
}
