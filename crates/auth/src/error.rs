use thiserror::Error;

/// エラー型
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Missing session")]
    MissingSession,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    pub fn api<T: std::fmt::Display>(status: u16, message: T) -> Self {
        AuthError::Api {
            status,
            message: message.to_string(),
        }
    }

    /// Whether retrying the same call later could succeed.
    ///
    /// Transport failures, rate limiting and server-side errors are
    /// recoverable. Rejected credentials, a missing session and malformed
    /// payloads are terminal.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AuthError::Network(_) => true,
            AuthError::Api { status, .. } => *status == 429 || *status >= 500,
            AuthError::Serialization(_)
            | AuthError::Url(_)
            | AuthError::MissingSession
            | AuthError::Config(_) => false,
        }
    }

    /// HTTP status reported by the provider, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::Api { status, .. } => Some(*status),
            AuthError::Network(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
