use thiserror::Error;

pub type PortalResult<T> = Result<T, PortalError>;

/// Shown when an error carries no usable text.
pub const FALLBACK_MESSAGE: &str = "An error occurred";

#[derive(Debug, Error)]
pub enum PortalError {
    /// Credential errors reported by the auth provider ("Invalid login credentials", ...)
    #[error("{0}")]
    Auth(String),

    /// Non-success response from the table API
    #[error("{message}")]
    Api {
        status: u16,
        message: String,
        code: Option<String>,
    },

    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode {entity}: {source}")]
    Decode {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("User not logged in")]
    NotAuthenticated,

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Session storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl PortalError {
    pub fn decode(entity: &'static str, source: serde_json::Error) -> Self {
        PortalError::Decode { entity, source }
    }

    /// HTTP status of a failed remote call, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            PortalError::Api { status, .. } => Some(*status),
            PortalError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Text suitable for a toast.
    pub fn user_message(&self) -> String {
        match self.status() {
            Some(401) => return "Unauthorized. Please login again.".to_string(),
            Some(403) => return "You do not have permission to perform this action.".to_string(),
            Some(404) => return "Resource not found.".to_string(),
            Some(500) => return "Server error. Please try again later.".to_string(),
            _ => {}
        }

        let message = self.to_string();
        if message.trim().is_empty() {
            FALLBACK_MESSAGE.to_string()
        } else {
            message
        }
    }
}
