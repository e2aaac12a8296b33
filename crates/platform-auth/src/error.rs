use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected status {status} from {endpoint}")]
    Status { endpoint: String, status: u16 },
    #[error("{endpoint} returned an error: {message}")]
    Protocol { endpoint: String, message: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("unable to obtain secret ({})", .0.join("; "))]
    SecretUnavailable(Vec<String>),
    #[error("system time error")]
    SystemTime,
}

impl AuthError {
    /// Errors that no amount of retrying will fix without a config change.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Network and parse failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Json(_) | Self::Parse(_) | Self::SecretUnavailable(_)
        )
    }

    pub(crate) fn protocol(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub(crate) fn status(endpoint: impl Into<String>, status: reqwest::StatusCode) -> Self {
        Self::Status {
            endpoint: endpoint.into(),
            status: status.as_u16(),
        }
    }
}
