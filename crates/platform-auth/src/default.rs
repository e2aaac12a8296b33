use reqwest::Client;
use std::time::Duration;

use crate::error::AuthError;

pub const DEFAULT_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared HTTP client used by every provider unless the caller brings its own.
pub fn default_client() -> Result<Client, AuthError> {
    Client::builder()
        .user_agent(DEFAULT_UA)
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .map_err(AuthError::Http)
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub(crate) fn unix_secs() -> Result<u64, AuthError> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| AuthError::SystemTime)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> Result<u64, AuthError> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| AuthError::SystemTime)
}
