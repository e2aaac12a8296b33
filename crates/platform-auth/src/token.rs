use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::cache::Expiring;
use crate::error::AuthError;

/// A token is treated as expired this long before its declared expiry.
pub const EXPIRY_MARGIN: TimeDelta = TimeDelta::seconds(10);

/// Which provider minted a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    ClientCredentials,
    Anonymous,
    Account,
    MediaApi,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ClientCredentials => "client_credentials",
            Self::Anonymous => "anonymous",
            Self::Account => "account",
            Self::MediaApi => "media_api",
        };
        f.write_str(name)
    }
}

/// Opaque bearer credential with an optional absolute expiry.
///
/// `None` expiry means the token never expires.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    kind: TokenKind,
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn new(kind: TokenKind, value: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            kind,
            value: value.into(),
            expires_at,
        }
    }

    /// Token whose expiry is given as epoch milliseconds, as the web-player endpoint reports it.
    ///
    /// Fails when the timestamp is outside the representable range.
    pub fn expiring_at_millis(
        kind: TokenKind,
        value: impl Into<String>,
        expires_ms: i64,
    ) -> Result<Self, AuthError> {
        let expires_at = DateTime::from_timestamp_millis(expires_ms).ok_or_else(|| {
            AuthError::Parse(format!("expiry timestamp {expires_ms} ms is out of range"))
        })?;
        Ok(Self::new(kind, value, Some(expires_at)))
    }

    /// Token whose lifetime is given in seconds from now, as OAuth endpoints report it.
    pub fn expiring_in_secs(
        kind: TokenKind,
        value: impl Into<String>,
        expires_in: i64,
    ) -> Result<Self, AuthError> {
        let expires_at = TimeDelta::try_seconds(expires_in)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| AuthError::Parse(format!("expires_in {expires_in} s is out of range")))?;
        Ok(Self::new(kind, value, Some(expires_at)))
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => true,
            // An expiry too close to the minimum date to subtract the margin is long gone
            Some(expiry) => expiry
                .checked_sub_signed(EXPIRY_MARGIN)
                .is_some_and(|deadline| deadline > now),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Header value for `Authorization`.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl Expiring for Token {
    fn is_fresh(&self) -> bool {
        !self.value.is_empty() && self.is_valid()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.kind)
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::inside_margin(9, false)]
    #[case::exactly_margin(10, false)]
    #[case::outside_margin(11, true)]
    #[case::already_expired(-5, false)]
    fn test_expiry_boundary(#[case] secs_left: i64, #[case] valid: bool) {
        let now = Utc::now();
        let token = Token::new(
            TokenKind::Anonymous,
            "abc",
            Some(now + TimeDelta::seconds(secs_left)),
        );
        assert_eq!(token.is_valid_at(now), valid);
    }

    #[test]
    fn test_never_expiring_token() {
        let token = Token::new(TokenKind::MediaApi, "abc", None);
        assert!(token.is_valid());
        assert!(token.is_fresh());
    }

    #[test]
    fn test_expiry_from_millis() {
        let token =
            Token::expiring_at_millis(TokenKind::Anonymous, "abc", 1_700_000_000_000).unwrap();
        assert_eq!(
            token.expires_at().map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
    }

    #[rstest]
    #[case::max(i64::MAX)]
    #[case::min(i64::MIN)]
    fn test_out_of_range_millis_is_parse_error(#[case] millis: i64) {
        let err = Token::expiring_at_millis(TokenKind::Anonymous, "abc", millis).unwrap_err();
        assert!(matches!(err, AuthError::Parse(_)));
    }

    #[rstest]
    #[case::max(i64::MAX)]
    #[case::min(i64::MIN)]
    #[case::past_max_date(i64::MAX / 1000)]
    fn test_out_of_range_lifetime_is_parse_error(#[case] secs: i64) {
        let err = Token::expiring_in_secs(TokenKind::ClientCredentials, "abc", secs).unwrap_err();
        assert!(matches!(err, AuthError::Parse(_)));
    }

    #[test]
    fn test_lifetime_in_seconds() {
        let before = Utc::now();
        let token = Token::expiring_in_secs(TokenKind::ClientCredentials, "abc", 3600).unwrap();
        let expiry = token.expires_at().unwrap();
        assert!(expiry >= before + TimeDelta::seconds(3600));
        assert!(token.is_valid());
    }

    #[test]
    fn test_expiry_at_minimum_date_is_invalid() {
        let token = Token::new(TokenKind::Anonymous, "abc", Some(DateTime::<Utc>::MIN_UTC));
        assert!(!token.is_valid());
        assert!(!token.is_fresh());
    }

    #[test]
    fn test_debug_hides_value() {
        let token = Token::new(TokenKind::Account, "very-secret", None);
        let debug = format!("{token:?}");
        assert!(!debug.contains("very-secret"));
        assert_eq!(token.bearer(), "Bearer very-secret");
    }
}
