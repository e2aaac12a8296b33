use serde::Deserialize;
use serde_json::Value;

/// Web-player token endpoint response (anonymous and account tokens).
#[derive(Debug, Deserialize)]
pub(crate) struct WebTokenResponse {
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,
    #[serde(rename = "accessTokenExpirationTimestampMs")]
    pub expiration_ms: Option<i64>,
    #[serde(rename = "isAnonymous", default)]
    pub is_anonymous: bool,
    pub error: Option<Value>,
}

/// OAuth client-credentials grant response.
#[derive(Debug, Deserialize)]
pub(crate) struct ClientCredentialsResponse {
    pub access_token: Option<String>,
    pub expires_in: Option<i64>,
    pub error: Option<Value>,
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerTimeResponse {
    #[serde(rename = "serverTime")]
    pub server_time: Option<i64>,
}

/// Message of a non-null `error` field, if any.
pub(crate) fn error_message(error: Option<&Value>) -> Option<String> {
    match error? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => Some(
            map.get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        ),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_message_shapes() {
        assert_eq!(error_message(None), None);
        assert_eq!(error_message(Some(&Value::Null)), None);
        assert_eq!(
            error_message(Some(&json!("invalid_client"))),
            Some("invalid_client".to_string())
        );
        assert_eq!(
            error_message(Some(&json!({"code": 401, "message": "Unauthorized"}))),
            Some("Unauthorized".to_string())
        );
    }

    #[test]
    fn test_web_token_response() {
        let body = r#"{"clientId":"x","accessToken":"abc","accessTokenExpirationTimestampMs":1700000600000,"isAnonymous":true}"#;
        let parsed: WebTokenResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.access_token.as_deref(), Some("abc"));
        assert_eq!(parsed.expiration_ms, Some(1_700_000_600_000));
        assert!(parsed.is_anonymous);
        assert!(parsed.error.is_none());
    }
}
