//! TOTP secret resolution.
//!
//! The web player keeps its TOTP secret as an integer array that is XORed with
//! `(index % 33) + 9`. After un-XORing, every byte is written out as a decimal
//! number, the digits are concatenated and that string is hex encoded. The HMAC key
//! is the hex string decoded again, i.e. the ASCII bytes of the digit string.
//!
//! Three sources are tried in order: the embedded fallback table, the public
//! secret registry and finally the web player's own scripts.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use reqwest::{Client, StatusCode, header};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::SpotifyEndpoints;
use crate::cache::{Expiring, ExpiringCell};
use crate::default::DEFAULT_UA;
use crate::error::AuthError;

/// A resolved secret is reused for this long, whichever source produced it.
pub const SECRET_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

const XOR_MODULUS: usize = 33;
const XOR_OFFSET: usize = 9;

/// Version tag used for secrets scraped from the web player.
pub const WEB_VERSION: &str = "web";

/// Script URLs must contain this to be considered.
const SCRIPT_PATTERN: &str = "mobile-web-player";

static SCRIPT_SRC_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<script[^>]*\ssrc="([^"]+)""#).unwrap());

static SECRET_ARRAY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""secret":\[(\d+(?:,\d+)+)\]"#).unwrap());

struct EncodedSecret {
    encoded: &'static str,
    version: u32,
}

const FALLBACK_SECRETS: [EncodedSecret; 3] = [
    EncodedSecret {
        encoded: r#",7/*F("rLJ2oxaKL^f+E1xvP@N"#,
        version: 61,
    },
    EncodedSecret {
        encoded: r#"OmE{ZA.J^":0FG\Uz?[@WW"#,
        version: 60,
    },
    EncodedSecret {
        encoded: r#"{iOFn;4}<1PFYKPV?5{%u14]M>/V0hDH"#,
        version: 59,
    },
];

/// XOR every byte with `(index % 33) + 9`. Applying it twice yields the input.
pub fn xor_transform(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ ((i % XOR_MODULUS) + XOR_OFFSET) as u8)
        .collect()
}

/// Concatenate every byte as a signed decimal number, the way the web player's
/// own client stringifies its byte array.
fn digit_string(decoded: &[u8]) -> String {
    decoded.iter().map(|&b| (b as i8).to_string()).collect()
}

/// Where a secret came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Embedded,
    Registry,
    WebPlayer,
}

impl SecretSource {
    /// Resolution order.
    pub const CHAIN: [SecretSource; 3] = [Self::Embedded, Self::Registry, Self::WebPlayer];
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Embedded => "embedded",
            Self::Registry => "registry",
            Self::WebPlayer => "web player",
        })
    }
}

/// A derived TOTP secret. Never mutated, only replaced.
#[derive(Clone)]
pub struct Secret {
    hex: String,
    key: Vec<u8>,
    version: String,
    source: SecretSource,
    fetched_at: Instant,
}

impl Secret {
    /// Build a secret from the un-XORed byte array.
    pub fn from_decoded(
        decoded: &[u8],
        version: impl Into<String>,
        source: SecretSource,
    ) -> Result<Self, AuthError> {
        if decoded.is_empty() {
            return Err(AuthError::Parse("secret array is empty".to_string()));
        }
        let hex = hex::encode(digit_string(decoded).as_bytes());
        let key = hex::decode(&hex).map_err(|e| AuthError::Crypto(e.to_string()))?;
        Ok(Self {
            hex,
            key,
            version: version.into(),
            source,
            fetched_at: Instant::now(),
        })
    }

    /// HMAC key bytes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Hex representation of the key.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn source(&self) -> SecretSource {
        self.source
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

impl Expiring for Secret {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < SECRET_CACHE_TTL
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("version", &self.version)
            .field("source", &self.source)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Decode the newest embedded fallback secret.
pub fn embedded_secret() -> Result<Secret, AuthError> {
    let newest = FALLBACK_SECRETS
        .iter()
        .max_by_key(|s| s.version)
        .ok_or_else(|| AuthError::Parse("no embedded secrets".to_string()))?;
    let decoded = xor_transform(newest.encoded.as_bytes());
    Secret::from_decoded(&decoded, newest.version.to_string(), SecretSource::Embedded)
}

/// Pick the numerically largest version from a registry document and decode it.
pub fn secret_from_registry(registry: &HashMap<String, Vec<i64>>) -> Result<Secret, AuthError> {
    let (version, values) = registry
        .iter()
        .filter_map(|(k, v)| k.parse::<u64>().ok().map(|n| (n, v)))
        .max_by_key(|(n, _)| *n)
        .ok_or_else(|| AuthError::Parse("no secrets found in registry".to_string()))?;

    // Truncate like the web player's byte cast before un-XORing.
    let raw: Vec<u8> = values.iter().map(|&v| v as u8).collect();
    Secret::from_decoded(&xor_transform(&raw), version.to_string(), SecretSource::Registry)
}

/// Pull the `"secret":[...]` array out of a web player script body.
pub fn secret_array_from_script(script: &str) -> Option<Vec<u8>> {
    let caps = SECRET_ARRAY_REGEX.captures(script)?;
    caps.get(1)?
        .as_str()
        .split(',')
        .map(|n| n.trim().parse::<i64>().ok().map(|v| v as u8))
        .collect()
}

/// Candidate script URLs from the landing page, made absolute against `base`.
pub fn web_player_script_urls(html: &str, base: &Url) -> Vec<Url> {
    SCRIPT_SRC_REGEX
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .filter(|src| src.contains(SCRIPT_PATTERN) && !src.contains("vendor"))
        .filter_map(|src| base.join(src).ok())
        .collect()
}

/// Resolves and caches the TOTP secret.
pub struct SecretResolver {
    client: Client,
    endpoints: SpotifyEndpoints,
    sources: Vec<SecretSource>,
    cell: ExpiringCell<Secret>,
}

impl SecretResolver {
    pub fn new(client: Client, endpoints: SpotifyEndpoints) -> Self {
        Self {
            client,
            endpoints,
            sources: SecretSource::CHAIN.to_vec(),
            cell: ExpiringCell::new(),
        }
    }

    /// Restrict or reorder the sources tried on each resolution.
    pub fn with_sources(mut self, sources: impl IntoIterator<Item = SecretSource>) -> Self {
        self.sources = sources.into_iter().collect();
        self
    }

    /// The cached secret, or a freshly resolved one once the cache is older than an hour.
    pub async fn resolve(&self) -> Result<Secret, AuthError> {
        self.cell.get_or_refresh(|| self.resolve_uncached()).await
    }

    /// Drop the cached secret so the next call walks the chain again.
    pub fn invalidate(&self) {
        self.cell.invalidate();
    }

    async fn resolve_uncached(&self) -> Result<Secret, AuthError> {
        let mut failures = Vec::with_capacity(self.sources.len());

        for &source in &self.sources {
            match self.try_source(source).await {
                Ok(secret) => {
                    debug!(%source, version = secret.version(), "Resolved TOTP secret");
                    return Ok(secret);
                }
                Err(e) => {
                    warn!(%source, error = %e, "TOTP secret source failed, trying next");
                    failures.push(format!("{source}: {e}"));
                }
            }
        }

        error!("Failed to obtain TOTP secret from all sources");
        Err(AuthError::SecretUnavailable(failures))
    }

    async fn try_source(&self, source: SecretSource) -> Result<Secret, AuthError> {
        match source {
            SecretSource::Embedded => embedded_secret(),
            SecretSource::Registry => self.fetch_from_registry().await,
            SecretSource::WebPlayer => self.scrape_web_player().await,
        }
    }

    #[instrument(skip(self))]
    async fn fetch_from_registry(&self) -> Result<Secret, AuthError> {
        let url = &self.endpoints.secrets_registry;
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(AuthError::status(url.as_str(), response.status()));
        }

        let registry: HashMap<String, Vec<i64>> = response
            .json()
            .await
            .map_err(|e| AuthError::Parse(format!("secret registry: {e}")))?;

        let secret = secret_from_registry(&registry)?;
        info!(version = secret.version(), "Fetched TOTP secret from registry");
        Ok(secret)
    }

    #[instrument(skip(self))]
    async fn scrape_web_player(&self) -> Result<Secret, AuthError> {
        let homepage = Url::parse(&self.endpoints.homepage)
            .map_err(|e| AuthError::Configuration(format!("invalid homepage url: {e}")))?;

        let html = self
            .client
            .get(homepage.as_str())
            .header(header::USER_AGENT, DEFAULT_UA)
            .send()
            .await?
            .text()
            .await?;

        let scripts = web_player_script_urls(&html, &homepage);
        debug!(count = scripts.len(), "Found candidate web player scripts");
        if scripts.is_empty() {
            return Err(AuthError::Parse(
                "no web player script urls found on homepage".to_string(),
            ));
        }

        for script_url in scripts {
            let body = match self.fetch_script(&script_url).await {
                Ok(body) => body,
                Err(e) => {
                    debug!(url = %script_url, error = %e, "Failed to download script");
                    continue;
                }
            };

            match secret_array_from_script(&body) {
                Some(raw) => {
                    let secret = Secret::from_decoded(
                        &xor_transform(&raw),
                        WEB_VERSION,
                        SecretSource::WebPlayer,
                    )?;
                    info!(url = %script_url, "Extracted TOTP secret from web player");
                    return Ok(secret);
                }
                None => debug!(url = %script_url, "No secret array in script"),
            }
        }

        Err(AuthError::Parse(
            "no secret array found in web player scripts".to_string(),
        ))
    }

    async fn fetch_script(&self, url: &Url) -> Result<String, AuthError> {
        let response = self
            .client
            .get(url.as_str())
            .header(header::USER_AGENT, DEFAULT_UA)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::status(url.as_str(), response.status()));
        }
        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // Digits of the embedded version 61 secret after un-XORing.
    const V61_DIGITS: &str = "376136387538459893883312310911992847112448894410210511297108";

    #[test]
    fn test_xor_transform_is_self_inverse() {
        let inputs: [&[u8]; 3] = [b"", b"hello world", &[0, 1, 2, 250, 255, 128, 7]];
        for input in inputs {
            assert_eq!(xor_transform(&xor_transform(input)), input.to_vec());
        }
        let long: Vec<u8> = (0..=255).collect();
        assert_eq!(xor_transform(&xor_transform(&long)), long);
    }

    #[test]
    fn test_xor_table_wraps_every_33_bytes() {
        let zeros = vec![0u8; 34];
        let keys = xor_transform(&zeros);
        assert_eq!(keys[0], 9);
        assert_eq!(keys[32], 41);
        assert_eq!(keys[33], 9);
    }

    #[test]
    fn test_embedded_secret_layering() {
        let secret = embedded_secret().unwrap();
        assert_eq!(secret.version(), "61");
        assert_eq!(secret.source(), SecretSource::Embedded);
        assert_eq!(secret.key(), V61_DIGITS.as_bytes());
        assert_eq!(secret.hex(), hex::encode(V61_DIGITS));
    }

    #[test]
    fn test_digit_string_uses_signed_bytes() {
        assert_eq!(digit_string(&[65, 7, 200]), "657-56");
    }

    #[test]
    fn test_registry_picks_numerically_largest_version() {
        let embedded = xor_transform(r#",7/*F("rLJ2oxaKL^f+E1xvP@N"#.as_bytes());
        let encoded: Vec<i64> = xor_transform(&embedded).iter().map(|&b| i64::from(b)).collect();

        let mut registry = HashMap::new();
        registry.insert("9".to_string(), vec![1, 2, 3]);
        registry.insert("61".to_string(), encoded);
        registry.insert("not-a-version".to_string(), vec![4, 5]);

        let secret = secret_from_registry(&registry).unwrap();
        assert_eq!(secret.version(), "61");
        assert_eq!(secret.key(), V61_DIGITS.as_bytes());
    }

    #[test]
    fn test_registry_without_versions_fails() {
        let registry = HashMap::from([("latest".to_string(), vec![1, 2])]);
        assert!(secret_from_registry(&registry).is_err());

        let empty = HashMap::from([("12".to_string(), Vec::new())]);
        assert!(secret_from_registry(&empty).is_err());
    }

    #[test]
    fn test_secret_array_from_script() {
        let script = r#"var a=1;const x={"secret":[44,55,47],"version":9};"#;
        assert_eq!(secret_array_from_script(script), Some(vec![44, 55, 47]));
        assert_eq!(secret_array_from_script(r#"{"secret":[1]}"#), None);
        assert_eq!(secret_array_from_script("no secrets here"), None);
    }

    #[test]
    fn test_web_player_script_urls() {
        let base = Url::parse("https://open.spotify.com/").unwrap();
        let html = r#"
            <script src="https://cdn.example/vendor~mobile-web-player.js"></script>
            <script defer src="/cdn/mobile-web-player.abc123.js"></script>
            <script src="https://cdn.example/other.js"></script>
            <script type="module" src="https://cdn.example/mobile-web-player-main.js"></script>
        "#;
        let urls: Vec<String> = web_player_script_urls(html, &base)
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://open.spotify.com/cdn/mobile-web-player.abc123.js".to_string(),
                "https://cdn.example/mobile-web-player-main.js".to_string(),
            ]
        );
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = embedded_secret().unwrap();
        assert!(!format!("{secret:?}").contains(V61_DIGITS));
        assert!(secret.is_fresh());
    }
}
