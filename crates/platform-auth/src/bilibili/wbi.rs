use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use reqwest::{Client, header};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::BilibiliEndpoints;
use crate::cache::{Expiring, ExpiringCell};
use crate::default::{DEFAULT_UA, unix_secs};
use crate::error::AuthError;

const CACHE_EXPIRATION: Duration = Duration::from_secs(60 * 60);

const MIXIN_KEY_LEN: usize = 32;

const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

/// Characters the server drops from values before verifying the signature.
const FILTERED_CHARS: [char; 5] = ['!', '\'', '(', ')', '*'];

#[derive(Deserialize)]
struct WbiImg {
    img_url: String,
    sub_url: String,
}

#[derive(Deserialize)]
struct NavData {
    wbi_img: WbiImg,
}

// `code` is -101 for anonymous callers but wbi_img is still present.
#[derive(Deserialize)]
struct NavResponse {
    data: Option<NavData>,
}

#[derive(Clone, Debug)]
pub struct MixinKey {
    key: String,
    fetched_at: Instant,
}

impl MixinKey {
    /// Derive the key from the `img` and `sub` filename stems.
    pub fn from_fragments(img_key: &str, sub_key: &str) -> Self {
        Self {
            key: get_mixin_key(format!("{img_key}{sub_key}").as_bytes()),
            fetched_at: Instant::now(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl Expiring for MixinKey {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < CACHE_EXPIRATION
    }
}

// 对 imgKey 和 subKey 进行字符顺序打乱编码
fn get_mixin_key(orig: &[u8]) -> String {
    MIXIN_KEY_ENC_TAB
        .iter()
        .filter_map(|&i| orig.get(i))
        .take(MIXIN_KEY_LEN)
        .map(|&b| b as char)
        .collect()
}

/// Filename without extension, e.g. the key stem of a `wbi_img` url.
fn take_filename(url: &str) -> Option<&str> {
    url.rsplit_once('/')
        .and_then(|(_, s)| s.rsplit_once('.'))
        .map(|(s, _)| s)
        .filter(|s| !s.is_empty())
}

/// Add `wts`, strip filtered characters from values and sort by key.
fn prepare_params<K, V>(params: &[(K, V)], wts: u64) -> Vec<(String, String)>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| {
            let value = v.as_ref().replace(FILTERED_CHARS, "");
            (k.as_ref().to_string(), value)
        })
        .collect();
    pairs.push(("wts".to_string(), wts.to_string()));
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn w_rid(query: &str, mixin_key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(query.as_bytes());
    hasher.update(mixin_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Signed query string for a fixed key and timestamp.
pub fn sign_with_timestamp<K, V>(params: &[(K, V)], mixin_key: &str, wts: u64) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let query = encode_query(&prepare_params(params, wts));
    let sign = w_rid(&query, mixin_key);
    format!("{query}&w_rid={sign}")
}

/// Signs request parameters with the WBI scheme, caching the mixin key for an hour.
pub struct WbiSigner {
    client: Client,
    nav_url: String,
    referer: String,
    cookies: Option<String>,
    cell: ExpiringCell<MixinKey>,
}

impl WbiSigner {
    pub fn new(client: Client, endpoints: &BilibiliEndpoints) -> Self {
        Self {
            client,
            nav_url: endpoints.nav.clone(),
            referer: endpoints.referer.clone(),
            cookies: None,
            cell: ExpiringCell::new(),
        }
    }

    /// Send this `Cookie` header with the nav request.
    pub fn with_cookies(mut self, cookies: Option<String>) -> Self {
        self.cookies = cookies.filter(|c| !c.is_empty());
        self
    }

    pub async fn mixin_key(&self) -> Result<MixinKey, AuthError> {
        self.cell.get_or_refresh(|| self.fetch_mixin_key()).await
    }

    pub fn invalidate(&self) {
        self.cell.invalidate();
    }

    /// Signed query string using the current time for `wts`.
    pub async fn sign<K, V>(&self, params: &[(K, V)]) -> Result<String, AuthError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let key = self.mixin_key().await?;
        Ok(sign_with_timestamp(params, key.as_str(), unix_secs()?))
    }

    /// Signed parameters as pairs, `wts` and `w_rid` included, for `RequestBuilder::query`.
    pub async fn sign_params<K, V>(&self, params: &[(K, V)]) -> Result<Vec<(String, String)>, AuthError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let key = self.mixin_key().await?;
        let mut pairs = prepare_params(params, unix_secs()?);
        let sign = w_rid(&encode_query(&pairs), key.as_str());
        pairs.push(("w_rid".to_string(), sign));
        Ok(pairs)
    }

    #[instrument(skip(self))]
    async fn fetch_mixin_key(&self) -> Result<MixinKey, AuthError> {
        let mut request = self
            .client
            .get(&self.nav_url)
            .header(header::USER_AGENT, DEFAULT_UA)
            .header(header::REFERER, &self.referer);
        if let Some(cookies) = &self.cookies {
            request = request.header(header::COOKIE, cookies);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AuthError::status("nav", response.status()));
        }

        let wbi_img = response
            .json::<NavResponse>()
            .await?
            .data
            .map(|d| d.wbi_img)
            .ok_or_else(|| AuthError::Parse("nav response has no wbi_img".to_string()))?;

        let img_key = take_filename(&wbi_img.img_url)
            .ok_or_else(|| AuthError::Parse(format!("bad img_url {}", wbi_img.img_url)))?;
        let sub_key = take_filename(&wbi_img.sub_url)
            .ok_or_else(|| AuthError::Parse(format!("bad sub_url {}", wbi_img.sub_url)))?;

        debug!("Fetched new WBI keys");
        Ok(MixinKey::from_fragments(img_key, sub_key))
    }
}

// 取自文档描述的测试用例
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const IMG_KEY: &str = "7cd084941338484aae1ad9425b84077c";
    const SUB_KEY: &str = "4932caff0ff746eab6f01bf08b70ac45";

    #[test]
    fn test_get_filename() {
        assert_eq!(
            take_filename("https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png"),
            Some(IMG_KEY)
        );
        assert_eq!(take_filename("no-slash.png"), None);
        assert_eq!(take_filename("https://i0.hdslb.com/bfs/wbi/noext"), None);
    }

    #[test]
    fn test_get_mixin_key() {
        assert_eq!(
            MixinKey::from_fragments(IMG_KEY, SUB_KEY).as_str(),
            "ea1db124af3c7062474693fa704f4ff8"
        );
    }

    #[test]
    fn test_mixin_key_skips_out_of_range_indices() {
        // Only indices < 20 survive, in table order.
        let short = b"abcdefghijklmnopqrst";
        let key = get_mixin_key(short);
        assert_eq!(key.len(), 20);
        assert!(key.starts_with("scip"));
    }

    #[test]
    fn test_encode_wbi() {
        let params = [("foo", "114"), ("bar", "514"), ("zab", "1919810")];
        let mixin = MixinKey::from_fragments(IMG_KEY, SUB_KEY);
        assert_eq!(
            sign_with_timestamp(&params, mixin.as_str(), 1702204169),
            "bar=514&foo=114&wts=1702204169&zab=1919810&w_rid=8f6f2b5b3d485fe1886cec6a0be8c5d4"
        );
    }

    #[test]
    fn test_params_sorted_and_wts_appended() {
        let params = [("b", "2"), ("a", "1")];
        let signed = sign_with_timestamp(&params, "key", 1700000000);
        assert!(signed.starts_with("a=1&b=2&wts=1700000000&w_rid="));
        assert_eq!(signed, sign_with_timestamp(&params, "key", 1700000000));
    }

    #[test]
    fn test_values_are_filtered_and_encoded() {
        let params = [("q", "it's (a) test!*"), ("k", "中")];
        let signed = sign_with_timestamp(&params, "key", 1);
        assert!(signed.starts_with("k=%E4%B8%AD&q=its%20a%20test&wts=1&w_rid="));
    }
}
