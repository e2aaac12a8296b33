//! Apple Music developer token ("media API token").
//!
//! The token is either supplied by the user or scraped from the module script the
//! web player loads. Only the JWT payload is inspected, for `exp` and
//! `root_https_origin`.

mod manager;
mod token;

pub use manager::MediaApiTokenManager;
pub use token::{MediaApiToken, extract_token, module_script_url};

pub mod urls {
    pub const ORIGIN: &str = "https://music.apple.com";
    pub const BROWSE: &str = "https://music.apple.com/us/browse";
}

#[derive(Debug, Clone)]
pub struct AppleMusicEndpoints {
    /// Page whose module script embeds the token.
    pub browse: String,
    /// Prefix for relative script paths.
    pub origin: String,
}

impl Default for AppleMusicEndpoints {
    fn default() -> Self {
        Self {
            browse: urls::BROWSE.to_string(),
            origin: urls::ORIGIN.to_string(),
        }
    }
}

impl AppleMusicEndpoints {
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            browse: format!("{base}/us/browse"),
            origin: base.to_string(),
        }
    }
}
