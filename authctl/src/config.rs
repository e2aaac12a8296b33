use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use platform_auth::AuthConfig;
use tracing::debug;

const CONFIG_DIR: &str = "authctl";
const CONFIG_FILE: &str = "config.toml";

/// Default location, `<config dir>/authctl/config.toml`.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Load the configuration from `path`, or from the default location.
///
/// An explicit path must exist. A missing default file yields an empty
/// configuration.
pub fn load(path: Option<&Path>) -> Result<AuthConfig> {
    match path {
        Some(path) => read(path),
        None => match default_path() {
            Some(path) if path.exists() => read(&path),
            _ => {
                debug!("No configuration file found, using defaults");
                Ok(AuthConfig::default())
            }
        },
    }
}

fn read(path: &Path) -> Result<AuthConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = parse(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

fn parse(content: &str) -> Result<AuthConfig> {
    Ok(toml::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_sections() {
        let config = parse(
            r#"
            [spotify]
            client_id = "id"
            client_secret = "secret"
            prefer_anonymous = true

            [bilibili]
            cookies = "SESSDATA=s; bili_jct=j"
            refresh_token = "rt"
            refresh_on_startup = false
            "#,
        )
        .unwrap();

        assert!(config.spotify.credentials().has_client_credentials());
        assert!(config.spotify.credentials().prefer_anonymous);
        let bilibili = config.bilibili.credentials();
        assert_eq!(bilibili.csrf(), Some("j"));
        assert!(bilibili.can_refresh());
        assert!(!config.bilibili.refresh_on_startup());
        assert!(config.apple_music.media_api_token.is_none());
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = parse("").unwrap();
        assert!(!config.spotify.credentials().has_client_credentials());
        assert!(config.bilibili.refresh_on_startup());
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        assert!(parse("[spotify]\nprefer_anonymous = \"yes\"").is_err());
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let err = load(Some(Path::new("/nonexistent/authctl.toml"))).err().expect("expected an error");
        assert!(err.to_string().contains("failed to read config file"));
    }
}
