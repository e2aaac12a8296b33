use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "authctl", version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = "AUTHCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mint (or reuse) a Spotify bearer token and print its expiry
    Token(TokenArgs),
    /// Resolve the Spotify TOTP secret and print its version
    Secret,
    /// Sign query parameters for the Bilibili WBI endpoints
    Sign {
        /// Parameters as key=value pairs
        #[arg(required = true, value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Check the Bilibili session and run the cookie refresh handshake if needed
    CookieCheck {
        /// Print refreshed cookie and token values instead of only their names
        #[arg(long)]
        show_values: bool,
    },
    /// Fetch the Apple Music media API token and print its origin and expiry
    AppleToken {
        /// Scrape a fresh token even if the cached one is valid
        #[arg(long)]
        force: bool,
    },
}

#[derive(ClapArgs, Debug)]
pub struct TokenArgs {
    /// Use the anonymous web-player token even when client credentials are set
    #[arg(long, conflicts_with = "account")]
    pub anonymous: bool,

    /// Use the account token bound to the sp_dc cookie
    #[arg(long)]
    pub account: bool,

    /// Override the configured sp_dc cookie
    #[arg(long, env = "SPOTIFY_SP_DC", hide_env_values = true)]
    pub sp_dc: Option<String>,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}
