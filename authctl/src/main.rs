mod cli;
mod config;

use std::process;

use anyhow::{Context, Result, bail};
use clap::Parser;
use platform_auth::apple_music::MediaApiTokenManager;
use platform_auth::bilibili::{RefreshResult, WbiSigner};
use platform_auth::config::BilibiliConfig;
use platform_auth::spotify::{TokenStrategy, TokenTracker};
use platform_auth::{AuthConfig, RequestInterceptor, Token, default_client};
use reqwest::Client;
use tracing::{Level, debug, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands, TokenArgs};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let config = config::load(args.config.as_deref())?;
    let client = default_client().context("failed to build HTTP client")?;

    match args.command {
        Commands::Token(token_args) => token(client, &config, token_args).await,
        Commands::Secret => secret(client, &config).await,
        Commands::Sign { params } => sign(client, &config, &params).await,
        Commands::CookieCheck { show_values } => cookie_check(client, &config, show_values).await,
        Commands::AppleToken { force } => apple_token(client, &config, force).await,
    }
}

async fn token(client: Client, config: &AuthConfig, args: TokenArgs) -> Result<()> {
    let tracker = TokenTracker::with_endpoints(
        client,
        config.spotify.credentials(),
        config.spotify.endpoints(),
    );
    if args.sp_dc.is_some() {
        tracker.set_session_cookie(args.sp_dc);
    }

    let result = if args.account {
        tracker.token_for(TokenStrategy::Account).await
    } else {
        tracker.access_token(args.anonymous).await
    };
    let token = result.context("failed to obtain Spotify token")?;

    print_token(&token);
    Ok(())
}

async fn secret(client: Client, config: &AuthConfig) -> Result<()> {
    let tracker = TokenTracker::with_endpoints(
        client,
        config.spotify.credentials(),
        config.spotify.endpoints(),
    );
    let secret = tracker
        .secrets()
        .resolve()
        .await
        .context("failed to resolve TOTP secret")?;

    // Only metadata, the key itself stays in memory
    println!("version: {}", secret.version());
    println!("source:  {}", secret.source());
    Ok(())
}

async fn sign(client: Client, config: &AuthConfig, params: &[(String, String)]) -> Result<()> {
    let credentials = config.bilibili.credentials();
    let cookies = credentials.cookie_header();

    let interceptor =
        RequestInterceptor::bilibili(client.clone(), config.bilibili.endpoints(), credentials)?;
    startup_refresh(&interceptor, &config.bilibili).await;

    let signer =
        WbiSigner::new(client, &config.bilibili.endpoints()).with_cookies(Some(cookies));

    let query = signer
        .sign(params)
        .await
        .context("failed to sign parameters")?;
    println!("{query}");
    Ok(())
}

/// Cookie health check run before Bilibili commands unless disabled in the config.
///
/// Refreshed values are only logged by name; the configuration is not rewritten.
async fn startup_refresh(
    interceptor: &RequestInterceptor,
    config: &BilibiliConfig,
) -> Option<RefreshResult> {
    if !config.refresh_on_startup() {
        debug!("Startup cookie refresh disabled");
        return None;
    }
    interceptor.startup_check().await
}

async fn cookie_check(client: Client, config: &AuthConfig, show_values: bool) -> Result<()> {
    let interceptor = RequestInterceptor::bilibili(
        client,
        config.bilibili.endpoints(),
        config.bilibili.credentials(),
    )?;

    let Some(result) = interceptor.startup_check().await else {
        bail!("bilibili credentials need SESSDATA, bili_jct and refresh_token to refresh");
    };
    debug!(?result, "Cookie check finished");
    let report = if show_values {
        serde_json::to_value(&result)?
    } else {
        redacted_report(&result)
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !result.success {
        bail!("cookie refresh failed: {}", result.message);
    }
    Ok(())
}

async fn apple_token(client: Client, config: &AuthConfig, force: bool) -> Result<()> {
    let manager = MediaApiTokenManager::with_endpoints(
        client,
        config.apple_music.media_api_token.as_deref(),
        config.apple_music.endpoints(),
    )
    .context("invalid media API token in configuration")?;

    let result = if force && manager.is_auto_fetch() {
        manager.fetch_new_token().await
    } else {
        manager.token().await
    };
    let token = result.context("failed to obtain Apple Music media API token")?;

    println!("origin:  {}", token.origin().unwrap_or("-"));
    println!("expires: {}", expiry(token.token()));
    println!("mode:    {}", if manager.is_auto_fetch() { "auto" } else { "manual" });
    Ok(())
}

/// Refresh outcome with cookie names only.
fn redacted_report(result: &RefreshResult) -> serde_json::Value {
    serde_json::json!({
        "success": result.success,
        "message": result.message,
        "new_refresh_token": result.new_refresh_token.is_some(),
        "new_cookies": result.new_cookies.keys().collect::<Vec<_>>(),
    })
}

fn print_token(token: &Token) {
    println!("kind:    {}", token.kind());
    println!("expires: {}", expiry(token));
    println!("{}", token.bearer());
}

fn expiry(token: &Token) -> String {
    token
        .expires_at()
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string())
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}
