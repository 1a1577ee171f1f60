//! oidcx - OAuth 2.0 / OpenID Connect client
//!
#![doc = "oidcx - OAuth 2.0 / OpenID Connect client"]
#![doc = "Main entry point for the oidcx command-line tool."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use oidcx::cli::{Cli, Commands};
use oidcx::commands;
use oidcx::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Discover => {
            tracing::info!("Fetching discovery document for {}", config.client.issuer);
            commands::discover::run_discover(config).await?;
            Ok(())
        }
        Commands::Login { port, params } => {
            tracing::info!("Starting authorization code login");
            commands::login::run_login(config, port, params).await?;
            Ok(())
        }
        Commands::Device { timeout } => {
            tracing::info!("Starting device authorization");
            if let Some(t) = timeout {
                tracing::debug!("Polling timeout: {}s", t);
            }
            commands::device::run_device(config, timeout).await?;
            Ok(())
        }
        Commands::Refresh { refresh_token } => {
            tracing::info!("Refreshing tokens");
            commands::tokens::run_refresh(config, refresh_token).await?;
            Ok(())
        }
        Commands::Introspect { token, hint } => {
            tracing::info!("Introspecting token");
            commands::tokens::run_introspect(config, token, hint).await?;
            Ok(())
        }
        Commands::Revoke { token, hint } => {
            tracing::info!("Revoking token");
            commands::tokens::run_revoke(config, token, hint).await?;
            Ok(())
        }
        Commands::LogoutUrl {
            id_token_hint,
            state,
        } => {
            commands::tokens::run_logout_url(config, id_token_hint, state).await?;
            Ok(())
        }
        Commands::Claims { access_token } => {
            tracing::info!("Resolving token claims");
            commands::tokens::run_claims(config, access_token).await?;
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter
fn init_tracing(verbose: bool) {
    let default = if verbose { "oidcx=debug" } else { "oidcx=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
