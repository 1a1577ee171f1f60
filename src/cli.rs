//! Command-line interface definition for oidcx
//!
//! This module defines the CLI structure using clap's derive API. Each
//! subcommand maps to one operation of the OIDC client engine.

use clap::{Parser, Subcommand};

/// oidcx - OAuth 2.0 / OpenID Connect client
///
/// Discover a provider, log in with the authorization code or device flow,
/// and manage the resulting tokens.
#[derive(Parser, Debug, Clone)]
#[command(name = "oidcx")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the configured issuer URL
    #[arg(long, global = true)]
    pub issuer: Option<String>,

    /// Override the configured client id
    #[arg(long, global = true)]
    pub client_id: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for oidcx
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Fetch and print the provider's discovery document
    Discover,

    /// Log in with the authorization code flow and a loopback redirect
    Login {
        /// Loopback port to listen on for the redirect
        #[arg(short, long, default_value_t = 8765)]
        port: u16,

        /// Extra authorization request parameters as key=value
        #[arg(long = "param", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },

    /// Log in with the device authorization flow
    Device {
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Exchange a refresh token for new tokens
    Refresh {
        /// Refresh token to use
        #[arg(long)]
        refresh_token: String,
    },

    /// Introspect a token
    Introspect {
        /// Token to introspect
        token: String,

        /// Token type hint (access_token, refresh_token)
        #[arg(long)]
        hint: Option<String>,
    },

    /// Revoke a token
    Revoke {
        /// Token to revoke
        token: String,

        /// Token type hint (access_token, refresh_token)
        #[arg(long)]
        hint: Option<String>,
    },

    /// Print an RP-initiated logout URL
    LogoutUrl {
        /// ID token to pass as id_token_hint
        #[arg(long)]
        id_token_hint: Option<String>,

        /// State to round-trip through the logout
        #[arg(long)]
        state: Option<String>,
    },

    /// Print the claims for an access token
    Claims {
        /// Access token (JWT tokens are verified, opaque ones sent to UserInfo)
        #[arg(long)]
        access_token: String,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
