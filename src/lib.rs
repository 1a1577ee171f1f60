//! oidcx - OAuth 2.0 / OpenID Connect client engine
//!
//! This library implements the client side of OAuth 2.0 and OpenID Connect:
//! building authorization requests, handling redirects, running the device
//! flow, managing the token lifecycle, verifying JWS signatures, and binding
//! tokens to HTTP sessions.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `oidc`: Protocol engine (discovery, keys, flows, tokens, signatures)
//! - `session`: Session manager, session store, cookies and refresh timers
//! - `clock`: Injectable time source
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//! - `commands`: CLI command handlers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use oidcx::config::ClientConfig;
//! use oidcx::oidc::{AuthorizationFlow, HttpIssuer, TokenManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut client = ClientConfig::new("https://id.example.com", "my-app");
//!     client.redirect_uri = Some("https://app.example.com/callback".to_string());
//!
//!     let http = reqwest::Client::new();
//!     let issuer = Arc::new(HttpIssuer::new(http.clone(), &client.issuer)?);
//!     let tokens = Arc::new(TokenManager::new(client, http, issuer)?);
//!     let flow = AuthorizationFlow::new(tokens);
//!
//!     let attempt = flow.get_authorization_url(&[]).await?;
//!     println!("{}", attempt.url);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod oidc;
pub mod session;

// Re-export commonly used types
pub use config::Config;
pub use error::{error_code, OidcError, Result};
pub use oidc::{AuthorizationFlow, SignatureVerifier, TokenManager, TokenSet};
pub use session::{SessionContext, SessionManager};
