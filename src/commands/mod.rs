/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `discover`  - Print the provider's discovery document
- `login`     - Authorization code flow with a loopback redirect listener
- `device`    - Device authorization flow
- `tokens`    - Refresh, introspection, revocation, logout URL and claims

Each handler builds the engine from the loaded [`Config`] and prints its
result as JSON on stdout.
*/

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::oidc::discovery::{build_http_client, HttpIssuer, Issuer};
use crate::oidc::flow::AuthorizationFlow;
use crate::oidc::tokens::TokenManager;

/// Builds the token manager and authorization flow for `config`.
///
/// # Errors
///
/// Fails when the issuer URL is invalid or the client authentication
/// settings are inconsistent.
pub fn build_engine(config: &Config) -> Result<(Arc<TokenManager>, AuthorizationFlow)> {
    let http = build_http_client(config.client.http_timeout)?;
    let issuer: Arc<dyn Issuer> = Arc::new(HttpIssuer::new(http.clone(), &config.client.issuer)?);
    let tokens = Arc::new(TokenManager::new(config.client.clone(), http, issuer)?);
    let flow = AuthorizationFlow::new(tokens.clone());
    Ok((tokens, flow))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// Discovery command handler
pub mod discover {
    //! Prints the discovery document.

    use super::*;

    /// Fetch and print the provider metadata
    pub async fn run_discover(config: Config) -> Result<()> {
        let (tokens, _) = build_engine(&config)?;
        let meta = tokens.issuer().discover(true).await?;
        print_json(&meta)
    }
}

// Authorization code login handler
pub mod login {
    //! Authorization code flow with a loopback redirect listener.
    //!
    //! Binds `127.0.0.1:<port>`, prints the authorization URL, accepts a
    //! single redirect request, and completes the flow with it.

    use super::*;
    use crate::error::OidcError;
    use std::io::{BufRead, BufReader, Write};

    /// Run the authorization code flow
    ///
    /// # Arguments
    ///
    /// * `config` - Loaded configuration; `redirect_uri` defaults to the
    ///   loopback listener when unset
    /// * `port` - Loopback port
    /// * `params` - Extra authorization request parameters
    pub async fn run_login(mut config: Config, port: u16, params: Vec<(String, String)>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| OidcError::Config(format!("cannot listen on 127.0.0.1:{port}: {e}")))?;

        let base = format!("http://127.0.0.1:{port}");
        if config.client.redirect_uri.is_none() {
            config.client.redirect_uri = Some(format!("{base}/callback"));
        }

        let (tokens, flow) = build_engine(&config)?;
        let extra: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let attempt = flow.get_authorization_url(&extra).await?;

        println!("\nOpen this URL in a browser to log in:\n\n  {}\n", attempt.url);
        println!("Waiting for the redirect on {base} ...");

        let target = accept_redirect(listener).await?;
        flow.handle_redirect_url(&format!("{base}{target}")).await?;

        match tokens.get_tokens() {
            Some(set) => print_json(&set),
            None => Err(OidcError::NoValidToken.into()),
        }
    }

    /// Accepts one HTTP request and returns its request target.
    async fn accept_redirect(listener: tokio::net::TcpListener) -> Result<String> {
        let (stream, _peer) = listener
            .accept()
            .await
            .map_err(|e| OidcError::MissingRedirectParameter(format!("accept failed: {e}")))?;

        tokio::task::spawn_blocking(move || -> Result<String> {
            let std_stream = stream.into_std()?;
            std_stream.set_nonblocking(false)?;
            let mut write_stream = std_stream.try_clone()?;

            let mut request_line = String::new();
            for line in BufReader::new(std_stream).lines() {
                let line = line?;
                if line.is_empty() {
                    break;
                }
                if request_line.is_empty() {
                    request_line = line;
                }
            }

            let response = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nLogin complete. You may close this tab.";
            let _ = write_stream.write_all(response.as_bytes());

            // "GET /callback?code=...&state=... HTTP/1.1"
            request_line
                .split_whitespace()
                .nth(1)
                .map(str::to_string)
                .ok_or_else(|| {
                    OidcError::MissingRedirectParameter("malformed redirect request".to_string())
                        .into()
                })
        })
        .await
        .map_err(|e| OidcError::MissingRedirectParameter(format!("redirect task failed: {e}")))?
    }
}

// Device flow handler
pub mod device {
    //! Device authorization flow.

    use super::*;
    use std::time::Duration;

    /// Run the device flow and print the issued tokens
    pub async fn run_device(config: Config, timeout_secs: Option<u64>) -> Result<()> {
        let (_, flow) = build_engine(&config)?;
        let authorization = flow.start_device_authorization().await?;

        println!("\nDevice login required:");
        match &authorization.verification_uri_complete {
            Some(complete) => println!("  Visit: {complete}"),
            None => {
                println!("  1. Visit: {}", authorization.verification_uri);
                println!("  2. Enter code: {}", authorization.user_code);
            }
        }
        println!("\nWaiting for authorization...");

        let tokens = flow
            .poll_device_token(
                &authorization.device_code,
                authorization.interval,
                timeout_secs.map(Duration::from_secs),
            )
            .await?;
        print_json(&tokens)
    }
}

// Token management handlers
pub mod tokens {
    //! Refresh, introspection, revocation, logout URL and claims.

    use super::*;
    use crate::oidc::tokens::TokenSet;

    /// Use `refresh_token` to obtain new tokens
    pub async fn run_refresh(config: Config, refresh_token: String) -> Result<()> {
        let (tokens, _) = build_engine(&config)?;
        let mut seed = TokenSet::bearer(String::new());
        seed.refresh_token = Some(refresh_token);
        tokens.set_tokens(seed);
        let refreshed = tokens.refresh_access_token().await?;
        print_json(&refreshed)
    }

    /// Introspect `token`
    pub async fn run_introspect(config: Config, token: String, hint: Option<String>) -> Result<()> {
        let (tokens, _) = build_engine(&config)?;
        let resp = tokens.introspect_token(&token, hint.as_deref()).await?;
        print_json(&resp)
    }

    /// Revoke `token`
    pub async fn run_revoke(config: Config, token: String, hint: Option<String>) -> Result<()> {
        let (tokens, _) = build_engine(&config)?;
        tokens.revoke_token(&token, hint.as_deref()).await?;
        println!("Token revoked");
        Ok(())
    }

    /// Print an RP-initiated logout URL
    pub async fn run_logout_url(
        config: Config,
        id_token_hint: Option<String>,
        state: Option<String>,
    ) -> Result<()> {
        let (_, flow) = build_engine(&config)?;
        let url = flow
            .get_logout_url(id_token_hint.as_deref(), state.as_deref())
            .await?;
        println!("{url}");
        Ok(())
    }

    /// Print the claims carried by, or resolvable for, `access_token`
    pub async fn run_claims(config: Config, access_token: String) -> Result<()> {
        let (tokens, _) = build_engine(&config)?;
        tokens.set_tokens(TokenSet::bearer(access_token));
        let claims = tokens.get_claims().await?;
        print_json(&claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    #[test]
    fn test_build_engine_rejects_invalid_issuer() {
        let config = Config {
            client: ClientConfig::new("not a url", "app"),
            ..Config::default()
        };
        assert!(build_engine(&config).is_err());
    }

    #[test]
    fn test_build_engine_rejects_basic_without_secret() {
        let mut client = ClientConfig::new("https://id.example.com", "app");
        client.token_endpoint_auth_method =
            Some(crate::oidc::client_auth::TokenEndpointAuthMethod::ClientSecretBasic);
        let config = Config {
            client,
            ..Config::default()
        };
        let err = build_engine(&config).unwrap_err();
        assert_eq!(
            crate::error::error_code(&err),
            Some("MISSING_CLIENT_SECRET")
        );
    }

    #[tokio::test]
    async fn test_build_engine_shares_token_manager() {
        let config = Config {
            client: ClientConfig::new("https://id.example.com", "app"),
            ..Config::default()
        };
        let (tokens, flow) = build_engine(&config).unwrap();
        assert!(Arc::ptr_eq(&tokens, flow.tokens()));
    }
}
