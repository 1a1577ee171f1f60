//! Configuration management for oidcx
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{OidcError, Result};
use crate::oidc::client_auth::TokenEndpointAuthMethod;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for oidcx
///
/// Holds the relying-party client registration and the session transport
/// settings used by the session manager.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// OAuth2/OIDC client registration
    #[serde(default)]
    pub client: ClientConfig,

    /// Session lifecycle and cookie settings
    #[serde(default)]
    pub session: SessionConfig,
}

/// Grant the client is registered for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// Authorization code grant, optionally with PKCE
    #[default]
    AuthorizationCode,
    /// Implicit grant (`response_type=id_token token`)
    Implicit,
    /// Device authorization grant (RFC 8628)
    DeviceCode,
    /// Client credentials grant
    ClientCredentials,
}

impl GrantType {
    /// Wire name used in error messages and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::Implicit => "implicit",
            Self::DeviceCode => "device_code",
            Self::ClientCredentials => "client_credentials",
        }
    }
}

/// Relying-party client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Issuer base URL; discovery is fetched from
    /// `{issuer}/.well-known/openid-configuration`
    #[serde(default)]
    pub issuer: String,

    /// Registered client identifier
    #[serde(default)]
    pub client_id: String,

    /// Client secret for confidential clients
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Redirect URI registered with the authorization server
    #[serde(default)]
    pub redirect_uri: Option<String>,

    /// Where the end-session endpoint sends the user after logout
    #[serde(default)]
    pub post_logout_redirect_uri: Option<String>,

    /// Space-separated scopes requested during authorization
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Grant the client drives
    #[serde(default)]
    pub grant_type: GrantType,

    /// Whether PKCE is used for the authorization code grant
    #[serde(default = "default_pkce")]
    pub pkce: bool,

    /// PKCE challenge method (`S256` or `plain`)
    #[serde(default = "default_pkce_method")]
    pub pkce_method: String,

    /// Client authentication method at the token endpoint
    ///
    /// Defaults to `client_secret_post` when a secret is configured and to
    /// `none` otherwise.
    #[serde(default)]
    pub token_endpoint_auth_method: Option<TokenEndpointAuthMethod>,

    /// JWS algorithm for `private_key_jwt` client assertions
    #[serde(default)]
    pub token_endpoint_auth_signing_alg: Option<String>,

    /// PEM-encoded private key for `private_key_jwt`
    #[serde(default)]
    pub private_key: Option<String>,

    /// Key id placed in the client assertion header
    #[serde(default)]
    pub private_key_id: Option<String>,

    /// Must be true for the TLS client authentication methods
    #[serde(default)]
    pub tls_client_certificate_bound_access_tokens: bool,

    /// Seconds before expiry at which a cached access token is refreshed
    #[serde(default = "default_token_refresh_threshold")]
    pub token_refresh_threshold: u64,

    /// PSS salt length in bytes; defaults to the digest length
    #[serde(default)]
    pub pss_salt_length: Option<usize>,

    /// Lifetime of a pending authorization `state` entry, in seconds
    #[serde(default = "default_state_ttl")]
    pub state_ttl: u64,

    /// Allowed clock skew when checking `exp`, in seconds
    #[serde(default)]
    pub clock_tolerance: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,
}

fn default_scope() -> String {
    "openid".to_string()
}

fn default_pkce() -> bool {
    true
}

fn default_pkce_method() -> String {
    "S256".to_string()
}

fn default_token_refresh_threshold() -> u64 {
    60
}

fn default_state_ttl() -> u64 {
    600
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            client_id: String::new(),
            client_secret: None,
            redirect_uri: None,
            post_logout_redirect_uri: None,
            scope: default_scope(),
            grant_type: GrantType::default(),
            pkce: default_pkce(),
            pkce_method: default_pkce_method(),
            token_endpoint_auth_method: None,
            token_endpoint_auth_signing_alg: None,
            private_key: None,
            private_key_id: None,
            tls_client_certificate_bound_access_tokens: false,
            token_refresh_threshold: default_token_refresh_threshold(),
            pss_salt_length: None,
            state_ttl: default_state_ttl(),
            clock_tolerance: 0,
            http_timeout: default_http_timeout(),
        }
    }
}

impl ClientConfig {
    /// Creates a minimal client configuration for `issuer` and `client_id`.
    pub fn new(issuer: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            ..Self::default()
        }
    }
}

/// Where the session manager keeps tokens
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Tokens live in the server-side session store, keyed by cookie
    #[default]
    Server,
    /// Tokens are handed to the client (cookie or JSON body)
    Client,
    /// Both of the above
    Hybrid,
}

impl SessionMode {
    /// True for `server` and `hybrid`.
    pub fn uses_server_store(&self) -> bool {
        matches!(self, Self::Server | Self::Hybrid)
    }

    /// True for `client` and `hybrid`.
    pub fn exposes_to_client(&self) -> bool {
        matches!(self, Self::Client | Self::Hybrid)
    }
}

/// How tokens are exposed to the client in `client`/`hybrid` mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientStorage {
    /// A cookie holding base64url-encoded JSON
    #[default]
    Cookie,
    /// A JSON response body
    Json,
}

/// `SameSite` attribute applied to every session cookie
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=Lax`
    #[default]
    Lax,
    /// `SameSite=None`
    None,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session mode
    #[serde(default)]
    pub mode: SessionMode,

    /// Name of the session-id cookie
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Name of the CSRF token cookie
    #[serde(default = "default_csrf_cookie_name")]
    pub csrf_cookie_name: String,

    /// Name of the cookie carrying tokens in client mode
    #[serde(default = "default_token_cookie_name")]
    pub token_cookie_name: String,

    /// Session lifetime in seconds; also the cookie `Max-Age`
    #[serde(default = "default_session_ttl")]
    pub ttl: u64,

    /// Client-side token transport
    #[serde(default)]
    pub client_storage: ClientStorage,

    /// `Secure` cookie attribute
    #[serde(default = "default_true")]
    pub secure: bool,

    /// `HttpOnly` cookie attribute
    #[serde(default = "default_true")]
    pub http_only: bool,

    /// `SameSite` cookie attribute
    #[serde(default)]
    pub same_site: SameSitePolicy,

    /// How long before access-token expiry the refresh timer fires, in ms
    #[serde(default = "default_refresh_threshold_ms")]
    pub refresh_threshold_ms: u64,

    /// Fetch user info when a session is created or updated
    #[serde(default = "default_true")]
    pub fetch_user_info: bool,
}

fn default_cookie_name() -> String {
    "sid".to_string()
}

fn default_csrf_cookie_name() -> String {
    "csrf_token".to_string()
}

fn default_token_cookie_name() -> String {
    "oidc_tokens".to_string()
}

fn default_session_ttl() -> u64 {
    86_400
}

fn default_true() -> bool {
    true
}

fn default_refresh_threshold_ms() -> u64 {
    60_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::default(),
            cookie_name: default_cookie_name(),
            csrf_cookie_name: default_csrf_cookie_name(),
            token_cookie_name: default_token_cookie_name(),
            ttl: default_session_ttl(),
            client_storage: ClientStorage::default(),
            secure: true,
            http_only: true,
            same_site: SameSitePolicy::default(),
            refresh_threshold_ms: default_refresh_threshold_ms(),
            fetch_user_info: true,
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| OidcError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| OidcError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(issuer) = std::env::var("OIDCX_ISSUER") {
            self.client.issuer = issuer;
        }

        if let Ok(client_id) = std::env::var("OIDCX_CLIENT_ID") {
            self.client.client_id = client_id;
        }

        if let Ok(secret) = std::env::var("OIDCX_CLIENT_SECRET") {
            self.client.client_secret = Some(secret);
        }

        if let Ok(redirect_uri) = std::env::var("OIDCX_REDIRECT_URI") {
            self.client.redirect_uri = Some(redirect_uri);
        }

        if let Ok(scope) = std::env::var("OIDCX_SCOPE") {
            self.client.scope = scope;
        }

        if let Ok(method) = std::env::var("OIDCX_TOKEN_ENDPOINT_AUTH_METHOD") {
            match method.parse::<TokenEndpointAuthMethod>() {
                Ok(m) => self.client.token_endpoint_auth_method = Some(m),
                Err(e) => tracing::warn!("Ignoring OIDCX_TOKEN_ENDPOINT_AUTH_METHOD: {}", e),
            }
        }

        if let Ok(private_key_file) = std::env::var("OIDCX_PRIVATE_KEY_FILE") {
            match std::fs::read_to_string(&private_key_file) {
                Ok(pem) => self.client.private_key = Some(pem),
                Err(e) => tracing::warn!(
                    "Failed to read private key from {}: {}",
                    private_key_file,
                    e
                ),
            }
        }

        if let Ok(mode) = std::env::var("OIDCX_SESSION_MODE") {
            match mode.as_str() {
                "server" => self.session.mode = SessionMode::Server,
                "client" => self.session.mode = SessionMode::Client,
                "hybrid" => self.session.mode = SessionMode::Hybrid,
                other => tracing::warn!("Ignoring unknown OIDCX_SESSION_MODE: {}", other),
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }

        if let Some(issuer) = &cli.issuer {
            self.client.issuer = issuer.clone();
        }

        if let Some(client_id) = &cli.client_id {
            self.client.client_id = client_id.clone();
        }
    }

    /// Validate the configuration
    ///
    /// Checks the fields every flow needs. Authentication-method consistency
    /// (secrets, keys, algorithms) is checked when the token manager is built.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Config`] if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.client.issuer.is_empty() {
            return Err(OidcError::Config("client.issuer cannot be empty".to_string()).into());
        }

        if url::Url::parse(&self.client.issuer).is_err() {
            return Err(OidcError::Config(format!(
                "client.issuer is not a valid URL: {}",
                self.client.issuer
            ))
            .into());
        }

        if self.client.client_id.is_empty() {
            return Err(OidcError::Config("client.client_id cannot be empty".to_string()).into());
        }

        if self.client.grant_type == GrantType::AuthorizationCode
            && self.client.redirect_uri.is_none()
        {
            return Err(OidcError::Config(
                "client.redirect_uri is required for the authorization_code grant".to_string(),
            )
            .into());
        }

        if self.client.http_timeout == 0 {
            return Err(
                OidcError::Config("client.http_timeout must be greater than 0".to_string()).into(),
            );
        }

        if self.client.state_ttl == 0 {
            return Err(
                OidcError::Config("client.state_ttl must be greater than 0".to_string()).into(),
            );
        }

        if self.session.ttl == 0 {
            return Err(
                OidcError::Config("session.ttl must be greater than 0".to_string()).into(),
            );
        }

        if self.session.cookie_name.is_empty() || self.session.csrf_cookie_name.is_empty() {
            return Err(
                OidcError::Config("session cookie names cannot be empty".to_string()).into(),
            );
        }

        Ok(())
    }
}
