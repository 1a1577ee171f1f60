//! Error types for oidcx
//!
//! This module defines every error the engine can raise, using `thiserror`
//! for the enum and `anyhow` for propagation. Each variant carries a stable
//! string code (see [`OidcError::code`]) so callers can branch on failures
//! without matching display text.

use thiserror::Error;

/// Main error type for oidcx operations
///
/// Variants fall into four groups: construction-time configuration errors,
/// protocol/network errors surfaced by the token and discovery endpoints,
/// validation errors (CSRF, ID token, signatures), and state-precondition
/// errors (no tokens, no refresh token).
#[derive(Error, Debug)]
pub enum OidcError {
    /// Configuration-related errors (missing or inconsistent client fields)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A `client_secret_*` authentication method is configured without a secret
    #[error("Missing client secret: {0} requires client_secret")]
    MissingClientSecret(String),

    /// `private_key_jwt` is configured without a private key
    #[error("Missing private key: private_key_jwt requires private_key")]
    MissingPrivateKey,

    /// `private_key_jwt` is configured without a signing algorithm
    #[error("Missing algorithm: private_key_jwt requires token_endpoint_auth_signing_alg")]
    MissingAlgorithm,

    /// The configured grant type cannot be used for the requested operation
    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    /// The discovery document does not advertise a required endpoint
    #[error("Missing endpoint in discovery document: {0}")]
    MissingEndpoint(String),

    /// Discovery document fetch or parse failure
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Remote key set fetch, parse, or lookup failure
    #[error("JWKS error: {0}")]
    Jwks(String),

    /// State or CSRF token validation failed
    #[error("CSRF validation failed: {0}")]
    Csrf(String),

    /// The authorization server redirected back with an `error` parameter
    #[error("Authorization error: {error}{}", description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    AuthorizationError {
        /// OAuth error code (e.g. `access_denied`)
        error: String,
        /// Optional human-readable `error_description`
        description: Option<String>,
    },

    /// A required redirect parameter was absent
    #[error("Missing redirect parameter: {0}")]
    MissingRedirectParameter(String),

    /// Authorization code exchange failed
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// Refresh token grant failed
    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    /// Any other token endpoint grant failed
    #[error("Token request failed: {0}")]
    TokenRequest(String),

    /// Token introspection failed
    #[error("Introspection failed: {0}")]
    Introspection(String),

    /// Token revocation failed
    #[error("Revocation failed: {0}")]
    Revocation(String),

    /// ID token or JWT signature/claim validation failed
    #[error("ID token validation failed: {0}")]
    IdTokenValidation(String),

    /// The device code expired before the user authorized it
    #[error("Device code expired before authorization")]
    DeviceCodeExpired,

    /// Device polling exceeded the caller-supplied timeout
    #[error("Device token polling timed out after {elapsed_ms}ms")]
    DeviceTokenPollingTimeout {
        /// Elapsed milliseconds when the timeout was detected
        elapsed_ms: u64,
    },

    /// Device polling failed with a terminal error
    #[error("Device token polling failed: {0}")]
    DeviceTokenPollingFailed(String),

    /// No token set is available for the requested operation
    #[error("{0}")]
    NoTokensAvailable(String),

    /// A refresh was requested without a cached refresh token
    #[error("No refresh token available")]
    NoRefreshToken,

    /// No valid access token could be obtained
    #[error("No valid access token available")]
    NoValidToken,

    /// Session store or session state failure
    #[error("Session error: {0}")]
    Session(String),

    /// UserInfo endpoint failure
    #[error("UserInfo error: {0}")]
    UserInfo(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl OidcError {
    /// Returns the stable, machine-readable code for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use oidcx::error::OidcError;
    ///
    /// assert_eq!(OidcError::NoRefreshToken.code(), "NO_REFRESH_TOKEN");
    /// assert_eq!(OidcError::Csrf("x".into()).code(), "CSRF_VALIDATION_FAILED");
    /// ```
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::MissingClientSecret(_) => "MISSING_CLIENT_SECRET",
            Self::MissingPrivateKey => "MISSING_PRIVATE_KEY",
            Self::MissingAlgorithm => "MISSING_ALGORITHM",
            Self::UnsupportedGrantType(_) => "UNSUPPORTED_GRANT_TYPE",
            Self::MissingEndpoint(_) => "MISSING_ENDPOINT",
            Self::Discovery(_) => "DISCOVERY_ERROR",
            Self::Jwks(_) => "JWKS_ERROR",
            Self::Csrf(_) => "CSRF_VALIDATION_FAILED",
            Self::AuthorizationError { .. } => "AUTHORIZATION_ERROR",
            Self::MissingRedirectParameter(_) => "MISSING_REDIRECT_PARAMETER",
            Self::TokenExchange(_) => "TOKEN_EXCHANGE_ERROR",
            Self::TokenRefresh(_) => "TOKEN_REFRESH_ERROR",
            Self::TokenRequest(_) => "TOKEN_REQUEST_ERROR",
            Self::Introspection(_) => "INTROSPECTION_ERROR",
            Self::Revocation(_) => "REVOCATION_ERROR",
            Self::IdTokenValidation(_) => "ID_TOKEN_VALIDATION_ERROR",
            Self::DeviceCodeExpired => "DEVICE_CODE_EXPIRED",
            Self::DeviceTokenPollingTimeout { .. } => "DEVICE_TOKEN_POLLING_TIMEOUT",
            Self::DeviceTokenPollingFailed(_) => "DEVICE_TOKEN_POLLING_FAILED",
            Self::NoTokensAvailable(_) => "NO_TOKENS_AVAILABLE",
            Self::NoRefreshToken => "NO_REFRESH_TOKEN",
            Self::NoValidToken => "NO_VALID_TOKEN",
            Self::Session(_) => "SESSION_ERROR",
            Self::UserInfo(_) => "USERINFO_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Yaml(_) => "YAML_ERROR",
            Self::Http(_) => "HTTP_ERROR",
        }
    }
}

/// Result type alias for oidcx operations
///
/// Uses `anyhow::Error` so transport and parse failures can be wrapped with
/// an [`OidcError`] context while the original error stays in the chain.
pub type Result<T> = anyhow::Result<T>;

/// Recovers the stable [`OidcError::code`] from an `anyhow` error.
///
/// Works both for errors created from an [`OidcError`] directly and for
/// errors where an [`OidcError`] was attached as context.
///
/// # Examples
///
/// ```
/// use anyhow::Context as _;
/// use oidcx::error::{error_code, OidcError};
///
/// let direct: anyhow::Error = OidcError::NoValidToken.into();
/// assert_eq!(error_code(&direct), Some("NO_VALID_TOKEN"));
///
/// let wrapped = std::fs::read("/definitely/not/here")
///     .context(OidcError::Config("cannot read key".into()))
///     .unwrap_err();
/// assert_eq!(error_code(&wrapped), Some("CONFIG_ERROR"));
/// ```
pub fn error_code(err: &anyhow::Error) -> Option<&'static str> {
    err.downcast_ref::<OidcError>().map(OidcError::code)
}
