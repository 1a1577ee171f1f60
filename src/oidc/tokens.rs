//! Token lifecycle management
//!
//! [`TokenManager`] owns the current [`TokenSet`] and performs every call to
//! the token, introspection and revocation endpoints. All of them go through
//! the configured client authentication method (see
//! [`crate::oidc::client_auth`]).
//!
//! # Concurrency
//!
//! The token set and its computed expiry are stored together behind one
//! lock and replaced as a whole, so readers never observe a half-updated
//! state.

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::error::{OidcError, Result};
use crate::oidc::client_auth::{ClientAuthenticator, PreparedRequest};
use crate::oidc::discovery::{ClientMetadata, Issuer};
use crate::oidc::jwks::{KeySet, RemoteJwks};
use crate::oidc::jwt::{self, Claims, IdTokenExpectations};
use crate::oidc::userinfo::{HttpUserInfo, UserInfo};
use crate::oidc::verifier::SignatureVerifier;

/// Grant type for RFC 7523 JWT bearer assertions.
pub const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

// ---------------------------------------------------------------------------
// TokenSet
// ---------------------------------------------------------------------------

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Tokens returned by the token endpoint.
///
/// Deserializes directly from a token endpoint response; `token_type`
/// defaults to `Bearer` when the server omits it.
///
/// # Examples
///
/// ```
/// use oidcx::oidc::tokens::TokenSet;
///
/// let tokens: TokenSet = serde_json::from_str(r#"{"access_token":"at","expires_in":120}"#).unwrap();
/// assert_eq!(tokens.token_type, "Bearer");
/// assert_eq!(tokens.expires_in, Some(120));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenSet {
    /// The access token.
    pub access_token: String,

    /// Refresh token, when issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// ID token, when issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Access token lifetime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    /// Token type.
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Granted scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenSet {
    /// Creates a bearer token set holding only `access_token`.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            id_token: None,
            expires_in: None,
            token_type: default_token_type(),
            scope: None,
        }
    }
}

/// RFC 7662 introspection response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntrospectionResponse {
    /// Whether the token is currently active.
    pub active: bool,
    /// Scopes associated with the token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Client the token was issued to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Resource owner username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Token type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Expiry, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Issue time, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Audience, string or array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Remaining fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// OAuth error body (RFC 6749 section 5.2).
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OAuthErrorBody {
    pub(crate) error: String,
    #[serde(default)]
    pub(crate) error_description: Option<String>,
}

impl OAuthErrorBody {
    pub(crate) fn describe(&self) -> String {
        match &self.error_description {
            Some(d) => format!("{} ({})", self.error, d),
            None => self.error.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct TokenState {
    tokens: TokenSet,
    expires_at: Option<DateTime<Utc>>,
}

/// Which grant a token request belongs to; selects the error variant.
#[derive(Debug, Clone, Copy)]
enum GrantKind {
    Exchange,
    Refresh,
    Other,
}

impl GrantKind {
    fn error(self, msg: String) -> OidcError {
        match self {
            Self::Exchange => OidcError::TokenExchange(msg),
            Self::Refresh => OidcError::TokenRefresh(msg),
            Self::Other => OidcError::TokenRequest(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// TokenManager
// ---------------------------------------------------------------------------

/// Owns the current token set and talks to the provider's token endpoints.
pub struct TokenManager {
    config: ClientConfig,
    http: reqwest::Client,
    issuer: Arc<dyn Issuer>,
    auth: ClientAuthenticator,
    verifier: SignatureVerifier,
    user_info: Arc<dyn UserInfo>,
    clock: Arc<dyn Clock>,
    state: RwLock<Option<TokenState>>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("client_id", &self.config.client_id)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Creates a token manager for `config`.
    ///
    /// Keys are fetched from the discovered `jwks_uri`, user info from the
    /// discovered `userinfo_endpoint`, and time comes from the system clock.
    /// Use the `with_*` methods to replace any of them.
    ///
    /// # Arguments
    ///
    /// * `config` - Client registration
    /// * `http` - Shared HTTP client
    /// * `issuer` - Source of provider metadata
    ///
    /// # Errors
    ///
    /// Fails when the client authentication configuration is inconsistent;
    /// see [`ClientAuthenticator::from_config`].
    pub fn new(config: ClientConfig, http: reqwest::Client, issuer: Arc<dyn Issuer>) -> Result<Self> {
        let auth = ClientAuthenticator::from_config(&config)?;
        let keys: Arc<dyn KeySet> = Arc::new(RemoteJwks::from_issuer(http.clone(), issuer.clone()));
        let verifier = SignatureVerifier::new(keys).with_pss_salt_length(config.pss_salt_length);
        let user_info: Arc<dyn UserInfo> = Arc::new(HttpUserInfo::new(http.clone(), issuer.clone()));

        tracing::debug!(
            "Token manager for client {} uses {}",
            config.client_id,
            auth.method()
        );

        Ok(Self {
            config,
            http,
            issuer,
            auth,
            verifier,
            user_info,
            clock: Arc::new(SystemClock),
            state: RwLock::new(None),
        })
    }

    /// Replaces the key set used for signature verification.
    pub fn with_key_set(mut self, keys: Arc<dyn KeySet>) -> Self {
        self.verifier = SignatureVerifier::new(keys).with_pss_salt_length(self.config.pss_salt_length);
        self
    }

    /// Replaces the UserInfo capability.
    pub fn with_user_info(mut self, user_info: Arc<dyn UserInfo>) -> Self {
        self.user_info = user_info;
        self
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The metadata source.
    pub fn issuer(&self) -> &Arc<dyn Issuer> {
        &self.issuer
    }

    /// The signature verifier.
    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    /// The UserInfo capability.
    pub fn user_info(&self) -> &Arc<dyn UserInfo> {
        &self.user_info
    }

    /// The clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Shared HTTP client.
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    // -----------------------------------------------------------------------
    // Token state
    // -----------------------------------------------------------------------

    /// Returns a copy of the current token set.
    pub fn get_tokens(&self) -> Option<TokenSet> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.tokens.clone())
    }

    /// Replaces the current token set; its expiry is computed from now.
    pub fn set_tokens(&self, tokens: TokenSet) {
        let now = self.clock.now();
        let expires_at = tokens.expires_in.and_then(|secs| {
            i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|lifetime| now.checked_add_signed(lifetime))
        });
        *self.state.write().unwrap_or_else(PoisonError::into_inner) =
            Some(TokenState { tokens, expires_at });
    }

    /// Restores a token set saved earlier, keeping its absolute expiry.
    ///
    /// Unlike [`Self::set_tokens`] the lifetime is not restarted, so a token
    /// that expired while the set was stored is reported stale. Without a
    /// recorded `expires_at` this behaves like [`Self::set_tokens`].
    pub fn restore_tokens(&self, tokens: TokenSet, expires_at: Option<DateTime<Utc>>) {
        let Some(expires_at) = expires_at else {
            self.set_tokens(tokens);
            return;
        };
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(TokenState {
            tokens,
            expires_at: Some(expires_at),
        });
    }

    /// Forgets the current token set.
    pub fn clear_tokens(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// When the current access token expires, if known.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|s| s.expires_at)
    }

    // -----------------------------------------------------------------------
    // Grants
    // -----------------------------------------------------------------------

    /// Exchanges an authorization code for tokens and stores them.
    ///
    /// # Arguments
    ///
    /// * `code` - Authorization code from the redirect
    /// * `code_verifier` - PKCE verifier, when PKCE was used
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::TokenExchange`] on transport failure, a non-2xx
    /// status, or a malformed response.
    pub async fn exchange_code_for_token(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenSet> {
        let mut params = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
        ];
        if let Some(redirect_uri) = &self.config.redirect_uri {
            params.push(("redirect_uri".to_string(), redirect_uri.clone()));
        }
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier".to_string(), verifier.to_string()));
        }

        let tokens = self.token_request(params, GrantKind::Exchange).await?;
        self.set_tokens(tokens.clone());
        tracing::info!("Authorization code exchanged for tokens");
        Ok(tokens)
    }

    /// Uses the cached refresh token to obtain a new token set.
    ///
    /// A response without a new `refresh_token` keeps the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::NoRefreshToken`] when no refresh token is
    /// cached and [`OidcError::TokenRefresh`] when the request fails.
    pub async fn refresh_access_token(&self) -> Result<TokenSet> {
        let refresh_token = self
            .get_tokens()
            .and_then(|t| t.refresh_token)
            .ok_or(OidcError::NoRefreshToken)?;

        let params = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.clone()),
        ];

        let mut tokens = self.token_request(params, GrantKind::Refresh).await?;
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token);
        }
        self.set_tokens(tokens.clone());
        tracing::info!("Access token refreshed");
        Ok(tokens)
    }

    /// Performs the client credentials grant and stores the result.
    pub async fn client_credentials_grant(&self, scope: Option<&str>) -> Result<TokenSet> {
        let mut params = vec![("grant_type".to_string(), "client_credentials".to_string())];
        if let Some(scope) = scope {
            params.push(("scope".to_string(), scope.to_string()));
        }

        let tokens = self.token_request(params, GrantKind::Other).await?;
        self.set_tokens(tokens.clone());
        tracing::info!("Client credentials grant completed");
        Ok(tokens)
    }

    /// Exchanges a JWT assertion for tokens (RFC 7523) and stores them.
    pub async fn jwt_bearer_grant(&self, assertion: &str, scope: Option<&str>) -> Result<TokenSet> {
        let mut params = vec![
            ("grant_type".to_string(), JWT_BEARER_GRANT_TYPE.to_string()),
            ("assertion".to_string(), assertion.to_string()),
        ];
        if let Some(scope) = scope {
            params.push(("scope".to_string(), scope.to_string()));
        }

        let tokens = self.token_request(params, GrantKind::Other).await?;
        self.set_tokens(tokens.clone());
        tracing::info!("JWT bearer grant completed");
        Ok(tokens)
    }

    /// Returns a usable access token.
    ///
    /// The cached token is returned unless it expires within
    /// `token_refresh_threshold` seconds; in that case it is refreshed when
    /// a refresh token exists. Returns `None` when no token is available.
    ///
    /// # Errors
    ///
    /// Propagates refresh failures.
    pub async fn get_access_token(&self) -> Result<Option<String>> {
        let Some(tokens) = self.get_tokens() else {
            return Ok(None);
        };

        let threshold = i64::try_from(self.config.token_refresh_threshold)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        let now = self.clock.now();
        let stale = self.expires_at().is_some_and(|at| {
            at.checked_sub_signed(threshold)
                .map_or(true, |refresh_at| refresh_at <= now)
        });

        if !stale {
            return Ok(Some(tokens.access_token));
        }

        if tokens.refresh_token.is_some() {
            tracing::debug!("Access token is within the refresh threshold, refreshing");
            let refreshed = self.refresh_access_token().await?;
            return Ok(Some(refreshed.access_token));
        }

        tracing::debug!("Access token is stale and no refresh token is available");
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Introspection and revocation
    // -----------------------------------------------------------------------

    /// Introspects `token` (RFC 7662).
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Introspection`] if the endpoint is not advertised
    /// or the request fails.
    pub async fn introspect_token(
        &self,
        token: &str,
        token_type_hint: Option<&str>,
    ) -> Result<IntrospectionResponse> {
        let meta = self.issuer.discover(false).await?;
        let endpoint = meta.introspection_endpoint.ok_or_else(|| {
            OidcError::Introspection("introspection endpoint not advertised".to_string())
        })?;

        let resp = self
            .post_authenticated(&endpoint, token_params(token, token_type_hint))
            .await
            .context(OidcError::Introspection("request failed".to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .context(OidcError::Introspection("failed to read response".to_string()))?;
        if !status.is_success() {
            return Err(OidcError::Introspection(describe_failure(status, &body)).into());
        }

        serde_json::from_str(&body)
            .context(OidcError::Introspection("malformed response".to_string()))
    }

    /// Revokes `token` (RFC 7009).
    ///
    /// If `token` is the cached access or refresh token, the local token set
    /// is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Revocation`] if the endpoint is not advertised
    /// or the request fails.
    pub async fn revoke_token(&self, token: &str, token_type_hint: Option<&str>) -> Result<()> {
        let meta = self.issuer.discover(false).await?;
        let endpoint = meta.revocation_endpoint.ok_or_else(|| {
            OidcError::Revocation("revocation endpoint not advertised".to_string())
        })?;

        let resp = self
            .post_authenticated(&endpoint, token_params(token, token_type_hint))
            .await
            .context(OidcError::Revocation("request failed".to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OidcError::Revocation(describe_failure(status, &body)).into());
        }

        let cached = self.get_tokens().is_some_and(|t| {
            t.access_token == token || t.refresh_token.as_deref() == Some(token)
        });
        if cached {
            tracing::debug!("Revoked token was cached, clearing local tokens");
            self.clear_tokens();
        }

        tracing::info!("Token revoked");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Claims
    // -----------------------------------------------------------------------

    /// Verifies an ID token and checks its registered claims.
    ///
    /// # Arguments
    ///
    /// * `id_token` - Compact JWS
    /// * `expected_nonce` - Nonce from the authorization request, if any
    ///
    /// # Returns
    ///
    /// The verified claims.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::IdTokenValidation`] for a bad signature or when
    /// `iss`, `aud`, `exp` or `nonce` do not match.
    pub async fn validate_id_token(
        &self,
        id_token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<Claims> {
        let claims = self.verifier.verify_and_decode(id_token).await?;
        let meta = self.issuer.discover(false).await?;
        jwt::validate_id_token_claims(
            &claims,
            &IdTokenExpectations {
                issuer: &meta.issuer,
                client_id: &self.config.client_id,
                nonce: expected_nonce,
                now: self.clock.now(),
                clock_tolerance: self.config.clock_tolerance,
            },
        )?;
        Ok(claims)
    }

    /// Returns the claims for the current access token.
    ///
    /// A JWT access token is verified and its payload returned; an opaque
    /// token is sent to the UserInfo endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::NoValidToken`] when no access token is available.
    pub async fn get_claims(&self) -> Result<Claims> {
        let token = self
            .get_access_token()
            .await?
            .ok_or(OidcError::NoValidToken)?;

        if jwt::is_jwt(&token) {
            self.verifier.verify_and_decode(&token).await
        } else {
            self.user_info.get_user_info(&token).await
        }
    }

    /// Fetches UserInfo claims with the current access token.
    pub async fn fetch_user_info(&self) -> Result<Claims> {
        let token = self
            .get_access_token()
            .await?
            .ok_or(OidcError::NoValidToken)?;
        self.user_info.get_user_info(&token).await
    }

    // -----------------------------------------------------------------------
    // HTTP plumbing
    // -----------------------------------------------------------------------

    /// Adds client authentication to `params` for `endpoint`.
    pub(crate) fn authenticate(
        &self,
        params: Vec<(String, String)>,
        endpoint: &str,
    ) -> Result<PreparedRequest> {
        self.auth.apply(params, endpoint, self.clock.now())
    }

    /// POSTs an authenticated form to `endpoint`.
    pub(crate) async fn post_authenticated(
        &self,
        endpoint: &str,
        params: Vec<(String, String)>,
    ) -> Result<reqwest::Response> {
        let prepared = self.authenticate(params, endpoint)?;
        let resp = prepared
            .apply_to(self.http.post(endpoint))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        Ok(resp)
    }

    /// Discovers the provider and returns its metadata.
    pub(crate) async fn metadata(&self) -> Result<ClientMetadata> {
        self.issuer.discover(false).await
    }

    async fn token_request(&self, params: Vec<(String, String)>, kind: GrantKind) -> Result<TokenSet> {
        let meta = self.metadata().await?;
        let grant = params
            .first()
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        tracing::debug!("POST {} (grant_type={})", meta.token_endpoint, grant);

        let resp = self
            .post_authenticated(&meta.token_endpoint, params)
            .await
            .with_context(|| kind.error("request failed".to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| kind.error("failed to read response".to_string()))?;

        if !status.is_success() {
            return Err(kind.error(describe_failure(status, &body)).into());
        }

        serde_json::from_str::<TokenSet>(&body)
            .with_context(|| kind.error("malformed token response".to_string()))
    }
}

fn token_params(token: &str, hint: Option<&str>) -> Vec<(String, String)> {
    let mut params = vec![("token".to_string(), token.to_string())];
    if let Some(hint) = hint {
        params.push(("token_type_hint".to_string(), hint.to_string()));
    }
    params
}

/// Formats a non-2xx response, preferring the OAuth error body.
pub(crate) fn describe_failure(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(err) => format!("server returned {status}: {}", err.describe()),
        Err(_) => format!("server returned {status}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::oidc::discovery::StaticIssuer;
    use std::time::Duration;

    fn manager(clock: Arc<ManualClock>) -> TokenManager {
        let config = ClientConfig::new("https://id.example.com", "app");
        let issuer = Arc::new(StaticIssuer::new(ClientMetadata::for_issuer(
            "https://id.example.com",
        )));
        TokenManager::new(config, reqwest::Client::new(), issuer)
            .unwrap()
            .with_clock(clock)
    }

    #[test]
    fn test_token_set_defaults_token_type() {
        let tokens: TokenSet = serde_json::from_str(r#"{"access_token":"at"}"#).unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert!(tokens.refresh_token.is_none());
    }

    #[test]
    fn test_token_set_keeps_scope() {
        let tokens: TokenSet =
            serde_json::from_str(r#"{"access_token":"at","token_type":"DPoP","scope":"openid"}"#)
                .unwrap();
        assert_eq!(tokens.token_type, "DPoP");
        assert_eq!(tokens.scope.as_deref(), Some("openid"));
    }

    #[test]
    fn test_set_get_clear_tokens() {
        let mgr = manager(Arc::new(ManualClock::new()));
        assert!(mgr.get_tokens().is_none());
        mgr.set_tokens(TokenSet::bearer("at"));
        assert_eq!(mgr.get_tokens().unwrap().access_token, "at");
        mgr.clear_tokens();
        assert!(mgr.get_tokens().is_none());
    }

    #[tokio::test]
    async fn test_get_access_token_returns_fresh_token() {
        let clock = Arc::new(ManualClock::new());
        let mgr = manager(clock.clone());
        let mut tokens = TokenSet::bearer("at");
        tokens.expires_in = Some(3600);
        mgr.set_tokens(tokens);

        clock.advance(Duration::from_secs(3000));
        assert_eq!(mgr.get_access_token().await.unwrap().as_deref(), Some("at"));
    }

    #[tokio::test]
    async fn test_get_access_token_stale_without_refresh_token() {
        let clock = Arc::new(ManualClock::new());
        let mgr = manager(clock.clone());
        let mut tokens = TokenSet::bearer("at");
        tokens.expires_in = Some(120);
        mgr.set_tokens(tokens);

        // 60 s threshold: at t=60 the token is due for refresh.
        clock.advance(Duration::from_secs(60));
        assert!(mgr.get_access_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_tokens_keeps_original_expiry() {
        let clock = Arc::new(ManualClock::new());
        let mgr = manager(clock.clone());
        let mut tokens = TokenSet::bearer("at");
        tokens.expires_in = Some(600);
        mgr.set_tokens(tokens.clone());
        let expires_at = mgr.expires_at();

        clock.advance(Duration::from_secs(7200));
        mgr.restore_tokens(tokens.clone(), expires_at);
        assert_eq!(mgr.expires_at(), expires_at);
        assert!(mgr.get_access_token().await.unwrap().is_none());

        // No recorded expiry: the lifetime starts now.
        mgr.restore_tokens(tokens, None);
        assert_eq!(mgr.get_access_token().await.unwrap().as_deref(), Some("at"));
    }

    #[tokio::test]
    async fn test_get_access_token_without_expiry_never_stale() {
        let clock = Arc::new(ManualClock::new());
        let mgr = manager(clock.clone());
        mgr.set_tokens(TokenSet::bearer("at"));
        clock.advance(Duration::from_secs(1_000_000));
        assert_eq!(mgr.get_access_token().await.unwrap().as_deref(), Some("at"));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_fails() {
        let mgr = manager(Arc::new(ManualClock::new()));
        mgr.set_tokens(TokenSet::bearer("at"));
        let err = mgr.refresh_access_token().await.unwrap_err();
        assert_eq!(crate::error::error_code(&err), Some("NO_REFRESH_TOKEN"));
    }

    #[tokio::test]
    async fn test_get_claims_without_token() {
        let mgr = manager(Arc::new(ManualClock::new()));
        let err = mgr.get_claims().await.unwrap_err();
        assert_eq!(crate::error::error_code(&err), Some("NO_VALID_TOKEN"));
    }

    #[test]
    fn test_describe_failure_uses_oauth_error() {
        let msg = describe_failure(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"code reused"}"#,
        );
        assert!(msg.contains("invalid_grant (code reused)"));
        let msg = describe_failure(reqwest::StatusCode::BAD_GATEWAY, "<html>");
        assert_eq!(msg, "server returned 502 Bad Gateway");
    }

    #[test]
    fn test_introspection_response_flattens_extra() {
        let resp: IntrospectionResponse =
            serde_json::from_str(r#"{"active":true,"sub":"alice","cnf":{"x5t#S256":"abc"}}"#)
                .unwrap();
        assert!(resp.active);
        assert_eq!(resp.sub.as_deref(), Some("alice"));
        assert!(resp.extra.contains_key("cnf"));
    }
}
