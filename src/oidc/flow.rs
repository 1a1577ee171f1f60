//! Authorization code, implicit and logout flows
//!
//! [`AuthorizationFlow`] builds authorization URLs, remembers what it sent in
//! a [`StateStore`], and turns the provider's redirect back into a
//! [`TokenSet`] held by the shared [`TokenManager`].
//!
//! # Attempt lifecycle
//!
//! ```text
//! Idle -> Requested (get_authorization_url) -> AwaitingRedirect
//!      -> Completed | Failed (handle_redirect / handle_redirect_for_implicit_flow)
//! ```
//!
//! The `state` entry is consumed as soon as the redirect is handled, so a
//! replayed redirect always fails CSRF validation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::config::GrantType;
use crate::error::{OidcError, Result};
use crate::oidc::pkce;
use crate::oidc::random_token;
use crate::oidc::state_store::StateStore;
use crate::oidc::tokens::{TokenManager, TokenSet};

/// Parameters the caller may not override through `additional_params`.
const RESERVED_PARAMS: [&str; 4] = ["state", "nonce", "code_challenge", "code_challenge_method"];

/// Result of [`AuthorizationFlow::get_authorization_url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationUrlResult {
    /// URL to send the user agent to.
    pub url: String,
    /// The `state` value embedded in `url`.
    pub state: String,
    /// PKCE verifier, when PKCE is in use.
    pub code_verifier: Option<String>,
}

/// Drives browser-based authorization and logout.
#[derive(Debug)]
pub struct AuthorizationFlow {
    tokens: Arc<TokenManager>,
    states: StateStore,
}

impl AuthorizationFlow {
    /// Creates a flow over `tokens`, using its clock and `state_ttl`.
    pub fn new(tokens: Arc<TokenManager>) -> Self {
        let ttl = Duration::from_secs(tokens.config().state_ttl);
        let states = StateStore::new(tokens.clock().clone(), ttl);
        Self { tokens, states }
    }

    /// The token manager this flow feeds.
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Pending authorization attempts.
    pub fn state_store(&self) -> &StateStore {
        &self.states
    }

    /// Builds the authorization request URL.
    ///
    /// Generates fresh `state` and `nonce` values and, for the code grant
    /// with PKCE enabled, a code verifier. The attempt is recorded under
    /// `state` until the redirect is handled or the entry expires.
    ///
    /// # Arguments
    ///
    /// * `additional_params` - Extra query parameters (e.g. `prompt`,
    ///   `login_hint`); they cannot replace `state`, `nonce` or the PKCE
    ///   parameters
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::UnsupportedGrantType`] unless the client is
    /// configured for `authorization_code` or `implicit`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn example(flow: oidcx::oidc::AuthorizationFlow) -> oidcx::error::Result<()> {
    /// let attempt = flow.get_authorization_url(&[("prompt", "login")]).await?;
    /// println!("Open {} in a browser", attempt.url);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_authorization_url(
        &self,
        additional_params: &[(&str, &str)],
    ) -> Result<AuthorizationUrlResult> {
        let config = self.tokens.config();
        let response_type = match config.grant_type {
            GrantType::AuthorizationCode => "code",
            GrantType::Implicit => "id_token token",
            other => {
                return Err(OidcError::UnsupportedGrantType(format!(
                    "{} cannot build an authorization URL",
                    other.as_str()
                ))
                .into())
            }
        };

        let meta = self.tokens.metadata().await?;
        let mut url = Url::parse(&meta.authorization_endpoint).map_err(|e| {
            OidcError::Discovery(format!("invalid authorization endpoint URL: {e}"))
        })?;

        let state = random_token(16);
        let nonce = random_token(16);
        let challenge = (config.grant_type == GrantType::AuthorizationCode && config.pkce)
            .then(|| pkce::generate(&config.pkce_method));

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", response_type);
            query.append_pair("client_id", &config.client_id);
            if let Some(redirect_uri) = &config.redirect_uri {
                query.append_pair("redirect_uri", redirect_uri);
            }
            query.append_pair("scope", &config.scope);
            query.append_pair("state", &state);
            query.append_pair("nonce", &nonce);
            if let Some(challenge) = &challenge {
                query.append_pair("code_challenge", &challenge.challenge);
                if let Some(method) = &challenge.method {
                    query.append_pair("code_challenge_method", method);
                }
            }
            for (key, value) in additional_params {
                if RESERVED_PARAMS.contains(key) {
                    tracing::debug!("Ignoring additional parameter '{}'", key);
                    continue;
                }
                query.append_pair(key, value);
            }
        }

        let code_verifier = challenge.map(|c| c.verifier);
        self.states.insert(state.clone(), nonce, code_verifier.clone());
        tracing::debug!("Authorization request prepared ({})", response_type);

        Ok(AuthorizationUrlResult {
            url: url.to_string(),
            state,
            code_verifier,
        })
    }

    /// Completes the authorization code flow.
    ///
    /// The `state` entry is consumed first; an unknown or expired state
    /// fails before any token request is made. When the token response
    /// carries an ID token it is verified against the stored nonce, and the
    /// tokens are cleared if that fails.
    ///
    /// # Errors
    ///
    /// * [`OidcError::Csrf`] for an unknown or expired `state`
    /// * [`OidcError::TokenExchange`] if the exchange fails
    /// * [`OidcError::IdTokenValidation`] if the ID token is invalid
    pub async fn handle_redirect(&self, code: &str, state: &str) -> Result<TokenSet> {
        let entry = self.states.take(state).ok_or_else(|| {
            OidcError::Csrf("unknown or expired state parameter".to_string())
        })?;

        let tokens = self
            .tokens
            .exchange_code_for_token(code, entry.code_verifier.as_deref())
            .await?;

        if let Some(id_token) = &tokens.id_token {
            if let Err(e) = self
                .tokens
                .validate_id_token(id_token, Some(&entry.nonce))
                .await
            {
                tracing::warn!("ID token rejected, discarding tokens: {}", e);
                self.tokens.clear_tokens();
                return Err(e);
            }
        }

        tracing::info!("Authorization code flow completed");
        Ok(tokens)
    }

    /// Completes the flow from a full redirect URL (query string).
    ///
    /// An `error` parameter is reported as [`OidcError::AuthorizationError`];
    /// otherwise `code` and `state` are required and passed to
    /// [`Self::handle_redirect`].
    pub async fn handle_redirect_url(&self, redirect_url: &str) -> Result<TokenSet> {
        let url = Url::parse(redirect_url)
            .map_err(|e| OidcError::MissingRedirectParameter(format!("invalid URL: {e}")))?;
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        authorization_error(&params)?;

        let code = required(&params, "code")?;
        let state = required(&params, "state")?;
        self.handle_redirect(code, state).await
    }

    /// Completes the implicit flow from the redirect fragment.
    ///
    /// The fragment may start with `#`. Values are percent-decoded.
    ///
    /// # Errors
    ///
    /// * [`OidcError::AuthorizationError`] when the fragment carries `error`
    /// * [`OidcError::MissingRedirectParameter`] without `access_token` or `state`
    /// * [`OidcError::Csrf`] for an unknown or expired `state`
    /// * [`OidcError::IdTokenValidation`] if a present ID token is invalid
    pub async fn handle_redirect_for_implicit_flow(&self, fragment: &str) -> Result<TokenSet> {
        let fragment = fragment.strip_prefix('#').unwrap_or(fragment);
        let params: HashMap<String, String> = url::form_urlencoded::parse(fragment.as_bytes())
            .into_owned()
            .collect();

        authorization_error(&params)?;
        let access_token = required(&params, "access_token")?;
        let state = required(&params, "state")?;

        let entry = self.states.take(state).ok_or_else(|| {
            OidcError::Csrf("unknown or expired state parameter".to_string())
        })?;

        let id_token = params.get("id_token").cloned();
        match &id_token {
            Some(id_token) => {
                self.tokens
                    .validate_id_token(id_token, Some(&entry.nonce))
                    .await?;
            }
            None => tracing::info!("Implicit redirect carried no id_token"),
        }

        let tokens = TokenSet {
            access_token: access_token.to_string(),
            refresh_token: None,
            id_token,
            expires_in: params.get("expires_in").and_then(|v| v.parse().ok()),
            token_type: params
                .get("token_type")
                .cloned()
                .unwrap_or_else(|| "Bearer".to_string()),
            scope: params.get("scope").cloned(),
        };
        self.tokens.set_tokens(tokens.clone());
        tracing::info!("Implicit flow completed");
        Ok(tokens)
    }

    /// Builds an RP-initiated logout URL.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::MissingEndpoint`] when the provider does not
    /// advertise `end_session_endpoint`.
    pub async fn get_logout_url(
        &self,
        id_token_hint: Option<&str>,
        state: Option<&str>,
    ) -> Result<String> {
        let meta = self.tokens.metadata().await?;
        let endpoint = meta
            .end_session_endpoint
            .ok_or_else(|| OidcError::MissingEndpoint("end_session_endpoint".to_string()))?;
        let mut url = Url::parse(&endpoint)
            .map_err(|e| OidcError::Discovery(format!("invalid end session endpoint URL: {e}")))?;

        let config = self.tokens.config();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &config.client_id);
            if let Some(uri) = &config.post_logout_redirect_uri {
                query.append_pair("post_logout_redirect_uri", uri);
            }
            if let Some(hint) = id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }

        Ok(url.to_string())
    }
}

fn required<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OidcError::MissingRedirectParameter(name.to_string()).into())
}

fn authorization_error(params: &HashMap<String, String>) -> Result<()> {
    match params.get("error") {
        Some(error) => Err(OidcError::AuthorizationError {
            error: error.clone(),
            description: params.get("error_description").cloned(),
        }
        .into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ClientConfig;
    use crate::error::error_code;
    use crate::oidc::discovery::{ClientMetadata, StaticIssuer};

    fn flow_with(config: ClientConfig) -> AuthorizationFlow {
        let issuer = Arc::new(StaticIssuer::new(ClientMetadata::for_issuer(
            "https://id.example.com",
        )));
        let tokens = TokenManager::new(config, reqwest::Client::new(), issuer)
            .unwrap()
            .with_clock(Arc::new(ManualClock::new()));
        AuthorizationFlow::new(Arc::new(tokens))
    }

    fn config() -> ClientConfig {
        let mut config = ClientConfig::new("https://id.example.com", "app");
        config.redirect_uri = Some("https://app.example.com/cb".to_string());
        config.post_logout_redirect_uri = Some("https://app.example.com/bye".to_string());
        config
    }

    fn query(url: &str) -> HashMap<String, String> {
        Url::parse(url).unwrap().query_pairs().into_owned().collect()
    }

    #[tokio::test]
    async fn test_authorization_url_with_s256() {
        let flow = flow_with(config());
        let result = flow.get_authorization_url(&[]).await.unwrap();
        let q = query(&result.url);

        assert!(result.url.starts_with("https://id.example.com/authorize?"));
        assert_eq!(q["response_type"], "code");
        assert_eq!(q["client_id"], "app");
        assert_eq!(q["redirect_uri"], "https://app.example.com/cb");
        assert_eq!(q["scope"], "openid");
        assert_eq!(q["state"], result.state);
        assert!(q.contains_key("nonce"));
        assert_eq!(q["code_challenge_method"], "S256");

        let verifier = result.code_verifier.expect("PKCE verifier");
        assert_eq!(q["code_challenge"], pkce::s256_challenge(&verifier));
        assert_eq!(flow.state_store().len(), 1);
    }

    /// Collects formatted log output.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_authorization_url_invalid_pkce_method_omits_method() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut config = config();
        config.pkce_method = "invalid_method".to_string();
        let flow = flow_with(config);
        let result = flow.get_authorization_url(&[]).await.unwrap();
        let q = query(&result.url);
        assert!(!q.contains_key("code_challenge_method"));
        assert_eq!(Some(&q["code_challenge"]), result.code_verifier.as_ref());

        let output = logs.contents();
        assert!(output.contains("WARN"), "no warning logged: {output}");
        assert!(output.contains("Invalid PKCE method 'invalid_method'"));
    }

    #[tokio::test]
    async fn test_authorization_url_without_pkce() {
        let mut config = config();
        config.pkce = false;
        let flow = flow_with(config);
        let result = flow.get_authorization_url(&[]).await.unwrap();
        assert!(result.code_verifier.is_none());
        assert!(!query(&result.url).contains_key("code_challenge"));
    }

    #[tokio::test]
    async fn test_implicit_authorization_url() {
        let mut config = config();
        config.grant_type = GrantType::Implicit;
        let flow = flow_with(config);
        let result = flow.get_authorization_url(&[]).await.unwrap();
        let q = query(&result.url);
        assert_eq!(q["response_type"], "id_token token");
        assert!(result.code_verifier.is_none(), "PKCE is code-grant only");
    }

    #[tokio::test]
    async fn test_additional_params_cannot_override_state() {
        let flow = flow_with(config());
        let result = flow
            .get_authorization_url(&[("prompt", "login"), ("state", "attacker")])
            .await
            .unwrap();
        let pairs: Vec<(String, String)> = Url::parse(&result.url)
            .unwrap()
            .query_pairs()
            .into_owned()
            .collect();
        assert_eq!(pairs.iter().filter(|(k, _)| k == "state").count(), 1);
        assert!(pairs.contains(&("prompt".to_string(), "login".to_string())));
        assert!(!pairs.iter().any(|(_, v)| v == "attacker"));
    }

    #[tokio::test]
    async fn test_unsupported_grant_for_authorization_url() {
        let mut config = config();
        config.grant_type = GrantType::DeviceCode;
        let flow = flow_with(config);
        let err = flow.get_authorization_url(&[]).await.unwrap_err();
        assert_eq!(error_code(&err), Some("UNSUPPORTED_GRANT_TYPE"));
    }

    #[tokio::test]
    async fn test_implicit_fragment_error_is_terminal() {
        let flow = flow_with(config());
        let err = flow
            .handle_redirect_for_implicit_flow("#error=access_denied&error_description=User%20cancelled")
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), Some("AUTHORIZATION_ERROR"));
        assert!(err.to_string().contains("User cancelled"));
    }

    #[tokio::test]
    async fn test_implicit_fragment_missing_parameters() {
        let flow = flow_with(config());
        let err = flow
            .handle_redirect_for_implicit_flow("state=abc")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("access_token"));

        let err = flow
            .handle_redirect_for_implicit_flow("access_token=at")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("state"));
    }

    #[tokio::test]
    async fn test_implicit_fragment_unknown_state() {
        let flow = flow_with(config());
        let err = flow
            .handle_redirect_for_implicit_flow("#access_token=at&state=forged")
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), Some("CSRF_VALIDATION_FAILED"));
        assert!(flow.tokens().get_tokens().is_none());
    }

    #[tokio::test]
    async fn test_implicit_fragment_without_id_token_stores_tokens() {
        let mut config = config();
        config.grant_type = GrantType::Implicit;
        let flow = flow_with(config);
        let attempt = flow.get_authorization_url(&[]).await.unwrap();

        let fragment = format!(
            "#access_token=at%2B1&token_type=Bearer&expires_in=3600&state={}",
            attempt.state
        );
        let tokens = flow.handle_redirect_for_implicit_flow(&fragment).await.unwrap();
        assert_eq!(tokens.access_token, "at+1");
        assert_eq!(tokens.expires_in, Some(3600));
        assert_eq!(flow.tokens().get_tokens(), Some(tokens));
        assert!(flow.state_store().is_empty());
    }

    #[tokio::test]
    async fn test_handle_redirect_url_reports_error() {
        let flow = flow_with(config());
        let err = flow
            .handle_redirect_url("https://app.example.com/cb?error=access_denied")
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), Some("AUTHORIZATION_ERROR"));

        let err = flow
            .handle_redirect_url("https://app.example.com/cb?state=s")
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), Some("MISSING_REDIRECT_PARAMETER"));
    }

    #[tokio::test]
    async fn test_logout_url() {
        let flow = flow_with(config());
        let url = flow
            .get_logout_url(Some("id.tok.en"), Some("st"))
            .await
            .unwrap();
        let q = query(&url);
        assert!(url.starts_with("https://id.example.com/logout?"));
        assert_eq!(q["client_id"], "app");
        assert_eq!(q["post_logout_redirect_uri"], "https://app.example.com/bye");
        assert_eq!(q["id_token_hint"], "id.tok.en");
        assert_eq!(q["state"], "st");
    }

    #[tokio::test]
    async fn test_logout_url_requires_endpoint() {
        let mut meta = ClientMetadata::for_issuer("https://id.example.com");
        meta.end_session_endpoint = None;
        let tokens = TokenManager::new(
            config(),
            reqwest::Client::new(),
            Arc::new(StaticIssuer::new(meta)),
        )
        .unwrap();
        let flow = AuthorizationFlow::new(Arc::new(tokens));
        let err = flow.get_logout_url(None, None).await.unwrap_err();
        assert_eq!(error_code(&err), Some("MISSING_ENDPOINT"));
    }
}
