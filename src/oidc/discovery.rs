//! OpenID Connect discovery
//!
//! Retrieves and caches the provider's discovery document (OpenID Connect
//! Discovery 1.0, with an RFC 8414 fallback). The document is exposed to the
//! rest of the engine through the [`Issuer`] capability so tests can supply a
//! [`StaticIssuer`] instead of a live provider.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::error::{OidcError, Result};

// ---------------------------------------------------------------------------
// ClientMetadata
// ---------------------------------------------------------------------------

/// Provider metadata as published at `/.well-known/openid-configuration`.
///
/// Only the endpoints the engine uses are modelled; every other field is
/// kept in [`ClientMetadata::extra`].
///
/// # Examples
///
/// ```
/// use oidcx::oidc::discovery::ClientMetadata;
///
/// let json = r#"{
///     "issuer": "https://id.example.com",
///     "authorization_endpoint": "https://id.example.com/authorize",
///     "token_endpoint": "https://id.example.com/token",
///     "jwks_uri": "https://id.example.com/jwks",
///     "claims_supported": ["sub", "email"]
/// }"#;
///
/// let meta: ClientMetadata = serde_json::from_str(json).unwrap();
/// assert_eq!(meta.issuer, "https://id.example.com");
/// assert!(meta.extra.contains_key("claims_supported"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientMetadata {
    /// Issuer identifier; ID tokens must carry this exact `iss`.
    pub issuer: String,

    /// Authorization endpoint (RFC 6749 section 3.1).
    pub authorization_endpoint: String,

    /// Token endpoint (RFC 6749 section 3.2).
    pub token_endpoint: String,

    /// Device authorization endpoint (RFC 8628).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_authorization_endpoint: Option<String>,

    /// RP-initiated logout endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,

    /// Token introspection endpoint (RFC 7662).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<String>,

    /// Token revocation endpoint (RFC 7009).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,

    /// Location of the provider's JSON Web Key Set.
    pub jwks_uri: String,

    /// UserInfo endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    /// PKCE challenge methods the provider supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,

    /// Client authentication methods accepted at the token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_methods_supported: Option<Vec<String>>,

    /// Unmodelled fields.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ClientMetadata {
    /// Builds metadata for an issuer with the conventional endpoint paths.
    ///
    /// Useful for [`StaticIssuer`] and tests; real providers should be
    /// discovered.
    pub fn for_issuer(issuer: &str) -> Self {
        let base = issuer.trim_end_matches('/');
        Self {
            issuer: issuer.to_string(),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            device_authorization_endpoint: Some(format!("{base}/device/code")),
            end_session_endpoint: Some(format!("{base}/logout")),
            introspection_endpoint: Some(format!("{base}/introspect")),
            revocation_endpoint: Some(format!("{base}/revoke")),
            jwks_uri: format!("{base}/jwks"),
            userinfo_endpoint: Some(format!("{base}/userinfo")),
            code_challenge_methods_supported: Some(vec!["S256".to_string()]),
            token_endpoint_auth_methods_supported: None,
            extra: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Issuer capability
// ---------------------------------------------------------------------------

/// Source of provider metadata.
#[async_trait]
pub trait Issuer: Send + Sync {
    /// Returns the provider metadata, refetching when `force_refresh` is set.
    async fn discover(&self, force_refresh: bool) -> Result<ClientMetadata>;
}

/// An [`Issuer`] that always returns the same metadata.
#[derive(Debug, Clone)]
pub struct StaticIssuer {
    metadata: ClientMetadata,
}

impl StaticIssuer {
    /// Wraps `metadata`.
    pub fn new(metadata: ClientMetadata) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl Issuer for StaticIssuer {
    async fn discover(&self, _force_refresh: bool) -> Result<ClientMetadata> {
        Ok(self.metadata.clone())
    }
}

/// An [`Issuer`] that fetches the discovery document over HTTP and caches it.
#[derive(Debug)]
pub struct HttpIssuer {
    http: reqwest::Client,
    issuer: Url,
    cache: RwLock<Option<ClientMetadata>>,
}

impl HttpIssuer {
    /// Creates an issuer for `issuer_url` sharing `http`.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Config`] if `issuer_url` is not a valid URL.
    pub fn new(http: reqwest::Client, issuer_url: &str) -> Result<Self> {
        let issuer = Url::parse(issuer_url)
            .map_err(|e| OidcError::Config(format!("invalid issuer URL {issuer_url}: {e}")))?;
        Ok(Self {
            http,
            issuer,
            cache: RwLock::new(None),
        })
    }

    /// The issuer URL this instance discovers.
    pub fn issuer_url(&self) -> &Url {
        &self.issuer
    }

    async fn fetch(&self) -> Result<ClientMetadata> {
        let mut last_error = None;

        for candidate in candidate_urls(&self.issuer) {
            tracing::debug!("Fetching discovery document from {}", candidate);
            let resp = match self.http.get(candidate.clone()).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(format!("{candidate}: {e}"));
                    continue;
                }
            };

            if !resp.status().is_success() {
                last_error = Some(format!("{candidate} returned {}", resp.status()));
                continue;
            }

            match resp.json::<ClientMetadata>().await {
                Ok(meta) => return Ok(meta),
                Err(e) => last_error = Some(format!("{candidate}: invalid document: {e}")),
            }
        }

        Err(OidcError::Discovery(format!(
            "metadata not found for issuer {}{}",
            self.issuer,
            last_error.map(|e| format!(" ({e})")).unwrap_or_default()
        ))
        .into())
    }
}

#[async_trait]
impl Issuer for HttpIssuer {
    async fn discover(&self, force_refresh: bool) -> Result<ClientMetadata> {
        if !force_refresh {
            if let Some(meta) = self.cache.read().await.as_ref() {
                return Ok(meta.clone());
            }
        }

        let meta = self.fetch().await?;
        *self.cache.write().await = Some(meta.clone());
        Ok(meta)
    }
}

/// Candidate discovery URLs, in order:
///
/// 1. `<issuer>/.well-known/openid-configuration` (path appending)
/// 2. `/.well-known/oauth-authorization-server<path>` (RFC 8414 path insertion)
fn candidate_urls(issuer: &Url) -> Vec<Url> {
    let path = issuer.path().trim_end_matches('/').to_string();
    let mut candidates = Vec::with_capacity(2);

    let mut appended = issuer.clone();
    appended.set_path(&format!("{path}/.well-known/openid-configuration"));
    appended.set_query(None);
    appended.set_fragment(None);
    candidates.push(appended);

    let mut inserted = issuer.clone();
    inserted.set_path(&format!("/.well-known/oauth-authorization-server{path}"));
    inserted.set_query(None);
    inserted.set_fragment(None);
    candidates.push(inserted);

    candidates
}

/// Builds the shared HTTP client used for every provider call.
///
/// # Errors
///
/// Returns [`OidcError::Config`] if the TLS backend cannot be initialised.
pub fn build_http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("oidcx/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| OidcError::Config(format!("failed to build HTTP client: {e}")).into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn discovery_body(issuer: &str) -> serde_json::Value {
        serde_json::to_value(ClientMetadata::for_issuer(issuer)).unwrap()
    }

    #[test]
    fn test_candidate_urls_root_issuer() {
        let issuer = Url::parse("https://id.example.com").unwrap();
        let urls = candidate_urls(&issuer);
        assert_eq!(
            urls[0].as_str(),
            "https://id.example.com/.well-known/openid-configuration"
        );
        assert_eq!(
            urls[1].as_str(),
            "https://id.example.com/.well-known/oauth-authorization-server"
        );
    }

    #[test]
    fn test_candidate_urls_with_path() {
        let issuer = Url::parse("https://id.example.com/realms/demo/").unwrap();
        let urls = candidate_urls(&issuer);
        assert_eq!(
            urls[0].as_str(),
            "https://id.example.com/realms/demo/.well-known/openid-configuration"
        );
        assert_eq!(
            urls[1].as_str(),
            "https://id.example.com/.well-known/oauth-authorization-server/realms/demo"
        );
    }

    #[test]
    fn test_metadata_optional_endpoints_default_to_none() {
        let json = r#"{
            "issuer": "https://id.example.com",
            "authorization_endpoint": "https://id.example.com/a",
            "token_endpoint": "https://id.example.com/t",
            "jwks_uri": "https://id.example.com/k"
        }"#;
        let meta: ClientMetadata = serde_json::from_str(json).unwrap();
        assert!(meta.device_authorization_endpoint.is_none());
        assert!(meta.end_session_endpoint.is_none());
        assert!(meta.userinfo_endpoint.is_none());
        assert!(meta.extra.is_empty());
    }

    #[tokio::test]
    async fn test_http_issuer_caches_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(discovery_body(&server.uri())))
            .expect(2)
            .mount(&server)
            .await;

        let issuer = HttpIssuer::new(reqwest::Client::new(), &server.uri()).unwrap();
        let first = issuer.discover(false).await.unwrap();
        let second = issuer.discover(false).await.unwrap();
        assert_eq!(first, second);

        // A forced refresh goes back to the network.
        issuer.discover(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_issuer_falls_back_to_rfc8414() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(discovery_body(&server.uri())))
            .mount(&server)
            .await;

        let issuer = HttpIssuer::new(reqwest::Client::new(), &server.uri()).unwrap();
        let meta = issuer.discover(false).await.unwrap();
        assert_eq!(meta.issuer, server.uri());
    }

    #[tokio::test]
    async fn test_http_issuer_reports_discovery_error() {
        let server = MockServer::start().await;
        let issuer = HttpIssuer::new(reqwest::Client::new(), &server.uri()).unwrap();
        let err = issuer.discover(false).await.unwrap_err();
        assert_eq!(crate::error::error_code(&err), Some("DISCOVERY_ERROR"));
    }

    #[test]
    fn test_http_issuer_rejects_invalid_url() {
        assert!(HttpIssuer::new(reqwest::Client::new(), "::nope::").is_err());
    }
}
