//! JSON Web Key Sets
//!
//! Provides the [`Jwk`] model and the [`KeySet`] capability used by the
//! signature verifier. [`RemoteJwks`] fetches the provider's `jwks_uri` and
//! caches it; an unknown `kid` triggers one refetch so key rotation is picked
//! up without restarting.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{OidcError, Result};
use crate::oidc::discovery::Issuer;

/// A single JSON Web Key (RFC 7517).
///
/// Key material fields are base64url strings exactly as published.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    /// Key type: `RSA`, `EC` or `oct`.
    pub kty: String,

    /// Intended algorithm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// Key id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Public key use (`sig` or `enc`).
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,

    /// RSA modulus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA public exponent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    /// EC curve name (`P-256`, `P-384`, `P-521`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// EC x coordinate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// EC y coordinate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,

    /// Symmetric key value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
}

/// A key set document: `{"keys": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwkSet {
    /// Published keys.
    #[serde(default)]
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    /// Finds the key whose `kid` equals `kid`.
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }
}

/// Resolves verification keys by key id.
#[async_trait]
pub trait KeySet: Send + Sync {
    /// Returns the key with `kid`.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Jwks`] if the key set cannot be loaded or no key
    /// has that id.
    async fn get_key(&self, kid: &str) -> Result<Jwk>;
}

/// A fixed, in-memory key set.
#[derive(Debug, Clone, Default)]
pub struct StaticJwks {
    keys: HashMap<String, Jwk>,
}

impl StaticJwks {
    /// Indexes `set` by `kid`; keys without one are ignored.
    pub fn new(set: JwkSet) -> Self {
        let keys = set
            .keys
            .into_iter()
            .filter_map(|k| k.kid.clone().map(|kid| (kid, k)))
            .collect();
        Self { keys }
    }
}

#[async_trait]
impl KeySet for StaticJwks {
    async fn get_key(&self, kid: &str) -> Result<Jwk> {
        self.keys
            .get(kid)
            .cloned()
            .ok_or_else(|| OidcError::Jwks(format!("no key found for kid '{kid}'")).into())
    }
}

enum JwksLocation {
    Uri(String),
    Discovered(Arc<dyn Issuer>),
}

/// A key set fetched from the provider and cached in memory.
pub struct RemoteJwks {
    http: reqwest::Client,
    location: JwksLocation,
    cache: RwLock<Option<JwkSet>>,
}

impl std::fmt::Debug for RemoteJwks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let location = match &self.location {
            JwksLocation::Uri(uri) => uri.as_str(),
            JwksLocation::Discovered(_) => "<discovered>",
        };
        f.debug_struct("RemoteJwks")
            .field("location", &location)
            .finish_non_exhaustive()
    }
}

impl RemoteJwks {
    /// Fetches keys from a fixed `jwks_uri`.
    pub fn from_uri(http: reqwest::Client, jwks_uri: impl Into<String>) -> Self {
        Self {
            http,
            location: JwksLocation::Uri(jwks_uri.into()),
            cache: RwLock::new(None),
        }
    }

    /// Fetches keys from the `jwks_uri` advertised by `issuer`.
    pub fn from_issuer(http: reqwest::Client, issuer: Arc<dyn Issuer>) -> Self {
        Self {
            http,
            location: JwksLocation::Discovered(issuer),
            cache: RwLock::new(None),
        }
    }

    async fn jwks_uri(&self) -> Result<String> {
        match &self.location {
            JwksLocation::Uri(uri) => Ok(uri.clone()),
            JwksLocation::Discovered(issuer) => Ok(issuer.discover(false).await?.jwks_uri),
        }
    }

    async fn fetch(&self) -> Result<JwkSet> {
        let uri = self.jwks_uri().await?;
        tracing::debug!("Fetching JWKS from {}", uri);

        let resp = self
            .http
            .get(&uri)
            .send()
            .await
            .map_err(|e| OidcError::Jwks(format!("request to {uri} failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(
                OidcError::Jwks(format!("{uri} returned status {}", resp.status())).into(),
            );
        }

        let set: JwkSet = resp
            .json()
            .await
            .map_err(|e| OidcError::Jwks(format!("failed to parse key set: {e}")))?;
        *self.cache.write().await = Some(set.clone());
        Ok(set)
    }
}

#[async_trait]
impl KeySet for RemoteJwks {
    async fn get_key(&self, kid: &str) -> Result<Jwk> {
        if let Some(key) = self.cache.read().await.as_ref().and_then(|s| s.find(kid)) {
            return Ok(key.clone());
        }

        // Unknown kid: the provider may have rotated keys since the last fetch.
        let set = self.fetch().await?;
        set.find(kid)
            .cloned()
            .ok_or_else(|| OidcError::Jwks(format!("no key found for kid '{kid}'")).into())
    }
}
