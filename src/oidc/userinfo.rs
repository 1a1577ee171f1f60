//! UserInfo endpoint client

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{OidcError, Result};
use crate::oidc::discovery::Issuer;
use crate::oidc::jwt::Claims;

/// Resolves the claims of the user an access token was issued to.
#[async_trait]
pub trait UserInfo: Send + Sync {
    /// Returns the user's claims for `access_token`.
    async fn get_user_info(&self, access_token: &str) -> Result<Claims>;
}

/// Calls the discovered `userinfo_endpoint` with a Bearer token.
pub struct HttpUserInfo {
    http: reqwest::Client,
    issuer: Arc<dyn Issuer>,
}

impl HttpUserInfo {
    /// Creates a client that discovers the endpoint through `issuer`.
    pub fn new(http: reqwest::Client, issuer: Arc<dyn Issuer>) -> Self {
        Self { http, issuer }
    }
}

#[async_trait]
impl UserInfo for HttpUserInfo {
    async fn get_user_info(&self, access_token: &str) -> Result<Claims> {
        let meta = self.issuer.discover(false).await?;
        let endpoint = meta
            .userinfo_endpoint
            .ok_or_else(|| OidcError::MissingEndpoint("userinfo_endpoint".to_string()))?;

        let resp = self
            .http
            .get(&endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| OidcError::UserInfo(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(
                OidcError::UserInfo(format!("endpoint returned {}", resp.status())).into(),
            );
        }

        resp.json::<Claims>()
            .await
            .map_err(|e| OidcError::UserInfo(format!("invalid response: {e}")).into())
    }
}
