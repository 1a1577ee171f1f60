//! Request/response view used by the session manager
//!
//! [`SessionContext`] is the one shape the session manager reads cookies
//! from and writes cookies and bodies to. Host adapters fill
//! `request_cookies` from the incoming `Cookie` header and copy
//! [`SessionContext::set_cookie_headers`] and `response_body` back out.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use cookie::{Cookie, SameSite};
use serde::{Deserialize, Serialize};

use crate::config::{SameSitePolicy, SessionConfig};
use crate::oidc::jwt::Claims;
use crate::oidc::tokens::TokenSet;

/// Data kept per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionData {
    /// Current tokens.
    pub tokens: TokenSet,
    /// User claims, when fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Claims>,
    /// CSRF token issued with the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf_token: Option<String>,
    /// When `tokens.access_token` expires. Kept so a resumed session does
    /// not restart the token lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionData {
    /// Creates session data holding only `tokens`.
    pub fn new(tokens: TokenSet) -> Self {
        Self {
            tokens,
            user: None,
            csrf_token: None,
            expires_at: None,
        }
    }
}

/// One request/response exchange.
#[derive(Debug, Default)]
pub struct SessionContext {
    /// Cookies sent by the client.
    pub request_cookies: HashMap<String, String>,
    /// Session bound to this request.
    pub session: Option<SessionData>,
    /// Cookies to send back.
    pub response_cookies: Vec<Cookie<'static>>,
    /// JSON body to send back, when tokens are exposed as JSON.
    pub response_body: Option<serde_json::Value>,
}

impl SessionContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context from a raw `Cookie` request header.
    ///
    /// Malformed pairs are skipped.
    ///
    /// # Examples
    ///
    /// ```
    /// use oidcx::session::SessionContext;
    ///
    /// let ctx = SessionContext::from_cookie_header("sid=abc; theme=dark");
    /// assert_eq!(ctx.request_cookie("sid"), Some("abc"));
    /// ```
    pub fn from_cookie_header(header: &str) -> Self {
        let request_cookies = Cookie::split_parse(header.to_string())
            .filter_map(|c| c.ok())
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        Self {
            request_cookies,
            ..Self::default()
        }
    }

    /// Adds a request cookie.
    pub fn with_request_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_cookies.insert(name.into(), value.into());
        self
    }

    /// Value of request cookie `name`.
    pub fn request_cookie(&self, name: &str) -> Option<&str> {
        self.request_cookies.get(name).map(String::as_str)
    }

    /// The last response cookie named `name`.
    pub fn response_cookie(&self, name: &str) -> Option<&Cookie<'static>> {
        self.response_cookies.iter().rev().find(|c| c.name() == name)
    }

    /// Formatted `Set-Cookie` header values.
    pub fn set_cookie_headers(&self) -> Vec<String> {
        self.response_cookies.iter().map(|c| c.to_string()).collect()
    }

    pub(crate) fn set_cookie(&mut self, config: &SessionConfig, name: &str, value: String) {
        let ttl = i64::try_from(config.ttl).unwrap_or(i64::MAX);
        let cookie = Cookie::build((name.to_string(), value))
            .path("/")
            .http_only(config.http_only)
            .secure(config.secure)
            .same_site(same_site(config.same_site))
            .max_age(time::Duration::seconds(ttl))
            .build();
        self.response_cookies.push(cookie);
    }

    pub(crate) fn clear_cookie(&mut self, config: &SessionConfig, name: &str) {
        let mut cookie = Cookie::build((name.to_string(), String::new()))
            .path("/")
            .http_only(config.http_only)
            .secure(config.secure)
            .same_site(same_site(config.same_site))
            .build();
        cookie.make_removal();
        self.request_cookies.remove(name);
        self.response_cookies.push(cookie);
    }
}

fn same_site(policy: SameSitePolicy) -> SameSite {
    match policy {
        SameSitePolicy::Strict => SameSite::Strict,
        SameSitePolicy::Lax => SameSite::Lax,
        SameSitePolicy::None => SameSite::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cookie_header_skips_garbage() {
        let ctx = SessionContext::from_cookie_header("sid=abc; ; csrf_token=xyz");
        assert_eq!(ctx.request_cookie("sid"), Some("abc"));
        assert_eq!(ctx.request_cookie("csrf_token"), Some("xyz"));
    }

    #[test]
    fn test_set_cookie_applies_config() {
        let config = SessionConfig {
            ttl: 3600,
            same_site: SameSitePolicy::Strict,
            ..SessionConfig::default()
        };
        let mut ctx = SessionContext::new();
        ctx.set_cookie(&config, "sid", "abc".to_string());

        let header = &ctx.set_cookie_headers()[0];
        assert!(header.starts_with("sid=abc"));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("Secure"));
        assert!(header.contains("SameSite=Strict"));
        assert!(header.contains("Max-Age=3600"));
    }

    #[test]
    fn test_clear_cookie_expires_it() {
        let config = SessionConfig::default();
        let mut ctx = SessionContext::new().with_request_cookie("sid", "stale");
        ctx.clear_cookie(&config, "sid");

        assert!(ctx.request_cookie("sid").is_none());
        let cookie = ctx.response_cookie("sid").unwrap();
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(time::Duration::ZERO));
    }
}
