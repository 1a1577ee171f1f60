//! Device authorization grant (RFC 8628)
//!
//! The device flow is two calls on [`AuthorizationFlow`]:
//! [`AuthorizationFlow::start_device_authorization`] obtains a user code to
//! show to the user, and [`AuthorizationFlow::poll_device_token`] polls the
//! token endpoint until the user approves, the code expires, or the caller's
//! timeout elapses. Sleeps go through the token manager's [`Clock`].
//!
//! [`Clock`]: crate::clock::Clock

use std::fmt;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OidcError, Result};
use crate::oidc::flow::AuthorizationFlow;
use crate::oidc::tokens::{describe_failure, OAuthErrorBody, TokenSet};

/// Grant type for polling the token endpoint with a device code.
pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Polling interval used when the server does not send one.
const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Added to the interval on every `slow_down` response.
const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

/// Device authorization response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceAuthorization {
    /// Code the client polls with.
    pub device_code: String,
    /// Code the user enters at `verification_uri`.
    pub user_code: String,
    /// Where the user goes to approve the request.
    pub verification_uri: String,
    /// `verification_uri` with the user code already filled in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    /// Lifetime of the device code in seconds.
    pub expires_in: u64,
    /// Minimum polling interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
}

/// Result of a single poll, used for logging the flow's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePollOutcome {
    /// `authorization_pending`
    Pending,
    /// `slow_down`; the interval was increased
    SlowDown,
    /// Tokens were issued
    Authorized,
    /// `expired_token`
    Expired,
    /// The caller's timeout elapsed
    TimedOut,
    /// Any other error
    Failed,
}

impl fmt::Display for DevicePollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::SlowDown => "slow_down",
            Self::Authorized => "authorized",
            Self::Expired => "expired",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl AuthorizationFlow {
    /// Starts a device authorization request.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::MissingEndpoint`] when the provider does not
    /// advertise `device_authorization_endpoint`, and
    /// [`OidcError::TokenRequest`] when the request fails.
    pub async fn start_device_authorization(&self) -> Result<DeviceAuthorization> {
        let tokens = self.tokens();
        let meta = tokens.metadata().await?;
        let endpoint = meta.device_authorization_endpoint.ok_or_else(|| {
            OidcError::MissingEndpoint("device_authorization_endpoint".to_string())
        })?;

        let params = vec![("scope".to_string(), tokens.config().scope.clone())];
        tracing::debug!("POST {} (device authorization)", endpoint);
        let resp = tokens
            .post_authenticated(&endpoint, params)
            .await
            .context(OidcError::TokenRequest(
                "device authorization request failed".to_string(),
            ))?;

        let status = resp.status();
        let body = resp.text().await.context(OidcError::TokenRequest(
            "failed to read device authorization response".to_string(),
        ))?;
        if !status.is_success() {
            return Err(OidcError::TokenRequest(describe_failure(status, &body)).into());
        }

        let authorization: DeviceAuthorization = serde_json::from_str(&body).context(
            OidcError::TokenRequest("malformed device authorization response".to_string()),
        )?;
        tracing::info!(
            "Device authorization started, code expires in {}s",
            authorization.expires_in
        );
        Ok(authorization)
    }

    /// Polls the token endpoint until the device code is authorized.
    ///
    /// The first request is sent immediately. `authorization_pending` sleeps
    /// for the current interval and retries; `slow_down` adds five seconds
    /// to the interval first. When `timeout` is set, the elapsed time is
    /// checked before every request and after every retryable response; a
    /// token returned by a request that started before the deadline is
    /// still accepted.
    ///
    /// # Arguments
    ///
    /// * `device_code` - From [`DeviceAuthorization::device_code`]
    /// * `interval_secs` - Initial polling interval in seconds
    /// * `timeout` - Optional overall polling limit
    ///
    /// # Errors
    ///
    /// * [`OidcError::DeviceCodeExpired`] on `expired_token`
    /// * [`OidcError::DeviceTokenPollingTimeout`] when `timeout` elapses
    /// * [`OidcError::DeviceTokenPollingFailed`] for any other error response
    pub async fn poll_device_token(
        &self,
        device_code: &str,
        interval_secs: u64,
        timeout: Option<Duration>,
    ) -> Result<TokenSet> {
        let tokens = self.tokens();
        let clock = tokens.clock().clone();
        let started = clock.now();
        let mut interval = Duration::from_secs(interval_secs);
        let meta = tokens.metadata().await?;

        loop {
            check_deadline(started, clock.now(), timeout)?;

            let params = vec![
                ("grant_type".to_string(), DEVICE_CODE_GRANT_TYPE.to_string()),
                ("device_code".to_string(), device_code.to_string()),
            ];
            let resp = tokens
                .post_authenticated(&meta.token_endpoint, params)
                .await
                .context(OidcError::DeviceTokenPollingFailed("request failed".to_string()))?;

            let status = resp.status();
            let body = resp.text().await.context(OidcError::DeviceTokenPollingFailed(
                "failed to read response".to_string(),
            ))?;

            // Some servers answer pending polls with 200 and an error body.
            let error = match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(value) if value.get("access_token").is_some() => {
                    let tokens_set: TokenSet = serde_json::from_value(value).context(
                        OidcError::DeviceTokenPollingFailed("malformed token response".to_string()),
                    )?;
                    tokens.set_tokens(tokens_set.clone());
                    tracing::info!("Device poll outcome: {}", DevicePollOutcome::Authorized);
                    return Ok(tokens_set);
                }
                Ok(value) => serde_json::from_value::<OAuthErrorBody>(value).ok(),
                Err(e) => {
                    tracing::warn!("Device poll returned a non-JSON body ({}): {}", status, e);
                    None
                }
            };

            let Some(error) = error else {
                tracing::debug!("Device poll outcome: {}", DevicePollOutcome::Failed);
                return Err(OidcError::DeviceTokenPollingFailed(format!(
                    "server returned {status} without an OAuth error"
                ))
                .into());
            };

            match error.error.as_str() {
                "authorization_pending" => {
                    tracing::debug!("Device poll outcome: {}", DevicePollOutcome::Pending);
                }
                "slow_down" => {
                    interval += SLOW_DOWN_INCREMENT;
                    tracing::debug!(
                        "Device poll outcome: {}, interval now {}s",
                        DevicePollOutcome::SlowDown,
                        interval.as_secs()
                    );
                }
                "expired_token" => {
                    tracing::info!("Device poll outcome: {}", DevicePollOutcome::Expired);
                    return Err(OidcError::DeviceCodeExpired.into());
                }
                _ => {
                    tracing::debug!("Device poll outcome: {}", DevicePollOutcome::Failed);
                    return Err(OidcError::DeviceTokenPollingFailed(error.describe()).into());
                }
            }

            check_deadline(started, clock.now(), timeout)?;
            clock.sleep(interval).await;
        }
    }
}

fn check_deadline(
    started: DateTime<Utc>,
    now: DateTime<Utc>,
    timeout: Option<Duration>,
) -> Result<()> {
    let Some(timeout) = timeout else {
        return Ok(());
    };
    let elapsed = (now - started).to_std().unwrap_or_default();
    if elapsed > timeout {
        tracing::info!("Device poll outcome: {}", DevicePollOutcome::TimedOut);
        return Err(OidcError::DeviceTokenPollingTimeout {
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
        .into());
    }
    Ok(())
}
