//! Compact JWT parsing and ID-token claim checks
//!
//! Signature verification lives in [`crate::oidc::verifier`]; this module
//! only splits and decodes tokens and checks the registered claims an ID
//! token must carry.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OidcError, Result};

/// Arbitrary JWT or UserInfo claims.
pub type Claims = serde_json::Map<String, Value>;

/// JOSE header of a compact JWS.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JwtHeader {
    /// Signing algorithm.
    #[serde(default)]
    pub alg: String,

    /// Key id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Media type, usually `JWT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

/// The three parts of a compact JWS.
#[derive(Debug, Clone, Copy)]
pub struct JwtParts<'a> {
    /// `base64url(header) "." base64url(payload)`, the bytes that were signed.
    pub signing_input: &'a str,
    /// Encoded header segment.
    pub header: &'a str,
    /// Encoded payload segment.
    pub payload: &'a str,
    /// Encoded signature segment.
    pub signature: &'a str,
}

/// Returns true when `token` has the `a.b.c` shape of a compact JWS.
pub fn is_jwt(token: &str) -> bool {
    token.split('.').count() == 3 && token.split('.').all(|s| !s.is_empty())
}

/// Splits a compact JWS into its segments.
///
/// # Errors
///
/// Returns [`OidcError::IdTokenValidation`] if the token does not have
/// exactly three non-empty segments.
pub fn split(token: &str) -> Result<JwtParts<'_>> {
    let mut segments = token.splitn(3, '.');
    let (Some(header), Some(payload), Some(signature)) =
        (segments.next(), segments.next(), segments.next())
    else {
        return Err(OidcError::IdTokenValidation("malformed JWT".to_string()).into());
    };

    if header.is_empty() || payload.is_empty() || signature.is_empty() || signature.contains('.')
    {
        return Err(OidcError::IdTokenValidation("malformed JWT".to_string()).into());
    }

    Ok(JwtParts {
        signing_input: &token[..header.len() + 1 + payload.len()],
        header,
        payload,
        signature,
    })
}

/// Decodes a base64url segment, tolerating trailing padding.
pub fn b64_decode(segment: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| OidcError::IdTokenValidation(format!("invalid base64url: {e}")).into())
}

/// Decodes the JOSE header of `token`.
pub fn decode_header(token: &str) -> Result<JwtHeader> {
    let parts = split(token)?;
    let bytes = b64_decode(parts.header)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| OidcError::IdTokenValidation(format!("invalid JWT header: {e}")).into())
}

/// Decodes the payload of `token` without verifying it.
pub fn decode_claims(token: &str) -> Result<Claims> {
    let parts = split(token)?;
    let bytes = b64_decode(parts.payload)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| OidcError::IdTokenValidation(format!("invalid JWT payload: {e}")).into())
}

// ---------------------------------------------------------------------------
// ID token claim validation
// ---------------------------------------------------------------------------

/// What an ID token's claims are checked against.
#[derive(Debug, Clone)]
pub struct IdTokenExpectations<'a> {
    /// Discovered issuer.
    pub issuer: &'a str,
    /// This client's id; must appear in `aud`.
    pub client_id: &'a str,
    /// Nonce sent in the authorization request, if any.
    pub nonce: Option<&'a str>,
    /// Current time.
    pub now: DateTime<Utc>,
    /// Allowed skew for `exp`, in seconds.
    pub clock_tolerance: u64,
}

/// Checks `iss`, `aud`, `exp` and `nonce` of decoded ID-token claims.
///
/// `aud` may be a single string or an array of strings.
///
/// # Errors
///
/// Returns [`OidcError::IdTokenValidation`] naming the first failed check.
pub fn validate_id_token_claims(claims: &Claims, expected: &IdTokenExpectations<'_>) -> Result<()> {
    let iss = claims.get("iss").and_then(Value::as_str);
    if iss != Some(expected.issuer) {
        return Err(OidcError::IdTokenValidation(format!(
            "issuer mismatch: expected {}, got {}",
            expected.issuer,
            iss.unwrap_or("<missing>")
        ))
        .into());
    }

    let audience_ok = match claims.get("aud") {
        Some(Value::String(aud)) => aud == expected.client_id,
        Some(Value::Array(auds)) => auds
            .iter()
            .any(|a| a.as_str() == Some(expected.client_id)),
        _ => false,
    };
    if !audience_ok {
        return Err(OidcError::IdTokenValidation("audience mismatch".to_string()).into());
    }

    let Some(exp) = claims.get("exp").and_then(Value::as_i64) else {
        return Err(OidcError::IdTokenValidation("missing exp claim".to_string()).into());
    };
    let tolerance = i64::try_from(expected.clock_tolerance).unwrap_or(i64::MAX);
    if exp.saturating_add(tolerance) <= expected.now.timestamp() {
        return Err(OidcError::IdTokenValidation("token has expired".to_string()).into());
    }

    if let Some(nonce) = expected.nonce {
        if claims.get("nonce").and_then(Value::as_str) != Some(nonce) {
            return Err(OidcError::IdTokenValidation("nonce mismatch".to_string()).into());
        }
    }

    Ok(())
}
