//! PKCE challenge generation
//!
//! Implements the Proof Key for Code Exchange (PKCE) extension to OAuth 2.0
//! as defined in RFC 7636, supporting both the `S256` and `plain` challenge
//! methods.
//!
//! # How PKCE works
//!
//! 1. The client generates a high-entropy random string called the `code_verifier`.
//! 2. The client derives the `code_challenge` from it: for `S256` the
//!    base64url SHA-256 digest, for `plain` the verifier itself.
//! 3. The authorization request includes `code_challenge` and
//!    `code_challenge_method`.
//! 4. The token exchange request includes the original `code_verifier`.
//!
//! # References
//!
//! - RFC 7636 <https://www.rfc-editor.org/rfc/rfc7636>

use base64::Engine as _;
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// PkceChallenge
// ---------------------------------------------------------------------------

/// A PKCE verifier and its derived challenge.
///
/// # Examples
///
/// ```
/// use oidcx::oidc::pkce::generate;
///
/// let pkce = generate("S256");
/// assert_eq!(pkce.method.as_deref(), Some("S256"));
/// assert_eq!(pkce.verifier.len(), 43);
/// ```
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// The code verifier: 32 random bytes, base64url-encoded without padding
    /// (43 characters).
    pub verifier: String,

    /// The code challenge sent to the authorization endpoint.
    pub challenge: String,

    /// The `code_challenge_method` to send, or `None` when the configured
    /// method was not recognised and the parameter must be omitted.
    pub method: Option<String>,
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Generates a fresh random code verifier.
pub fn generate_verifier() -> String {
    use rand::RngCore as _;

    let mut random_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut random_bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Computes the `S256` challenge for `verifier`:
/// `BASE64URL(SHA256(ASCII(code_verifier)))`.
pub fn s256_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice())
}

/// Generates a verifier and derives its challenge using `method`.
///
/// `S256` hashes the verifier and `plain` uses it unchanged. Any other
/// method is logged as a warning; the challenge then falls back to the
/// verifier itself and [`PkceChallenge::method`] is `None`, so callers omit
/// `code_challenge_method` from the request.
///
/// # Arguments
///
/// * `method` - The configured challenge method
///
/// # Examples
///
/// ```
/// use oidcx::oidc::pkce::generate;
///
/// let plain = generate("plain");
/// assert_eq!(plain.challenge, plain.verifier);
///
/// let unknown = generate("S512");
/// assert!(unknown.method.is_none());
/// ```
pub fn generate(method: &str) -> PkceChallenge {
    let verifier = generate_verifier();
    derive(verifier, method)
}

fn derive(verifier: String, method: &str) -> PkceChallenge {
    match method {
        "S256" => PkceChallenge {
            challenge: s256_challenge(&verifier),
            verifier,
            method: Some("S256".to_string()),
        },
        "plain" => PkceChallenge {
            challenge: verifier.clone(),
            verifier,
            method: Some("plain".to_string()),
        },
        other => {
            tracing::warn!(
                "Invalid PKCE method '{}', omitting code_challenge_method",
                other
            );
            PkceChallenge {
                challenge: verifier.clone(),
                verifier,
                method: None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
