//! OAuth2 / OpenID Connect client protocol
//!
//! This module contains the protocol half of the engine:
//!
//! - [`discovery`] - provider metadata and the [`discovery::Issuer`] capability
//! - [`jwks`] - JSON Web Key Sets and the [`jwks::KeySet`] capability
//! - [`jwt`] - compact JWT parsing and ID-token claim checks
//! - [`verifier`] - JWS signature verification
//! - [`pkce`] - PKCE verifier/challenge generation
//! - [`client_auth`] - token endpoint client authentication methods
//! - [`state_store`] - single-use `state` entries for pending attempts
//! - [`tokens`] - the token lifecycle manager
//! - [`userinfo`] - the UserInfo endpoint client
//! - [`flow`] - authorization code, implicit and logout flows
//! - [`device`] - the device authorization grant

pub mod client_auth;
pub mod device;
pub mod discovery;
pub mod flow;
pub mod jwks;
pub mod jwt;
pub mod pkce;
pub mod state_store;
pub mod tokens;
pub mod userinfo;
pub mod verifier;

pub use client_auth::TokenEndpointAuthMethod;
pub use device::{DeviceAuthorization, DevicePollOutcome};
pub use discovery::{ClientMetadata, HttpIssuer, Issuer, StaticIssuer};
pub use flow::{AuthorizationFlow, AuthorizationUrlResult};
pub use jwks::{Jwk, JwkSet, KeySet, RemoteJwks, StaticJwks};
pub use jwt::{Claims, JwtHeader};
pub use tokens::{IntrospectionResponse, TokenManager, TokenSet};
pub use userinfo::{HttpUserInfo, UserInfo};
pub use verifier::{JwsAlgorithm, SignatureVerifier, VerificationKey};

/// Returns `len` random bytes encoded as base64url without padding.
///
/// Used for `state`, `nonce` and CSRF tokens.
pub fn random_token(len: usize) -> String {
    use base64::Engine as _;
    use rand::RngCore as _;

    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
