//! Shared helpers for integration tests: key material, token signing, and
//! engine construction against a wiremock provider.

#![allow(dead_code)]

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use rsa::pkcs8::DecodePrivateKey as _;
use rsa::traits::PublicKeyParts as _;
use rsa::{Pkcs1v15Sign, Pss, RsaPrivateKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use wiremock::MockServer;

use oidcx::clock::ManualClock;
use oidcx::config::ClientConfig;
use oidcx::oidc::discovery::{ClientMetadata, StaticIssuer};
use oidcx::oidc::jwks::{Jwk, JwkSet, StaticJwks};
use oidcx::oidc::tokens::TokenManager;
use oidcx::oidc::verifier::{JwsAlgorithm, SignatureVerifier};

pub const RSA_PRIVATE_PEM: &str = include_str!("../fixtures/rsa_private.pem");
pub const EC256_PRIVATE_PEM: &str = include_str!("../fixtures/ec256_private.pem");

pub fn b64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

pub fn rsa_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(RSA_PRIVATE_PEM).expect("fixture RSA key")
}

pub fn rsa_jwk(kid: &str) -> Jwk {
    let public = rsa_key().to_public_key();
    Jwk {
        kty: "RSA".to_string(),
        kid: Some(kid.to_string()),
        key_use: Some("sig".to_string()),
        n: Some(b64(&public.n().to_bytes_be())),
        e: Some(b64(&public.e().to_bytes_be())),
        ..Jwk::default()
    }
}

fn ec_jwk_from_point(kid: &str, crv: &str, x: &[u8], y: &[u8]) -> Jwk {
    Jwk {
        kty: "EC".to_string(),
        kid: Some(kid.to_string()),
        crv: Some(crv.to_string()),
        x: Some(b64(x)),
        y: Some(b64(y)),
        ..Jwk::default()
    }
}

fn p256_secret() -> [u8; 32] {
    [0x11; 32]
}

fn p384_secret() -> [u8; 48] {
    [0x11; 48]
}

fn p521_secret() -> [u8; 66] {
    let mut bytes = [0x11; 66];
    bytes[0] = 0x01;
    bytes
}

/// Public JWK for the deterministic test key of `alg`'s curve.
pub fn ec_jwk(kid: &str, alg: JwsAlgorithm) -> Jwk {
    match alg {
        JwsAlgorithm::ES256 => {
            let secret = p256::SecretKey::from_slice(&p256_secret()).unwrap();
            let point = secret.public_key().to_encoded_point(false);
            ec_jwk_from_point(kid, "P-256", point.x().unwrap(), point.y().unwrap())
        }
        JwsAlgorithm::ES384 => {
            let secret = p384::SecretKey::from_slice(&p384_secret()).unwrap();
            let point = secret.public_key().to_encoded_point(false);
            ec_jwk_from_point(kid, "P-384", point.x().unwrap(), point.y().unwrap())
        }
        JwsAlgorithm::ES512 => {
            let secret = p521::SecretKey::from_slice(&p521_secret()).unwrap();
            let point = secret.public_key().to_encoded_point(false);
            ec_jwk_from_point(kid, "P-521", point.x().unwrap(), point.y().unwrap())
        }
        other => panic!("{other:?} is not an EC algorithm"),
    }
}

/// Public JWK of the P-256 PEM fixture.
pub fn ec256_fixture_jwk(kid: &str) -> Jwk {
    let secret = <p256::SecretKey as p256::pkcs8::DecodePrivateKey>::from_pkcs8_pem(EC256_PRIVATE_PEM)
        .expect("fixture EC key");
    let point = secret.public_key().to_encoded_point(false);
    ec_jwk_from_point(kid, "P-256", point.x().unwrap(), point.y().unwrap())
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

fn rsa_sign(alg: JwsAlgorithm, input: &[u8]) -> Vec<u8> {
    let key = rsa_key();
    let mut rng = rsa::rand_core::OsRng;
    let signature = match alg {
        JwsAlgorithm::RS256 => key.sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(input)),
        JwsAlgorithm::RS384 => key.sign(Pkcs1v15Sign::new::<Sha384>(), &Sha384::digest(input)),
        JwsAlgorithm::RS512 => key.sign(Pkcs1v15Sign::new::<Sha512>(), &Sha512::digest(input)),
        JwsAlgorithm::PS256 => key.sign_with_rng(&mut rng, Pss::new::<Sha256>(), &Sha256::digest(input)),
        JwsAlgorithm::PS384 => key.sign_with_rng(&mut rng, Pss::new::<Sha384>(), &Sha384::digest(input)),
        JwsAlgorithm::PS512 => key.sign_with_rng(&mut rng, Pss::new::<Sha512>(), &Sha512::digest(input)),
        other => panic!("{other:?} is not an RSA algorithm"),
    };
    signature.expect("RSA signing")
}

/// Raw `r || s` ECDSA signature, as carried in a JWS.
fn ec_sign(alg: JwsAlgorithm, input: &[u8]) -> Vec<u8> {
    use p256::ecdsa::signature::Signer as _;
    match alg {
        JwsAlgorithm::ES256 => {
            let key = p256::ecdsa::SigningKey::from_slice(&p256_secret()).unwrap();
            let sig: p256::ecdsa::Signature = key.sign(input);
            sig.to_bytes().to_vec()
        }
        JwsAlgorithm::ES384 => {
            let key = p384::ecdsa::SigningKey::from_slice(&p384_secret()).unwrap();
            let sig: p384::ecdsa::Signature = key.sign(input);
            sig.to_bytes().to_vec()
        }
        JwsAlgorithm::ES512 => {
            let key = p521::ecdsa::SigningKey::from_slice(&p521_secret()).unwrap();
            let sig: p521::ecdsa::Signature = key.sign(input);
            sig.to_bytes().to_vec()
        }
        other => panic!("{other:?} is not an EC algorithm"),
    }
}

/// Signs `claims` as a compact JWS with the test key for `alg`.
pub fn sign_jwt(alg: JwsAlgorithm, kid: &str, claims: &serde_json::Value) -> String {
    let header = serde_json::json!({"alg": alg.as_str(), "kid": kid, "typ": "JWT"});
    let signing_input = format!(
        "{}.{}",
        b64(header.to_string().as_bytes()),
        b64(claims.to_string().as_bytes())
    );
    let signature = match alg.key_type() {
        "RSA" => rsa_sign(alg, signing_input.as_bytes()),
        "EC" => ec_sign(alg, signing_input.as_bytes()),
        _ => panic!("no test key for {alg:?}"),
    };
    format!("{signing_input}.{}", b64(&signature))
}

pub fn verifier_for(keys: Vec<Jwk>) -> SignatureVerifier {
    SignatureVerifier::new(Arc::new(StaticJwks::new(JwkSet { keys })))
}

// ---------------------------------------------------------------------------
// Engine construction
// ---------------------------------------------------------------------------

pub fn client_config(server: &MockServer) -> ClientConfig {
    let mut config = ClientConfig::new(server.uri(), "test-client");
    config.redirect_uri = Some("https://app.example.com/callback".to_string());
    config
}

pub fn metadata(server: &MockServer) -> ClientMetadata {
    ClientMetadata::for_issuer(&server.uri())
}

/// Token manager against `server` with the RSA test key published as `kid-rsa`.
pub fn token_manager(config: ClientConfig, server: &MockServer, clock: Arc<ManualClock>) -> TokenManager {
    let issuer = Arc::new(StaticIssuer::new(metadata(server)));
    TokenManager::new(config, reqwest::Client::new(), issuer)
        .expect("token manager")
        .with_key_set(Arc::new(StaticJwks::new(JwkSet {
            keys: vec![rsa_jwk("kid-rsa")],
        })))
        .with_clock(clock)
}

/// ID token claims for `server` and `test-client`, valid for an hour from `now`.
pub fn id_token_claims(server: &MockServer, nonce: &str, now: chrono::DateTime<chrono::Utc>) -> serde_json::Value {
    serde_json::json!({
        "iss": server.uri(),
        "sub": "user-1",
        "aud": "test-client",
        "iat": now.timestamp(),
        "exp": now.timestamp() + 3600,
        "nonce": nonce,
    })
}

/// Parses an `application/x-www-form-urlencoded` body.
pub fn form(body: &[u8]) -> std::collections::HashMap<String, String> {
    url::form_urlencoded::parse(body).into_owned().collect()
}
