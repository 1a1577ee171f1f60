//! JWS signature verification against a provider key set
//!
//! [`SignatureVerifier`] resolves the signing key by `kid` through a
//! [`KeySet`], checks that the key matches the header algorithm, and then
//! verifies the signature over `header.payload`.
//!
//! Supported algorithms:
//!
//! | alg | key type | scheme |
//! |---|---|---|
//! | RS256 / RS384 / RS512 | RSA | RSASSA-PKCS1-v1_5 |
//! | PS256 / PS384 / PS512 | RSA | RSASSA-PSS (salt = digest length unless configured) |
//! | ES256 / ES384 / ES512 | EC P-256 / P-384 / P-521 | ECDSA, raw `r‖s` re-encoded to DER |
//!
//! HMAC algorithms are recognised but a symmetric (`oct`) key is never
//! accepted for verification, so `HS*` tokens always fail with
//! "unsupported key type".

use std::str::FromStr;
use std::sync::Arc;

use rsa::{BigUint, Pkcs1v15Sign, Pss, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{OidcError, Result};
use crate::oidc::jwks::{Jwk, KeySet};
use crate::oidc::jwt::{self, Claims, JwtHeader};

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    OidcError::IdTokenValidation(msg.into()).into()
}

// ---------------------------------------------------------------------------
// Algorithms
// ---------------------------------------------------------------------------

/// JWS algorithms the verifier understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JwsAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    RS256,
    /// RSASSA-PKCS1-v1_5 with SHA-384
    RS384,
    /// RSASSA-PKCS1-v1_5 with SHA-512
    RS512,
    /// RSASSA-PSS with SHA-256
    PS256,
    /// RSASSA-PSS with SHA-384
    PS384,
    /// RSASSA-PSS with SHA-512
    PS512,
    /// ECDSA P-256 with SHA-256
    ES256,
    /// ECDSA P-384 with SHA-384
    ES384,
    /// ECDSA P-521 with SHA-512
    ES512,
    /// HMAC with SHA-256
    HS256,
    /// HMAC with SHA-384
    HS384,
    /// HMAC with SHA-512
    HS512,
}

/// Hash function selected by an algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlg {
    /// Digest length in bytes; also the default PSS salt length.
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

impl JwsAlgorithm {
    /// The `alg` header value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::RS512 => "RS512",
            Self::PS256 => "PS256",
            Self::PS384 => "PS384",
            Self::PS512 => "PS512",
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
            Self::ES512 => "ES512",
            Self::HS256 => "HS256",
            Self::HS384 => "HS384",
            Self::HS512 => "HS512",
        }
    }

    /// The JWK `kty` this algorithm requires.
    pub fn key_type(self) -> &'static str {
        match self {
            Self::RS256 | Self::RS384 | Self::RS512 | Self::PS256 | Self::PS384 | Self::PS512 => {
                "RSA"
            }
            Self::ES256 | Self::ES384 | Self::ES512 => "EC",
            Self::HS256 | Self::HS384 | Self::HS512 => "oct",
        }
    }

    /// The hash this algorithm signs with.
    pub fn hash(self) -> HashAlg {
        match self {
            Self::RS256 | Self::PS256 | Self::ES256 | Self::HS256 => HashAlg::Sha256,
            Self::RS384 | Self::PS384 | Self::ES384 | Self::HS384 => HashAlg::Sha384,
            Self::RS512 | Self::PS512 | Self::ES512 | Self::HS512 => HashAlg::Sha512,
        }
    }

    /// The EC curve name for `ES*`, `None` otherwise.
    pub fn curve(self) -> Option<&'static str> {
        match self {
            Self::ES256 => Some("P-256"),
            Self::ES384 => Some("P-384"),
            Self::ES512 => Some("P-521"),
            _ => None,
        }
    }

    fn is_pss(self) -> bool {
        matches!(self, Self::PS256 | Self::PS384 | Self::PS512)
    }
}

impl FromStr for JwsAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "RS256" => Self::RS256,
            "RS384" => Self::RS384,
            "RS512" => Self::RS512,
            "PS256" => Self::PS256,
            "PS384" => Self::PS384,
            "PS512" => Self::PS512,
            "ES256" => Self::ES256,
            "ES384" => Self::ES384,
            "ES512" => Self::ES512,
            "HS256" => Self::HS256,
            "HS384" => Self::HS384,
            "HS512" => Self::HS512,
            other => return Err(invalid(format!("unsupported algorithm: {other}"))),
        })
    }
}

// ---------------------------------------------------------------------------
// Verification keys
// ---------------------------------------------------------------------------

/// A public key ready for signature verification.
#[derive(Clone)]
pub enum VerificationKey {
    /// RSA public key
    Rsa(RsaPublicKey),
    /// P-256 public key
    P256(p256::ecdsa::VerifyingKey),
    /// P-384 public key
    P384(p384::ecdsa::VerifyingKey),
    /// P-521 public key
    P521(p521::ecdsa::VerifyingKey),
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // p521's verifying key has no Debug impl; name the variant only.
        let kind = match self {
            Self::Rsa(_) => "Rsa",
            Self::P256(_) => "P256",
            Self::P384(_) => "P384",
            Self::P521(_) => "P521",
        };
        f.debug_tuple("VerificationKey").field(&kind).finish()
    }
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str> {
    field
        .as_deref()
        .ok_or_else(|| invalid(format!("JWK is missing '{name}'")))
}

/// Left-pads an EC coordinate to the field size; some publishers strip
/// leading zero bytes.
fn coordinate(encoded: &str, size: usize) -> Result<Vec<u8>> {
    let raw = jwt::b64_decode(encoded)?;
    if raw.len() > size {
        return Err(invalid("EC coordinate is too long for curve"));
    }
    let mut out = vec![0u8; size - raw.len()];
    out.extend_from_slice(&raw);
    Ok(out)
}

impl VerificationKey {
    /// Builds a verification key from `jwk` for use with `alg`.
    ///
    /// # Errors
    ///
    /// Fails with [`OidcError::IdTokenValidation`] when the key type does
    /// not match the algorithm family, the JWK declares a different `alg`,
    /// the EC curve is wrong, key material is missing or malformed, or the
    /// key is symmetric.
    pub fn from_jwk(jwk: &Jwk, alg: JwsAlgorithm) -> Result<Self> {
        if jwk.kty != alg.key_type() {
            return Err(invalid(format!(
                "key type {} does not match algorithm {}",
                jwk.kty,
                alg.as_str()
            )));
        }

        if let Some(jwk_alg) = jwk.alg.as_deref() {
            if jwk_alg != alg.as_str() {
                return Err(invalid(format!(
                    "key algorithm {jwk_alg} does not match token algorithm {}",
                    alg.as_str()
                )));
            }
        }

        match jwk.kty.as_str() {
            "RSA" => {
                let n = jwt::b64_decode(required(&jwk.n, "n")?)?;
                let e = jwt::b64_decode(required(&jwk.e, "e")?)?;
                let key =
                    RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
                        .map_err(|err| invalid(format!("invalid RSA key: {err}")))?;
                Ok(Self::Rsa(key))
            }
            "EC" => {
                let crv = required(&jwk.crv, "crv")?;
                if Some(crv) != alg.curve() {
                    return Err(invalid(format!(
                        "curve {crv} does not match algorithm {}",
                        alg.as_str()
                    )));
                }
                let size = match alg {
                    JwsAlgorithm::ES256 => 32,
                    JwsAlgorithm::ES384 => 48,
                    _ => 66,
                };
                let mut point = Vec::with_capacity(1 + 2 * size);
                point.push(0x04);
                point.extend(coordinate(required(&jwk.x, "x")?, size)?);
                point.extend(coordinate(required(&jwk.y, "y")?, size)?);

                let bad_point = |err: p256::ecdsa::Error| invalid(format!("invalid EC key: {err}"));
                match alg {
                    JwsAlgorithm::ES256 => Ok(Self::P256(
                        p256::ecdsa::VerifyingKey::from_sec1_bytes(&point).map_err(bad_point)?,
                    )),
                    JwsAlgorithm::ES384 => Ok(Self::P384(
                        p384::ecdsa::VerifyingKey::from_sec1_bytes(&point).map_err(bad_point)?,
                    )),
                    _ => Ok(Self::P521(
                        p521::ecdsa::VerifyingKey::from_sec1_bytes(&point).map_err(bad_point)?,
                    )),
                }
            }
            other => Err(invalid(format!("unsupported key type: {other}"))),
        }
    }

    /// Verifies `signature` over `signing_input`.
    ///
    /// `pss_salt_length` applies to `PS*` only and defaults to the digest
    /// length.
    pub fn verify(
        &self,
        alg: JwsAlgorithm,
        signing_input: &[u8],
        signature: &[u8],
        pss_salt_length: Option<usize>,
    ) -> Result<()> {
        use p256::ecdsa::signature::Verifier as _;

        let rejected = || invalid("signature verification failed");

        match self {
            Self::Rsa(key) => {
                let hash = alg.hash();
                let hashed = hash.digest(signing_input);
                let outcome = if alg.is_pss() {
                    let salt = pss_salt_length.unwrap_or(hash.output_len());
                    let scheme = match hash {
                        HashAlg::Sha256 => Pss::new_with_salt::<Sha256>(salt),
                        HashAlg::Sha384 => Pss::new_with_salt::<Sha384>(salt),
                        HashAlg::Sha512 => Pss::new_with_salt::<Sha512>(salt),
                    };
                    key.verify(scheme, &hashed, signature)
                } else {
                    let scheme = match hash {
                        HashAlg::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
                        HashAlg::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
                        HashAlg::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
                    };
                    key.verify(scheme, &hashed, signature)
                };
                outcome.map_err(|_| rejected())
            }
            Self::P256(key) => {
                let raw = p256::ecdsa::Signature::from_slice(signature).map_err(|_| rejected())?;
                let der = raw.to_der();
                let sig = p256::ecdsa::Signature::from_der(der.as_bytes())
                    .map_err(|_| rejected())?;
                key.verify(signing_input, &sig).map_err(|_| rejected())
            }
            Self::P384(key) => {
                let raw = p384::ecdsa::Signature::from_slice(signature).map_err(|_| rejected())?;
                let der = raw.to_der();
                let sig = p384::ecdsa::Signature::from_der(der.as_bytes())
                    .map_err(|_| rejected())?;
                key.verify(signing_input, &sig).map_err(|_| rejected())
            }
            Self::P521(key) => {
                let raw = p521::ecdsa::Signature::from_slice(signature).map_err(|_| rejected())?;
                let der = raw.to_der();
                let sig = p521::ecdsa::Signature::from_der(der.as_bytes())
                    .map_err(|_| rejected())?;
                key.verify(signing_input, &sig).map_err(|_| rejected())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SignatureVerifier
// ---------------------------------------------------------------------------

/// Verifies compact JWS tokens with keys from a [`KeySet`].
#[derive(Clone)]
pub struct SignatureVerifier {
    keys: Arc<dyn KeySet>,
    pss_salt_length: Option<usize>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("pss_salt_length", &self.pss_salt_length)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    /// Creates a verifier over `keys`.
    pub fn new(keys: Arc<dyn KeySet>) -> Self {
        Self {
            keys,
            pss_salt_length: None,
        }
    }

    /// Overrides the PSS salt length used for `PS*` tokens.
    pub fn with_pss_salt_length(mut self, salt_length: Option<usize>) -> Self {
        self.pss_salt_length = salt_length;
        self
    }

    /// Verifies the signature of `token` using `header`.
    ///
    /// # Arguments
    ///
    /// * `header` - The decoded JOSE header of `token`
    /// * `token` - The compact JWS
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::IdTokenValidation`] if `kid` or `alg` is
    /// missing, the algorithm is unsupported, the key does not fit the
    /// algorithm, or the signature does not verify. Key lookup failures are
    /// reported as [`OidcError::Jwks`].
    pub async fn verify(&self, header: &JwtHeader, token: &str) -> Result<()> {
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| invalid("JWT header is missing 'kid'"))?;
        if header.alg.is_empty() {
            return Err(invalid("JWT header is missing 'alg'"));
        }
        let alg: JwsAlgorithm = header.alg.parse()?;

        let jwk = self.keys.get_key(kid).await?;
        let key = VerificationKey::from_jwk(&jwk, alg)?;

        let parts = jwt::split(token)?;
        let signature = jwt::b64_decode(parts.signature)?;
        key.verify(
            alg,
            parts.signing_input.as_bytes(),
            &signature,
            self.pss_salt_length,
        )?;

        tracing::debug!("Verified {} signature with key {}", alg.as_str(), kid);
        Ok(())
    }

    /// Decodes the header of `token`, verifies it, and returns its claims.
    pub async fn verify_and_decode(&self, token: &str) -> Result<Claims> {
        let header = jwt::decode_header(token)?;
        self.verify(&header, token).await?;
        jwt::decode_claims(token)
    }
}
