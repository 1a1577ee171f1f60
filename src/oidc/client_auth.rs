//! Token endpoint client authentication
//!
//! Every request to the token, introspection, revocation and device
//! endpoints goes through [`ClientAuthenticator::apply`], which rewrites the
//! form body (and optionally adds an `Authorization` header) according to
//! the configured [`TokenEndpointAuthMethod`].
//!
//! Client assertions for `client_secret_jwt` and `private_key_jwt` follow
//! RFC 7523 section 2.2 and are signed with `jsonwebtoken`.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::error::{OidcError, Result};

/// `client_assertion_type` for JWT client assertions.
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of a client assertion, in seconds.
const ASSERTION_LIFETIME_SECS: i64 = 60;

/// How the client authenticates to the token endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    /// Secret in the form body
    ClientSecretPost,
    /// Secret in an HTTP Basic `Authorization` header
    ClientSecretBasic,
    /// HS256 assertion signed with the client secret
    ClientSecretJwt,
    /// Assertion signed with the client's private key
    PrivateKeyJwt,
    /// Mutual TLS with a CA-issued certificate
    TlsClientAuth,
    /// Mutual TLS with a self-signed certificate
    SelfSignedTlsClientAuth,
    /// Public client
    None,
}

impl TokenEndpointAuthMethod {
    /// Registered method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientSecretPost => "client_secret_post",
            Self::ClientSecretBasic => "client_secret_basic",
            Self::ClientSecretJwt => "client_secret_jwt",
            Self::PrivateKeyJwt => "private_key_jwt",
            Self::TlsClientAuth => "tls_client_auth",
            Self::SelfSignedTlsClientAuth => "self_signed_tls_client_auth",
            Self::None => "none",
        }
    }
}

impl fmt::Display for TokenEndpointAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenEndpointAuthMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "client_secret_post" => Self::ClientSecretPost,
            "client_secret_basic" => Self::ClientSecretBasic,
            "client_secret_jwt" => Self::ClientSecretJwt,
            "private_key_jwt" => Self::PrivateKeyJwt,
            "tls_client_auth" => Self::TlsClientAuth,
            "self_signed_tls_client_auth" => Self::SelfSignedTlsClientAuth,
            "none" => Self::None,
            other => {
                return Err(OidcError::Config(format!(
                    "unknown token_endpoint_auth_method: {other}"
                ))
                .into())
            }
        })
    }
}

/// Form body and optional `Authorization` header for one token request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedRequest {
    /// Form-encoded body parameters, in order.
    pub form: Vec<(String, String)>,
    /// Value for the `Authorization` header, if the method uses one.
    pub authorization: Option<String>,
}

impl PreparedRequest {
    /// Looks up a form parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Attaches the body and header to `builder`.
    pub fn apply_to(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.form(&self.form);
        match &self.authorization {
            Some(value) => builder.header(reqwest::header::AUTHORIZATION, value),
            None => builder,
        }
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
}

#[derive(Clone)]
struct AssertionSigner {
    algorithm: Algorithm,
    key: EncodingKey,
    kid: Option<String>,
}

/// Applies the configured client authentication method to token requests.
#[derive(Clone)]
pub struct ClientAuthenticator {
    method: TokenEndpointAuthMethod,
    client_id: String,
    client_secret: Option<String>,
    signer: Option<AssertionSigner>,
}

impl fmt::Debug for ClientAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAuthenticator")
            .field("method", &self.method)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

fn encoding_key(algorithm: Algorithm, material: &str) -> Result<EncodingKey> {
    use Algorithm::*;

    let key = match algorithm {
        RS256 | RS384 | RS512 | PS256 | PS384 | PS512 => {
            EncodingKey::from_rsa_pem(material.as_bytes())
        }
        ES256 | ES384 => EncodingKey::from_ec_pem(material.as_bytes()),
        EdDSA => EncodingKey::from_ed_pem(material.as_bytes()),
        HS256 | HS384 | HS512 => Ok(EncodingKey::from_secret(material.as_bytes())),
    };
    key.map_err(|e| {
        OidcError::Config(format!(
            "private_key is not usable with {algorithm:?}: {e}"
        ))
        .into()
    })
}

impl ClientAuthenticator {
    /// Resolves and validates the authentication method for `config`.
    ///
    /// The default method is `client_secret_post` when a secret is
    /// configured and `none` otherwise.
    ///
    /// # Errors
    ///
    /// * [`OidcError::MissingClientSecret`] for `client_secret_*` without a secret
    /// * [`OidcError::MissingAlgorithm`] for `private_key_jwt` without
    ///   `token_endpoint_auth_signing_alg`
    /// * [`OidcError::MissingPrivateKey`] for `private_key_jwt` without a key
    /// * [`OidcError::Config`] for TLS methods unless
    ///   `tls_client_certificate_bound_access_tokens` is set, or when the
    ///   private key or algorithm cannot be used. Assertions are signed with
    ///   `jsonwebtoken`, which has no `ES512`; a P-521 client key is rejected
    ///   here with "unsupported token_endpoint_auth_signing_alg: ES512".
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let method = config.token_endpoint_auth_method.unwrap_or({
            if config.client_secret.is_some() {
                TokenEndpointAuthMethod::ClientSecretPost
            } else {
                TokenEndpointAuthMethod::None
            }
        });

        let mut signer = None;
        match method {
            TokenEndpointAuthMethod::ClientSecretPost
            | TokenEndpointAuthMethod::ClientSecretBasic
            | TokenEndpointAuthMethod::ClientSecretJwt => {
                if config.client_secret.is_none() {
                    return Err(OidcError::MissingClientSecret(method.to_string()).into());
                }
            }
            TokenEndpointAuthMethod::PrivateKeyJwt => {
                let alg_name = config
                    .token_endpoint_auth_signing_alg
                    .as_deref()
                    .ok_or(OidcError::MissingAlgorithm)?;
                let pem = config
                    .private_key
                    .as_deref()
                    .ok_or(OidcError::MissingPrivateKey)?;
                let algorithm = Algorithm::from_str(alg_name).map_err(|_| {
                    OidcError::Config(format!(
                        "unsupported token_endpoint_auth_signing_alg: {alg_name}"
                    ))
                })?;
                signer = Some(AssertionSigner {
                    algorithm,
                    key: encoding_key(algorithm, pem)?,
                    kid: config.private_key_id.clone(),
                });
            }
            TokenEndpointAuthMethod::TlsClientAuth
            | TokenEndpointAuthMethod::SelfSignedTlsClientAuth => {
                if !config.tls_client_certificate_bound_access_tokens {
                    return Err(OidcError::Config(format!(
                        "{method} requires tls_client_certificate_bound_access_tokens = true"
                    ))
                    .into());
                }
            }
            TokenEndpointAuthMethod::None => {}
        }

        Ok(Self {
            method,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            signer,
        })
    }

    /// The resolved authentication method.
    pub fn method(&self) -> TokenEndpointAuthMethod {
        self.method
    }

    /// Adds client authentication to `params` for a request to `endpoint`.
    ///
    /// `client_id` is always present in the body. `client_secret` is only
    /// present for `client_secret_post`.
    ///
    /// # Arguments
    ///
    /// * `params` - Grant-specific parameters
    /// * `endpoint` - Target endpoint; the `aud` of any client assertion
    /// * `now` - Issue time for client assertions
    pub fn apply(
        &self,
        params: Vec<(String, String)>,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<PreparedRequest> {
        let mut form = params;
        form.retain(|(k, _)| k != "client_id" && k != "client_secret");
        form.push(("client_id".to_string(), self.client_id.clone()));

        let mut authorization = None;
        match self.method {
            TokenEndpointAuthMethod::ClientSecretPost => {
                if let Some(secret) = &self.client_secret {
                    form.push(("client_secret".to_string(), secret.clone()));
                }
            }
            TokenEndpointAuthMethod::ClientSecretBasic => {
                let secret = self.client_secret.as_deref().unwrap_or_default();
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", self.client_id, secret));
                authorization = Some(format!("Basic {credentials}"));
            }
            TokenEndpointAuthMethod::ClientSecretJwt => {
                let secret = self.client_secret.as_deref().unwrap_or_default();
                let signer = AssertionSigner {
                    algorithm: Algorithm::HS256,
                    key: EncodingKey::from_secret(secret.as_bytes()),
                    kid: None,
                };
                let assertion = self.mint_assertion(&signer, endpoint, now)?;
                push_assertion(&mut form, assertion);
            }
            TokenEndpointAuthMethod::PrivateKeyJwt => {
                let signer = self.signer.as_ref().ok_or(OidcError::MissingPrivateKey)?;
                let assertion = self.mint_assertion(signer, endpoint, now)?;
                push_assertion(&mut form, assertion);
            }
            TokenEndpointAuthMethod::TlsClientAuth
            | TokenEndpointAuthMethod::SelfSignedTlsClientAuth
            | TokenEndpointAuthMethod::None => {}
        }

        Ok(PreparedRequest {
            form,
            authorization,
        })
    }

    fn mint_assertion(
        &self,
        signer: &AssertionSigner,
        audience: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let iat = now.timestamp();
        let claims = AssertionClaims {
            iss: &self.client_id,
            sub: &self.client_id,
            aud: audience,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let mut header = Header::new(signer.algorithm);
        header.kid = signer.kid.clone();

        jsonwebtoken::encode(&header, &claims, &signer.key).map_err(|e| {
            OidcError::Config(format!("failed to sign client assertion: {e}")).into()
        })
    }
}

fn push_assertion(form: &mut Vec<(String, String)>, assertion: String) {
    form.push((
        "client_assertion_type".to_string(),
        CLIENT_ASSERTION_TYPE.to_string(),
    ));
    form.push(("client_assertion".to_string(), assertion));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_code;
    use crate::oidc::jwt;

    const ENDPOINT: &str = "https://id.example.com/token";

    fn config(method: TokenEndpointAuthMethod) -> ClientConfig {
        let mut config = ClientConfig::new("https://id.example.com", "app");
        config.client_secret = Some("s3cret".to_string());
        config.token_endpoint_auth_method = Some(method);
        config
    }

    fn grant() -> Vec<(String, String)> {
        vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), "abc".to_string()),
            ("client_secret".to_string(), "leak".to_string()),
        ]
    }

    #[test]
    fn test_default_method_depends_on_secret() {
        let mut config = ClientConfig::new("https://id.example.com", "app");
        assert_eq!(
            ClientAuthenticator::from_config(&config).unwrap().method(),
            TokenEndpointAuthMethod::None
        );
        config.client_secret = Some("s".to_string());
        assert_eq!(
            ClientAuthenticator::from_config(&config).unwrap().method(),
            TokenEndpointAuthMethod::ClientSecretPost
        );
    }

    #[test]
    fn test_secret_methods_require_secret() {
        for method in [
            TokenEndpointAuthMethod::ClientSecretPost,
            TokenEndpointAuthMethod::ClientSecretBasic,
            TokenEndpointAuthMethod::ClientSecretJwt,
        ] {
            let mut config = config(method);
            config.client_secret = None;
            let err = ClientAuthenticator::from_config(&config).unwrap_err();
            assert_eq!(error_code(&err), Some("MISSING_CLIENT_SECRET"));
        }
    }

    #[test]
    fn test_private_key_jwt_requires_alg_then_key() {
        let mut config = config(TokenEndpointAuthMethod::PrivateKeyJwt);
        let err = ClientAuthenticator::from_config(&config).unwrap_err();
        assert_eq!(error_code(&err), Some("MISSING_ALGORITHM"));

        config.token_endpoint_auth_signing_alg = Some("RS256".to_string());
        let err = ClientAuthenticator::from_config(&config).unwrap_err();
        assert_eq!(error_code(&err), Some("MISSING_PRIVATE_KEY"));

        config.private_key = Some("not a pem".to_string());
        let err = ClientAuthenticator::from_config(&config).unwrap_err();
        assert_eq!(error_code(&err), Some("CONFIG_ERROR"));
    }

    #[test]
    fn test_private_key_jwt_rejects_es512() {
        let mut config = config(TokenEndpointAuthMethod::PrivateKeyJwt);
        config.token_endpoint_auth_signing_alg = Some("ES512".to_string());
        config.private_key = Some("unused".to_string());
        let err = ClientAuthenticator::from_config(&config).unwrap_err();
        assert_eq!(error_code(&err), Some("CONFIG_ERROR"));
        assert!(err
            .to_string()
            .contains("unsupported token_endpoint_auth_signing_alg: ES512"));
    }

    #[test]
    fn test_tls_methods_require_bound_tokens() {
        let mut config = config(TokenEndpointAuthMethod::TlsClientAuth);
        let err = ClientAuthenticator::from_config(&config).unwrap_err();
        assert_eq!(error_code(&err), Some("CONFIG_ERROR"));
        config.tls_client_certificate_bound_access_tokens = true;
        assert!(ClientAuthenticator::from_config(&config).is_ok());
    }

    #[test]
    fn test_client_secret_post_puts_secret_in_body() {
        let auth =
            ClientAuthenticator::from_config(&config(TokenEndpointAuthMethod::ClientSecretPost))
                .unwrap();
        let req = auth.apply(grant(), ENDPOINT, Utc::now()).unwrap();
        assert_eq!(req.param("client_secret"), Some("s3cret"));
        assert_eq!(req.param("client_id"), Some("app"));
        assert!(req.authorization.is_none());
    }

    #[test]
    fn test_client_secret_basic_uses_header() {
        let auth =
            ClientAuthenticator::from_config(&config(TokenEndpointAuthMethod::ClientSecretBasic))
                .unwrap();
        let req = auth.apply(grant(), ENDPOINT, Utc::now()).unwrap();
        assert!(req.param("client_secret").is_none());
        // base64("app:s3cret")
        assert_eq!(req.authorization.as_deref(), Some("Basic YXBwOnMzY3JldA=="));
    }

    #[test]
    fn test_client_secret_jwt_assertion_claims() {
        let auth =
            ClientAuthenticator::from_config(&config(TokenEndpointAuthMethod::ClientSecretJwt))
                .unwrap();
        let now = Utc::now();
        let req = auth.apply(grant(), ENDPOINT, now).unwrap();
        assert!(req.param("client_secret").is_none());
        assert_eq!(req.param("client_assertion_type"), Some(CLIENT_ASSERTION_TYPE));

        let assertion = req.param("client_assertion").unwrap();
        assert_eq!(jwt::decode_header(assertion).unwrap().alg, "HS256");
        let claims = jwt::decode_claims(assertion).unwrap();
        assert_eq!(claims["iss"], "app");
        assert_eq!(claims["sub"], "app");
        assert_eq!(claims["aud"], ENDPOINT);
        assert_eq!(claims["iat"], now.timestamp());
        assert_eq!(claims["exp"], now.timestamp() + 60);
        assert!(claims["jti"].as_str().is_some());
    }

    #[test]
    fn test_assertion_jti_is_unique() {
        let auth =
            ClientAuthenticator::from_config(&config(TokenEndpointAuthMethod::ClientSecretJwt))
                .unwrap();
        let now = Utc::now();
        let a = auth.apply(grant(), ENDPOINT, now).unwrap();
        let b = auth.apply(grant(), ENDPOINT, now).unwrap();
        let jti = |r: &PreparedRequest| {
            jwt::decode_claims(r.param("client_assertion").unwrap()).unwrap()["jti"].clone()
        };
        assert_ne!(jti(&a), jti(&b));
    }

    #[test]
    fn test_private_key_jwt_with_hmac_key_material() {
        let mut config = config(TokenEndpointAuthMethod::PrivateKeyJwt);
        config.token_endpoint_auth_signing_alg = Some("HS512".to_string());
        config.private_key = Some("shared-key-material".to_string());
        config.private_key_id = Some("key-7".to_string());
        let auth = ClientAuthenticator::from_config(&config).unwrap();
        let req = auth.apply(grant(), ENDPOINT, Utc::now()).unwrap();
        let header = jwt::decode_header(req.param("client_assertion").unwrap()).unwrap();
        assert_eq!(header.alg, "HS512");
        assert_eq!(header.kid.as_deref(), Some("key-7"));
        assert!(req.param("client_secret").is_none());
    }

    #[test]
    fn test_none_and_tls_strip_secret() {
        let mut tls = config(TokenEndpointAuthMethod::SelfSignedTlsClientAuth);
        tls.tls_client_certificate_bound_access_tokens = true;
        for config in [config(TokenEndpointAuthMethod::None), tls] {
            let auth = ClientAuthenticator::from_config(&config).unwrap();
            let req = auth.apply(grant(), ENDPOINT, Utc::now()).unwrap();
            assert!(req.param("client_secret").is_none());
            assert!(req.param("client_assertion").is_none());
            assert!(req.authorization.is_none());
        }
    }

    #[test]
    fn test_method_from_str_round_trip() {
        for name in [
            "client_secret_post",
            "client_secret_basic",
            "client_secret_jwt",
            "private_key_jwt",
            "tls_client_auth",
            "self_signed_tls_client_auth",
            "none",
        ] {
            let method: TokenEndpointAuthMethod = name.parse().unwrap();
            assert_eq!(method.as_str(), name);
        }
        assert!("bogus".parse::<TokenEndpointAuthMethod>().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let auth =
            ClientAuthenticator::from_config(&config(TokenEndpointAuthMethod::ClientSecretPost))
                .unwrap();
        assert!(!format!("{auth:?}").contains("s3cret"));
    }
}
