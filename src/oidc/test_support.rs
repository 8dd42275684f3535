//! Shared fixtures for unit tests: a signing key matching the test JWKS and
//! a scripted token endpoint.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Value, json};
use url::Url;

use super::endpoint::{EndpointError, TokenEndpoint, TokenResponse};
use super::exchange::{ClientRegistration, CodeExchanger};
use super::keys::StaticKeySet;
use super::pkce::PkceStore;
use super::validator::{TokenValidator, ValidationPolicy};

pub(crate) const ISSUER: &str = "https://login.example.com/tenant-1/v2.0";
pub(crate) const AUDIENCE: &str = "api://gateway";
pub(crate) const KID: &str = "idp-key-1";

const SIGNING_KEY: &[u8] = include_bytes!("../../tests/fixtures/idp_signing_key.pem");
const OTHER_KEY: &[u8] = include_bytes!("../../tests/fixtures/other_signing_key.pem");
const JWKS: &str = include_str!("../../tests/fixtures/jwks.json");

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Claims for a valid one-hour token carrying `roles`.
pub(crate) fn claims_with_roles(roles: Value) -> Value {
    let now = now();
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "sub": "subject-alice",
        "oid": "oid-alice",
        "name": "Alice Smith",
        "preferred_username": "Alice.Smith@Example.COM",
        "iat": now,
        "nbf": now,
        "exp": now + 3600,
        "roles": roles,
    })
}

pub(crate) fn sign_with_header(header: &Header, claims: &Value) -> String {
    let key = EncodingKey::from_rsa_pem(SIGNING_KEY).unwrap();
    jsonwebtoken::encode(header, claims, &key).unwrap()
}

pub(crate) fn sign(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    sign_with_header(&header, claims)
}

pub(crate) fn sign_with_other_key(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let key = EncodingKey::from_rsa_pem(OTHER_KEY).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

/// An `alg: none` JWT, as an `id_token` whose payload is read unverified.
pub(crate) fn unsigned_id_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("{header}.{payload}.")
}

pub(crate) fn test_policy() -> ValidationPolicy {
    ValidationPolicy {
        issuer: ISSUER.to_string(),
        audience: AUDIENCE.to_string(),
        roles_claim: "roles".to_string(),
        allowed_roles: vec![
            "WorkspaceOwner".to_string(),
            "WorkspaceResearcher".to_string(),
        ],
        leeway: Duration::from_secs(60),
    }
}

pub(crate) fn test_validator() -> TokenValidator {
    TokenValidator::new(
        Arc::new(test_policy()),
        Arc::new(StaticKeySet::from_json(JWKS).unwrap()),
    )
}

pub(crate) fn test_exchanger(
    endpoint: FakeTokenEndpoint,
) -> (CodeExchanger, Arc<FakeTokenEndpoint>) {
    let fake = Arc::new(endpoint);
    let exchanger = CodeExchanger::new(
        Arc::new(PkceStore::new()),
        Arc::new(test_validator()),
        Arc::clone(&fake) as Arc<dyn TokenEndpoint>,
        ClientRegistration {
            authorization_endpoint: Url::parse(
                "https://login.example.com/tenant-1/oauth2/v2.0/authorize",
            )
            .unwrap(),
            client_id: "client-123".to_string(),
            redirect_uri: "https://gateway.example.com/".to_string(),
            scopes: vec!["openid".to_string(), "offline_access".to_string()],
        },
    );
    (exchanger, fake)
}

/// Scripted token endpoint recording every grant it receives.
#[derive(Default)]
pub(crate) struct FakeTokenEndpoint {
    response: Option<TokenResponse>,
    rejection: Option<String>,
    delay: Option<Duration>,
    /// `(code, code_verifier)` pairs
    pub(crate) redeemed: Mutex<Vec<(String, String)>>,
    /// Refresh tokens presented
    pub(crate) refreshed: Mutex<Vec<String>>,
}

impl FakeTokenEndpoint {
    pub(crate) fn issuing(access: &str, id_token: Option<&str>, refresh: Option<&str>) -> Self {
        Self {
            response: Some(TokenResponse {
                access_token: access.to_string(),
                token_type: Some("Bearer".to_string()),
                id_token: id_token.map(String::from),
                refresh_token: refresh.map(String::from),
                expires_in: Some(3600),
                scope: None,
            }),
            ..Self::default()
        }
    }

    pub(crate) fn rejecting(error: &str) -> Self {
        Self {
            rejection: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn respond(&self) -> Result<TokenResponse, EndpointError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.rejection {
            return Err(EndpointError::Rejected {
                error: error.clone(),
                description: None,
            });
        }
        self.response
            .clone()
            .ok_or_else(|| EndpointError::Transport("no response scripted".to_string()))
    }
}

#[async_trait]
impl TokenEndpoint for FakeTokenEndpoint {
    async fn redeem_code(
        &self,
        code: &str,
        code_verifier: &str,
        _redirect_uri: &str,
        _scopes: &[String],
    ) -> Result<TokenResponse, EndpointError> {
        self.redeemed
            .lock()
            .push((code.to_string(), code_verifier.to_string()));
        self.respond().await
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        _scopes: &[String],
    ) -> Result<TokenResponse, EndpointError> {
        self.refreshed.lock().push(refresh_token.to_string());
        self.respond().await
    }
}
