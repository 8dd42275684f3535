//! Throwaway identity provider for integration tests.
//!
//! Serves a discovery document, a JWKS and a token endpoint on
//! `127.0.0.1:0`. Authorization codes are minted by [`FakeIdp::authorize`],
//! which plays the part of the browser and login page, and are bound to the
//! PKCE challenge from the redirect URL.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Form, Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gateway_oidc_auth::config::Config;
use gateway_oidc_auth::oidc::pkce::challenge_for;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use url::Url;

pub const AUDIENCE: &str = "api://gateway";
pub const KID: &str = "idp-key-1";
pub const CLIENT_ID: &str = "gateway-client";
pub const REDIRECT_URI: &str = "https://gateway.example.com/auth/callback";

const SIGNING_KEY: &[u8] = include_bytes!("../fixtures/idp_signing_key.pem");
pub const JWKS: &str = include_str!("../fixtures/jwks.json");

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Sign `claims` with the provider key under `kid`.
pub fn sign_with_kid(claims: &Value, kid: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(SIGNING_KEY).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

/// What the provider knows about the user logging in.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub preferred_username: String,
    pub name: String,
    pub roles: Value,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            preferred_username: "Alice.Smith@Example.COM".to_string(),
            name: "Alice Smith".to_string(),
            roles: json!(["WorkspaceOwner", "Other"]),
        }
    }
}

#[derive(Default)]
struct IdpState {
    issuer: String,
    jwks: Mutex<String>,
    /// code -> PKCE challenge
    codes: Mutex<HashMap<String, String>>,
    refresh_tokens: Mutex<Vec<String>>,
    profile: Mutex<UserProfile>,
    jwks_fetches: AtomicUsize,
    token_requests: AtomicUsize,
    minted: AtomicUsize,
}

impl IdpState {
    fn access_token(&self) -> String {
        let profile = self.profile.lock().clone();
        let now = now();
        let n = self.minted.fetch_add(1, Ordering::SeqCst);
        sign_with_kid(
            &json!({
                "iss": self.issuer,
                "aud": AUDIENCE,
                "sub": "subject-alice",
                "oid": "oid-alice",
                "tid": "tenant-1",
                "preferred_username": profile.preferred_username,
                "roles": profile.roles,
                "iat": now,
                "exp": now + 3600,
                "jti": format!("at-{n}"),
            }),
            KID,
        )
    }

    fn id_token(&self) -> String {
        let profile = self.profile.lock().clone();
        let now = now();
        sign_with_kid(
            &json!({
                "iss": self.issuer,
                "aud": CLIENT_ID,
                "sub": "subject-alice",
                "oid": "oid-alice",
                "tid": "tenant-1",
                "name": profile.name,
                "preferred_username": profile.preferred_username,
                "iat": now,
                "exp": now + 3600,
            }),
            KID,
        )
    }

    fn mint_refresh_token(&self) -> String {
        let n = self.minted.fetch_add(1, Ordering::SeqCst);
        let token = format!("rt-{n}");
        self.refresh_tokens.lock().push(token.clone());
        token
    }
}

/// Handle to a running fake provider.
pub struct FakeIdp {
    pub base_url: String,
    state: Arc<IdpState>,
}

impl FakeIdp {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");

        let state = Arc::new(IdpState {
            issuer: base_url.clone(),
            jwks: Mutex::new(JWKS.to_string()),
            ..IdpState::default()
        });

        let app = Router::new()
            .route("/.well-known/openid-configuration", get(discovery))
            .route("/keys", get(keys))
            .route("/token", post(token))
            .with_state(Arc::clone(&state));

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, state }
    }

    /// Issuer the provider signs tokens with
    pub fn issuer(&self) -> &str {
        &self.state.issuer
    }

    /// Authenticator configuration pointing at this provider via discovery.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.provider.authority = self.base_url.clone();
        config.provider.client_id = CLIENT_ID.to_string();
        config.provider.client_secret = "s3cret".to_string();
        config.provider.redirect_uri = REDIRECT_URI.to_string();
        config.provider.scopes = "openid offline_access api://gateway/user_impersonation".to_string();
        config.provider.allow_http = true;
        config.policy.issuer = self.base_url.clone();
        config.policy.audience = AUDIENCE.to_string();
        config.policy.allowed_roles = vec![
            "WorkspaceOwner".to_string(),
            "WorkspaceResearcher".to_string(),
        ];
        config
    }

    /// Valid access token for the current profile
    pub fn access_token(&self) -> String {
        self.state.access_token()
    }

    pub fn set_profile(&self, profile: UserProfile) {
        *self.state.profile.lock() = profile;
    }

    pub fn set_jwks(&self, jwks: &str) {
        *self.state.jwks.lock() = jwks.to_string();
    }

    /// Forget every refresh token, as if the user's grant was revoked.
    pub fn revoke_refresh_tokens(&self) {
        self.state.refresh_tokens.lock().clear();
    }

    pub fn jwks_fetches(&self) -> usize {
        self.state.jwks_fetches.load(Ordering::SeqCst)
    }

    pub fn token_requests(&self) -> usize {
        self.state.token_requests.load(Ordering::SeqCst)
    }

    /// Act as the user's browser: read the redirect, "log in" and return the
    /// callback query string the provider would send back.
    pub fn authorize(&self, redirect: &Url) -> String {
        let params: HashMap<String, String> = redirect.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["client_id"], CLIENT_ID);

        let n = self.state.minted.fetch_add(1, Ordering::SeqCst);
        let code = format!("code-{n}");
        self.state
            .codes
            .lock()
            .insert(code.clone(), params["code_challenge"].clone());

        serde_urlencoded::to_string([("code", code.as_str()), ("state", params["state"].as_str())])
            .unwrap()
    }

    /// Like [`authorize`](Self::authorize) but binds the code to a challenge
    /// the authenticator never issued.
    pub fn authorize_with_foreign_challenge(&self, redirect: &Url) -> String {
        let params: HashMap<String, String> = redirect.query_pairs().into_owned().collect();
        let code = "code-foreign".to_string();
        self.state
            .codes
            .lock()
            .insert(code.clone(), challenge_for("attacker-verifier"));
        format!("code={code}&state={}", params["state"])
    }
}

async fn discovery(State(state): State<Arc<IdpState>>) -> Json<Value> {
    let base = &state.issuer;
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/token"),
        "jwks_uri": format!("{base}/keys"),
        "code_challenge_methods_supported": ["S256"],
        "response_modes_supported": ["query"],
    }))
}

async fn keys(State(state): State<Arc<IdpState>>) -> Response {
    state.jwks_fetches.fetch_add(1, Ordering::SeqCst);
    let body = state.jwks.lock().clone();
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct TokenForm {
    grant_type: String,
    client_id: String,
    client_secret: Option<String>,
    code: Option<String>,
    code_verifier: Option<String>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

fn oauth_error(error: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": error, "error_description": format!("{error} (fake idp)") })),
    )
        .into_response()
}

async fn token(State(state): State<Arc<IdpState>>, Form(form): Form<TokenForm>) -> Response {
    state.token_requests.fetch_add(1, Ordering::SeqCst);

    if form.client_id != CLIENT_ID || form.client_secret.as_deref() != Some("s3cret") {
        return oauth_error("invalid_client");
    }

    match form.grant_type.as_str() {
        "authorization_code" => {
            let (Some(code), Some(verifier)) = (form.code, form.code_verifier) else {
                return oauth_error("invalid_request");
            };
            let Some(challenge) = state.codes.lock().remove(&code) else {
                return oauth_error("invalid_grant");
            };
            if challenge_for(&verifier) != challenge {
                return oauth_error("invalid_grant");
            }
        }
        "refresh_token" => {
            let Some(presented) = form.refresh_token else {
                return oauth_error("invalid_request");
            };
            let mut known = state.refresh_tokens.lock();
            let Some(pos) = known.iter().position(|t| *t == presented) else {
                return oauth_error("invalid_grant");
            };
            // Rotation: a refresh token is good for one use
            known.remove(pos);
        }
        _ => return oauth_error("unsupported_grant_type"),
    }

    Json(json!({
        "token_type": "Bearer",
        "access_token": state.access_token(),
        "id_token": state.id_token(),
        "refresh_token": state.mint_refresh_token(),
        "expires_in": 3600,
        "scope": form.scope.unwrap_or_default(),
    }))
    .into_response()
}
