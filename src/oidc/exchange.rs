//! Authorization Code + PKCE exchange
//!
//! # Flow
//!
//! 1. [`CodeExchanger::build_redirect`] stores a fresh PKCE challenge and
//!    returns the provider authorization URL carrying it.
//! 2. The provider sends the browser back with `state` and `code` (or
//!    `error`) in the query string.
//! 3. [`CodeExchanger::complete_exchange`] consumes the PKCE state named by
//!    `state`, redeems the code with the original verifier, validates the
//!    returned access token and opens an [`OidcSession`] holding the token
//!    cache for later silent refresh.
//!
//! The PKCE state is consumed before anything else in the callback is
//! looked at, so a replayed or forged `state` fails the same way whatever the
//! rest of the query contains.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use super::endpoint::{EndpointError, TokenEndpoint};
use super::pkce::{PkceState, PkceStore};
use super::session::{AccountRef, OidcSession, TokenCache};
use super::validator::{AuthenticatedIdentity, TokenValidator, ValidationError};
use crate::ErrorKind;

/// Client registration details used to build redirects and redeem codes.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    /// Provider authorization endpoint
    pub authorization_endpoint: Url,
    /// OAuth client id
    pub client_id: String,
    /// Redirect URI registered with the provider
    pub redirect_uri: String,
    /// Scopes requested when redeeming a code
    pub scopes: Vec<String>,
}

/// Query parameters of an OIDC authentication response.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticationResponse {
    /// Echo of the PKCE state id
    pub state: String,
    /// Authorization code
    #[serde(default)]
    pub code: Option<String>,
    /// Provider error code
    #[serde(default)]
    pub error: Option<String>,
    /// Provider error description
    #[serde(default)]
    pub error_description: Option<String>,
    /// Identity assertion delivered on the front channel
    #[serde(default)]
    pub id_token: Option<String>,
    /// Access token delivered on the front channel
    #[serde(default)]
    pub access_token: Option<String>,
}

impl AuthenticationResponse {
    /// Parse a raw query string. Returns `None` unless the query carries a
    /// non-empty `state` plus at least one response artifact or error.
    #[must_use]
    pub fn parse(query: &str) -> Option<Self> {
        let response: Self = serde_urlencoded::from_str(query).ok()?;
        if response.state.trim().is_empty() {
            return None;
        }
        let has_payload = [
            &response.code,
            &response.error,
            &response.id_token,
            &response.access_token,
        ]
        .iter()
        .any(|v| v.as_deref().is_some_and(|s| !s.is_empty()));
        has_payload.then_some(response)
    }
}

/// Identity established through the redirect flow.
#[derive(Debug, Clone)]
pub struct OidcIdentity {
    /// Validated access token identity
    pub identity: AuthenticatedIdentity,
    /// Session holding the token cache for silent refresh
    pub session: OidcSession,
}

/// Exchange failures
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// `state` is unknown, expired or already consumed
    #[error("Invalid or expired state")]
    InvalidState,

    /// The callback or token response is malformed
    #[error("Invalid authentication response: {0}")]
    InvalidResponse(String),

    /// The provider reported an authentication error
    #[error("Provider returned error: {0}")]
    ProviderError(String),

    /// Tokens arrived on the front channel instead of a code
    #[error("Authentication response carried tokens instead of an authorization code")]
    UnexpectedArtifacts,

    /// Code redemption failed
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// The redeemed access token failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ExchangeError {
    /// Failure class of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState => ErrorKind::State,
            Self::InvalidResponse(_) | Self::UnexpectedArtifacts => ErrorKind::Protocol,
            Self::ProviderError(_) => ErrorKind::Authorization,
            Self::Endpoint(e) => e.kind(),
            Self::Validation(e) => e.kind(),
        }
    }
}

/// Drives the Authorization Code + PKCE exchange.
pub struct CodeExchanger {
    store: Arc<PkceStore>,
    validator: Arc<TokenValidator>,
    token_endpoint: Arc<dyn TokenEndpoint>,
    client: ClientRegistration,
}

impl CodeExchanger {
    /// Create an exchanger
    #[must_use]
    pub fn new(
        store: Arc<PkceStore>,
        validator: Arc<TokenValidator>,
        token_endpoint: Arc<dyn TokenEndpoint>,
        client: ClientRegistration,
    ) -> Self {
        Self {
            store,
            validator,
            token_endpoint,
            client,
        }
    }

    /// The PKCE store this exchanger issues challenges from
    #[must_use]
    pub fn store(&self) -> &PkceStore {
        &self.store
    }

    /// Create a PKCE challenge and the authorization URL that carries it.
    #[must_use]
    pub fn build_redirect(&self, scopes: &[String]) -> (PkceState, Url) {
        let state = self.store.create_challenge();

        let mut url = self.client.authorization_endpoint.clone();
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("client_id", &self.client.client_id);
            params.append_pair("response_type", "code");
            params.append_pair("redirect_uri", &self.client.redirect_uri);
            params.append_pair("scope", &scopes.join(" "));
            params.append_pair("state", &state.id);
            params.append_pair("response_mode", "query");
            params.append_pair("code_challenge", &state.code_challenge);
            params.append_pair("code_challenge_method", state.challenge_method());
        }

        debug!(state = %state.id, "Built authorization redirect");
        (state, url)
    }

    /// `true` if `query` is a well-formed authentication response.
    #[must_use]
    pub fn is_callback(query: Option<&str>) -> bool {
        query.and_then(AuthenticationResponse::parse).is_some()
    }

    /// Complete the exchange for a callback query string.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError`] if the state is unknown, the provider
    /// reported an error, the response carries tokens instead of a code, the
    /// code cannot be redeemed or the access token fails validation.
    pub async fn complete_exchange(&self, query: &str) -> Result<OidcIdentity, ExchangeError> {
        let response = AuthenticationResponse::parse(query).ok_or_else(|| {
            ExchangeError::InvalidResponse("not an authentication response".to_string())
        })?;

        let pkce = self
            .store
            .get_and_consume(&response.state)
            .ok_or(ExchangeError::InvalidState)?;

        if let Some(error) = response.error {
            let description = response.error_description.unwrap_or(error);
            warn!(description = %description, "Provider returned authentication error");
            return Err(ExchangeError::ProviderError(description));
        }

        if response.id_token.is_some() || response.access_token.is_some() {
            return Err(ExchangeError::UnexpectedArtifacts);
        }

        let code = response
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ExchangeError::InvalidResponse("missing code".to_string()))?;

        let tokens = self
            .token_endpoint
            .redeem_code(
                &code,
                &pkce.code_verifier,
                &self.client.redirect_uri,
                &self.client.scopes,
            )
            .await?;

        if tokens.access_token.is_empty() {
            return Err(ExchangeError::InvalidResponse(
                "token response has no access token".to_string(),
            ));
        }

        let identity = self.validator.validate(&tokens.access_token).await?;

        let id_claims = match tokens.id_token.as_deref() {
            Some(id_token) => unverified_claims(id_token).ok_or_else(|| {
                ExchangeError::InvalidResponse("malformed id_token".to_string())
            })?,
            None => identity.raw_claims.clone(),
        };

        let account = AccountRef {
            home_account_id: home_account_id(&id_claims, &identity),
            username: identity.preferred_username.clone(),
        };
        let display_name = claim_str(&id_claims, "name")
            .unwrap_or(&identity.preferred_username)
            .to_string();

        let cache = TokenCache::from_response(account.clone(), &tokens, &self.client.scopes);
        let blob = cache
            .to_blob()
            .map_err(|e| ExchangeError::InvalidResponse(format!("token cache: {e}")))?;

        info!(username = %identity.preferred_username, "OIDC login completed");

        Ok(OidcIdentity {
            session: OidcSession::new(account, display_name, self.client.scopes.clone(), blob),
            identity,
        })
    }
}

/// Decode a JWT payload without verifying it. Only used on an `id_token`
/// received directly from the token endpoint.
fn unverified_claims(token: &str) -> Option<Map<String, Value>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn claim_str<'a>(claims: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn home_account_id(claims: &Map<String, Value>, identity: &AuthenticatedIdentity) -> String {
    let object_id = claim_str(claims, "oid")
        .or(identity.object_id.as_deref())
        .unwrap_or(&identity.subject);
    match claim_str(claims, "tid") {
        Some(tenant) => format!("{object_id}.{tenant}"),
        None => object_id.to_string(),
    }
}
