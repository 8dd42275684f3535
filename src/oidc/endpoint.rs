//! Provider token endpoint client
//!
//! Form-encoded POSTs for the `authorization_code` and `refresh_token`
//! grants. The [`TokenEndpoint`] trait is the seam the exchanger and the
//! silent refresher talk through, so both can run against a fake provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::ErrorKind;

/// Token endpoint response (RFC 6749 §5.1 plus the OIDC `id_token`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Token type (usually "Bearer")
    #[serde(default)]
    pub token_type: Option<String>,
    /// OIDC identity assertion
    #[serde(default)]
    pub id_token: Option<String>,
    /// Refresh credential, possibly rotated
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Granted scopes, space-separated
    #[serde(default)]
    pub scope: Option<String>,
}

/// OAuth error body (RFC 6749 §5.2)
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Token endpoint failures
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// Network failure or timeout
    #[error("Token endpoint unreachable: {0}")]
    Transport(String),

    /// The provider answered with an OAuth error
    #[error("Token request rejected: {error}")]
    Rejected {
        /// OAuth error code (e.g. `invalid_grant`)
        error: String,
        /// Provider's human-readable description
        description: Option<String>,
    },

    /// The response body could not be decoded
    #[error("Invalid token response: {0}")]
    Decode(String),
}

impl EndpointError {
    /// Failure class of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            // The provider refuses this client's registration, not the user
            Self::Rejected { error, .. }
                if matches!(
                    error.as_str(),
                    "invalid_client" | "unauthorized_client" | "unsupported_grant_type"
                ) =>
            {
                ErrorKind::Configuration
            }
            Self::Rejected { .. } => ErrorKind::Authorization,
            Self::Decode(_) => ErrorKind::Protocol,
        }
    }
}

/// A provider token endpoint.
#[async_trait]
pub trait TokenEndpoint: Send + Sync + 'static {
    /// Redeem an authorization code together with its PKCE verifier.
    async fn redeem_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, EndpointError>;

    /// Mint a new access token from a refresh credential.
    async fn refresh(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, EndpointError>;
}

/// Build the outbound HTTP client used for every provider call.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn http_client(timeout: Duration, allow_http: bool) -> crate::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .https_only(!allow_http)
        .user_agent(concat!("gateway-oidc-auth/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| crate::Error::Config(format!("Failed to build HTTP client: {e}")))
}

/// Confidential-client token endpoint over HTTP.
pub struct HttpTokenEndpoint {
    http: Client,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenEndpoint {
    /// Create a client for `token_endpoint`
    #[must_use]
    pub fn new(
        http: Client,
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    async fn post<'a>(
        &'a self,
        mut params: Vec<(&'a str, &'a str)>,
    ) -> Result<TokenResponse, EndpointError> {
        params.push(("client_id", self.client_id.as_str()));
        if !self.client_secret.is_empty() {
            params.push(("client_secret", self.client_secret.as_str()));
        }

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| EndpointError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| EndpointError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(match serde_json::from_slice::<ErrorResponse>(&body) {
                Ok(err) => EndpointError::Rejected {
                    error: err.error,
                    description: err.error_description,
                },
                Err(_) => EndpointError::Rejected {
                    error: format!("HTTP {status}"),
                    description: None,
                },
            });
        }

        serde_json::from_slice(&body).map_err(|e| EndpointError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn redeem_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, EndpointError> {
        debug!(endpoint = %self.token_endpoint, "Redeeming authorization code");
        let scope = scopes.join(" ");
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }
        self.post(params).await
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, EndpointError> {
        debug!(endpoint = %self.token_endpoint, "Refreshing access token");
        let scope = scopes.join(" ");
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }
        self.post(params).await
    }
}
