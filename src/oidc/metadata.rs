//! OpenID Provider metadata discovery
//!
//! Fetches `/.well-known/openid-configuration` once at startup and fills in
//! whichever provider endpoints the configuration left unset.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::{Error, Result};

/// OpenID Provider Metadata (OpenID Connect Discovery 1.0 §3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Key set URL
    pub jwks_uri: String,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,

    /// Supported response modes
    #[serde(default)]
    pub response_modes_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Fetch the discovery document at `url`
    ///
    /// # Errors
    ///
    /// Returns an error if the document is unreachable or malformed.
    pub async fn discover(client: &Client, url: &str) -> Result<Self> {
        debug!(url = %url, "Discovering OpenID provider metadata");

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to fetch provider metadata: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "Provider metadata discovery failed: HTTP {}",
                response.status()
            )));
        }

        let metadata: Self = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Failed to parse provider metadata: {e}")))?;

        debug!(issuer = %metadata.issuer, "Discovered OpenID provider");
        Ok(metadata)
    }

    /// Check if PKCE is supported (S256 method). An empty list means the
    /// provider did not advertise support either way.
    #[must_use]
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported.is_empty()
            || self
                .code_challenge_methods_supported
                .iter()
                .any(|m| m == super::pkce::CHALLENGE_METHOD)
    }
}

/// The three provider endpoints the authenticator calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderEndpoints {
    /// Where users are redirected to log in
    pub authorization_endpoint: String,
    /// Where codes and refresh credentials are redeemed
    pub token_endpoint: String,
    /// Where signing keys are published
    pub jwks_uri: String,
}

impl ProviderEndpoints {
    /// Endpoints from configuration alone, if all three are set.
    #[must_use]
    pub fn from_config(provider: &ProviderConfig) -> Option<Self> {
        Some(Self {
            authorization_endpoint: provider.authorization_endpoint.clone()?,
            token_endpoint: provider.token_endpoint.clone()?,
            jwks_uri: provider.jwks_uri.clone()?,
        })
    }

    /// Resolve endpoints, running discovery only if configuration leaves a gap.
    /// Explicitly configured endpoints always win over discovered ones.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery is needed and fails.
    pub async fn resolve(client: &Client, provider: &ProviderConfig) -> Result<Self> {
        if let Some(endpoints) = Self::from_config(provider) {
            debug!("All provider endpoints configured, skipping discovery");
            return Ok(endpoints);
        }

        let metadata =
            ProviderMetadata::discover(client, &provider.discovery_document_url()).await?;
        if !metadata.supports_pkce() {
            warn!(
                issuer = %metadata.issuer,
                "Provider does not advertise S256 PKCE support"
            );
        }

        Ok(Self::merge(provider, metadata))
    }

    fn merge(provider: &ProviderConfig, metadata: ProviderMetadata) -> Self {
        Self {
            authorization_endpoint: provider
                .authorization_endpoint
                .clone()
                .unwrap_or(metadata.authorization_endpoint),
            token_endpoint: provider
                .token_endpoint
                .clone()
                .unwrap_or(metadata.token_endpoint),
            jwks_uri: provider.jwks_uri.clone().unwrap_or(metadata.jwks_uri),
        }
    }
}
