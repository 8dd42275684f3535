//! Request dispatcher
//!
//! Routes an inbound request to one of three paths by its shape:
//!
//! | Request carries                | Path                       |
//! |--------------------------------|----------------------------|
//! | forwarded identity headers     | header-trust validation    |
//! | an authentication response     | `complete_exchange`        |
//! | neither                        | `build_redirect`           |
//!
//! Both identity paths end in [`TokenValidator::validate`] before a
//! [`Principal`] is returned.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName};
use tracing::{debug, info};
use url::Url;

use super::endpoint::{HttpTokenEndpoint, TokenEndpoint, http_client};
use super::exchange::{ClientRegistration, CodeExchanger, ExchangeError, OidcIdentity};
use super::keys::RemoteKeySet;
use super::metadata::ProviderEndpoints;
use super::pkce::PkceStore;
use super::refresh::SilentTokenRefresher;
use super::session::OidcSession;
use super::validator::{AuthenticatedIdentity, TokenValidator, ValidationError};
use crate::config::{Config, HeaderTrustConfig};
use crate::{Error, ErrorKind};

/// Header names an upstream proxy uses to forward identity.
#[derive(Debug, Clone)]
pub struct HeaderTrust {
    access_token_header: HeaderName,
    username_header: HeaderName,
}

impl HeaderTrust {
    /// Parse header names from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if either name is not a valid HTTP header name.
    pub fn from_config(config: &HeaderTrustConfig) -> crate::Result<Self> {
        let parse = |name: &str| {
            HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|e| Error::Config(format!("Invalid header name '{name}': {e}")))
        };
        Ok(Self {
            access_token_header: parse(&config.access_token_header)?,
            username_header: parse(&config.username_header)?,
        })
    }

    /// Both forwarded values, or `None` unless both headers are present and non-empty.
    fn extract(&self, headers: &HeaderMap) -> Option<(String, String)> {
        let token = header_value(headers, &self.access_token_header)?;
        let username = header_value(headers, &self.username_header)?;
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        Some((token.to_string(), username.to_string()))
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Identity asserted by an upstream proxy and confirmed by local validation.
#[derive(Debug, Clone)]
pub struct HeaderTrustIdentity {
    /// Validated forwarded token identity
    pub identity: AuthenticatedIdentity,
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub enum Principal {
    /// Established from forwarded proxy headers
    HeaderTrust(HeaderTrustIdentity),
    /// Established through the redirect flow
    Oidc(OidcIdentity),
}

impl Principal {
    /// The validated token identity
    #[must_use]
    pub fn identity(&self) -> &AuthenticatedIdentity {
        match self {
            Self::HeaderTrust(h) => &h.identity,
            Self::Oidc(o) => &o.identity,
        }
    }

    /// Lowercased preferred username
    #[must_use]
    pub fn username(&self) -> &str {
        &self.identity().preferred_username
    }

    /// Display name, falling back to the username on the header-trust path
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self {
            Self::HeaderTrust(h) => &h.identity.preferred_username,
            Self::Oidc(o) => &o.session.display_name,
        }
    }

    /// The OIDC session, if the redirect flow produced one
    #[must_use]
    pub fn session(&self) -> Option<&OidcSession> {
        match self {
            Self::HeaderTrust(_) => None,
            Self::Oidc(o) => Some(&o.session),
        }
    }

    /// Short label for logs and responses
    #[must_use]
    pub fn source(&self) -> &'static str {
        match self {
            Self::HeaderTrust(_) => "header_trust",
            Self::Oidc(_) => "oidc",
        }
    }
}

/// Result of dispatching one request.
#[derive(Debug)]
pub enum AuthOutcome {
    /// The caller is authenticated
    Authenticated(Box<Principal>),
    /// Send the caller to the provider
    Redirect(Url),
}

/// Authentication failures
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The forwarded username disagrees with the token's own
    #[error("Forwarded username does not match token")]
    ForwardedIdentityMismatch,

    /// No credentials and no redirect flow to obtain them
    #[error("No credentials presented")]
    MissingCredentials,

    /// Token validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Authorization code exchange failed
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl AuthError {
    /// Failure class of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ForwardedIdentityMismatch | Self::MissingCredentials => ErrorKind::Protocol,
            Self::Validation(e) => e.kind(),
            Self::Exchange(e) => e.kind(),
        }
    }
}

/// Top-level authenticator composing validation, exchange and refresh.
pub struct AuthenticationCoordinator {
    validator: Arc<TokenValidator>,
    header_trust: Option<HeaderTrust>,
    exchanger: Option<Arc<CodeExchanger>>,
    refresher: Option<SilentTokenRefresher>,
    scopes: Vec<String>,
}

impl AuthenticationCoordinator {
    /// Compose a coordinator. `None` disables the corresponding path.
    #[must_use]
    pub fn new(
        validator: Arc<TokenValidator>,
        header_trust: Option<HeaderTrust>,
        exchanger: Option<Arc<CodeExchanger>>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            validator,
            header_trust,
            exchanger,
            refresher: None,
            scopes,
        }
    }

    /// Attach a silent refresher for downstream token acquisition
    #[must_use]
    pub fn with_refresher(mut self, refresher: SilentTokenRefresher) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Build every component from configuration, discovering provider
    /// endpoints if they are not all configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid configuration, or a transport
    /// error if discovery fails.
    pub async fn from_config(config: &Config) -> crate::Result<Self> {
        config.validate()?;

        let provider = &config.provider;
        let http = http_client(provider.http_timeout, provider.allow_http)?;

        let redirect_enabled = config.redirect_flow.enabled;
        let endpoints = match (&provider.jwks_uri, redirect_enabled) {
            (Some(jwks_uri), false) => ProviderEndpoints {
                authorization_endpoint: String::new(),
                token_endpoint: String::new(),
                jwks_uri: jwks_uri.clone(),
            },
            _ => ProviderEndpoints::resolve(&http, provider).await?,
        };
        info!(jwks_uri = %endpoints.jwks_uri, "Provider endpoints resolved");

        let keys = Arc::new(
            RemoteKeySet::new(endpoints.jwks_uri.clone(), http.clone())
                .with_refetch_interval(provider.jwks_refetch_interval),
        );
        let validator = Arc::new(TokenValidator::new(
            Arc::new(config.validation_policy()),
            keys,
        ));

        let header_trust = if config.header_trust.enabled {
            Some(HeaderTrust::from_config(&config.header_trust)?)
        } else {
            None
        };

        let scopes = provider.scope_list();
        let mut coordinator = Self::new(Arc::clone(&validator), header_trust, None, scopes.clone());

        if redirect_enabled {
            let authorization_endpoint =
                Url::parse(&endpoints.authorization_endpoint).map_err(|e| {
                    Error::Config(format!("Invalid authorization endpoint: {e}"))
                })?;
            let token_endpoint: Arc<dyn TokenEndpoint> = Arc::new(HttpTokenEndpoint::new(
                http,
                endpoints.token_endpoint,
                provider.client_id.clone(),
                provider.client_secret.clone(),
            ));
            let store = Arc::new(
                PkceStore::with_settings(config.pkce.state_ttl, config.pkce.sweep_interval)
                    .with_max_pending(config.pkce.max_pending),
            );

            coordinator.exchanger = Some(Arc::new(CodeExchanger::new(
                store,
                validator,
                Arc::clone(&token_endpoint),
                ClientRegistration {
                    authorization_endpoint,
                    client_id: provider.client_id.clone(),
                    redirect_uri: provider.redirect_uri.clone(),
                    scopes,
                },
            )));
            coordinator.refresher = Some(SilentTokenRefresher::new(
                token_endpoint,
                provider.http_timeout,
            ));
        }

        Ok(coordinator)
    }

    /// The validator every path ends in
    #[must_use]
    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// The silent refresher, when the redirect flow is enabled
    #[must_use]
    pub fn refresher(&self) -> Option<&SilentTokenRefresher> {
        self.refresher.as_ref()
    }

    /// `true` if unauthenticated callers can be sent to the provider
    #[must_use]
    pub fn redirect_enabled(&self) -> bool {
        self.exchanger.is_some()
    }

    /// Authenticate one request.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if the request carries credentials that fail,
    /// or carries none and the redirect flow is disabled.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<AuthOutcome, AuthError> {
        if let Some((token, username)) = self
            .header_trust
            .as_ref()
            .and_then(|ht| ht.extract(headers))
        {
            debug!("Dispatching to header-trust path");
            let identity = self.validator.validate(&token).await?;
            if identity.preferred_username != username.to_lowercase() {
                return Err(AuthError::ForwardedIdentityMismatch);
            }
            info!(username = %identity.preferred_username, "Authenticated via forwarded identity");
            return Ok(AuthOutcome::Authenticated(Box::new(Principal::HeaderTrust(
                HeaderTrustIdentity { identity },
            ))));
        }

        let Some(exchanger) = &self.exchanger else {
            return Err(AuthError::MissingCredentials);
        };

        if let Some(query) = query.filter(|q| CodeExchanger::is_callback(Some(*q))) {
            debug!("Dispatching to authorization code exchange");
            let oidc = exchanger.complete_exchange(query).await?;
            return Ok(AuthOutcome::Authenticated(Box::new(Principal::Oidc(oidc))));
        }

        debug!("Dispatching to authorization redirect");
        let (_, url) = exchanger.build_redirect(&self.scopes);
        Ok(AuthOutcome::Redirect(url))
    }

    /// A fresh authorization redirect, if the redirect flow is enabled.
    #[must_use]
    pub fn reauthenticate(&self) -> Option<Url> {
        self.exchanger
            .as_ref()
            .map(|exchanger| exchanger.build_redirect(&self.scopes).1)
    }
}
