//! Silent access-token renewal from a session's token cache.
//!
//! Every failure (unreadable cache, account mismatch, provider rejection,
//! network error, timeout) collapses to `None`. The only useful reaction to
//! any of them is a fresh interactive login, so callers are not given a
//! reason. The reason is logged.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::endpoint::{EndpointError, TokenEndpoint};
use super::session::{OidcSession, TokenCache, unix_now};
use crate::ErrorKind;

#[derive(Debug, thiserror::Error)]
enum RefreshError {
    #[error("token cache unreadable: {0}")]
    Cache(#[from] serde_json::Error),

    #[error("token cache belongs to a different account")]
    AccountMismatch,

    #[error("no refresh token cached")]
    NoRefreshToken,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),
}

impl RefreshError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Cache(_) | Self::AccountMismatch | Self::NoRefreshToken => ErrorKind::State,
            Self::Endpoint(e) => e.kind(),
            Self::TimedOut(_) => ErrorKind::Transport,
        }
    }
}

/// Mints access tokens for downstream calls without user interaction.
pub struct SilentTokenRefresher {
    token_endpoint: Arc<dyn TokenEndpoint>,
    timeout: Duration,
}

impl SilentTokenRefresher {
    /// Create a refresher bounded by `timeout` per provider call
    #[must_use]
    pub fn new(token_endpoint: Arc<dyn TokenEndpoint>, timeout: Duration) -> Self {
        Self {
            token_endpoint,
            timeout,
        }
    }

    /// Return a usable access token for `scopes`, refreshing if needed.
    ///
    /// An empty `scopes` means the scopes the session logged in with. On a
    /// successful refresh the session's token cache is replaced with the
    /// rotated one. Returns `None` on any failure.
    pub async fn get_access_token(
        &self,
        session: &mut OidcSession,
        scopes: &[String],
    ) -> Option<String> {
        let scopes = if scopes.is_empty() {
            session.scopes.clone()
        } else {
            scopes.to_vec()
        };

        match self.acquire(session, &scopes).await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(
                    username = %session.account.username,
                    kind = %e.kind(),
                    error = %e,
                    "Silent token acquisition failed"
                );
                None
            }
        }
    }

    async fn acquire(
        &self,
        session: &mut OidcSession,
        scopes: &[String],
    ) -> Result<String, RefreshError> {
        let mut cache = TokenCache::from_blob(session.token_cache())?;
        if cache.account != session.account {
            return Err(RefreshError::AccountMismatch);
        }

        if let Some(token) = cache.usable_access_token(scopes, unix_now()) {
            debug!(username = %session.account.username, "Using cached access token");
            return Ok(token.to_string());
        }

        let refresh_token = cache
            .refresh_token()
            .ok_or(RefreshError::NoRefreshToken)?
            .to_string();

        let response = tokio::time::timeout(
            self.timeout,
            self.token_endpoint.refresh(&refresh_token, scopes),
        )
        .await
        .map_err(|_| RefreshError::TimedOut(self.timeout))??;

        cache.absorb(&response, scopes, unix_now());
        session.replace_token_cache(cache.to_blob()?);

        debug!(username = %session.account.username, "Access token refreshed");
        Ok(response.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::endpoint::TokenResponse;
    use crate::oidc::session::AccountRef;
    use crate::oidc::test_support::FakeTokenEndpoint;

    fn account() -> AccountRef {
        AccountRef {
            home_account_id: "oid-alice.tenant-1".to_string(),
            username: "alice.smith@example.com".to_string(),
        }
    }

    fn scopes() -> Vec<String> {
        vec!["openid".to_string(), "api://gateway/user_impersonation".to_string()]
    }

    /// Session whose cached access token is already past its expiry buffer.
    fn session_needing_refresh() -> OidcSession {
        let login = TokenResponse {
            access_token: "at-login".to_string(),
            refresh_token: Some("rt-1".to_string()),
            expires_in: Some(30),
            ..TokenResponse::default()
        };
        let cache = TokenCache::from_response(account(), &login, &scopes());
        OidcSession::new(account(), "Alice", scopes(), cache.to_blob().unwrap())
    }

    fn refresher(endpoint: FakeTokenEndpoint) -> (SilentTokenRefresher, Arc<FakeTokenEndpoint>) {
        let fake = Arc::new(endpoint);
        let refresher = SilentTokenRefresher::new(
            Arc::clone(&fake) as Arc<dyn TokenEndpoint>,
            Duration::from_secs(2),
        );
        (refresher, fake)
    }

    #[tokio::test]
    async fn refreshes_and_rotates_cache() {
        // GIVEN: a session whose access token is about to expire
        let (refresher, fake) = refresher(FakeTokenEndpoint::issuing("at-2", None, Some("rt-2")));
        let mut session = session_needing_refresh();
        let before = session.token_cache().to_string();

        // WHEN: a downstream call asks for a token
        let token = refresher.get_access_token(&mut session, &[]).await;

        // THEN: a new token is minted from the cached refresh credential
        assert_eq!(token.as_deref(), Some("at-2"));
        assert_eq!(fake.refreshed.lock().clone(), vec!["rt-1".to_string()]);
        assert_ne!(session.token_cache(), before);
        assert!(session.token_cache().contains("rt-2"));
    }

    #[tokio::test]
    async fn fresh_cached_token_is_reused_without_provider_call() {
        let (refresher, fake) = refresher(FakeTokenEndpoint::issuing("unused", None, None));
        let login = TokenResponse {
            access_token: "at-login".to_string(),
            refresh_token: Some("rt-1".to_string()),
            expires_in: Some(3600),
            ..TokenResponse::default()
        };
        let cache = TokenCache::from_response(account(), &login, &scopes());
        let mut session = OidcSession::new(account(), "Alice", scopes(), cache.to_blob().unwrap());

        let token = refresher.get_access_token(&mut session, &scopes()).await;

        assert_eq!(token.as_deref(), Some("at-login"));
        assert!(fake.refreshed.lock().is_empty());
    }

    #[tokio::test]
    async fn second_refresh_uses_rotated_credential() {
        let (refresher, fake) = refresher(FakeTokenEndpoint::issuing("at-2", None, Some("rt-2")));
        let mut session = session_needing_refresh();

        assert!(refresher.get_access_token(&mut session, &[]).await.is_some());
        // A scope the cached token was not granted for forces another refresh
        let other = vec!["api://other/.default".to_string()];
        assert!(refresher.get_access_token(&mut session, &other).await.is_some());

        assert_eq!(
            fake.refreshed.lock().clone(),
            vec!["rt-1".to_string(), "rt-2".to_string()]
        );
    }

    #[tokio::test]
    async fn provider_rejection_collapses_to_none() {
        let (refresher, _) = refresher(FakeTokenEndpoint::rejecting("invalid_grant"));
        let mut session = session_needing_refresh();
        let before = session.token_cache().to_string();

        assert!(refresher.get_access_token(&mut session, &[]).await.is_none());
        // Cache untouched on failure
        assert_eq!(session.token_cache(), before);
    }

    #[tokio::test]
    async fn transport_failure_collapses_to_none() {
        let (refresher, _) = refresher(FakeTokenEndpoint::default());
        let mut session = session_needing_refresh();
        assert!(refresher.get_access_token(&mut session, &[]).await.is_none());
    }

    #[tokio::test]
    async fn slow_provider_times_out_to_none() {
        let slow = FakeTokenEndpoint::issuing("at-2", None, None).delayed(Duration::from_secs(30));
        let refresher = SilentTokenRefresher::new(Arc::new(slow), Duration::from_millis(50));
        let mut session = session_needing_refresh();
        assert!(refresher.get_access_token(&mut session, &[]).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_cache_collapses_to_none() {
        let (refresher, fake) = refresher(FakeTokenEndpoint::issuing("at-2", None, None));
        let mut session = OidcSession::new(account(), "Alice", scopes(), "{garbage".to_string());

        assert!(refresher.get_access_token(&mut session, &[]).await.is_none());
        assert!(fake.refreshed.lock().is_empty());
    }

    #[tokio::test]
    async fn cache_from_another_account_is_refused() {
        let (refresher, fake) = refresher(FakeTokenEndpoint::issuing("at-2", None, None));
        let mut session = session_needing_refresh();
        session.account.home_account_id = "oid-mallory.tenant-1".to_string();

        assert!(refresher.get_access_token(&mut session, &[]).await.is_none());
        assert!(fake.refreshed.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_refresh_token_collapses_to_none() {
        let (refresher, fake) = refresher(FakeTokenEndpoint::issuing("at-2", None, None));
        let login = TokenResponse {
            access_token: "at-login".to_string(),
            expires_in: Some(0),
            ..TokenResponse::default()
        };
        let cache = TokenCache::from_response(account(), &login, &scopes());
        let mut session = OidcSession::new(account(), "Alice", scopes(), cache.to_blob().unwrap());

        assert!(refresher.get_access_token(&mut session, &[]).await.is_none());
        assert!(fake.refreshed.lock().is_empty());
    }
}
