//! Authenticated session and its token cache
//!
//! The token cache is an opaque serialized blob owned by one [`OidcSession`].
//! It lives only as long as the session, is rewritten on every successful
//! silent refresh and is never shared between sessions.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::endpoint::TokenResponse;

/// Seconds before expiry at which a cached access token is no longer handed out.
pub(crate) const EXPIRY_BUFFER_SECS: u64 = 60;

/// Scopes the provider always grants and never reflects in `scope`.
const RESERVED_SCOPES: [&str; 4] = ["openid", "profile", "offline_access", "email"];

/// The provider account a token cache belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRef {
    /// Provider-stable account key (`oid` or `sub`, with `tid` when present)
    pub home_account_id: String,
    /// Lowercased preferred username
    pub username: String,
}

/// A user's OIDC session.
#[derive(Debug, Clone)]
pub struct OidcSession {
    /// Account the session was established for
    pub account: AccountRef,
    /// Display name from the identity assertion
    pub display_name: String,
    /// Scopes requested at login
    pub scopes: Vec<String>,
    token_cache: String,
}

impl OidcSession {
    /// Wrap an account and a serialized token cache
    #[must_use]
    pub fn new(
        account: AccountRef,
        display_name: impl Into<String>,
        scopes: Vec<String>,
        token_cache: String,
    ) -> Self {
        Self {
            account,
            display_name: display_name.into(),
            scopes,
            token_cache,
        }
    }

    /// The serialized token cache
    #[must_use]
    pub fn token_cache(&self) -> &str {
        &self.token_cache
    }

    pub(crate) fn replace_token_cache(&mut self, token_cache: String) {
        self.token_cache = token_cache;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedAccessToken {
    secret: String,
    /// Unix seconds, absent when the provider gave no lifetime
    expires_at: Option<u64>,
    scopes: BTreeSet<String>,
}

/// Deserialized form of the token cache blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TokenCache {
    pub(crate) account: AccountRef,
    refresh_token: Option<String>,
    access_token: Option<CachedAccessToken>,
}

impl TokenCache {
    /// Build a cache from a token endpoint response.
    pub(crate) fn from_response(
        account: AccountRef,
        response: &TokenResponse,
        requested: &[String],
    ) -> Self {
        let mut cache = Self {
            account,
            refresh_token: None,
            access_token: None,
        };
        cache.absorb(response, requested, unix_now());
        cache
    }

    pub(crate) fn from_blob(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }

    pub(crate) fn to_blob(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub(crate) fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// The cached access token, if it covers `scopes` and is not about to expire.
    pub(crate) fn usable_access_token(&self, scopes: &[String], now: u64) -> Option<&str> {
        let token = self.access_token.as_ref()?;
        if token
            .expires_at
            .is_some_and(|exp| now.saturating_add(EXPIRY_BUFFER_SECS) >= exp)
        {
            return None;
        }
        let covered = scopes
            .iter()
            .filter(|s| !is_reserved(s))
            .all(|s| token.scopes.contains(&s.to_lowercase()));
        covered.then_some(token.secret.as_str())
    }

    /// Fold a token response into the cache. A response without a refresh
    /// token keeps the previous one.
    pub(crate) fn absorb(&mut self, response: &TokenResponse, requested: &[String], now: u64) {
        let granted: BTreeSet<String> = match response.scope.as_deref() {
            Some(scope) if !scope.trim().is_empty() => {
                scope.split_whitespace().map(str::to_lowercase).collect()
            }
            _ => requested.iter().map(|s| s.to_lowercase()).collect(),
        };

        self.access_token = Some(CachedAccessToken {
            secret: response.access_token.clone(),
            expires_at: response.expires_in.map(|secs| now.saturating_add(secs)),
            scopes: granted,
        });
        if let Some(rotated) = &response.refresh_token {
            self.refresh_token = Some(rotated.clone());
        }
    }
}

fn is_reserved(scope: &str) -> bool {
    RESERVED_SCOPES.iter().any(|r| r.eq_ignore_ascii_case(scope))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
