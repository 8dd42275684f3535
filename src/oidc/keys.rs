//! Provider key-set access: JWKS fetching and caching.
//!
//! # Lookup flow
//!
//! 1. Return the cached JWKS if it is younger than the TTL (default 1 hour).
//! 2. Otherwise fetch it from the provider's `jwks_uri`.
//! 3. If the requested `kid` is not in the set, force one refresh and look
//!    again; a key that is still missing is reported as unknown.
//!
//! Forced refreshes are rate limited: within the refetch interval of the
//! last one, an unknown `kid` is rejected from the cache alone.
//!
//! Every fetch goes through a `reqwest` client with a bounded timeout, so an
//! unreachable provider fails the current validation only.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, JwkSet},
};
use tracing::debug;

use super::validator::ValidationError;

/// Source of signature verification keys, indexed by key id.
#[async_trait]
pub trait KeySource: Send + Sync + 'static {
    /// Resolve the public key for `kid`.
    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, ValidationError>;
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Remote JWKS endpoint with a TTL cache.
pub struct RemoteKeySet {
    jwks_uri: String,
    http: reqwest::Client,
    cache: DashMap<String, CachedJwks>,
    ttl: Duration,
    refetch_interval: Duration,
    last_forced: Mutex<Option<Instant>>,
}

impl RemoteKeySet {
    /// Create with the default 1-hour TTL.
    #[must_use]
    pub fn new(jwks_uri: impl Into<String>, http: reqwest::Client) -> Self {
        Self::with_ttl(jwks_uri, http, Duration::from_secs(3600))
    }

    /// Create with an explicit cache TTL.
    #[must_use]
    pub fn with_ttl(jwks_uri: impl Into<String>, http: reqwest::Client, ttl: Duration) -> Self {
        Self {
            jwks_uri: jwks_uri.into(),
            http,
            cache: DashMap::new(),
            ttl,
            refetch_interval: Duration::from_secs(5 * 60),
            last_forced: Mutex::new(None),
        }
    }

    /// Minimum gap between refetches forced by an unknown `kid`.
    #[must_use]
    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = interval;
        self
    }

    /// The endpoint keys are fetched from
    #[must_use]
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Return the cached JWKS, or fetch it if stale.
    ///
    /// If `force_refresh` is `true`, the cache is bypassed regardless of TTL.
    async fn get_or_fetch(&self, force_refresh: bool) -> Result<JwkSet, ValidationError> {
        if !force_refresh {
            if let Some(cached) = self.cache.get(&self.jwks_uri) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(jwks_uri = %self.jwks_uri, "Fetching JWKS");
        let response = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| ValidationError::KeySetUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ValidationError::KeySetUnavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| ValidationError::KeySetUnavailable(format!("invalid JWKS: {e}")))?;

        self.cache.insert(
            self.jwks_uri.clone(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(jwks)
    }

    /// Claim the forced-refresh slot. Returns `false` inside the interval.
    fn try_claim_forced_refresh(&self, now: Instant) -> bool {
        let mut last = self.last_forced.lock();
        if let Some(at) = *last {
            if now.saturating_duration_since(at) < self.refetch_interval {
                return false;
            }
        }
        *last = Some(now);
        true
    }
}

#[async_trait]
impl KeySource for RemoteKeySet {
    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, ValidationError> {
        let jwks = self.get_or_fetch(false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        // Unknown kid: the provider may have rotated keys, refresh once
        if !self.try_claim_forced_refresh(Instant::now()) {
            debug!(kid = %kid, "Key not found, forced JWKS refresh on cooldown");
            return Err(ValidationError::UnknownKeyId(kid.to_string()));
        }
        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.get_or_fetch(true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| ValidationError::UnknownKeyId(kid.to_string()))
    }
}

/// Fixed key set, for providers whose keys are pinned in configuration.
pub struct StaticKeySet {
    keys: JwkSet,
}

impl StaticKeySet {
    /// Wrap an already-parsed key set
    #[must_use]
    pub fn new(keys: JwkSet) -> Self {
        Self { keys }
    }

    /// Parse a JWKS JSON document
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid JWKS.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }
}

#[async_trait]
impl KeySource for StaticKeySet {
    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, ValidationError> {
        find_key_in_jwks(&self.keys, kid).ok_or_else(|| ValidationError::UnknownKeyId(kid.to_string()))
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
///
/// Only asymmetric keys are returned; symmetric (`oct`) entries never verify
/// provider tokens.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks
        .keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))?;

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        _ => None,
    }
}
