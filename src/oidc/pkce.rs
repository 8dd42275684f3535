//! PKCE challenge store
//!
//! Holds the server side of RFC 7636 Proof Key for Code Exchange: each login
//! redirect gets a fresh verifier whose S256 challenge is sent to the
//! provider, and the verifier is redeemed exactly once when the provider
//! calls back with the matching `state`.
//!
//! The store is an explicitly owned object shared by `Arc`. A single mutex
//! guards both the map and the sweep timestamp, so insert, get-and-remove and
//! sweep are mutually exclusive. Expired entries are evicted lazily: the
//! sweep piggybacks on [`PkceStore::create_challenge`] and
//! [`PkceStore::get_and_consume`] and never runs more than once per sweep
//! interval. There is no background task.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::Mutex;
use rand::RngExt;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// The only challenge method this crate emits.
pub const CHALLENGE_METHOD: &str = "S256";

/// Default lifetime of a challenge (10 minutes).
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Default minimum time between sweeps (60 seconds).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on pending challenges.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Server-held PKCE state for one pending login.
#[derive(Debug, Clone)]
pub struct PkceState {
    /// Opaque URL-safe id, sent to the provider as `state`
    pub id: String,
    /// Secret verifier, 32 random bytes base64url-encoded
    pub code_verifier: String,
    /// `base64url_nopad(sha256(code_verifier))`
    pub code_challenge: String,
    /// When the challenge was issued
    pub created_at: Instant,
    /// When the challenge stops being redeemable
    pub expires_at: Instant,
}

impl PkceState {
    fn generate(now: Instant, ttl: Duration) -> Self {
        let id_bytes: [u8; 24] = rand::rng().random();
        let verifier_bytes: [u8; 32] = rand::rng().random();

        let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        let code_challenge = challenge_for(&code_verifier);

        Self {
            id: URL_SAFE_NO_PAD.encode(id_bytes),
            code_verifier,
            code_challenge,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Always `"S256"`
    #[must_use]
    pub fn challenge_method(&self) -> &'static str {
        CHALLENGE_METHOD
    }

    /// `true` once `expires_at` has been reached
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Derive the S256 code challenge for a verifier.
#[must_use]
pub fn challenge_for(code_verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

struct Inner {
    challenges: HashMap<String, PkceState>,
    last_sweep: Instant,
}

/// In-memory PKCE challenge store.
pub struct PkceStore {
    inner: Mutex<Inner>,
    ttl: Duration,
    sweep_interval: Duration,
    max_pending: usize,
}

impl PkceStore {
    /// Store with the default 10 minute lifetime and 60 second sweep interval.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_STATE_TTL, DEFAULT_SWEEP_INTERVAL)
    }

    /// Store with explicit lifetime and sweep interval.
    #[must_use]
    pub fn with_settings(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                challenges: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            ttl,
            sweep_interval,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    /// Bound the number of pending challenges. Once full, expired entries are
    /// dropped and then the oldest pending login is evicted.
    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    /// Generate, store and return a new challenge.
    pub fn create_challenge(&self) -> PkceState {
        self.create_challenge_at(Instant::now())
    }

    /// Remove the challenge stored under `id` and return it if still valid.
    ///
    /// The entry is removed whether or not it has expired, so a given id can
    /// be redeemed at most once.
    pub fn get_and_consume(&self, id: &str) -> Option<PkceState> {
        self.get_and_consume_at(id, Instant::now())
    }

    /// Number of entries currently held, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().challenges.len()
    }

    /// `true` when no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn create_challenge_at(&self, now: Instant) -> PkceState {
        let state = PkceState::generate(now, self.ttl);

        let mut inner = self.inner.lock();
        self.sweep_locked(&mut inner, now);
        if inner.challenges.len() >= self.max_pending {
            self.make_room_locked(&mut inner, now);
        }
        inner.challenges.insert(state.id.clone(), state.clone());
        debug!(pending = inner.challenges.len(), "Created PKCE challenge");

        state
    }

    pub(crate) fn get_and_consume_at(&self, id: &str, now: Instant) -> Option<PkceState> {
        let mut inner = self.inner.lock();
        self.sweep_locked(&mut inner, now);

        let state = inner.challenges.remove(id)?;
        if state.is_expired_at(now) {
            debug!("PKCE challenge expired before redemption");
            return None;
        }
        Some(state)
    }

    /// Sweep if the interval has elapsed. Returns the number of entries removed,
    /// or `None` if the sweep was skipped.
    #[cfg(test)]
    pub(crate) fn sweep_at(&self, now: Instant) -> Option<usize> {
        let mut inner = self.inner.lock();
        self.sweep_locked(&mut inner, now)
    }

    fn make_room_locked(&self, inner: &mut Inner, now: Instant) {
        inner.challenges.retain(|_, state| !state.is_expired_at(now));
        inner.last_sweep = now;

        let mut evicted = 0usize;
        while inner.challenges.len() >= self.max_pending {
            let oldest = inner
                .challenges
                .values()
                .min_by_key(|state| state.created_at)
                .map(|state| state.id.clone());
            let Some(oldest) = oldest else { break };
            inner.challenges.remove(&oldest);
            evicted += 1;
        }
        if evicted > 0 {
            warn!(
                max_pending = self.max_pending,
                evicted, "PKCE store full, evicted oldest pending logins"
            );
        }
    }

    fn sweep_locked(&self, inner: &mut Inner, now: Instant) -> Option<usize> {
        if now.saturating_duration_since(inner.last_sweep) < self.sweep_interval {
            return None;
        }
        inner.last_sweep = now;

        let before = inner.challenges.len();
        inner.challenges.retain(|_, state| !state.is_expired_at(now));
        let removed = before - inner.challenges.len();
        if removed > 0 {
            debug!(removed, "Swept expired PKCE challenges");
        }
        Some(removed)
    }
}

impl Default for PkceStore {
    fn default() -> Self {
        Self::new()
    }
}
