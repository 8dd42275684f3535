//! Gateway OIDC authenticator
//!
//! Lets a remote-access gateway trust identities asserted by an OpenID
//! Connect provider instead of managing passwords itself.
//!
//! # Features
//!
//! - **Header trust**: validates a bearer token forwarded by an upstream proxy
//! - **Authorization Code + PKCE**: runs the redirect flow when no proxy has
//! - **Role admission**: a signed token is not enough, one allowed role is required
//! - **Silent refresh**: renews access tokens from the session's token cache

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod oidc;
pub mod server;

pub use error::{Error, ErrorKind, Result, UserAction};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
