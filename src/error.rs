//! Error types for the OIDC gateway authenticator
//!
//! Each component has its own error enum (see [`crate::oidc`]); all of them
//! classify into one [`ErrorKind`] so callers can branch on the failure class
//! without matching concrete variants.

use std::io;

use thiserror::Error;

/// Result type alias for crate-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level errors (startup, configuration, IO)
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport error while talking to the identity provider
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error (malformed provider document or response)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Failure class of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Protocol(_) | Self::Json(_) => ErrorKind::Protocol,
            Self::Transport(_) | Self::Io(_) | Self::Internal(_) => ErrorKind::Transport,
        }
    }
}

/// Failure classes shared by every authentication component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or malformed policy/provider configuration
    Configuration,
    /// Malformed OIDC response or unexpected artifact combination
    Protocol,
    /// Missing, expired or already-consumed PKCE state
    State,
    /// Signature, issuer, audience or expiry failure
    CryptoValidation,
    /// Cryptographically valid token without an allowed role
    Authorization,
    /// Network failure or timeout reaching the provider
    Transport,
}

impl ErrorKind {
    /// What the end user should be offered for a failure of this class.
    #[must_use]
    pub fn user_action(self) -> UserAction {
        match self {
            Self::Configuration => UserAction::OperatorMisconfiguration,
            _ => UserAction::Reauthenticate,
        }
    }

    /// Stable lowercase label, used as a structured log field
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Protocol => "protocol",
            Self::State => "state",
            Self::CryptoValidation => "crypto_validation",
            Self::Authorization => "authorization",
            Self::Transport => "transport",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-visible reaction to an authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Send the user through login again
    Reauthenticate,
    /// Show an operator-facing misconfiguration error
    OperatorMisconfiguration,
}
