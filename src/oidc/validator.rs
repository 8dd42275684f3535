//! Bearer token validation: signature, issuer, audience and role admission.
//!
//! # Validation flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Reject anything but an asymmetric signing algorithm.
//! 3. Resolve the provider's public key for `kid` through the [`KeySource`].
//! 4. Verify the signature together with `exp`/`nbf`, `iss` and `aud`.
//!    Expiry is reported as [`ValidationError::Expired`], never as a
//!    signature failure.
//! 5. Require the roles claim to be present, non-null and non-empty.
//! 6. Intersect the roles (case-insensitively) with the policy allow-list.
//!
//! Step 6 runs after, and independently of, the cryptographic checks: a
//! correctly signed token for a real user who lacks an allowed role is still
//! rejected here.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, Validation, errors::ErrorKind as JwtErrorKind};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::keys::KeySource;
use crate::ErrorKind;

/// Process-wide validation policy, built once at startup.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    /// Required `iss`
    pub issuer: String,
    /// Required `aud`
    pub audience: String,
    /// Name of the claim carrying roles (normally `"roles"`)
    pub roles_claim: String,
    /// Roles that grant access
    pub allowed_roles: Vec<String>,
    /// Clock skew tolerance for time-bound claims
    pub leeway: Duration,
}

impl ValidationPolicy {
    /// Roles from `roles` that appear in the allow-list, compared case-insensitively.
    #[must_use]
    pub fn permitted_roles<'a>(&self, roles: &'a BTreeSet<String>) -> Vec<&'a str> {
        roles
            .iter()
            .filter(|role| {
                self.allowed_roles
                    .iter()
                    .any(|allowed| allowed.to_lowercase() == role.to_lowercase())
            })
            .map(String::as_str)
            .collect()
    }
}

/// Error variants for token validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The token is not a structurally valid JWT.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// The JWT header carries a symmetric or unknown algorithm.
    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The JWT header contains no `kid` field.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the provider's key set.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The key set could not be fetched.
    #[error("Key set unavailable: {0}")]
    KeySetUnavailable(String),

    /// Signature verification failed.
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// `iss` does not match the policy.
    #[error("Issuer mismatch")]
    IssuerMismatch,

    /// `aud` does not match the policy.
    #[error("Audience mismatch")]
    AudienceMismatch,

    /// `exp` has passed.
    #[error("Token expired")]
    Expired,

    /// `nbf` is in the future.
    #[error("Token not yet valid")]
    NotYetValid,

    /// A claim needed to build the identity is absent.
    #[error("Required claim missing: {0}")]
    MissingClaim(String),

    /// The roles claim is absent, null or not a list.
    #[error("Token must contain a roles claim")]
    RoleClaimMissing,

    /// The roles claim is an empty list.
    #[error("Token roles claim is empty")]
    RoleClaimEmpty,

    /// None of the token's roles is in the allow-list.
    #[error("No allowed role present")]
    Unauthorized,
}

impl ValidationError {
    /// Failure class of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::KeySetUnavailable(_) => ErrorKind::Transport,
            Self::RoleClaimMissing | Self::RoleClaimEmpty | Self::Unauthorized => {
                ErrorKind::Authorization
            }
            _ => ErrorKind::CryptoValidation,
        }
    }

    /// `true` for time-bound rejections, which a fresh token would fix.
    #[must_use]
    pub fn is_expiry(&self) -> bool {
        matches!(self, Self::Expired | Self::NotYetValid)
    }

    fn from_jwt(err: &jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            JwtErrorKind::ExpiredSignature => Self::Expired,
            JwtErrorKind::ImmatureSignature => Self::NotYetValid,
            JwtErrorKind::InvalidIssuer => Self::IssuerMismatch,
            JwtErrorKind::InvalidAudience => Self::AudienceMismatch,
            JwtErrorKind::MissingRequiredClaim(claim) => match claim.as_str() {
                "iss" => Self::IssuerMismatch,
                "aud" => Self::AudienceMismatch,
                other => Self::MissingClaim(other.to_string()),
            },
            JwtErrorKind::InvalidToken | JwtErrorKind::Base64(_) | JwtErrorKind::Json(_) => {
                Self::Malformed(err.to_string())
            }
            _ => Self::SignatureInvalid(err.to_string()),
        }
    }
}

/// Identity established by a successfully validated bearer token.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedIdentity {
    /// `sub` claim
    pub subject: String,
    /// `oid` claim, when the provider sets one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// Lowercased preferred username, the stable downstream identifier
    pub preferred_username: String,
    /// Roles carried by the token
    pub roles: BTreeSet<String>,
    /// The validated bearer token
    #[serde(skip)]
    pub access_token: String,
    /// Every claim in the token payload
    #[serde(skip)]
    pub raw_claims: Map<String, Value>,
}

/// Token validator bound to one policy and one key source.
pub struct TokenValidator {
    policy: Arc<ValidationPolicy>,
    keys: Arc<dyn KeySource>,
}

impl TokenValidator {
    /// Create a validator
    #[must_use]
    pub fn new(policy: Arc<ValidationPolicy>, keys: Arc<dyn KeySource>) -> Self {
        Self { policy, keys }
    }

    /// The policy tokens are checked against
    #[must_use]
    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validate a bearer token and return the identity it asserts.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the token is malformed, signed with an
    /// unknown key or a non-asymmetric algorithm, fails signature, issuer,
    /// audience or time checks, or carries no allowed role.
    pub async fn validate(&self, token: &str) -> Result<AuthenticatedIdentity, ValidationError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let alg = pinned_algorithm(header.alg)?;
        let kid = header.kid.as_deref().ok_or(ValidationError::MissingKeyId)?;

        let key = self.keys.decoding_key(kid).await?;

        let validation = self.build_validation(alg);
        let claims = jsonwebtoken::decode::<Map<String, Value>>(token, &key, &validation)
            .map_err(|e| ValidationError::from_jwt(&e))?
            .claims;

        let subject = string_claim(&claims, "sub")
            .ok_or_else(|| ValidationError::MissingClaim("sub".to_string()))?;

        let roles = extract_roles(&claims, &self.policy.roles_claim).inspect_err(|e| {
            warn!(subject = %subject, error = %e, "Token rejected: roles claim");
        })?;

        if self.policy.permitted_roles(&roles).is_empty() {
            warn!(subject = %subject, roles = ?roles, "Token rejected: no allowed role");
            return Err(ValidationError::Unauthorized);
        }

        let preferred_username = ["preferred_username", "upn", "email"]
            .iter()
            .find_map(|name| string_claim(&claims, name))
            .ok_or_else(|| ValidationError::MissingClaim("preferred_username".to_string()))?
            .to_lowercase();

        debug!(subject = %subject, username = %preferred_username, "Token validated");

        Ok(AuthenticatedIdentity {
            object_id: string_claim(&claims, "oid"),
            subject,
            preferred_username,
            roles,
            access_token: token.to_string(),
            raw_claims: claims,
        })
    }

    fn build_validation(&self, alg: Algorithm) -> Validation {
        let mut v = Validation::new(alg);
        v.set_issuer(&[&self.policy.issuer]);
        v.set_audience(&[&self.policy.audience]);
        v.set_required_spec_claims(&["exp", "iss", "aud"]);
        v.validate_nbf = true;
        v.leeway = self.policy.leeway.as_secs();
        v
    }
}

/// Accept only asymmetric signing algorithms.
fn pinned_algorithm(alg: Algorithm) -> Result<Algorithm, ValidationError> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384 => Ok(alg),
        other => Err(ValidationError::UnsupportedAlgorithm(format!("{other:?}"))),
    }
}

fn string_claim(claims: &Map<String, Value>, name: &str) -> Option<String> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
}

/// Extract the role set. A single string counts as one role.
fn extract_roles(claims: &Map<String, Value>, name: &str) -> Result<BTreeSet<String>, ValidationError> {
    match claims.get(name) {
        None | Some(Value::Null) => Err(ValidationError::RoleClaimMissing),
        Some(Value::String(role)) if role.trim().is_empty() => Err(ValidationError::RoleClaimEmpty),
        Some(Value::String(role)) => Ok(BTreeSet::from([role.clone()])),
        Some(Value::Array(items)) => {
            let roles: BTreeSet<String> = items
                .iter()
                .filter_map(Value::as_str)
                .filter(|r| !r.trim().is_empty())
                .map(String::from)
                .collect();
            if roles.is_empty() {
                Err(ValidationError::RoleClaimEmpty)
            } else {
                Ok(roles)
            }
        }
        Some(_) => Err(ValidationError::RoleClaimMissing),
    }
}
