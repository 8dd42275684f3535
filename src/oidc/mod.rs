//! OIDC authentication
//!
//! Components, leaves first:
//!
//! - [`PkceStore`]: short-lived PKCE challenge state
//! - [`TokenValidator`]: signature, claim and role checks on bearer tokens
//! - [`CodeExchanger`]: Authorization Code + PKCE exchange
//! - [`SilentTokenRefresher`]: access-token renewal from a session's cache
//! - [`AuthenticationCoordinator`]: routes a request to the right path

pub mod coordinator;
pub mod endpoint;
pub mod exchange;
pub mod keys;
pub mod metadata;
pub mod pkce;
pub mod refresh;
pub mod session;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{
    AuthError, AuthOutcome, AuthenticationCoordinator, HeaderTrust, HeaderTrustIdentity, Principal,
};
pub use endpoint::{EndpointError, HttpTokenEndpoint, TokenEndpoint, TokenResponse, http_client};
pub use exchange::{
    AuthenticationResponse, ClientRegistration, CodeExchanger, ExchangeError, OidcIdentity,
};
pub use keys::{KeySource, RemoteKeySet, StaticKeySet};
pub use metadata::{ProviderEndpoints, ProviderMetadata};
pub use pkce::{PkceState, PkceStore};
pub use refresh::SilentTokenRefresher;
pub use session::{AccountRef, OidcSession};
pub use validator::{AuthenticatedIdentity, TokenValidator, ValidationError, ValidationPolicy};
