//! HTTP host
//!
//! A thin axum surface over [`AuthenticationCoordinator`]: `/health` plus
//! one authentication endpoint mounted at `/` and at the redirect URI path.
//! Failures map through [`UserAction`]. The response body never says which
//! check rejected the caller; that detail goes to the log only.
//!
//! The standalone binary answers with the identity only. An embedding host
//! that needs downstream tokens keeps the [`OidcSession`] from
//! [`Principal::session`] and later passes it to
//! [`SilentTokenRefresher::get_access_token`] through
//! [`AuthenticationCoordinator::refresher`].
//!
//! [`OidcSession`]: crate::oidc::OidcSession
//! [`SilentTokenRefresher::get_access_token`]: crate::oidc::SilentTokenRefresher::get_access_token

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{RawQuery, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::oidc::{AuthOutcome, AuthenticationCoordinator, Principal};
use crate::{Error, Result, UserAction};

/// Shared application state
pub struct AppState {
    /// The authenticator
    pub coordinator: Arc<AuthenticationCoordinator>,
    /// Upper bound on one authentication request
    pub request_timeout: Duration,
}

/// Create the router. `callback_path` is the path component of the
/// configured redirect URI.
pub fn create_router(state: Arc<AppState>, callback_path: &str) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/", get(authenticate_handler));

    if callback_path != "/" && callback_path != "/health" && !callback_path.is_empty() {
        router = router.route(callback_path, get(authenticate_handler));
    }

    router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the coordinator from `config` and serve until Ctrl+C or SIGTERM.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, endpoint discovery
/// fails, or the listener cannot bind.
pub async fn run(config: Config) -> Result<()> {
    let coordinator = AuthenticationCoordinator::from_config(&config).await?;

    let callback_path = Url::parse(&config.provider.redirect_uri)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| "/".to_string());

    let state = Arc::new(AppState {
        coordinator: Arc::new(coordinator),
        request_timeout: config.server.request_timeout,
    });
    let app = create_router(state, &callback_path);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid listen address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;

    info!(
        address = %addr,
        callback_path = %callback_path,
        header_trust = config.header_trust.enabled,
        redirect_flow = config.redirect_flow.enabled,
        "Authenticator listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    info!("Authenticator shutdown complete");
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn authenticate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let attempt = state
        .coordinator
        .authenticate(&headers, query.as_deref());

    let result = match tokio::time::timeout(state.request_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout = ?state.request_timeout, "Authentication timed out");
            return reauthenticate_response(&state.coordinator);
        }
    };

    match result {
        Ok(AuthOutcome::Authenticated(principal)) => principal_response(&principal),
        Ok(AuthOutcome::Redirect(url)) => redirect_response(&url),
        Err(e) => {
            let kind = e.kind();
            warn!(kind = %kind, error = %e, "Authentication failed");
            match kind.user_action() {
                UserAction::OperatorMisconfiguration => {
                    error!(error = %e, "Authenticator is misconfigured");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "error": "operator misconfiguration" })),
                    )
                        .into_response()
                }
                UserAction::Reauthenticate => reauthenticate_response(&state.coordinator),
            }
        }
    }
}

fn principal_response(principal: &Principal) -> Response {
    let identity = principal.identity();
    Json(json!({
        "source": principal.source(),
        "username": principal.username(),
        "display_name": principal.display_name(),
        "roles": identity.roles,
    }))
    .into_response()
}

fn redirect_response(url: &Url) -> Response {
    match HeaderValue::from_str(url.as_str()) {
        Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
        Err(e) => {
            error!(error = %e, "Redirect URL is not a valid header value");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Fresh login redirect, or 401 when the redirect flow is disabled.
fn reauthenticate_response(coordinator: &AuthenticationCoordinator) -> Response {
    match coordinator.reauthenticate() {
        Some(url) => redirect_response(&url),
        None => unauthorized_response(),
    }
}

fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({ "error": "authentication required" })),
    )
        .into_response()
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
