//! Gateway OIDC authenticator
//!
//! Header-trust and Authorization Code + PKCE authentication with role-based
//! admission, served over HTTP.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use gateway_oidc_auth::{
    cli::{Cli, Command},
    config::Config,
    oidc::{AuthenticationCoordinator, ProviderEndpoints, http_client},
    server, setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Validate { token }) => run_validate(&config, &token).await,
        Some(Command::Endpoints) => run_endpoints(&config).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Validate one token and print the identity it asserts
async fn run_validate(config: &Config, token: &str) -> ExitCode {
    let coordinator = match AuthenticationCoordinator::from_config(config).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ Failed to initialise: {e}");
            return ExitCode::FAILURE;
        }
    };

    match coordinator.validator().validate(token).await {
        Ok(identity) => match serde_json::to_string_pretty(&identity) {
            Ok(json) => {
                println!("✅ Token accepted\n{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ Failed to serialize identity: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("❌ Token rejected ({}): {e}", e.kind());
            ExitCode::FAILURE
        }
    }
}

/// Print the provider endpoints the authenticator would use
async fn run_endpoints(config: &Config) -> ExitCode {
    let http = match http_client(config.provider.http_timeout, config.provider.allow_http) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match ProviderEndpoints::resolve(&http, &config.provider).await {
        Ok(endpoints) => {
            println!("Authorization: {}", endpoints.authorization_endpoint);
            println!("Token:         {}", endpoints.token_endpoint);
            println!("Key set:       {}", endpoints.jwks_uri);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Endpoint resolution failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting gateway OIDC authenticator"
    );

    // Run with graceful shutdown
    if let Err(e) = server::run(config).await {
        if e.kind().user_action() == gateway_oidc_auth::UserAction::OperatorMisconfiguration {
            error!("Operator misconfiguration: {e}");
        } else {
            error!("Authenticator error: {e}");
        }
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
