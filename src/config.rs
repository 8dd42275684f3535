//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::oidc::ValidationPolicy;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// HTTP host configuration
    pub server: ServerConfig,
    /// Identity provider (OIDC client) configuration
    pub provider: ProviderConfig,
    /// Token validation policy
    pub policy: PolicyConfig,
    /// PKCE state lifetime settings
    pub pkce: PkceConfig,
    /// Upstream-proxy header-trust settings
    pub header_trust: HeaderTrustConfig,
    /// Direct Authorization Code + PKCE flow settings
    pub redirect_flow: RedirectFlowConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (OIDC_AUTH_ prefix)
        figment = figment.merge(Env::prefixed("OIDC_AUTH_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be loaded before ${VAR} expansion
        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in provider settings
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(format!("Invalid expansion pattern: {e}")))?;

        let provider = &mut self.provider;
        for value in [
            &mut provider.authority,
            &mut provider.client_id,
            &mut provider.client_secret,
            &mut provider.redirect_uri,
        ] {
            *value = Self::expand_string(&re, value);
        }
        self.policy.issuer = Self::expand_string(&re, &self.policy.issuer);
        self.policy.audience = Self::expand_string(&re, &self.policy.audience);

        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Check that everything the enabled flows need is present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first missing or malformed setting.
    pub fn validate(&self) -> Result<()> {
        if self.policy.issuer.trim().is_empty() {
            return Err(Error::Config("policy.issuer is not provided".to_string()));
        }
        if self.policy.audience.trim().is_empty() {
            return Err(Error::Config("policy.audience is not provided".to_string()));
        }
        if self.policy.roles_claim.trim().is_empty() {
            return Err(Error::Config("policy.roles_claim is empty".to_string()));
        }
        if self.policy.allowed_roles.iter().all(|r| r.trim().is_empty()) {
            return Err(Error::Config(
                "policy.allowed_roles must name at least one role".to_string(),
            ));
        }
        if !self.header_trust.enabled && !self.redirect_flow.enabled {
            return Err(Error::Config(
                "at least one of header_trust or redirect_flow must be enabled".to_string(),
            ));
        }
        if self.provider.jwks_uri.is_none() && self.provider.authority.trim().is_empty() {
            return Err(Error::Config(
                "provider.jwks_uri or provider.authority is required".to_string(),
            ));
        }

        if self.redirect_flow.enabled {
            if self.provider.client_id.trim().is_empty() {
                return Err(Error::Config("provider.client_id is not provided".to_string()));
            }
            if self.provider.redirect_uri.trim().is_empty() {
                return Err(Error::Config(
                    "provider.redirect_uri is not provided".to_string(),
                ));
            }
            url::Url::parse(&self.provider.redirect_uri)
                .map_err(|e| Error::Config(format!("provider.redirect_uri is invalid: {e}")))?;
            if self.provider.scope_list().is_empty() {
                return Err(Error::Config("provider.scopes is empty".to_string()));
            }
        }

        Ok(())
    }

    /// Build the read-only validation policy from the `policy` section
    #[must_use]
    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            issuer: self.policy.issuer.clone(),
            audience: self.policy.audience.clone(),
            roles_claim: self.policy.roles_claim.clone(),
            allowed_roles: self
                .policy
                .allowed_roles
                .iter()
                .filter(|r| !r.trim().is_empty())
                .cloned()
                .collect(),
            leeway: self.policy.leeway,
        }
    }
}

/// HTTP host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8085,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Authority URL (e.g. `https://login.microsoftonline.com/<tenant>/v2.0`)
    pub authority: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret (supports `${VAR}`)
    pub client_secret: String,
    /// Redirect URI registered with the provider
    pub redirect_uri: String,
    /// Space-separated scope list
    pub scopes: String,
    /// Explicit authorization endpoint (skips discovery)
    pub authorization_endpoint: Option<String>,
    /// Explicit token endpoint (skips discovery)
    pub token_endpoint: Option<String>,
    /// Explicit key-set URL (skips discovery)
    pub jwks_uri: Option<String>,
    /// Discovery document URL, defaults to `{authority}/.well-known/openid-configuration`
    pub discovery_url: Option<String>,
    /// Bound on every outbound call to the provider
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    /// Minimum gap between key-set refetches forced by an unknown `kid`
    #[serde(with = "humantime_serde")]
    pub jwks_refetch_interval: Duration,
    /// Permit plain-HTTP provider endpoints (local development only)
    pub allow_http: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            authority: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            scopes: "openid profile offline_access".to_string(),
            authorization_endpoint: None,
            token_endpoint: None,
            jwks_uri: None,
            discovery_url: None,
            http_timeout: Duration::from_secs(5),
            jwks_refetch_interval: Duration::from_secs(5 * 60),
            allow_http: false,
        }
    }
}

impl ProviderConfig {
    /// Scopes split on whitespace
    #[must_use]
    pub fn scope_list(&self) -> Vec<String> {
        self.scopes.split_whitespace().map(String::from).collect()
    }

    /// Discovery document URL
    #[must_use]
    pub fn discovery_document_url(&self) -> String {
        self.discovery_url.clone().unwrap_or_else(|| {
            format!(
                "{}/.well-known/openid-configuration",
                self.authority.trim_end_matches('/')
            )
        })
    }
}

/// Token validation policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Required `iss`
    pub issuer: String,
    /// Required `aud`
    pub audience: String,
    /// Claim holding the role list
    pub roles_claim: String,
    /// Roles that grant access (case-insensitive)
    pub allowed_roles: Vec<String>,
    /// Clock skew tolerance for `exp`/`nbf`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: String::new(),
            roles_claim: "roles".to_string(),
            allowed_roles: Vec::new(),
            leeway: Duration::from_secs(60),
        }
    }
}

/// PKCE state lifetime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkceConfig {
    /// How long a challenge stays redeemable
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
    /// Minimum time between expired-state sweeps
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Upper bound on pending logins
    pub max_pending: usize,
}

impl Default for PkceConfig {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
            max_pending: 10_000,
        }
    }
}

/// Header-trust settings for an upstream OIDC proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderTrustConfig {
    /// Accept forwarded identity headers
    pub enabled: bool,
    /// Header carrying the forwarded access token
    pub access_token_header: String,
    /// Header carrying the forwarded preferred username
    pub username_header: String,
}

impl Default for HeaderTrustConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            access_token_header: "X-Forwarded-Access-Token".to_string(),
            username_header: "X-Forwarded-Preferred-Username".to_string(),
        }
    }
}

/// Direct Authorization Code + PKCE flow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectFlowConfig {
    /// Run the redirect flow when no forwarded identity is present
    pub enabled: bool,
}

impl Default for RedirectFlowConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" must be checked before "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
