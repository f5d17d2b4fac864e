//! Configuration for the authentication core

use anyhow::{Context, Result};
use chrono::Duration;
use config::{Config, Environment as EnvironmentSource};
use serde::Deserialize;
use url::Url;

/// Deployment environment the core runs in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Brevo transactional e-mail settings
#[derive(Debug, Clone, Deserialize)]
pub struct BrevoConfig {
    pub api_key: String,
    pub sender_email: String,
    #[serde(default = "default_sender_name")]
    pub sender_name: String,
    #[serde(default = "default_brevo_base_url")]
    pub base_url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_sender_name() -> String {
    "Sign in".to_string()
}

fn default_brevo_base_url() -> String {
    "https://api.brevo.com/v3".to_string()
}

fn default_http_timeout_secs() -> u64 {
    10
}

/// Credentials and endpoint overrides for one OAuth2 provider
///
/// For Apple, `client_secret` is the pre-generated ES256 client secret JWT.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub userinfo_url: Option<String>,
    /// Key set verifying identity tokens (Apple)
    #[serde(default)]
    pub keys_url: Option<String>,
    /// Comma separated scopes, provider defaults when absent
    pub scopes: Option<String>,
}

impl OAuthClientConfig {
    pub fn scope_list(&self) -> Option<Vec<String>> {
        self.scopes.as_ref().map(|scopes| {
            scopes
                .split(',')
                .map(str::trim)
                .filter(|scope| !scope.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

/// OAuth2 providers enabled for this deployment
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub google: Option<OAuthClientConfig>,
    #[serde(default)]
    pub apple: Option<OAuthClientConfig>,
    #[serde(default)]
    pub amazon: Option<OAuthClientConfig>,
}

/// Authentication core configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Secret the sealing key is derived from
    pub crypt_key: String,
    pub frontend_base_url: String,
    pub state_ttl_secs: i64,
    pub token_ttl_secs: i64,
    /// Cron expression driving the expiry sweeps
    pub sweep_schedule: String,
    #[serde(default)]
    pub brevo: Option<BrevoConfig>,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

impl AuthConfig {
    /// Default State lifetime (5 minutes)
    pub const DEFAULT_STATE_TTL_SECS: i64 = 5 * 60;
    /// Default Token lifetime (30 days)
    pub const DEFAULT_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;
    pub const DEFAULT_SWEEP_SCHEDULE: &'static str = "0 */5 * * * *";

    /// Build a configuration with default lifetimes
    pub fn new(crypt_key: impl Into<String>, frontend_base_url: impl Into<String>) -> Self {
        Self {
            environment: Environment::default(),
            crypt_key: crypt_key.into(),
            frontend_base_url: frontend_base_url.into(),
            state_ttl_secs: Self::DEFAULT_STATE_TTL_SECS,
            token_ttl_secs: Self::DEFAULT_TOKEN_TTL_SECS,
            sweep_schedule: Self::DEFAULT_SWEEP_SCHEDULE.to_string(),
            brevo: None,
            oauth: OAuthConfig::default(),
        }
    }

    /// Load the configuration from environment variables
    ///
    /// # Environment Variables
    /// - `AUTH_CRYPT_KEY`: secret the sealing key is derived from (required)
    /// - `AUTH_ENVIRONMENT`: `development`, `test` or `production` (default: development)
    /// - `AUTH_FRONTEND_BASE_URL`: origin redirects must stay on (default: http://localhost:3000)
    /// - `AUTH_STATE_TTL_SECS`: State lifetime in seconds (default: 300)
    /// - `AUTH_TOKEN_TTL_SECS`: Token lifetime in seconds (default: 2592000)
    /// - `AUTH_SWEEP_SCHEDULE`: cron expression of the expiry sweeps (default: every 5 minutes)
    /// - `AUTH_BREVO__API_KEY`, `AUTH_BREVO__SENDER_EMAIL`, `AUTH_BREVO__SENDER_NAME`,
    ///   `AUTH_BREVO__BASE_URL`, `AUTH_BREVO__TIMEOUT_SECS`: e-mail delivery
    /// - `AUTH_OAUTH__GOOGLE__CLIENT_ID`, `AUTH_OAUTH__GOOGLE__CLIENT_SECRET`, ...:
    ///   OAuth2 credentials, same keys for `APPLE` and `AMAZON`
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .set_default("frontend_base_url", "http://localhost:3000")?
            .set_default("state_ttl_secs", Self::DEFAULT_STATE_TTL_SECS)?
            .set_default("token_ttl_secs", Self::DEFAULT_TOKEN_TTL_SECS)?
            .set_default("sweep_schedule", Self::DEFAULT_SWEEP_SCHEDULE)?
            .add_source(
                EnvironmentSource::with_prefix("AUTH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read auth configuration")?;

        let config: AuthConfig = settings
            .try_deserialize()
            .context("Invalid auth configuration")?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.crypt_key.is_empty() {
            anyhow::bail!("AUTH_CRYPT_KEY must not be empty");
        }
        if self.state_ttl_secs <= 0 || self.token_ttl_secs <= 0 {
            anyhow::bail!("State and token lifetimes must be positive");
        }
        Url::parse(&self.frontend_base_url)
            .with_context(|| format!("Invalid frontend base URL: {}", self.frontend_base_url))?;

        Ok(())
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::seconds(self.state_ttl_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::seconds(self.token_ttl_secs)
    }
}
