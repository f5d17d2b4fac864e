//! OAuth2 sign-in providers
//!
//! The processor only sees the [`OAuthProvider`] trait: build an
//! authorization URL carrying our sealed state, turn the callback values into
//! an authorized session, then fetch the profile. [`OAuth2Provider`] implements
//! it for providers exposing a plain authorization-code flow and a userinfo
//! endpoint (Google, Amazon); [`AppleProvider`] reads the profile from Apple's
//! signed identity token instead.

mod apple;

use async_trait::async_trait;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope,
    TokenResponse, TokenUrl, basic::BasicClient,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AuthConfig, OAuthClientConfig};
use crate::models::SessionProvider;

pub use apple::AppleProvider;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OAuthError {
    #[error("Provider denied the authorization: {0}")]
    Denied(String),

    #[error("Missing authorization code")]
    MissingCode,

    #[error("State doesn't match")]
    StateMismatch,

    #[error("Failed to exchange authorization code: {0}")]
    Exchange(String),

    #[error("Session is not authorized yet")]
    NotAuthorized,

    #[error("Failed to get user profile: {0}")]
    Profile(String),

    #[error("Invalid provider configuration: {0}")]
    Configuration(String),
}

/// Provider-side state of one sign-in attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OAuthSession {
    pub auth_url: String,
    pub state: String,
    pub access_token: Option<String>,
    pub id_token: Option<String>,
    /// Profile values the provider sent along with the callback
    pub profile: Option<OAuthUser>,
}

/// Profile returned by a provider, every field optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OAuthUser {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "given_name")]
    pub first_name: Option<String>,
    #[serde(default, alias = "preferred_username")]
    pub nickname: Option<String>,
    #[serde(default, alias = "picture")]
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Start an attempt whose callback will carry `state`
    fn begin_auth(&self, state: &str) -> Result<OAuthSession, OAuthError>;

    /// Validate the callback values and obtain the provider credentials
    async fn authorize(
        &self,
        session: &mut OAuthSession,
        values: &HashMap<String, String>,
    ) -> Result<(), OAuthError>;

    async fn fetch_user(&self, session: &OAuthSession) -> Result<OAuthUser, OAuthError>;
}

/// OAuth providers enabled for this deployment
#[derive(Clone, Default)]
pub struct OAuthProviders {
    providers: HashMap<SessionProvider, Arc<dyn OAuthProvider>>,
}

impl OAuthProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `implementation` for `provider`, replacing any previous one
    pub fn with(mut self, provider: SessionProvider, implementation: Arc<dyn OAuthProvider>) -> Self {
        self.providers.insert(provider, implementation);
        self
    }

    pub fn get(&self, provider: SessionProvider) -> Option<Arc<dyn OAuthProvider>> {
        self.providers.get(&provider).cloned()
    }

    /// Build the OAuth2 providers configured in `config`
    pub fn from_config(config: &AuthConfig) -> Result<Self, OAuthError> {
        let mut providers = Self::new();
        let configured = [
            (SessionProvider::Google, config.oauth.google.as_ref()),
            (SessionProvider::Amazon, config.oauth.amazon.as_ref()),
        ];

        for (provider, client) in configured {
            if let Some(client) = client {
                let redirect_url = callback_url(&config.frontend_base_url, provider);
                let implementation = OAuth2Provider::new(provider, client, &redirect_url)?;
                info!("Enabled OAuth provider: {}", provider);
                providers = providers.with(provider, Arc::new(implementation));
            }
        }

        if let Some(client) = config.oauth.apple.as_ref() {
            let redirect_url = callback_url(&config.frontend_base_url, SessionProvider::Apple);
            let implementation = AppleProvider::new(client, &redirect_url)?;
            info!("Enabled OAuth provider: {}", SessionProvider::Apple);
            providers = providers.with(SessionProvider::Apple, Arc::new(implementation));
        }

        if providers.providers.is_empty() {
            warn!("No OAuth provider configured");
        }

        Ok(providers)
    }
}

/// Authorization code of a callback answering `session`
fn authorization_code<'a>(
    session: &OAuthSession,
    values: &'a HashMap<String, String>,
) -> Result<&'a str, OAuthError> {
    if let Some(error) = values.get("error") {
        return Err(OAuthError::Denied(error.clone()));
    }

    if values.get("state").is_some_and(|state| state != &session.state) {
        return Err(OAuthError::StateMismatch);
    }

    values
        .get("code")
        .map(String::as_str)
        .filter(|code| !code.is_empty())
        .ok_or(OAuthError::MissingCode)
}

/// Frontend page the provider sends the browser back to
pub fn callback_url(frontend_base_url: &str, provider: SessionProvider) -> String {
    format!(
        "{}/dash/signin/{}/end",
        frontend_base_url.trim_end_matches('/'),
        provider.slug()
    )
}

struct ProviderEndpoints {
    auth_url: &'static str,
    token_url: &'static str,
    userinfo_url: &'static str,
    scopes: &'static [&'static str],
}

fn default_endpoints(provider: SessionProvider) -> Option<ProviderEndpoints> {
    match provider {
        SessionProvider::Google => Some(ProviderEndpoints {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
            token_url: "https://oauth2.googleapis.com/token",
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
            scopes: &["openid", "email", "profile"],
        }),
        SessionProvider::Amazon => Some(ProviderEndpoints {
            auth_url: "https://www.amazon.com/ap/oa",
            token_url: "https://api.amazon.com/auth/o2/token",
            userinfo_url: "https://api.amazon.com/user/profile",
            scopes: &["profile"],
        }),
        _ => None,
    }
}

/// Authorization-code flow over the `oauth2` crate
#[derive(Clone)]
pub struct OAuth2Provider {
    provider: SessionProvider,
    client: BasicClient,
    scopes: Vec<String>,
    userinfo_url: String,
    http: reqwest::Client,
}

impl OAuth2Provider {
    /// Create a client, filling unset endpoints with the provider defaults
    pub fn new(
        provider: SessionProvider,
        config: &OAuthClientConfig,
        redirect_url: &str,
    ) -> Result<Self, OAuthError> {
        let defaults = default_endpoints(provider);
        let endpoint = |configured: &Option<String>, default: Option<&'static str>| {
            configured
                .clone()
                .or_else(|| default.map(str::to_string))
                .ok_or_else(|| {
                    OAuthError::Configuration(format!("missing endpoint for {}", provider))
                })
        };

        let auth_url = endpoint(&config.auth_url, defaults.as_ref().map(|d| d.auth_url))?;
        let token_url = endpoint(&config.token_url, defaults.as_ref().map(|d| d.token_url))?;
        let userinfo_url =
            endpoint(&config.userinfo_url, defaults.as_ref().map(|d| d.userinfo_url))?;
        let scopes = config.scope_list().unwrap_or_else(|| {
            defaults
                .as_ref()
                .map(|d| d.scopes.iter().map(|scope| scope.to_string()).collect())
                .unwrap_or_default()
        });

        let invalid = |e: oauth2::url::ParseError| OAuthError::Configuration(e.to_string());
        let client = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            AuthUrl::new(auth_url).map_err(invalid)?,
            Some(TokenUrl::new(token_url).map_err(invalid)?),
        )
        .set_redirect_uri(RedirectUrl::new(redirect_url.to_string()).map_err(invalid)?);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OAuthError::Configuration(e.to_string()))?;

        Ok(Self {
            provider,
            client,
            scopes,
            userinfo_url,
            http,
        })
    }
}

#[async_trait]
impl OAuthProvider for OAuth2Provider {
    fn begin_auth(&self, state: &str) -> Result<OAuthSession, OAuthError> {
        let mut request = self
            .client
            .authorize_url(|| CsrfToken::new(state.to_string()));

        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }

        let (auth_url, _) = request.url();

        Ok(OAuthSession {
            auth_url: auth_url.to_string(),
            state: state.to_string(),
            ..OAuthSession::default()
        })
    }

    async fn authorize(
        &self,
        session: &mut OAuthSession,
        values: &HashMap<String, String>,
    ) -> Result<(), OAuthError> {
        let code = authorization_code(session, values)?;

        info!("Exchanging authorization code for access token for {}", self.provider);

        let token_response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| OAuthError::Exchange(e.to_string()))?;

        session.access_token = Some(token_response.access_token().secret().clone());
        Ok(())
    }

    async fn fetch_user(&self, session: &OAuthSession) -> Result<OAuthUser, OAuthError> {
        let access_token = session
            .access_token
            .as_deref()
            .ok_or(OAuthError::NotAuthorized)?;

        info!("Getting user profile for {}", self.provider);

        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| OAuthError::Profile(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OAuthError::Profile(format!(
                "userinfo endpoint answered {}",
                response.status()
            )));
        }

        response
            .json::<OAuthUser>()
            .await
            .map_err(|e| OAuthError::Profile(e.to_string()))
    }
}
