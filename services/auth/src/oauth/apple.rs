//! Sign in with Apple
//!
//! Apple posts the callback as a form and has no userinfo endpoint. The
//! e-mail comes from the `id_token` of the code exchange, verified against
//! Apple's published keys; the name only comes along with the very first
//! authorization, as the `user` callback value. The client secret is the ES256
//! JWT generated ahead of time from the Apple developer key.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
    BasicTokenType,
};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, Client, ClientId, ClientSecret, CsrfToken,
    ExtraTokenFields, RedirectUrl, Scope, StandardRevocableToken, StandardTokenResponse,
    TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use super::{OAuthError, OAuthProvider, OAuthSession, OAuthUser, authorization_code};
use crate::config::OAuthClientConfig;

const AUTH_URL: &str = "https://appleid.apple.com/auth/authorize";
const TOKEN_URL: &str = "https://appleid.apple.com/auth/token";
const KEYS_URL: &str = "https://appleid.apple.com/auth/keys";
const ISSUER: &str = "https://appleid.apple.com";
const DEFAULT_SCOPES: &[&str] = &["name", "email"];

/// Token endpoint fields beyond the access token
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IdTokenFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenFields {}

type AppleTokenResponse = StandardTokenResponse<IdTokenFields, BasicTokenType>;

type AppleClient = Client<
    BasicErrorResponse,
    AppleTokenResponse,
    BasicTokenType,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
>;

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AppleKeySet {
    keys: Vec<AppleKey>,
}

#[derive(Debug, Deserialize)]
struct AppleKey {
    kid: String,
    n: String,
    e: String,
}

/// `user` value posted on the first authorization only
#[derive(Debug, Default, Deserialize)]
struct FirstSignIn {
    #[serde(default)]
    name: Option<FirstSignInName>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FirstSignInName {
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

/// Names Apple shares once, when the user first authorizes the app
fn first_sign_in_profile(raw: &str) -> Option<OAuthUser> {
    let name = serde_json::from_str::<FirstSignIn>(raw).ok()?.name?;

    let first_name = name.first_name.filter(|part| !part.trim().is_empty());
    let full_name = [first_name.as_deref(), name.last_name.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if full_name.is_empty() {
        return None;
    }

    Some(OAuthUser {
        name: Some(full_name),
        first_name,
        ..OAuthUser::default()
    })
}

#[derive(Clone)]
pub struct AppleProvider {
    client: AppleClient,
    client_id: String,
    scopes: Vec<String>,
    keys_url: String,
    http: reqwest::Client,
}

impl AppleProvider {
    pub fn new(config: &OAuthClientConfig, redirect_url: &str) -> Result<Self, OAuthError> {
        let invalid = |e: oauth2::url::ParseError| OAuthError::Configuration(e.to_string());

        let auth_url = config.auth_url.as_deref().unwrap_or(AUTH_URL);
        let token_url = config.token_url.as_deref().unwrap_or(TOKEN_URL);
        let scopes = config.scope_list().unwrap_or_else(|| {
            DEFAULT_SCOPES.iter().map(|scope| scope.to_string()).collect()
        });

        let client = AppleClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            AuthUrl::new(auth_url.to_string()).map_err(invalid)?,
            Some(TokenUrl::new(token_url.to_string()).map_err(invalid)?),
        )
        .set_auth_type(AuthType::RequestBody)
        .set_redirect_uri(RedirectUrl::new(redirect_url.to_string()).map_err(invalid)?);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OAuthError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            scopes,
            keys_url: config
                .keys_url
                .clone()
                .unwrap_or_else(|| KEYS_URL.to_string()),
            http,
        })
    }

    /// Check the identity token signature, issuer and audience
    async fn verify_id_token(&self, id_token: &str) -> Result<IdTokenClaims, OAuthError> {
        let header = decode_header(id_token)
            .map_err(|e| OAuthError::Profile(format!("invalid id token: {}", e)))?;
        let kid = header
            .kid
            .ok_or_else(|| OAuthError::Profile("id token has no key id".to_string()))?;

        let response = self
            .http
            .get(&self.keys_url)
            .send()
            .await
            .map_err(|e| OAuthError::Profile(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OAuthError::Profile(format!(
                "keys endpoint answered {}",
                response.status()
            )));
        }

        let key_set: AppleKeySet = response
            .json()
            .await
            .map_err(|e| OAuthError::Profile(e.to_string()))?;

        let key = key_set
            .keys
            .iter()
            .find(|key| key.kid == kid)
            .ok_or_else(|| OAuthError::Profile(format!("no Apple key {}", kid)))?;

        let decoding_key = DecodingKey::from_rsa_components(&key.n, &key.e)
            .map_err(|e| OAuthError::Profile(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&[ISSUER]);

        decode::<IdTokenClaims>(id_token, &decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| OAuthError::Profile(format!("invalid id token: {}", e)))
    }
}

#[async_trait]
impl OAuthProvider for AppleProvider {
    fn begin_auth(&self, state: &str) -> Result<OAuthSession, OAuthError> {
        let mut request = self
            .client
            .authorize_url(|| CsrfToken::new(state.to_string()))
            .add_extra_param("response_mode", "form_post");

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

        info!("Exchanging authorization code for identity token for APPLE");

        let token_response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| OAuthError::Exchange(e.to_string()))?;

        let id_token = token_response
            .extra_fields()
            .id_token
            .clone()
            .ok_or_else(|| OAuthError::Exchange("no id token in token response".to_string()))?;

        session.access_token = Some(token_response.access_token().secret().clone());
        session.id_token = Some(id_token);
        session.profile = values.get("user").and_then(|user| first_sign_in_profile(user));
        Ok(())
    }

    async fn fetch_user(&self, session: &OAuthSession) -> Result<OAuthUser, OAuthError> {
        let id_token = session.id_token.as_deref().ok_or(OAuthError::NotAuthorized)?;

        let claims = self.verify_id_token(id_token).await?;

        Ok(OAuthUser {
            email: claims.email,
            ..session.profile.clone().unwrap_or_default()
        })
    }
}
