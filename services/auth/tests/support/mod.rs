//! Shared fixtures for the sign-in integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use auth::codec::TokenCodec;
use auth::config::AuthConfig;
use auth::email::{EmailError, EmailMessage, EmailSender};
use auth::models::{DEV_SIGN_IN_CODE, SessionProvider};
use auth::oauth::{OAuthError, OAuthProvider, OAuthProviders, OAuthSession, OAuthUser};
use auth::processor::{AuthProcessor, SignInEnd, SignInEnded, SignInStart};
use auth::repositories::{Database, MemoryDatabase};

pub const CRYPT_KEY: &str = "integration-test-crypt-key";
pub const FRONTEND_BASE_URL: &str = "https://app.acme.io";
pub const VALID_OAUTH_CODE: &str = "valid-code";

/// Keeps every message instead of delivering it
#[derive(Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<EmailMessage>>,
    failing: AtomicBool,
}

impl RecordingEmailSender {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmailError::Transport("connection refused".to_string()));
        }

        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Provider answering with a configurable profile for [`VALID_OAUTH_CODE`]
pub struct ScriptedOAuthProvider {
    profile: Mutex<Result<OAuthUser, OAuthError>>,
}

impl ScriptedOAuthProvider {
    pub fn new() -> Self {
        Self {
            profile: Mutex::new(Ok(OAuthUser::default())),
        }
    }

    pub fn set_profile(&self, profile: OAuthUser) {
        *self.profile.lock().unwrap() = Ok(profile);
    }

    pub fn fail_profile(&self) {
        *self.profile.lock().unwrap() = Err(OAuthError::Profile("503".to_string()));
    }
}

#[async_trait]
impl OAuthProvider for ScriptedOAuthProvider {
    fn begin_auth(&self, state: &str) -> Result<OAuthSession, OAuthError> {
        Ok(OAuthSession {
            auth_url: format!("https://provider.test/authorize?state={}", state),
            state: state.to_string(),
            ..OAuthSession::default()
        })
    }

    async fn authorize(
        &self,
        session: &mut OAuthSession,
        values: &HashMap<String, String>,
    ) -> Result<(), OAuthError> {
        if values.get("state").is_some_and(|state| state != &session.state) {
            return Err(OAuthError::StateMismatch);
        }

        match values.get("code") {
            Some(code) if code == VALID_OAUTH_CODE => {
                session.access_token = Some("access-token".to_string());
                Ok(())
            }
            Some(code) => Err(OAuthError::Exchange(format!("unknown code {}", code))),
            None => Err(OAuthError::MissingCode),
        }
    }

    async fn fetch_user(&self, session: &OAuthSession) -> Result<OAuthUser, OAuthError> {
        if session.access_token.is_none() {
            return Err(OAuthError::NotAuthorized);
        }

        self.profile.lock().unwrap().clone()
    }
}

pub struct Harness {
    pub database: Arc<MemoryDatabase>,
    pub email: Arc<RecordingEmailSender>,
    pub google: Arc<ScriptedOAuthProvider>,
    pub processor: AuthProcessor,
    pub codec: TokenCodec,
}

pub fn harness() -> Harness {
    harness_with(AuthConfig::new(CRYPT_KEY, FRONTEND_BASE_URL))
}

pub fn harness_with(config: AuthConfig) -> Harness {
    let database = Arc::new(MemoryDatabase::new());
    harness_over(config, database.clone(), database)
}

/// Harness whose processor writes through `storage` while tests inspect `database`
pub fn harness_over(
    config: AuthConfig,
    database: Arc<MemoryDatabase>,
    storage: Arc<dyn Database>,
) -> Harness {
    let email = Arc::new(RecordingEmailSender::default());
    let google = Arc::new(ScriptedOAuthProvider::new());
    let oauth_providers = OAuthProviders::new().with(SessionProvider::Google, google.clone());

    let processor =
        AuthProcessor::from_config(config, storage, email.clone(), oauth_providers).unwrap();

    Harness {
        database,
        email,
        google,
        processor,
        codec: TokenCodec::new(CRYPT_KEY).unwrap(),
    }
}

/// End request echoing `state` back unchanged
pub fn end_with(state: &str) -> SignInEnd {
    SignInEnd {
        start_state: state.to_string(),
        end_state: state.to_string(),
        ip: "203.0.113.7".to_string(),
        device: "Mozilla/5.0".to_string(),
    }
}

pub fn oauth_callback(state: &str) -> String {
    format!("state={}&code={}", state, VALID_OAUTH_CODE)
}

pub fn profile(email: &str, name: Option<&str>) -> OAuthUser {
    OAuthUser {
        email: Some(email.to_string()),
        name: name.map(str::to_string),
        ..OAuthUser::default()
    }
}

/// Full e-mail sign-in with the development code
pub async fn email_sign_in(harness: &Harness, email: &str, start: SignInStart) -> SignInEnded {
    let started = harness
        .processor
        .start_email_sign_in(email, start)
        .await
        .unwrap();

    harness
        .processor
        .end_email_sign_in(
            started.sign_in_code_id,
            DEV_SIGN_IN_CODE,
            end_with(&started.state),
        )
        .await
        .unwrap()
}

/// Full Google sign-in answering with `profile`
pub async fn google_sign_in(
    harness: &Harness,
    profile: OAuthUser,
    start: SignInStart,
) -> SignInEnded {
    harness.google.set_profile(profile);

    let started = harness
        .processor
        .start_oauth_sign_in("google", start)
        .unwrap();

    harness
        .processor
        .end_oauth_sign_in(
            "google",
            &oauth_callback(&started.state),
            end_with(&started.state),
        )
        .await
        .unwrap()
}
