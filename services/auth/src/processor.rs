//! Sign-in orchestration
//!
//! A sign-in spans two unrelated requests. The start phase seals a [`State`]
//! and hands it to the browser; the end phase gets it back twice (once from
//! the cookie, once from the provider callback), checks both copies match,
//! and only then resolves the user, creates the session and mints a token.
//!
//! Account resolution at the end phase, in order:
//!
//! 1. a still valid token held when the sign-in started links the new
//!    provider to its session, as long as the e-mail is the same;
//! 2. an existing user with the e-mail gets a new session;
//! 3. otherwise a user is created, joining the organization that invited
//!    them, or the organization owning their e-mail domain when it has domain
//!    sign-in enabled, or a brand new trial organization they administer.

use chrono::{DateTime, Utc};
use common::error::DatabaseError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::codec::TokenCodec;
use crate::config::AuthConfig;
use crate::email::{EmailSender, sign_in_code_message};
use crate::error::{AuthError, AuthResult};
use crate::models::{
    DEV_SIGN_IN_CODE, Organization, SIGN_IN_CODE_MAX_ATTEMPTS, Session, SessionLocation,
    SessionProvider, SignInCode, State, Token, USER_DEFAULT_PICTURE, User, UserRole,
};
use crate::oauth::{OAuthProvider, OAuthProviders};
use crate::repositories::{Database, Repositories};
use crate::validation::{email_domain, email_local_part, same_origin, validate_email};
use crate::verifier::AuthVerifier;

/// How many times the end phase transaction runs when it loses a uniqueness race
const SIGN_IN_TRANSACTION_ATTEMPTS: usize = 3;

/// Request data shared by every start phase
#[derive(Debug, Clone, Default)]
pub struct SignInStart {
    /// Where the frontend wants to land after signing in
    pub redirect_to: Option<String>,
    /// Token the browser currently holds, used for account linking
    pub current_token: Option<String>,
}

/// Request data shared by every end phase
#[derive(Debug, Clone)]
pub struct SignInEnd {
    /// State stored client side when the sign-in started
    pub start_state: String,
    /// State echoed back by the provider callback
    pub end_state: String,
    pub ip: String,
    pub device: String,
}

/// Way of signing in, with what the start phase needs for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInMethod {
    Email { email: String },
    OAuth { provider: String },
    Saml,
}

/// Proof of identity presented at the end phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInProof {
    Email { sign_in_code_id: Uuid, code: String },
    OAuth { provider: String, auth_result: String },
    Saml,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailSignInStarted {
    pub state: String,
    pub sign_in_code_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectSignInStarted {
    pub state: String,
    pub auth_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInStarted {
    Email(EmailSignInStarted),
    Redirect(RedirectSignInStarted),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInEnded {
    pub token: String,
    pub redirect_to: Option<String>,
}

/// Who the provider says is signing in
#[derive(Debug, Clone)]
struct SignInIdentity {
    provider: SessionProvider,
    email: String,
    name: String,
    picture: String,
}

/// Outcome of looking up the organization owning an e-mail domain
enum DomainOwner {
    Free,
    Joinable(Uuid),
    /// Owned by a live organization without domain sign-in
    Taken,
}

pub struct AuthProcessor {
    config: Arc<AuthConfig>,
    codec: Arc<TokenCodec>,
    database: Arc<dyn Database>,
    verifier: AuthVerifier,
    email_sender: Arc<dyn EmailSender>,
    oauth_providers: OAuthProviders,
}

impl AuthProcessor {
    pub fn new(
        config: Arc<AuthConfig>,
        codec: Arc<TokenCodec>,
        database: Arc<dyn Database>,
        verifier: AuthVerifier,
        email_sender: Arc<dyn EmailSender>,
        oauth_providers: OAuthProviders,
    ) -> Self {
        Self {
            config,
            codec,
            database,
            verifier,
            email_sender,
            oauth_providers,
        }
    }

    /// Wire a processor and its verifier around one sealing key
    pub fn from_config(
        config: AuthConfig,
        database: Arc<dyn Database>,
        email_sender: Arc<dyn EmailSender>,
        oauth_providers: OAuthProviders,
    ) -> AuthResult<Self> {
        let codec = Arc::new(
            TokenCodec::new(&config.crypt_key).map_err(|e| AuthError::Generic(e.to_string()))?,
        );
        let verifier = AuthVerifier::new(codec.clone(), database.clone());

        Ok(Self::new(
            Arc::new(config),
            codec,
            database,
            verifier,
            email_sender,
            oauth_providers,
        ))
    }

    pub fn verifier(&self) -> &AuthVerifier {
        &self.verifier
    }

    pub async fn start_sign_in(
        &self,
        method: SignInMethod,
        start: SignInStart,
    ) -> AuthResult<SignInStarted> {
        match method {
            SignInMethod::Email { email } => self
                .start_email_sign_in(&email, start)
                .await
                .map(SignInStarted::Email),
            SignInMethod::OAuth { provider } => self
                .start_oauth_sign_in(&provider, start)
                .map(SignInStarted::Redirect),
            SignInMethod::Saml => self.start_saml_sign_in(start).map(SignInStarted::Redirect),
        }
    }

    pub async fn end_sign_in(&self, proof: SignInProof, end: SignInEnd) -> AuthResult<SignInEnded> {
        match proof {
            SignInProof::Email {
                sign_in_code_id,
                code,
            } => self.end_email_sign_in(sign_in_code_id, &code, end).await,
            SignInProof::OAuth {
                provider,
                auth_result,
            } => self.end_oauth_sign_in(&provider, &auth_result, end).await,
            SignInProof::Saml => self.end_saml_sign_in(end).await,
        }
    }

    /// Send a one-time code to `email`
    ///
    /// The code is only stored if the e-mail carrying it was accepted for
    /// delivery.
    pub async fn start_email_sign_in(
        &self,
        email: &str,
        start: SignInStart,
    ) -> AuthResult<EmailSignInStarted> {
        validate_email(email).map_err(AuthError::InvalidEmail)?;

        let now = Utc::now();
        let state = self.seal_state(start, now)?;

        let tx = self.database.begin().await?;
        let sign_in_codes = tx.repositories().sign_in_codes();

        if let Some(existing) = sign_in_codes.get_by_email(email).await? {
            if !existing.is_expired_at(now) {
                return Err(AuthError::SignInCodeAlreadyRequested);
            }
            sign_in_codes.delete_by_id(existing.id).await?;
        }

        let code = if self.config.environment.is_production() {
            SignInCode::generate_code()
        } else {
            DEV_SIGN_IN_CODE.to_string()
        };
        let sign_in_code = SignInCode::new(email, code, now);
        sign_in_codes
            .create(&sign_in_code)
            .await
            .map_err(|e| match e {
                // a concurrent request stored its code first
                DatabaseError::UniqueViolation(_) => AuthError::SignInCodeAlreadyRequested,
                e => e.into(),
            })?;

        let link = self.email_sign_in_link(&sign_in_code, &state)?;
        self.email_sender
            .send(&sign_in_code_message(email, &sign_in_code.code, &link))
            .await
            .map_err(|e| AuthError::Generic(e.to_string()))?;

        tx.commit().await?;

        info!("Sign in code sent: {}", sign_in_code.id);

        Ok(EmailSignInStarted {
            state,
            sign_in_code_id: sign_in_code.id,
        })
    }

    /// Build the provider authorization URL correlated with a fresh state
    pub fn start_oauth_sign_in(
        &self,
        provider: &str,
        start: SignInStart,
    ) -> AuthResult<RedirectSignInStarted> {
        let (provider, implementation) = self.oauth_provider(provider)?;

        let state = self.seal_state(start, Utc::now())?;
        let session = implementation
            .begin_auth(&state)
            .map_err(|e| AuthError::Generic(e.to_string()))?;

        info!("Starting {} sign in", provider);

        Ok(RedirectSignInStarted {
            state,
            auth_url: session.auth_url,
        })
    }

    pub fn start_saml_sign_in(&self, _start: SignInStart) -> AuthResult<RedirectSignInStarted> {
        Err(AuthError::Generic("SAML not implemented".to_string()))
    }

    pub async fn end_email_sign_in(
        &self,
        sign_in_code_id: Uuid,
        code: &str,
        end: SignInEnd,
    ) -> AuthResult<SignInEnded> {
        let now = Utc::now();
        let sign_in_codes = self.database.repositories().sign_in_codes();

        let sign_in_code = sign_in_codes
            .get_by_id(sign_in_code_id)
            .await?
            .ok_or_else(|| invalid_sign_in_code("no sign in code linked"))?;

        if sign_in_code.is_expired_at(now) {
            return Err(invalid_sign_in_code("sign in code expired"));
        }

        // concurrent guesses each get their own count
        let attempts = sign_in_codes
            .increment_attempts(sign_in_code.id)
            .await
            .map_err(|e| match e {
                DatabaseError::UnexpectedEffect { .. } => {
                    invalid_sign_in_code("no sign in code linked")
                }
                e => e.into(),
            })?;
        if attempts > SIGN_IN_CODE_MAX_ATTEMPTS {
            return Err(invalid_sign_in_code("max attempts reached"));
        }

        if sign_in_code.code != code {
            return Err(invalid_sign_in_code("code doesn't match"));
        }

        sign_in_codes.delete_by_id(sign_in_code.id).await?;

        let identity = SignInIdentity {
            provider: SessionProvider::Email,
            name: email_local_part(&sign_in_code.email).to_string(),
            picture: USER_DEFAULT_PICTURE.to_string(),
            email: sign_in_code.email,
        };

        self.finish_sign_in(identity, end).await
    }

    /// Complete an OAuth sign-in from the raw callback query or form body
    pub async fn end_oauth_sign_in(
        &self,
        provider: &str,
        auth_result: &str,
        end: SignInEnd,
    ) -> AuthResult<SignInEnded> {
        let (provider, implementation) = self.oauth_provider(provider)?;

        let mut session = implementation
            .begin_auth(&end.start_state)
            .map_err(|e| AuthError::Generic(e.to_string()))?;

        let values = parse_callback_values(auth_result)?;
        implementation
            .authorize(&mut session, &values)
            .await
            .map_err(|e| AuthError::InvalidOAuthResult(e.to_string()))?;

        let profile = implementation
            .fetch_user(&session)
            .await
            .map_err(|e| AuthError::Generic(e.to_string()))?;

        let email = profile
            .email
            .filter(|email| !email.trim().is_empty())
            .ok_or_else(|| AuthError::InvalidOAuthResult("no email in profile".to_string()))?;

        let name = [profile.name, profile.first_name, profile.nickname]
            .into_iter()
            .flatten()
            .find(|name| !name.trim().is_empty())
            .unwrap_or_else(|| email_local_part(&email).to_string());

        let picture = profile
            .avatar_url
            .filter(|picture| !picture.trim().is_empty())
            .unwrap_or_else(|| USER_DEFAULT_PICTURE.to_string());

        let identity = SignInIdentity {
            provider,
            email,
            name,
            picture,
        };

        self.finish_sign_in(identity, end).await
    }

    pub async fn end_saml_sign_in(&self, _end: SignInEnd) -> AuthResult<SignInEnded> {
        Err(AuthError::Generic("SAML not implemented".to_string()))
    }

    /// Expire the session; tokens pointing at it stop verifying
    pub async fn sign_out(&self, session: &Session) -> AuthResult<()> {
        self.database
            .repositories()
            .sessions()
            .update_expired_at(session.id, Utc::now())
            .await?;

        info!("Session signed out: {}", session.id);
        Ok(())
    }

    fn seal_state(&self, start: SignInStart, now: DateTime<Utc>) -> AuthResult<String> {
        let state = State::new(
            start.redirect_to,
            start.current_token,
            self.config.state_ttl(),
            now,
        );

        self.codec
            .seal_state(&state)
            .map_err(|e| AuthError::Generic(e.to_string()))
    }

    fn email_sign_in_link(&self, sign_in_code: &SignInCode, state: &str) -> AuthResult<String> {
        let mut link = Url::parse(&format!(
            "{}/dash/signin/email/end",
            self.config.frontend_base_url.trim_end_matches('/')
        ))
        .map_err(|e| AuthError::Generic(format!("invalid frontend base URL: {}", e)))?;

        link.query_pairs_mut()
            .append_pair("id", &sign_in_code.id.to_string())
            .append_pair("code", &sign_in_code.code)
            .append_pair("state", state);

        Ok(link.into())
    }

    fn oauth_provider(
        &self,
        name: &str,
    ) -> AuthResult<(SessionProvider, Arc<dyn OAuthProvider>)> {
        let unsupported = || AuthError::InvalidOAuthProvider(name.to_string());

        let provider: SessionProvider = name.parse().map_err(|_| unsupported())?;
        if !provider.is_oauth() {
            return Err(unsupported());
        }

        let implementation = self.oauth_providers.get(provider).ok_or_else(unsupported)?;
        Ok((provider, implementation))
    }

    async fn finish_sign_in(
        &self,
        identity: SignInIdentity,
        end: SignInEnd,
    ) -> AuthResult<SignInEnded> {
        if end.start_state != end.end_state {
            return Err(AuthError::InvalidState("state doesn't match".to_string()));
        }

        let state = self
            .codec
            .open_state(&end.start_state)
            .map_err(|e| AuthError::InvalidState(e.to_string()))?;

        if state.is_expired_at(Utc::now()) {
            return Err(AuthError::InvalidState("state expired".to_string()));
        }

        if let Some(redirect_to) = &state.redirect_to {
            if !same_origin(&self.config.frontend_base_url, redirect_to) {
                return Err(AuthError::InvalidState(
                    "redirect target is not on the frontend origin".to_string(),
                ));
            }
        }

        let mut attempt = 1;
        let token = loop {
            match self.sign_in_once(&identity, &state, &end).await {
                Err(AuthError::Conflict(reason)) if attempt < SIGN_IN_TRANSACTION_ATTEMPTS => {
                    warn!(
                        "Sign in attempt {} lost a concurrent write, retrying: {}",
                        attempt, reason
                    );
                    attempt += 1;
                }
                result => break result?,
            }
        };

        Ok(SignInEnded {
            token,
            redirect_to: state.redirect_to,
        })
    }

    async fn sign_in_once(
        &self,
        identity: &SignInIdentity,
        state: &State,
        end: &SignInEnd,
    ) -> AuthResult<String> {
        let tx = self.database.begin().await?;
        let token = self
            .sign_in_within(tx.repositories(), identity, state, end)
            .await?;
        tx.commit().await?;

        Ok(token)
    }

    async fn sign_in_within(
        &self,
        repositories: &dyn Repositories,
        identity: &SignInIdentity,
        state: &State,
        end: &SignInEnd,
    ) -> AuthResult<String> {
        let now = Utc::now();

        let linked = match &state.previous_token {
            Some(previous_token) => {
                self.linked_session(repositories, identity, previous_token)
                    .await?
            }
            None => None,
        };

        let session = match linked {
            Some(session) => session,
            None => {
                let user = self.resolve_user(repositories, identity, now).await?;
                let session = Session::new(
                    user.id,
                    identity.provider,
                    SessionLocation {
                        ip: end.ip.clone(),
                        device: end.device.clone(),
                    },
                    now,
                );
                repositories.sessions().create(&session).await?;

                info!(
                    "Created {} session {} for user: {}",
                    session.provider, session.id, user.id
                );
                session
            }
        };

        let token = Token::new(session.id, session.provider, self.config.token_ttl(), now);
        self.codec
            .seal_token(&token)
            .map_err(|e| AuthError::Generic(e.to_string()))
    }

    /// Session the sign-in should attach to, if the browser was signed in
    async fn linked_session(
        &self,
        repositories: &dyn Repositories,
        identity: &SignInIdentity,
        previous_token: &str,
    ) -> AuthResult<Option<Session>> {
        let verified = match self
            .verifier
            .check_token_with(repositories, previous_token)
            .await
        {
            Ok(verified) => verified,
            Err(AuthError::InvalidToken(reason)) => {
                debug!("Ignoring previous token: {}", reason);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if verified.user.email != identity.email {
            return Err(AuthError::InvalidState(
                "multiple emails for the same user not supported".to_string(),
            ));
        }

        let mut session = verified.session;
        if session.provider != identity.provider {
            repositories
                .sessions()
                .update_provider(session.id, identity.provider)
                .await?;
            info!(
                "Linked session {} from {} to {}",
                session.id, session.provider, identity.provider
            );
            session.provider = identity.provider;
        }

        Ok(Some(session))
    }

    async fn resolve_user(
        &self,
        repositories: &dyn Repositories,
        identity: &SignInIdentity,
        now: DateTime<Utc>,
    ) -> AuthResult<User> {
        if let Some(user) = repositories.users().get_by_email(&identity.email).await? {
            if !user.is_deleted() {
                return Ok(user);
            }

            info!("Releasing email of deleted user: {}", user.id);
            repositories
                .users()
                .update_email(user.id, &user.anonymized_email())
                .await?;
        }

        self.create_user(repositories, identity, now).await
    }

    async fn create_user(
        &self,
        repositories: &dyn Repositories,
        identity: &SignInIdentity,
        now: DateTime<Utc>,
    ) -> AuthResult<User> {
        let domain = email_domain(&identity.email)
            .ok_or_else(|| AuthError::InvalidEmail(format!("no domain in {}", identity.email)))?;

        let membership = match self
            .invited_membership(repositories, &identity.email, now)
            .await?
        {
            Some(membership) => membership,
            None => match self.domain_owner(repositories, domain).await? {
                DomainOwner::Joinable(organization_id) => (organization_id, UserRole::Member),
                owner => {
                    let claim_domain = matches!(owner, DomainOwner::Free);
                    let organization =
                        Organization::new_trial(&identity.email, domain, claim_domain, now);
                    repositories.organizations().create(&organization).await?;

                    info!(
                        "Created trial organization {} for domain: {}",
                        organization.id, organization.domain
                    );
                    (organization.id, UserRole::Admin)
                }
            },
        };

        let (organization_id, role) = membership;
        let user = User::new(
            organization_id,
            identity.name.clone(),
            identity.picture.clone(),
            identity.email.clone(),
            role,
            now,
        );
        repositories.users().create(&user).await?;

        info!(
            "Created {} user {} in organization: {}",
            role, user.id, organization_id
        );
        Ok(user)
    }

    /// Membership granted by a pending invitation, consuming it
    async fn invited_membership(
        &self,
        repositories: &dyn Repositories,
        email: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<(Uuid, UserRole)>> {
        let Some(invitation) = repositories.invitations().get_by_email(email).await? else {
            return Ok(None);
        };

        let mut membership = None;
        if invitation.is_valid_at(now) {
            let organization = repositories
                .organizations()
                .get_by_id(invitation.organization_id)
                .await?
                .ok_or_else(|| AuthError::Generic("no organization linked".to_string()))?;

            if organization.is_deleted() {
                return Err(AuthError::UnauthorizedUser(
                    "organization is deleted".to_string(),
                ));
            }

            membership = Some((organization.id, invitation.role));
        }

        repositories.invitations().delete_by_id(invitation.id).await?;
        Ok(membership)
    }

    async fn domain_owner(
        &self,
        repositories: &dyn Repositories,
        domain: &str,
    ) -> AuthResult<DomainOwner> {
        let Some(organization) = repositories.organizations().get_by_domain(domain).await? else {
            return Ok(DomainOwner::Free);
        };

        if organization.is_deleted() {
            info!("Releasing domain of deleted organization: {}", organization.id);
            repositories
                .organizations()
                .update_domain(organization.id, &organization.released_domain())
                .await?;
            return Ok(DomainOwner::Free);
        }

        if organization.accepts_domain_sign_in() {
            Ok(DomainOwner::Joinable(organization.id))
        } else {
            Ok(DomainOwner::Taken)
        }
    }
}

fn invalid_sign_in_code(reason: &str) -> AuthError {
    AuthError::InvalidSignInCode(reason.to_string())
}

/// Decode a callback query string or form body
fn parse_callback_values(raw: &str) -> AuthResult<HashMap<String, String>> {
    let raw = raw.strip_prefix('?').unwrap_or(raw);
    let malformed = || AuthError::InvalidOAuthResult("malformed callback values".to_string());

    if raw.trim().is_empty() {
        return Err(malformed());
    }

    for pair in raw.split('&').filter(|pair| !pair.is_empty()) {
        let key = pair.split_once('=').map_or(pair, |(key, _)| key);
        if key.is_empty() || pair.contains(';') || !has_valid_escapes(pair) {
            return Err(malformed());
        }
    }

    Ok(url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect())
}

fn has_valid_escapes(value: &str) -> bool {
    let bytes = value.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let escape = bytes.get(index + 1..index + 3);
            if !escape.is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) {
                return false;
            }
            index += 3;
        } else {
            index += 1;
        }
    }
    true
}
