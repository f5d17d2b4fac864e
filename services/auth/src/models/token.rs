//! Sealed payloads: the sign-in State and the session Token
//!
//! Neither is persisted. Their authenticity rests entirely on the
//! authenticated encryption applied by [`crate::codec::TokenCodec`].

use chrono::{DateTime, Duration, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SessionProvider;

pub const NONCE_LENGTH: usize = 8;

pub fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LENGTH)
        .map(char::from)
        .collect()
}

/// Correlates the start and end requests of a sign-in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub redirect_to: Option<String>,
    /// Token held by the browser when the sign-in started
    pub previous_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
}

impl State {
    pub fn new(
        redirect_to: Option<String>,
        previous_token: Option<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            redirect_to,
            previous_token,
            expires_at: now + ttl,
            nonce: generate_nonce(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Encrypted part of a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPrivate {
    pub session_id: Uuid,
    pub provider: SessionProvider,
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
}

/// Authenticated but readable part of a token, carried as the footer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPublic {}

/// Bearer credential of an authenticated session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub private: TokenPrivate,
    pub public: TokenPublic,
}

impl Token {
    pub fn new(
        session_id: Uuid,
        provider: SessionProvider,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            private: TokenPrivate {
                session_id,
                provider,
                expires_at: now + ttl,
                nonce: generate_nonce(),
            },
            public: TokenPublic::default(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.private.expires_at
    }
}
