//! Passwordless e-mail sign-in codes

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SIGN_IN_CODE_LENGTH: usize = 6;
pub const SIGN_IN_CODE_MAX_ATTEMPTS: i32 = 3;
/// Code issued outside production so flows can be exercised without a mailbox
pub const DEV_SIGN_IN_CODE: &str = "123456";

const SIGN_IN_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn sign_in_code_expiration() -> Duration {
    Duration::minutes(5)
}

/// Short-lived code sent to an e-mail address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInCode {
    pub id: Uuid,
    pub email: String,
    pub code: String,
    pub attempts: i32,
    pub expires_at: DateTime<Utc>,
}

impl SignInCode {
    pub fn new(email: &str, code: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
            code,
            attempts: 0,
            expires_at: now + sign_in_code_expiration(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Random upper-case alphanumeric code
    pub fn generate_code() -> String {
        let mut rng = rand::thread_rng();
        (0..SIGN_IN_CODE_LENGTH)
            .map(|_| SIGN_IN_CODE_CHARSET[rng.gen_range(0..SIGN_IN_CODE_CHARSET.len())] as char)
            .collect()
    }
}
