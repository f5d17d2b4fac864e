//! Sealing of States and Tokens as PASETO v4.local tokens
//!
//! A single symmetric key, derived from the configured secret, encrypts and
//! authenticates every payload. Opening fails closed: a wrong key, a modified
//! byte, a truncated token or an unexpected payload shape all produce the same
//! [`CodecError::Invalid`].

use pasetors::Local;
use pasetors::keys::SymmetricKey;
use pasetors::token::UntrustedToken;
use pasetors::version4::{LocalToken, V4};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

use crate::models::{State, Token, TokenPrivate, TokenPublic};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Anything wrong with a sealed input; deliberately carries no detail
    #[error("Malformed or tampered payload")]
    Invalid,

    #[error("Failed to seal payload: {0}")]
    Seal(String),

    #[error("Invalid sealing key: {0}")]
    Key(String),
}

/// Authenticated encryption of the opaque blobs handed to browsers
pub struct TokenCodec {
    key: SymmetricKey<V4>,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Derive the 256-bit key from `secret`
    pub fn new(secret: &str) -> Result<Self, CodecError> {
        let digest = Sha256::digest(secret.as_bytes());
        let key = SymmetricKey::<V4>::from(digest.as_slice())
            .map_err(|e| CodecError::Key(e.to_string()))?;

        Ok(Self { key })
    }

    pub fn seal_state(&self, state: &State) -> Result<String, CodecError> {
        self.seal(state, None)
    }

    pub fn open_state(&self, sealed: &str) -> Result<State, CodecError> {
        let (state, _) = self.open(sealed)?;
        Ok(state)
    }

    /// The public part travels as the authenticated footer
    pub fn seal_token(&self, token: &Token) -> Result<String, CodecError> {
        let footer =
            serde_json::to_vec(&token.public).map_err(|e| CodecError::Seal(e.to_string()))?;
        self.seal(&token.private, Some(&footer))
    }

    pub fn open_token(&self, sealed: &str) -> Result<Token, CodecError> {
        let (private, footer) = self.open::<TokenPrivate>(sealed)?;
        let public: TokenPublic =
            serde_json::from_slice(&footer).map_err(|_| CodecError::Invalid)?;

        Ok(Token { private, public })
    }

    fn seal<P: Serialize>(&self, payload: &P, footer: Option<&[u8]>) -> Result<String, CodecError> {
        let message = serde_json::to_vec(payload).map_err(|e| CodecError::Seal(e.to_string()))?;

        LocalToken::encrypt(&self.key, &message, footer, None)
            .map_err(|e| CodecError::Seal(e.to_string()))
    }

    fn open<P: DeserializeOwned>(&self, sealed: &str) -> Result<(P, Vec<u8>), CodecError> {
        let untrusted =
            UntrustedToken::<Local, V4>::try_from(sealed).map_err(|_| CodecError::Invalid)?;
        let trusted = LocalToken::decrypt(&self.key, &untrusted, None, None)
            .map_err(|_| CodecError::Invalid)?;
        let payload = serde_json::from_str(trusted.payload()).map_err(|_| CodecError::Invalid)?;

        Ok((payload, trusted.footer().to_vec()))
    }
}
