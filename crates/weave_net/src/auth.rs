//! Handshake authentication: turn an opaque token into an [`Identity`].
//!
//! Gates accept any [`Authenticator`]. Two implementations ship here: a
//! fixed token table for tests and tooling, and an HMAC-style signed token
//! shared between gates and nodes.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::NetError;
use crate::identity::{Identity, Role};

/// Verifies the token presented in a handshake `cmd-result` frame.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, token: &[u8]) -> Result<Identity, NetError>;
}

impl<F> Authenticator for F
where
    F: Fn(&[u8]) -> Result<Identity, NetError> + Send + Sync + 'static,
{
    fn authenticate(&self, token: &[u8]) -> Result<Identity, NetError> {
        self(token)
    }
}

/// A fixed table of token to identity.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    tokens: HashMap<Vec<u8>, Identity>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<Vec<u8>>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, token: &[u8]) -> Result<Identity, NetError> {
        self.tokens
            .get(token)
            .copied()
            .ok_or_else(|| NetError::Auth("unknown token".into()))
    }
}

// ---------------------------------------------------------------------------
// Signed tokens
// ---------------------------------------------------------------------------
//
// Format: `<user_id>.<role>.<expiry unix secs>.<hex sha256(secret || payload)>`
// where payload is the first three dot-separated fields.

fn signature(secret: &[u8], payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Issues signed tokens for a shared secret.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn sign_until(&self, identity: Identity, expiry: DateTime<Utc>) -> String {
        let payload = format!(
            "{}.{}.{}",
            identity.user_id,
            identity.role.0,
            expiry.timestamp()
        );
        let sig = signature(&self.secret, &payload);
        format!("{payload}.{sig}")
    }

    pub fn sign(&self, identity: Identity, ttl: Duration) -> String {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expiry = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.sign_until(identity, expiry)
    }
}

/// Verifies tokens issued by a [`TokenSigner`] with the same secret.
#[derive(Clone)]
pub struct SignedTokenAuthenticator {
    secret: Vec<u8>,
}

impl SignedTokenAuthenticator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn verify_at(&self, token: &[u8], now: DateTime<Utc>) -> Result<Identity, NetError> {
        let token = std::str::from_utf8(token)
            .map_err(|_| NetError::Auth("token is not utf-8".into()))?;
        let (payload, sig) = token
            .rsplit_once('.')
            .ok_or_else(|| NetError::Auth("malformed token".into()))?;

        let expected = signature(&self.secret, payload);
        if !constant_time_eq(expected.as_bytes(), sig.as_bytes()) {
            return Err(NetError::Auth("bad signature".into()));
        }

        let mut fields = payload.split('.');
        let (Some(user_id), Some(role), Some(expiry), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(NetError::Auth("malformed token".into()));
        };
        let parse_err = |what: &str| NetError::Auth(format!("bad {what} in token"));
        let user_id: u32 = user_id.parse().map_err(|_| parse_err("user id"))?;
        let role: u16 = role.parse().map_err(|_| parse_err("role"))?;
        let expiry: i64 = expiry.parse().map_err(|_| parse_err("expiry"))?;

        if expiry <= now.timestamp() {
            return Err(NetError::Auth("token expired".into()));
        }
        Ok(Identity::new(user_id, Role(role)))
    }
}

impl Authenticator for SignedTokenAuthenticator {
    fn authenticate(&self, token: &[u8]) -> Result<Identity, NetError> {
        self.verify_at(token, Utc::now())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
