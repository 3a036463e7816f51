//! Credential verification
//!
//! Two acceptance paths, checked by the server in order: an `x-api-key`
//! header carrying an `agentflow_`-prefixed opaque key, then a session
//! cookie minted by the email sign-in flow. Both resolve to a `userId`.
//!
//! Secrets never hit the database in the clear: API keys and session tokens
//! are stored as SHA-256 digests (tokens peppered with the server secret),
//! passwords as salted iterated digests.

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{now_ms, ApiKey, User};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Prefix carried by every issued API key.
pub const API_KEY_PREFIX: &str = "agentflow_";

/// Session cookie name set by the sign-in flow.
pub const SESSION_COOKIE: &str = "agentflow_session";

const SESSION_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const PASSWORD_HASH_ITERATIONS: u32 = 100_000;

/// Credential store and verifier.
pub struct AuthService {
    db: Arc<Database>,
    secret: String,
}

impl AuthService {
    pub fn new(db: Arc<Database>, config: &Config) -> Result<Self> {
        let secret = config
            .auth_secret
            .clone()
            .ok_or_else(|| Error::Config("BETTER_AUTH_SECRET is not set".to_string()))?;
        Ok(Self { db, secret })
    }

    // ============================================
    // Users
    // ============================================

    /// Create a user. Public sign-up is disabled by policy; this is only
    /// reachable server-side (invite redemption, CLI bootstrap, tests).
    pub fn create_user(&self, email: &str, name: Option<&str>, password: &str) -> Result<User> {
        let email = email.trim().to_ascii_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::Config(format!("invalid email: {}", email)));
        }
        if password.len() < 8 {
            return Err(Error::Config("password must be at least 8 characters".into()));
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            email,
            name: name.map(|n| n.to_string()),
            created_at: now_ms(),
        };
        self.db.insert_user(&user, &hash_password(password))?;
        Ok(user)
    }

    /// Verify an email/password pair and mint a session token.
    ///
    /// Returns the user and the raw token (only ever exposed here); the
    /// store keeps a peppered digest.
    pub fn sign_in(&self, email: &str, password: &str) -> Result<Option<(User, String)>> {
        let email = email.trim().to_ascii_lowercase();
        let Some((user, stored_hash)) = self.db.get_user_by_email(&email)? else {
            return Ok(None);
        };
        if !verify_password(password, &stored_hash) {
            return Ok(None);
        }

        let token = random_token();
        let created_at = now_ms();
        self.db.insert_auth_session(
            &self.token_digest(&token),
            &user.id,
            created_at,
            created_at + SESSION_TTL_MS,
        )?;
        Ok(Some((user, token)))
    }

    /// Resolve a session cookie token to its user, honoring expiry.
    pub fn verify_session_token(&self, token: &str) -> Result<Option<String>> {
        let digest = self.token_digest(token);
        let Some((user_id, expires_at)) = self.db.get_auth_session(&digest)? else {
            return Ok(None);
        };
        if expires_at < now_ms() {
            self.db.delete_auth_session(&digest)?;
            return Ok(None);
        }
        Ok(Some(user_id))
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.db.get_user(id)
    }

    // ============================================
    // API keys
    // ============================================

    /// Issue an API key for a user. The raw key is returned exactly once.
    pub fn create_api_key(&self, user_id: &str, name: Option<&str>) -> Result<(ApiKey, String)> {
        let raw = format!("{}{}", API_KEY_PREFIX, random_token());
        let key = ApiKey {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.map(|n| n.to_string()),
            created_at: now_ms(),
            last_used_at: None,
        };
        self.db.insert_api_key(&key, &sha256_hex(raw.as_bytes()))?;
        Ok((key, raw))
    }

    /// Resolve an `x-api-key` value to its user. Values without the
    /// `agentflow_` prefix are rejected without a lookup.
    pub fn verify_api_key(&self, token: &str) -> Result<Option<String>> {
        if !token.starts_with(API_KEY_PREFIX) {
            return Ok(None);
        }
        self.db.find_api_key_user(&sha256_hex(token.as_bytes()))
    }

    fn token_digest(&self, token: &str) -> String {
        sha256_hex(format!("{}:{}", self.secret, token).as_bytes())
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn random_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt_hex = hex::encode(salt);
    format!("{}${}", salt_hex, iterate_digest(&salt_hex, password))
}

fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    iterate_digest(salt, password) == digest
}

fn iterate_digest(salt: &str, password: &str) -> String {
    let mut current = format!("{}:{}", salt, password).into_bytes();
    for _ in 0..PASSWORD_HASH_ITERATIONS {
        let mut hasher = Sha256::new();
        hasher.update(&current);
        current = hasher.finalize().to_vec();
    }
    hex::encode(current)
}
