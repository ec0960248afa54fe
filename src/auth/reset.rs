use std::fmt;

use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    error::AppError,
    users::{PasswordReset, User, UserStore},
};

pub const RESET_TOKEN_BYTES: usize = 32;
pub const RESET_TOKEN_TTL: Duration = Duration::minutes(10);

/// A freshly issued password-reset token. Only `hashed` and `expires_at`
/// are ever persisted.
#[derive(Clone)]
pub struct ResetToken {
    pub plaintext: String,
    pub hashed: String,
    pub expires_at: OffsetDateTime,
}

impl fmt::Debug for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetToken")
            .field("plaintext", &"<redacted>")
            .field("hashed", &self.hashed)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl ResetToken {
    pub fn issue() -> Self {
        Self::issue_at(OffsetDateTime::now_utc())
    }

    pub fn issue_at(now: OffsetDateTime) -> Self {
        let mut raw = [0u8; RESET_TOKEN_BYTES];
        OsRng.fill_bytes(&mut raw);
        let plaintext = hex::encode(raw);
        Self {
            hashed: hash_reset_token(&plaintext),
            plaintext,
            expires_at: now + RESET_TOKEN_TTL,
        }
    }

    pub fn to_record(&self) -> PasswordReset {
        PasswordReset {
            token_hash: self.hashed.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Lowercase hex SHA-256.
pub fn hash_reset_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Finds the user a plaintext token was issued to, provided it is still
/// outstanding at `now`. Clearing the reset fields is up to the caller.
pub async fn redeem(
    users: &dyn UserStore,
    plaintext: &str,
    now: OffsetDateTime,
) -> Result<User, AppError> {
    let hashed = hash_reset_token(plaintext.trim());
    match users.find_by_reset_token(&hashed, now).await? {
        Some(user) => {
            debug!(user_id = %user.id, "reset token matched");
            Ok(user)
        }
        None => Err(AppError::TokenInvalidOrExpired),
    }
}
