use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    User,
    Guide,
    LeadGuide,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Guide => "guide",
            Role::LeadGuide => "lead-guide",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "guide" => Ok(Role::Guide),
            "lead-guide" => Ok(Role::LeadGuide),
            "admin" => Ok(Role::Admin),
            other => anyhow::bail!("unknown role {other:?}"),
        }
    }
}

/// User record. Credential fields never reach JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    /// Only populated when the read asked for [`Select::WithPassword`].
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub password_changed_at: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub password_reset_token: Option<String>,
    #[serde(skip_serializing)]
    pub password_reset_expires: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl User {
    /// True when the password was changed after a token issued at `issued_at`
    /// (unix seconds).
    pub fn password_changed_after(&self, issued_at: i64) -> bool {
        match self.password_changed_at {
            Some(changed) => issued_at < changed.unix_timestamp(),
            None => false,
        }
    }
}

/// Which columns a read returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Select {
    #[default]
    Public,
    WithPassword,
}

/// Whether field-level checks run on a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Validated,
    Unvalidated,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordReset {
    pub token_hash: String,
    pub expires_at: OffsetDateTime,
}

/// Partial update. `password_reset: Some(None)` clears both reset columns.
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub password_changed_at: Option<OffsetDateTime>,
    pub password_reset: Option<Option<PasswordReset>>,
    pub active: Option<bool>,
}

impl UserPatch {
    pub fn password(hash: String, changed_at: OffsetDateTime) -> Self {
        Self {
            password_hash: Some(hash),
            password_changed_at: Some(changed_at),
            ..Self::default()
        }
    }

    pub fn set_reset(reset: PasswordReset) -> Self {
        Self {
            password_reset: Some(Some(reset)),
            ..Self::default()
        }
    }

    pub fn clear_reset() -> Self {
        Self::default().and_clear_reset()
    }

    pub fn and_clear_reset(mut self) -> Self {
        self.password_reset = Some(None);
        self
    }

    pub fn deactivate() -> Self {
        Self {
            active: Some(false),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.email.is_none()
            && self.password_hash.is_none()
            && self.password_changed_at.is_none()
            && self.password_reset.is_none()
            && self.active.is_none()
    }

    /// Applies the patch onto a full record.
    pub fn apply(self, user: &mut User) {
        if let Some(name) = self.name {
            user.name = name;
        }
        if let Some(email) = self.email {
            user.email = email;
        }
        if let Some(hash) = self.password_hash {
            user.password_hash = Some(hash);
        }
        if let Some(changed) = self.password_changed_at {
            user.password_changed_at = Some(changed);
        }
        if let Some(reset) = self.password_reset {
            match reset {
                Some(r) => {
                    user.password_reset_token = Some(r.token_hash);
                    user.password_reset_expires = Some(r.expires_at);
                }
                None => {
                    user.password_reset_token = None;
                    user.password_reset_expires = None;
                }
            }
        }
        if let Some(active) = self.active {
            user.active = active;
        }
    }
}
