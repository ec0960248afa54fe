use lazy_static::lazy_static;
use regex::Regex;

use super::{
    repo::StoreError,
    repo_types::{NewUser, UserPatch},
};

pub const NAME_MIN_CHARS: usize = 3;
pub const NAME_MAX_CHARS: usize = 255;
pub const PASSWORD_MIN_CHARS: usize = 8;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Trims and lowercases, then checks the format.
pub fn normalize_email(raw: &str) -> Result<String, StoreError> {
    let email = raw.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(StoreError::Invalid("Please provide a valid email".into()));
    }
    Ok(email)
}

pub fn normalize_name(raw: &str) -> Result<String, StoreError> {
    let name = raw.trim();
    let len = name.chars().count();
    if !(NAME_MIN_CHARS..=NAME_MAX_CHARS).contains(&len) {
        return Err(StoreError::Invalid(format!(
            "A user name must be between {NAME_MIN_CHARS} and {NAME_MAX_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

/// Checked before hashing; the store only ever sees the hash.
pub fn validate_password_pair(password: &str, confirm: &str) -> Result<(), StoreError> {
    if password.chars().count() < PASSWORD_MIN_CHARS {
        return Err(StoreError::Invalid(format!(
            "Password must be at least {PASSWORD_MIN_CHARS} characters"
        )));
    }
    if password != confirm {
        return Err(StoreError::Invalid("Passwords are not the same".into()));
    }
    Ok(())
}

pub fn validate_new_user(mut user: NewUser) -> Result<NewUser, StoreError> {
    user.name = normalize_name(&user.name)?;
    user.email = normalize_email(&user.email)?;
    if user.password_hash.is_empty() {
        return Err(StoreError::Invalid("A user must have a password".into()));
    }
    Ok(user)
}

pub fn validate_patch(mut patch: UserPatch) -> Result<UserPatch, StoreError> {
    if let Some(name) = patch.name.as_deref() {
        patch.name = Some(normalize_name(name)?);
    }
    if let Some(email) = patch.email.as_deref() {
        patch.email = Some(normalize_email(email)?);
    }
    if matches!(patch.password_hash.as_deref(), Some("")) {
        return Err(StoreError::Invalid("A user must have a password".into()));
    }
    Ok(patch)
}
