use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use axum_extra::extract::CookieJar;
use tracing::warn;

use super::services::AuthService;
use crate::{
    error::AppError,
    users::{Role, User},
};

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "jwt";

/// Bearer header first, then the session cookie.
pub(crate) fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    CookieJar::from_headers(headers)
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

/// Authenticated user. Extracting it runs [`AuthService::protect`].
pub struct AuthUser(pub User);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    AuthService: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = AuthService::from_ref(state);
        let token = token_from_headers(&parts.headers);
        let user = auth.protect(token.as_deref()).await?;
        Ok(AuthUser(user))
    }
}

/// Role restriction, checked against a user already resolved by [`AuthUser`].
#[derive(Debug, Clone, Copy)]
pub struct RoleGate {
    allowed: &'static [Role],
}

pub const fn restrict_to(allowed: &'static [Role]) -> RoleGate {
    RoleGate { allowed }
}

impl RoleGate {
    pub fn allows(&self, role: Role) -> bool {
        self.allowed.contains(&role)
    }

    pub fn check(&self, user: &User) -> Result<(), AppError> {
        if self.allows(user.role) {
            return Ok(());
        }
        warn!(user_id = %user.id, role = %user.role, "role not allowed");
        Err(AppError::Forbidden)
    }
}

pub const ADMIN_ONLY: RoleGate = restrict_to(&[Role::Admin]);
