use std::{sync::Arc, time::Duration};

use axum::extract::FromRef;
use lazy_static::lazy_static;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::SignupRequest,
        jwt::JwtKeys,
        password::{hash_password, hash_password_blocking, verify_password_blocking},
        reset::{self, ResetToken, RESET_TOKEN_TTL},
    },
    config::AppConfig,
    error::AppError,
    mail::{Mail, MailSender},
    state::AppState,
    users::{
        validation::{normalize_email, validate_password_pair},
        NewUser, Role, Select, User, UserPatch, UserStore, WriteMode,
    },
};

lazy_static! {
    /// Verified against on the unknown-email login path so both branches
    /// pay for a hash.
    static ref DUMMY_HASH: Option<String> = hash_password("not-a-real-password").ok();
}

/// Token plus the user it was minted for.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub user: User,
}

#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    mailer: Arc<dyn MailSender>,
    keys: JwtKeys,
    config: Arc<AppConfig>,
}

impl FromRef<AppState> for AuthService {
    fn from_ref(state: &AppState) -> Self {
        Self {
            users: state.users.clone(),
            mailer: state.mailer.clone(),
            keys: JwtKeys::from_ref(state),
            config: state.config.clone(),
        }
    }
}

// Backdated so a token minted in the same second as the change stays valid.
fn password_changed_at(now: OffsetDateTime) -> OffsetDateTime {
    now - time::Duration::seconds(1)
}

/// Reads an optional string field; `null` counts as absent.
fn string_field(fields: &Map<String, Value>, key: &str) -> Result<Option<String>, AppError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(AppError::Validation(format!("{key} must be a string"))),
    }
}

impl AuthService {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn issue_token(&self, user_id: Uuid) -> Result<String, AppError> {
        Ok(self.keys.sign(user_id)?)
    }

    fn reset_url(&self, plaintext: &str) -> String {
        format!(
            "{}/api/v1/users/resetPassword/{}",
            self.config.public_base_url.trim_end_matches('/'),
            plaintext
        )
    }

    async fn register(&self, req: SignupRequest, role: Role) -> Result<User, AppError> {
        validate_password_pair(&req.password, &req.password_confirm)?;

        // Cheap duplicate check before paying for the hash; the store still
        // enforces uniqueness on insert.
        let email = normalize_email(&req.email)?;
        if self.users.find_by_email(&email, Select::Public).await?.is_some() {
            warn!(email = %email, "email already registered");
            return Err(AppError::Validation("Email already registered".into()));
        }

        let password_hash = hash_password_blocking(req.password).await?;
        let user = self
            .users
            .create(NewUser {
                name: req.name,
                email,
                role,
                password_hash,
            })
            .await?;
        info!(user_id = %user.id, email = %user.email, role = %user.role, "user registered");
        Ok(user)
    }

    /// Public registration. Only the default role can be self-assigned.
    #[instrument(skip(self, req))]
    pub async fn signup(&self, req: SignupRequest) -> Result<AuthSession, AppError> {
        if let Some(role) = req.role.filter(|r| *r != Role::User) {
            warn!(%role, "signup tried to self-assign a role");
            return Err(AppError::Forbidden);
        }
        let user = self.register(req, Role::User).await?;
        let token = self.issue_token(user.id)?;
        Ok(AuthSession { token, user })
    }

    /// Registration on behalf of an administrator; the requested role is kept.
    #[instrument(skip(self, req))]
    pub async fn create_user(&self, req: SignupRequest) -> Result<User, AppError> {
        let role = req.role.unwrap_or_default();
        self.register(req, role).await
    }

    #[instrument(skip(self, password))]
    pub async fn login(
        &self,
        email: Option<&str>,
        password: Option<&str>,
    ) -> Result<AuthSession, AppError> {
        let email = email.map(str::trim).filter(|e| !e.is_empty());
        let password = password.filter(|p| !p.is_empty());
        let (Some(email), Some(password)) = (email, password) else {
            return Err(AppError::MissingCredentials);
        };

        let user = self.users.find_by_email(email, Select::WithPassword).await?;
        let verified = match user.as_ref().and_then(|u| u.password_hash.clone()) {
            Some(hash) => verify_password_blocking(password.to_owned(), hash).await?,
            None => {
                if let Some(dummy) = DUMMY_HASH.as_ref() {
                    let _ = verify_password_blocking(password.to_owned(), dummy.clone()).await;
                }
                false
            }
        };

        let user = match user {
            Some(mut user) if verified => {
                user.password_hash = None;
                user
            }
            _ => {
                warn!(email = %email, "login rejected");
                return Err(AppError::InvalidCredentials);
            }
        };

        let token = self.issue_token(user.id)?;
        info!(user_id = %user.id, "user logged in");
        Ok(AuthSession { token, user })
    }

    /// Resolves the user behind a session token.
    #[instrument(skip_all)]
    pub async fn protect(&self, token: Option<&str>) -> Result<User, AppError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AppError::Unauthenticated)?;

        let claims = self.keys.verify(token)?;

        let user = self
            .users
            .find_by_id(claims.id, Select::Public)
            .await?
            .ok_or_else(|| {
                warn!(user_id = %claims.id, "token subject no longer exists");
                AppError::UserNotFound
            })?;

        if user.password_changed_after(claims.iat as i64) {
            warn!(user_id = %user.id, "token predates password change");
            return Err(AppError::StalePassword);
        }

        debug!(user_id = %user.id, role = %user.role, "request authenticated");
        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn forgot_password(&self, email: &str) -> Result<(), AppError> {
        let user = self
            .users
            .find_by_email(email, Select::Public)
            .await?
            .ok_or(AppError::UserNotFound)?;

        let token = ResetToken::issue();
        self.users
            .update_by_id(
                user.id,
                UserPatch::set_reset(token.to_record()),
                WriteMode::Unvalidated,
            )
            .await?
            .ok_or(AppError::UserNotFound)?;

        let mail = Mail {
            to: user.email.clone(),
            subject: format!(
                "Your password reset token (valid for {} min)",
                RESET_TOKEN_TTL.whole_minutes()
            ),
            body: format!(
                "Forgot your password? Submit a PATCH request with your new password and \
                 passwordConfirm to: {}\nIf you didn't forget your password, please ignore \
                 this email!",
                self.reset_url(&token.plaintext)
            ),
        };

        let timeout = Duration::from_secs(self.config.mail.timeout_secs);
        let failure = match tokio::time::timeout(timeout, self.mailer.send(&mail)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("mail dispatch timed out after {}s", timeout.as_secs())),
        };

        if let Some(reason) = failure {
            error!(user_id = %user.id, error = %reason, "reset email not delivered");
            // Only this call's token is cleared; a newer one issued meanwhile stays.
            match self
                .users
                .update_by_reset_token(
                    &token.hashed,
                    None,
                    UserPatch::clear_reset(),
                    WriteMode::Unvalidated,
                )
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => debug!(user_id = %user.id, "reset token already replaced"),
                Err(e) => error!(user_id = %user.id, error = %e, "failed to clear reset token"),
            }
            return Err(AppError::EmailDelivery(reason));
        }

        info!(user_id = %user.id, "reset token sent");
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn reset_password(
        &self,
        plaintext: &str,
        password: String,
        password_confirm: String,
    ) -> Result<AuthSession, AppError> {
        let now = OffsetDateTime::now_utc();
        let user = reset::redeem(self.users.as_ref(), plaintext, now).await?;

        validate_password_pair(&password, &password_confirm)?;
        let hash = hash_password_blocking(password).await?;

        // The write only lands while the hash is still stored and unexpired,
        // so a concurrent redemption of the same token finds nothing.
        let patch = UserPatch::password(hash, password_changed_at(now)).and_clear_reset();
        let user = self
            .users
            .update_by_reset_token(
                &reset::hash_reset_token(plaintext.trim()),
                Some(now),
                patch,
                WriteMode::Validated,
            )
            .await?
            .ok_or(AppError::TokenInvalidOrExpired)?;

        let token = self.issue_token(user.id)?;
        info!(user_id = %user.id, "password reset");
        Ok(AuthSession { token, user })
    }

    #[instrument(skip(self, current, password, password_confirm))]
    pub async fn update_password(
        &self,
        user_id: Uuid,
        current: &str,
        password: String,
        password_confirm: String,
    ) -> Result<AuthSession, AppError> {
        let user = self
            .users
            .find_by_id(user_id, Select::WithPassword)
            .await?
            .ok_or(AppError::UserNotFound)?;
        let stored = user
            .password_hash
            .ok_or_else(|| anyhow::anyhow!("password hash not selected for {user_id}"))?;

        if !verify_password_blocking(current.to_owned(), stored).await? {
            warn!(%user_id, "current password mismatch");
            return Err(AppError::InvalidCredentials);
        }

        validate_password_pair(&password, &password_confirm)?;
        let hash = hash_password_blocking(password).await?;
        let now = OffsetDateTime::now_utc();
        let user = self
            .users
            .update_by_id(
                user_id,
                UserPatch::password(hash, password_changed_at(now)),
                WriteMode::Validated,
            )
            .await?
            .ok_or(AppError::UserNotFound)?;

        let token = self.issue_token(user.id)?;
        info!(%user_id, "password updated");
        Ok(AuthSession { token, user })
    }

    /// Name and email only. Credentials have their own route.
    #[instrument(skip(self, fields))]
    pub async fn update_profile(
        &self,
        user_id: Uuid,
        fields: &Map<String, Value>,
    ) -> Result<User, AppError> {
        if fields.contains_key("password") || fields.contains_key("passwordConfirm") {
            return Err(AppError::Validation(
                "This route is not for password updates. Please use /updateMyPassword".into(),
            ));
        }

        let patch = UserPatch {
            name: string_field(fields, "name")?,
            email: string_field(fields, "email")?,
            ..UserPatch::default()
        };
        let user = self
            .users
            .update_by_id(user_id, patch, WriteMode::Validated)
            .await?
            .ok_or(AppError::UserNotFound)?;
        info!(%user_id, "profile updated");
        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn deactivate(&self, user_id: Uuid) -> Result<(), AppError> {
        self.users
            .update_by_id(user_id, UserPatch::deactivate(), WriteMode::Unvalidated)
            .await?
            .ok_or(AppError::UserNotFound)?;
        info!(%user_id, "user deactivated");
        Ok(())
    }

    pub async fn list_users(&self) -> Result<Vec<User>, AppError> {
        Ok(self.users.list().await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        mail::{LogMailer, MailError},
        users::MemoryUserStore,
    };

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<Mail>>,
    }

    impl RecordingMailer {
        fn last_token(&self) -> String {
            let sent = self.sent.lock().unwrap();
            let body = &sent.last().expect("a mail was sent").body;
            let start = body.find("resetPassword/").unwrap() + "resetPassword/".len();
            body[start..]
                .chars()
                .take_while(|c| c.is_ascii_hexdigit())
                .collect()
        }
    }

    #[async_trait]
    impl MailSender for RecordingMailer {
        async fn send(&self, mail: &Mail) -> Result<(), MailError> {
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    struct FailingMailer;

    #[async_trait]
    impl MailSender for FailingMailer {
        async fn send(&self, _mail: &Mail) -> Result<(), MailError> {
            Err(MailError::Delivery("connection refused".into()))
        }
    }

    struct SlowMailer;

    #[async_trait]
    impl MailSender for SlowMailer {
        async fn send(&self, _mail: &Mail) -> Result<(), MailError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    /// Issues a newer reset token for the recipient mid-send, then fails.
    struct RacingMailer {
        store: Arc<MemoryUserStore>,
        newer: Mutex<Option<String>>,
    }

    #[async_trait]
    impl MailSender for RacingMailer {
        async fn send(&self, mail: &Mail) -> Result<(), MailError> {
            let user = self
                .store
                .find_by_email(&mail.to, Select::Public)
                .await
                .unwrap()
                .unwrap();
            let newer = ResetToken::issue();
            self.store
                .update_by_id(
                    user.id,
                    UserPatch::set_reset(newer.to_record()),
                    WriteMode::Unvalidated,
                )
                .await
                .unwrap();
            *self.newer.lock().unwrap() = Some(newer.hashed);
            Err(MailError::Delivery("connection reset".into()))
        }
    }

    fn service_with(mailer: Arc<dyn MailSender>) -> (AuthService, Arc<MemoryUserStore>) {
        let store = Arc::new(MemoryUserStore::new());
        let state = AppState::from_parts(
            Arc::new(AppConfig::for_tests()),
            store.clone(),
            mailer,
        );
        (AuthService::from_ref(&state), store)
    }

    fn service() -> (AuthService, Arc<MemoryUserStore>) {
        service_with(Arc::new(LogMailer))
    }

    fn signup_req(email: &str) -> SignupRequest {
        SignupRequest {
            name: "Test User".into(),
            email: email.into(),
            password: "pass1234".into(),
            password_confirm: "pass1234".into(),
            role: None,
        }
    }

    #[tokio::test]
    async fn signup_returns_token_and_sanitized_user() {
        let (auth, store) = service();
        let session = auth.signup(signup_req("New@Example.com")).await.unwrap();

        assert_eq!(session.user.email, "new@example.com");
        assert_eq!(session.user.role, Role::User);
        assert!(session.user.password_hash.is_none());
        assert!(session.user.password_changed_at.is_none());

        let json = serde_json::to_value(&session.user).unwrap();
        assert!(json.get("passwordHash").is_none());

        let stored = store
            .find_by_id(session.user.id, Select::WithPassword)
            .await
            .unwrap()
            .unwrap();
        let hash = stored.password_hash.unwrap();
        assert_ne!(hash, "pass1234");
        assert!(hash.starts_with("$argon2id$"));

        let me = auth.protect(Some(&session.token)).await.unwrap();
        assert_eq!(me.id, session.user.id);
    }

    #[tokio::test]
    async fn signup_validation_errors() {
        let (auth, _) = service();

        let mut short = signup_req("short@example.com");
        short.password = "short".into();
        short.password_confirm = "short".into();
        assert!(matches!(auth.signup(short).await, Err(AppError::Validation(_))));

        let mut mismatch = signup_req("mismatch@example.com");
        mismatch.password_confirm = "pass12345".into();
        assert!(matches!(auth.signup(mismatch).await, Err(AppError::Validation(_))));

        assert!(matches!(
            auth.signup(signup_req("not-an-email")).await,
            Err(AppError::Validation(_))
        ));

        let mut nameless = signup_req("nameless@example.com");
        nameless.name = "Al".into();
        assert!(matches!(auth.signup(nameless).await, Err(AppError::Validation(_))));

        auth.signup(signup_req("dup@example.com")).await.unwrap();
        assert!(matches!(
            auth.signup(signup_req("DUP@example.com")).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn signup_cannot_self_assign_elevated_role() {
        let (auth, store) = service();
        let mut req = signup_req("sneaky@example.com");
        req.role = Some(Role::Admin);
        assert!(matches!(auth.signup(req).await, Err(AppError::Forbidden)));
        assert!(store.list().await.unwrap().is_empty());

        let mut req = signup_req("plain@example.com");
        req.role = Some(Role::User);
        assert!(auth.signup(req).await.is_ok());
    }

    #[tokio::test]
    async fn create_user_keeps_requested_role() {
        let (auth, _) = service();
        let mut req = signup_req("guide@example.com");
        req.role = Some(Role::LeadGuide);
        let user = auth.create_user(req).await.unwrap();
        assert_eq!(user.role, Role::LeadGuide);
    }

    #[tokio::test]
    async fn login_requires_both_fields() {
        let (auth, _) = service();
        assert!(matches!(
            auth.login(None, Some("pass1234")).await,
            Err(AppError::MissingCredentials)
        ));
        assert!(matches!(
            auth.login(Some("a@example.com"), None).await,
            Err(AppError::MissingCredentials)
        ));
        assert!(matches!(
            auth.login(Some("  "), Some("")).await,
            Err(AppError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let (auth, _) = service();
        auth.signup(signup_req("known@example.com")).await.unwrap();

        let unknown = auth
            .login(Some("x@example.com"), Some("wrongpass"))
            .await
            .unwrap_err();
        let wrong = auth
            .login(Some("known@example.com"), Some("wrongpass"))
            .await
            .unwrap_err();

        assert!(matches!(unknown, AppError::InvalidCredentials));
        assert!(matches!(wrong, AppError::InvalidCredentials));
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert_eq!(unknown.status_code(), wrong.status_code());
        assert_eq!(unknown.error_code(), wrong.error_code());
    }

    #[tokio::test]
    async fn login_succeeds_with_case_insensitive_email() {
        let (auth, _) = service();
        let created = auth.signup(signup_req("case@example.com")).await.unwrap();
        let session = auth
            .login(Some(" CASE@example.com "), Some("pass1234"))
            .await
            .unwrap();
        assert_eq!(session.user.id, created.user.id);
        assert!(session.user.password_hash.is_none());
        assert!(auth.protect(Some(&session.token)).await.is_ok());
    }

    #[tokio::test]
    async fn protect_rejects_missing_bad_and_expired_tokens() {
        let (auth, _) = service();
        let session = auth.signup(signup_req("gate@example.com")).await.unwrap();

        assert!(matches!(auth.protect(None).await, Err(AppError::Unauthenticated)));
        assert!(matches!(auth.protect(Some("  ")).await, Err(AppError::Unauthenticated)));
        assert!(matches!(
            auth.protect(Some("garbage")).await,
            Err(AppError::InvalidToken)
        ));

        // ttl in the test config is five minutes
        let long_ago = OffsetDateTime::now_utc() - time::Duration::minutes(10);
        let expired = auth.keys.sign_at(session.user.id, long_ago).unwrap();
        assert!(matches!(
            auth.protect(Some(&expired)).await,
            Err(AppError::ExpiredToken)
        ));
    }

    #[tokio::test]
    async fn protect_rejects_tokens_for_missing_users() {
        let (auth, _) = service();
        let token = auth.keys.sign(Uuid::new_v4()).unwrap();
        assert!(matches!(
            auth.protect(Some(&token)).await,
            Err(AppError::UserNotFound)
        ));

        let session = auth.signup(signup_req("leaving@example.com")).await.unwrap();
        auth.deactivate(session.user.id).await.unwrap();
        assert!(matches!(
            auth.protect(Some(&session.token)).await,
            Err(AppError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn password_change_invalidates_older_tokens() {
        let (auth, _) = service();
        let session = auth.signup(signup_req("stale@example.com")).await.unwrap();
        let minted = OffsetDateTime::now_utc() - time::Duration::seconds(60);
        let old_token = auth.keys.sign_at(session.user.id, minted).unwrap();
        assert!(auth.protect(Some(&old_token)).await.is_ok());

        let fresh = auth
            .update_password(
                session.user.id,
                "pass1234",
                "newpass123".into(),
                "newpass123".into(),
            )
            .await
            .unwrap();

        // still signed and unexpired, but minted before the change
        assert!(auth.keys.verify(&old_token).is_ok());
        assert!(matches!(
            auth.protect(Some(&old_token)).await,
            Err(AppError::StalePassword)
        ));
        assert!(auth.protect(Some(&fresh.token)).await.is_ok());
        assert!(fresh.user.password_changed_at.is_some());
    }

    #[tokio::test]
    async fn update_password_checks_current_password() {
        let (auth, _) = service();
        let session = auth.signup(signup_req("current@example.com")).await.unwrap();

        let err = auth
            .update_password(
                session.user.id,
                "not-my-password",
                "newpass123".into(),
                "newpass123".into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));

        let err = auth
            .update_password(
                session.user.id,
                "pass1234",
                "newpass123".into(),
                "different1".into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // old password still works after the failed attempts
        assert!(auth
            .login(Some("current@example.com"), Some("pass1234"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn forgot_password_unknown_email() {
        let (auth, _) = service();
        assert!(matches!(
            auth.forgot_password("nobody@example.com").await,
            Err(AppError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn reset_token_is_single_use() {
        let mailer = Arc::new(RecordingMailer::default());
        let (auth, store) = service_with(mailer.clone());
        let session = auth.signup(signup_req("forgot@example.com")).await.unwrap();

        auth.forgot_password("forgot@example.com").await.unwrap();
        let token = mailer.last_token();
        assert_eq!(token.len(), 64);
        {
            let sent = mailer.sent.lock().unwrap();
            assert_eq!(sent[0].to, "forgot@example.com");
            assert!(sent[0].subject.contains("10 min"));
        }

        let stored = store
            .find_by_id(session.user.id, Select::Public)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stored.password_reset_token.as_deref(), Some(token.as_str()));
        assert!(stored.password_reset_expires.is_some());

        let reset = auth
            .reset_password(&token, "brandnew1".into(), "brandnew1".into())
            .await
            .unwrap();
        assert_eq!(reset.user.id, session.user.id);
        assert!(auth.protect(Some(&reset.token)).await.is_ok());

        let cleared = store
            .find_by_id(session.user.id, Select::Public)
            .await
            .unwrap()
            .unwrap();
        assert!(cleared.password_reset_token.is_none());
        assert!(cleared.password_reset_expires.is_none());

        let again = auth
            .reset_password(&token, "another12".into(), "another12".into())
            .await
            .unwrap_err();
        assert!(matches!(again, AppError::TokenInvalidOrExpired));

        assert!(auth
            .login(Some("forgot@example.com"), Some("brandnew1"))
            .await
            .is_ok());
        assert!(matches!(
            auth.login(Some("forgot@example.com"), Some("pass1234")).await,
            Err(AppError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn reissuing_reset_token_invalidates_previous_one() {
        let mailer = Arc::new(RecordingMailer::default());
        let (auth, _) = service_with(mailer.clone());
        auth.signup(signup_req("twice@example.com")).await.unwrap();

        auth.forgot_password("twice@example.com").await.unwrap();
        let first = mailer.last_token();
        auth.forgot_password("twice@example.com").await.unwrap();
        let second = mailer.last_token();
        assert_ne!(first, second);

        assert!(matches!(
            auth.reset_password(&first, "brandnew1".into(), "brandnew1".into())
                .await,
            Err(AppError::TokenInvalidOrExpired)
        ));
        assert!(auth
            .reset_password(&second, "brandnew1".into(), "brandnew1".into())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn invalid_new_password_keeps_token_usable() {
        let mailer = Arc::new(RecordingMailer::default());
        let (auth, _) = service_with(mailer.clone());
        auth.signup(signup_req("retry@example.com")).await.unwrap();
        auth.forgot_password("retry@example.com").await.unwrap();
        let token = mailer.last_token();

        assert!(matches!(
            auth.reset_password(&token, "short".into(), "short".into()).await,
            Err(AppError::Validation(_))
        ));
        assert!(auth
            .reset_password(&token, "longenough".into(), "longenough".into())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn mail_failure_rolls_back_reset_token() {
        let (auth, store) = service_with(Arc::new(FailingMailer));
        let session = auth.signup(signup_req("nomail@example.com")).await.unwrap();

        let err = auth.forgot_password("nomail@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::EmailDelivery(_)));

        let user = store
            .find_by_id(session.user.id, Select::Public)
            .await
            .unwrap()
            .unwrap();
        assert!(user.password_reset_token.is_none());
        assert!(user.password_reset_expires.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_resets_with_one_token_succeed_once() {
        let mailer = Arc::new(RecordingMailer::default());
        let (auth, _) = service_with(mailer.clone());
        auth.signup(signup_req("race@example.com")).await.unwrap();
        auth.forgot_password("race@example.com").await.unwrap();
        let token = mailer.last_token();

        let (first, second) = tokio::join!(
            auth.reset_password(&token, "attacker1".into(), "attacker1".into()),
            auth.reset_password(&token, "ownerpw12".into(), "ownerpw12".into()),
        );
        let winners = [first.is_ok(), second.is_ok()];
        assert_eq!(winners.iter().filter(|ok| **ok).count(), 1);

        let loser = if first.is_ok() { second } else { first };
        assert!(matches!(loser, Err(AppError::TokenInvalidOrExpired)));
    }

    #[tokio::test]
    async fn mail_failure_keeps_newer_reset_token() {
        let store = Arc::new(MemoryUserStore::new());
        let mailer = Arc::new(RacingMailer {
            store: store.clone(),
            newer: Mutex::new(None),
        });
        let state = AppState::from_parts(
            Arc::new(AppConfig::for_tests()),
            store.clone(),
            mailer.clone(),
        );
        let auth = AuthService::from_ref(&state);
        let session = auth.signup(signup_req("overlap@example.com")).await.unwrap();

        let err = auth.forgot_password("overlap@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::EmailDelivery(_)));

        let newer = mailer.newer.lock().unwrap().clone().unwrap();
        let user = store
            .find_by_id(session.user.id, Select::Public)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.password_reset_token.as_deref(), Some(newer.as_str()));
        assert!(user.password_reset_expires.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn mail_timeout_counts_as_delivery_failure() {
        let (auth, store) = service_with(Arc::new(SlowMailer));
        let session = auth.signup(signup_req("slow@example.com")).await.unwrap();

        let err = auth.forgot_password("slow@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::EmailDelivery(_)));
        let user = store
            .find_by_id(session.user.id, Select::Public)
            .await
            .unwrap()
            .unwrap();
        assert!(user.password_reset_token.is_none());
    }

    #[tokio::test]
    async fn update_profile_refuses_password_fields() {
        let (auth, store) = service();
        let session = auth.signup(signup_req("profile@example.com")).await.unwrap();

        let fields = json!({ "password": "new", "name": "X Changed" });
        let err = auth
            .update_profile(session.user.id, fields.as_object().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let fields = json!({ "passwordConfirm": "new" });
        assert!(auth
            .update_profile(session.user.id, fields.as_object().unwrap())
            .await
            .is_err());

        let unchanged = store
            .find_by_id(session.user.id, Select::Public)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.name, "Test User");
    }

    #[tokio::test]
    async fn update_profile_applies_allow_list_only() {
        let (auth, _) = service();
        let session = auth.signup(signup_req("allow@example.com")).await.unwrap();

        let fields = json!({ "name": "Renamed", "email": "Moved@Example.com", "role": "admin" });
        let user = auth
            .update_profile(session.user.id, fields.as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(user.name, "Renamed");
        assert_eq!(user.email, "moved@example.com");
        assert_eq!(user.role, Role::User);

        let bad = json!({ "email": "broken" });
        assert!(matches!(
            auth.update_profile(session.user.id, bad.as_object().unwrap())
                .await,
            Err(AppError::Validation(_))
        ));
        let wrong_type = json!({ "name": 42 });
        assert!(matches!(
            auth.update_profile(session.user.id, wrong_type.as_object().unwrap())
                .await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn deactivated_user_cannot_log_in() {
        let (auth, store) = service();
        let session = auth.signup(signup_req("bye@example.com")).await.unwrap();
        auth.deactivate(session.user.id).await.unwrap();

        let err = auth
            .login(Some("bye@example.com"), Some("pass1234"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));
        assert!(matches!(
            auth.forgot_password("bye@example.com").await,
            Err(AppError::UserNotFound)
        ));
        assert!(auth.list_users().await.unwrap().is_empty());
        assert!(store
            .find_by_email("bye@example.com", Select::Public)
            .await
            .unwrap()
            .is_none());
    }
}
