use anyhow::Context;
use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;

use super::{
    repo_types::{NewUser, Role, Select, User, UserPatch, WriteMode},
    validation::{validate_new_user, validate_patch},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Invalid(String),

    #[error("Email already registered")]
    DuplicateEmail,

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Invalid(msg) => AppError::Validation(msg),
            StoreError::DuplicateEmail => {
                AppError::Validation("Email already registered".into())
            }
            StoreError::Database(e) => AppError::Internal(e.into()),
            StoreError::Other(e) => AppError::Internal(e),
        }
    }
}

/// Persistence for user records.
///
/// Every read hides soft-deleted users and leaves `password_hash` empty
/// unless [`Select::WithPassword`] is asked for. Each write is atomic for
/// the single record it touches.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid, select: Select) -> Result<Option<User>, StoreError>;

    async fn find_by_email(&self, email: &str, select: Select)
        -> Result<Option<User>, StoreError>;

    /// User holding `token_hash` whose reset window is still open at `now`.
    async fn find_by_reset_token(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError>;

    async fn list(&self) -> Result<Vec<User>, StoreError>;

    async fn create(&self, user: NewUser) -> Result<User, StoreError>;

    async fn update_by_id(
        &self,
        id: Uuid,
        patch: UserPatch,
        mode: WriteMode,
    ) -> Result<Option<User>, StoreError>;

    /// Applies `patch` only to the active user still holding `token_hash`,
    /// and, when `open_at` is given, only while its reset window is open.
    /// Check and write happen in one step, so a given hash is consumed at
    /// most once.
    async fn update_by_reset_token(
        &self,
        token_hash: &str,
        open_at: Option<OffsetDateTime>,
        patch: UserPatch,
        mode: WriteMode,
    ) -> Result<Option<User>, StoreError>;
}

const USER_COLUMNS: &str = "id, name, email, role, password_hash, password_changed_at, \
     password_reset_token, password_reset_expires, active, created_at";

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    email: String,
    role: String,
    password_hash: String,
    password_changed_at: Option<OffsetDateTime>,
    password_reset_token: Option<String>,
    password_reset_expires: Option<OffsetDateTime>,
    active: bool,
    created_at: OffsetDateTime,
}

impl UserRow {
    fn into_user(self, select: Select) -> anyhow::Result<User> {
        let role = self
            .role
            .parse::<Role>()
            .with_context(|| format!("user {} has a bad role column", self.id))?;
        Ok(User {
            id: self.id,
            name: self.name,
            email: self.email,
            role,
            password_hash: match select {
                Select::WithPassword => Some(self.password_hash),
                Select::Public => None,
            },
            password_changed_at: self.password_changed_at,
            password_reset_token: self.password_reset_token,
            password_reset_expires: self.password_reset_expires,
            active: self.active,
            created_at: self.created_at,
        })
    }
}

fn map_write_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::DuplicateEmail;
        }
    }
    StoreError::Database(e)
}

fn push_assignments(qb: &mut QueryBuilder<'_, Postgres>, patch: UserPatch) {
    let mut set = qb.separated(", ");
    if let Some(name) = patch.name {
        set.push("name = ").push_bind_unseparated(name);
    }
    if let Some(email) = patch.email {
        set.push("email = ").push_bind_unseparated(email);
    }
    if let Some(hash) = patch.password_hash {
        set.push("password_hash = ").push_bind_unseparated(hash);
    }
    if let Some(changed) = patch.password_changed_at {
        set.push("password_changed_at = ").push_bind_unseparated(changed);
    }
    match patch.password_reset {
        Some(Some(reset)) => {
            set.push("password_reset_token = ")
                .push_bind_unseparated(reset.token_hash);
            set.push("password_reset_expires = ")
                .push_bind_unseparated(reset.expires_at);
        }
        Some(None) => {
            set.push("password_reset_token = NULL");
            set.push("password_reset_expires = NULL");
        }
        None => {}
    }
    if let Some(active) = patch.active {
        set.push("active = ").push_bind_unseparated(active);
    }
}

fn push_reset_condition(
    qb: &mut QueryBuilder<'_, Postgres>,
    token_hash: &str,
    open_at: Option<OffsetDateTime>,
) {
    qb.push(" WHERE password_reset_token = ")
        .push_bind(token_hash.to_owned());
    if let Some(now) = open_at {
        qb.push(" AND password_reset_expires > ").push_bind(now);
    }
    qb.push(" AND active");
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid, select: Select) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND active");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|r| r.into_user(select)).transpose()?)
    }

    async fn find_by_email(
        &self,
        email: &str,
        select: Select,
    ) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND active");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(email.trim().to_lowercase())
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|r| r.into_user(select)).transpose()?)
    }

    async fn find_by_reset_token(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let sql = format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE password_reset_token = $1
              AND password_reset_expires > $2
              AND active
            "#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(token_hash)
            .bind(now)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|r| r.into_user(Select::Public)).transpose()?)
    }

    async fn list(&self) -> Result<Vec<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE active ORDER BY created_at");
        let rows = sqlx::query_as::<_, UserRow>(&sql)
            .fetch_all(&self.db)
            .await?;
        rows.into_iter()
            .map(|r| r.into_user(Select::Public).map_err(StoreError::from))
            .collect()
    }

    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let user = validate_new_user(user)?;
        let sql = format!(
            r#"
            INSERT INTO users (id, name, email, role, password_hash)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&user.name)
            .bind(&user.email)
            .bind(user.role.as_str())
            .bind(&user.password_hash)
            .fetch_one(&self.db)
            .await
            .map_err(map_write_error)?;
        Ok(row.into_user(Select::Public)?)
    }

    async fn update_by_id(
        &self,
        id: Uuid,
        patch: UserPatch,
        mode: WriteMode,
    ) -> Result<Option<User>, StoreError> {
        let patch = match mode {
            WriteMode::Validated => validate_patch(patch)?,
            WriteMode::Unvalidated => patch,
        };
        if patch.is_empty() {
            return self.find_by_id(id, Select::Public).await;
        }

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE users SET ");
        push_assignments(&mut qb, patch);
        qb.push(" WHERE id = ")
            .push_bind(id)
            .push(" AND active RETURNING ")
            .push(USER_COLUMNS);

        let row = qb
            .build_query_as::<UserRow>()
            .fetch_optional(&self.db)
            .await
            .map_err(map_write_error)?;
        Ok(row.map(|r| r.into_user(Select::Public)).transpose()?)
    }

    async fn update_by_reset_token(
        &self,
        token_hash: &str,
        open_at: Option<OffsetDateTime>,
        patch: UserPatch,
        mode: WriteMode,
    ) -> Result<Option<User>, StoreError> {
        let patch = match mode {
            WriteMode::Validated => validate_patch(patch)?,
            WriteMode::Unvalidated => patch,
        };

        let updating = !patch.is_empty();
        let mut qb = if updating {
            let mut qb = QueryBuilder::<Postgres>::new("UPDATE users SET ");
            push_assignments(&mut qb, patch);
            qb
        } else {
            QueryBuilder::<Postgres>::new(format!("SELECT {USER_COLUMNS} FROM users"))
        };
        push_reset_condition(&mut qb, token_hash, open_at);
        if updating {
            qb.push(" RETURNING ").push(USER_COLUMNS);
        }

        let row = qb
            .build_query_as::<UserRow>()
            .fetch_optional(&self.db)
            .await
            .map_err(map_write_error)?;
        Ok(row.map(|r| r.into_user(Select::Public)).transpose()?)
    }
}
