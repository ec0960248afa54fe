use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    repo::{StoreError, UserStore},
    repo_types::{NewUser, Select, User, UserPatch, WriteMode},
    validation::{validate_new_user, validate_patch},
};

/// Process-local store used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn project(user: &User, select: Select) -> User {
    let mut out = user.clone();
    if select == Select::Public {
        out.password_hash = None;
    }
    out
}

fn email_taken(users: &HashMap<Uuid, User>, email: &str, except: Option<Uuid>) -> bool {
    users
        .values()
        .any(|u| u.email == email && Some(u.id) != except)
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_id(&self, id: Uuid, select: Select) -> Result<Option<User>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .get(&id)
            .filter(|u| u.active)
            .map(|u| project(u, select)))
    }

    async fn find_by_email(
        &self,
        email: &str,
        select: Select,
    ) -> Result<Option<User>, StoreError> {
        let email = email.trim().to_lowercase();
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| u.active && u.email == email)
            .map(|u| project(u, select)))
    }

    async fn find_by_reset_token(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| {
                u.active
                    && u.password_reset_token.as_deref() == Some(token_hash)
                    && u.password_reset_expires.is_some_and(|exp| exp > now)
            })
            .map(|u| project(u, Select::Public)))
    }

    async fn list(&self) -> Result<Vec<User>, StoreError> {
        let users = self.users.read().await;
        let mut out: Vec<User> = users
            .values()
            .filter(|u| u.active)
            .map(|u| project(u, Select::Public))
            .collect();
        out.sort_by_key(|u| u.created_at);
        Ok(out)
    }

    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let user = validate_new_user(user)?;
        let mut users = self.users.write().await;
        if email_taken(&users, &user.email, None) {
            return Err(StoreError::DuplicateEmail);
        }
        let record = User {
            id: Uuid::new_v4(),
            name: user.name,
            email: user.email,
            role: user.role,
            password_hash: Some(user.password_hash),
            password_changed_at: None,
            password_reset_token: None,
            password_reset_expires: None,
            active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        let out = project(&record, Select::Public);
        users.insert(record.id, record);
        Ok(out)
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
        let mut users = self.users.write().await;
        if let Some(email) = patch.email.as_deref() {
            if email_taken(&users, email, Some(id)) {
                return Err(StoreError::DuplicateEmail);
            }
        }
        let Some(record) = users.get_mut(&id).filter(|u| u.active) else {
            return Ok(None);
        };
        patch.apply(record);
        Ok(Some(project(record, Select::Public)))
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
        let mut users = self.users.write().await;
        let Some(id) = users
            .values()
            .find(|u| {
                u.active
                    && u.password_reset_token.as_deref() == Some(token_hash)
                    && open_at.map_or(true, |now| {
                        u.password_reset_expires.is_some_and(|exp| exp > now)
                    })
            })
            .map(|u| u.id)
        else {
            return Ok(None);
        };
        if let Some(email) = patch.email.as_deref() {
            if email_taken(&users, email, Some(id)) {
                return Err(StoreError::DuplicateEmail);
            }
        }
        let Some(record) = users.get_mut(&id) else {
            return Ok(None);
        };
        patch.apply(record);
        Ok(Some(project(record, Select::Public)))
    }
}
