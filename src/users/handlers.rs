use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get, patch},
    Json, Router,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::instrument;

use super::User;
use crate::{
    auth::{
        extractors::{AuthUser, ADMIN_ONLY},
        services::AuthService,
        SignupRequest,
    },
    error::AppError,
    extract::AppJson,
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct UserData {
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub status: &'static str,
    pub data: UserData,
}

impl UserResponse {
    fn new(user: User) -> Self {
        Self {
            status: "success",
            data: UserData { user },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UsersData {
    pub users: Vec<User>,
}

#[derive(Debug, Serialize)]
pub struct UsersResponse {
    pub status: &'static str,
    pub results: usize,
    pub data: UsersData,
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/users/me", get(me))
        .route("/users/updateMe", patch(update_me))
        .route("/users/deleteMe", delete(delete_me))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new().route("/users", get(list_users).post(create_user))
}

pub async fn me(AuthUser(user): AuthUser) -> Json<UserResponse> {
    Json(UserResponse::new(user))
}

#[instrument(skip(auth, user, changes), fields(user_id = %user.id))]
pub async fn update_me(
    State(auth): State<AuthService>,
    AuthUser(user): AuthUser,
    AppJson(changes): AppJson<Map<String, Value>>,
) -> Result<Json<UserResponse>, AppError> {
    let user = auth.update_profile(user.id, &changes).await?;
    Ok(Json(UserResponse::new(user)))
}

#[instrument(skip(auth, user), fields(user_id = %user.id))]
pub async fn delete_me(
    State(auth): State<AuthService>,
    AuthUser(user): AuthUser,
) -> Result<StatusCode, AppError> {
    auth.deactivate(user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(auth, user), fields(user_id = %user.id))]
pub async fn list_users(
    State(auth): State<AuthService>,
    AuthUser(user): AuthUser,
) -> Result<Json<UsersResponse>, AppError> {
    ADMIN_ONLY.check(&user)?;
    let users = auth.list_users().await?;
    Ok(Json(UsersResponse {
        status: "success",
        results: users.len(),
        data: UsersData { users },
    }))
}

#[instrument(skip(auth, user, payload), fields(user_id = %user.id))]
pub async fn create_user(
    State(auth): State<AuthService>,
    AuthUser(user): AuthUser,
    AppJson(payload): AppJson<SignupRequest>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    ADMIN_ONLY.check(&user)?;
    let created = auth.create_user(payload).await?;
    Ok((StatusCode::CREATED, Json(UserResponse::new(created))))
}
