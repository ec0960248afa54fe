use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{patch, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use tracing::instrument;

use crate::{
    auth::{
        dto::{
            AuthResponse, ForgotPasswordRequest, LoginRequest, MessageResponse,
            ResetPasswordRequest, SignupRequest, UpdatePasswordRequest,
        },
        extractors::{AuthUser, SESSION_COOKIE},
        services::{AuthService, AuthSession},
    },
    config::AppConfig,
    error::AppError,
    extract::AppJson,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/users/signup", post(signup))
        .route("/users/login", post(login))
        .route("/users/forgotPassword", post(forgot_password))
        .route("/users/resetPassword/:token", patch(reset_password))
        .route("/users/updateMyPassword", patch(update_password))
}

pub(crate) fn session_cookie(token: String, config: &AppConfig) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .http_only(true)
        .secure(!config.env.is_development())
        .path("/")
        .max_age(time::Duration::days(config.jwt.cookie_ttl_days))
        .build()
}

fn send_session(
    auth: &AuthService,
    jar: CookieJar,
    session: AuthSession,
) -> (CookieJar, Json<AuthResponse>) {
    let jar = jar.add(session_cookie(session.token.clone(), auth.config()));
    (jar, Json(AuthResponse::new(session.token, session.user)))
}

#[instrument(skip(auth, jar, payload))]
pub async fn signup(
    State(auth): State<AuthService>,
    jar: CookieJar,
    AppJson(payload): AppJson<SignupRequest>,
) -> Result<(StatusCode, CookieJar, Json<AuthResponse>), AppError> {
    let session = auth.signup(payload).await?;
    let (jar, body) = send_session(&auth, jar, session);
    Ok((StatusCode::CREATED, jar, body))
}

#[instrument(skip(auth, jar, payload))]
pub async fn login(
    State(auth): State<AuthService>,
    jar: CookieJar,
    AppJson(payload): AppJson<LoginRequest>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    let session = auth
        .login(payload.email.as_deref(), payload.password.as_deref())
        .await?;
    Ok(send_session(&auth, jar, session))
}

#[instrument(skip(auth, payload))]
pub async fn forgot_password(
    State(auth): State<AuthService>,
    AppJson(payload): AppJson<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    auth.forgot_password(&payload.email).await?;
    Ok(Json(MessageResponse {
        status: "success",
        message: "Token sent to email!".into(),
    }))
}

#[instrument(skip_all)]
pub async fn reset_password(
    State(auth): State<AuthService>,
    jar: CookieJar,
    Path(token): Path<String>,
    AppJson(payload): AppJson<ResetPasswordRequest>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    let session = auth
        .reset_password(&token, payload.password, payload.password_confirm)
        .await?;
    Ok(send_session(&auth, jar, session))
}

#[instrument(skip(auth, jar, user, payload), fields(user_id = %user.id))]
pub async fn update_password(
    State(auth): State<AuthService>,
    jar: CookieJar,
    AuthUser(user): AuthUser,
    AppJson(payload): AppJson<UpdatePasswordRequest>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    let session = auth
        .update_password(
            user.id,
            &payload.password_current,
            payload.password,
            payload.password_confirm,
        )
        .await?;
    Ok(send_session(&auth, jar, session))
}
