use crate::state::AppState;
use axum::Router;

mod dto;
pub mod extractors;
pub mod handlers;
pub mod jwt;
pub mod password;
pub mod reset;
pub mod services;

pub use dto::SignupRequest;

pub fn router() -> Router<AppState> {
    Router::new().merge(handlers::auth_routes())
}
