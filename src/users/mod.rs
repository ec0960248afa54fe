use crate::state::AppState;
use axum::Router;

pub mod handlers;
mod memory;
mod repo;
mod repo_types;
pub mod validation;

pub use memory::MemoryUserStore;
pub use repo::{PgUserStore, UserStore};
pub use repo_types::{NewUser, PasswordReset, Role, Select, User, UserPatch, WriteMode};

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::me_routes())
        .merge(handlers::admin_routes())
}
