//! Authenticated management API and the sandbox proxy data path.

pub mod auth;
pub mod batch;
pub mod error;
pub mod handlers;
pub mod proxy;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
