//! REST API: node-facing protocol endpoints plus the management surface.

pub mod handlers;
mod routes;

pub use handlers::{ApiError, AppState};
pub use routes::{create_router, ApiDoc};
