//! HTTP surface and composition root.
//!
//! The router, state and middleware are exposed as a library so integration
//! tests can drive the full stack over `tower::ServiceExt::oneshot` against
//! the in-memory store.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::build_router;
pub use state::AppState;
