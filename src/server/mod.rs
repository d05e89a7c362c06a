//! HTTP surface for task submission, state queries and observer push.
//!
//! There is no authentication layer. See [`routes`] for the endpoint list.

pub mod routes;

pub use routes::{app_router, AppState};
