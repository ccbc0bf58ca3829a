//! HTTP surface: the OpenAI-compatible client API and the operator admin API.

pub mod admin;
pub mod admin_auth;
pub mod routes;

use std::sync::Arc;

use axum::Router;

use crate::pipeline::Gateway;

/// The full application router: client surface plus the `/admin` tree.
pub fn router(gateway: Arc<Gateway>) -> Router {
    routes::router(Arc::clone(&gateway)).merge(admin::router(gateway))
}
