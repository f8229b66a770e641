use axum::{Router, routing::get};

pub mod batch;
pub mod system;

/// Router for every batch endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/handlers", get(system::handlers))
        .nest("/batch", batch::router())
}
