use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/envs", post(handlers::create_env))
        .route(
            "/envs/:env_id",
            get(handlers::get_env).delete(handlers::delete_env),
        )
        .route("/envs/:env_id/reset", post(handlers::reset_env))
        .route("/envs/:env_id/step", post(handlers::step_env))
}
