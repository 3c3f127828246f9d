use super::handlers;
use crate::server::state::AppState;
use axum::{
    routing::{delete, get, post},
    Router,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/range", delete(handlers::destroy_range))
        .route("/range/deploy", post(handlers::deploy_range))
        .route("/range/abort", post(handlers::abort_range))
        .route("/range/logs", get(handlers::get_range_logs))
        .route("/range/notify/test", post(handlers::send_test_notification))
}
