use super::handlers;
use crate::server::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/templates",
            get(handlers::list_templates).post(handlers::build_templates),
        )
        .route("/templates/abort", post(handlers::abort_templates))
        .route("/templates/status", get(handlers::get_template_status))
        .route("/templates/logs", get(handlers::get_template_logs))
}
