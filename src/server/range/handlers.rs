use super::controller::DeployRequest;
use crate::db::models::User;
use crate::server::error::{ServerError, ServerErrorExt};
use crate::server::logs::{read_log, LogQuery, LogSlice};
use crate::server::state::AppState;
use crate::server::ActionResponse;
use axum::{
    extract::{Extension, Query, State},
    Json,
};

pub async fn deploy_range(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(payload): Json<DeployRequest>,
) -> Result<Json<ActionResponse>, ServerError> {
    tracing::info!("Deploy requested for range {} by {}", user.user_id, user.username);

    state.ranges.deploy(&user, payload).await?;
    Ok(Json(ActionResponse::new("Range deploy started")))
}

pub async fn destroy_range(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<ActionResponse>, ServerError> {
    tracing::info!("Destroy requested for range {} by {}", user.user_id, user.username);

    state.ranges.destroy(&user).await?;
    Ok(Json(ActionResponse::new("Range destroy in progress")))
}

pub async fn abort_range(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<ActionResponse>, ServerError> {
    state.ranges.abort(&user).await?;
    Ok(Json(ActionResponse::new("Playbook process aborted")))
}

pub async fn get_range_logs(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogSlice>, ServerError> {
    let path = state.ranges.workspace().ansible_log(&user.username);
    let slice = read_log(&path, &query)
        .await
        .internal_err("Failed to read range logs")
        .map_err(|e| e.with_context("username", user.username.clone()))?;
    Ok(Json(slice))
}

pub async fn send_test_notification(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<ActionResponse>, ServerError> {
    state.ranges.notify_test(&user).await?;
    Ok(Json(ActionResponse::new("Test notification sent")))
}
