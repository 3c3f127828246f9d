use super::inventory::BuildSubject;
use super::BuildRequest;
use crate::db::models::User;
use crate::server::error::{ServerError, ServerErrorExt};
use crate::server::logs::{LogQuery, LogSlice};
use crate::server::process_table::BuildingTemplate;
use crate::server::state::AppState;
use crate::server::ActionResponse;
use axum::{
    extract::{Extension, Query, State},
    Json,
};

pub async fn list_templates(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<BuildSubject>>, ServerError> {
    let subjects = state.templates.subjects(&user).await?;
    Ok(Json(subjects))
}

pub async fn build_templates(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(payload): Json<BuildRequest>,
) -> Result<Json<ActionResponse>, ServerError> {
    let (parallel, _handle) = state.templates.build(&user, payload).await?;
    Ok(Json(ActionResponse::new(format!(
        "Template building started - this will take a while. Building {} template(s) at a time.",
        parallel
    ))))
}

pub async fn abort_templates(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<ActionResponse>, ServerError> {
    state.templates.abort(&user)?;
    Ok(Json(ActionResponse::new(format!(
        "Packer process(es) aborted for user {}",
        user.username
    ))))
}

pub async fn get_template_status(State(state): State<AppState>) -> Json<Vec<BuildingTemplate>> {
    Json(state.templates.status())
}

pub async fn get_template_logs(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogSlice>, ServerError> {
    let slice = state
        .templates
        .logs(&user, &query)
        .await
        .internal_err("Failed to read template logs")?;
    Ok(Json(slice))
}
