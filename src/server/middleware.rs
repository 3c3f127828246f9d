use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::server::error::{ServerError, ServerErrorExt};
use crate::server::state::AppState;

/// Request ID stored in request extensions for correlation and debugging
#[derive(Clone, Debug)]
pub struct RequestId(pub Uuid);

/// Middleware that tags every request with a UUID v4, stored in request
/// extensions and echoed in the `x-request-id` response header.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());

    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;

    // Add request ID to response headers
    response.headers_mut().insert(
        header::HeaderName::from_static("x-request-id"),
        header::HeaderValue::from_str(&request_id.0.to_string())
            .unwrap_or_else(|_| header::HeaderValue::from_static("invalid")),
    );

    response
}

/// Header set by the authenticating proxy in front of the server
pub const OWNER_HEADER: &str = "x-labrange-user";

/// Middleware that resolves the owner named in [`OWNER_HEADER`] and stores
/// the user record in request extensions.
///
/// Requests without the header or naming an unknown user are rejected with 401.
pub async fn owner_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let username = request
        .headers()
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ServerError::unauthorized("Missing user identity"))?
        .to_string();

    let user = state
        .users
        .find_by_username(&username)
        .await
        .internal_err("Failed to look up user")?
        .ok_or_else(|| {
            tracing::warn!(username = %username, "Request for unknown user");
            ServerError::unauthorized("Unknown user")
        })?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}
