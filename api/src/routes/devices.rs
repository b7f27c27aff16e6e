use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::{delete, get},
    Router,
};
use domain::DeviceView;
use uuid::Uuid;

use crate::{
    auth_middleware::CurrentUser,
    envelope,
    problem::{ApiError, ErrorCode, Trace},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/:device_id", delete(deactivate_device))
}

async fn list_devices(
    State(state): State<AppState>,
    user: CurrentUser,
    trace: Trace,
) -> Result<Response, ApiError> {
    let devices = state
        .credentials
        .list_devices(user.user_id)
        .await
        .map_err(|err| trace.problem(err))?;
    let views: Vec<DeviceView> = devices.into_iter().map(DeviceView::from).collect();
    Ok(envelope::data(views))
}

async fn deactivate_device(
    State(state): State<AppState>,
    user: CurrentUser,
    trace: Trace,
    Path(device_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let deactivated = state
        .credentials
        .deactivate_device(user.user_id, device_id, auth::USER_REVOKED_REASON)
        .await
        .map_err(|err| trace.problem(err))?;
    if deactivated {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, ErrorCode::NotFound).with_trace(&trace.0))
    }
}
