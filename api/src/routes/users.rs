use axum::{extract::State, response::Response, routing::get, Router};

use crate::{
    auth_middleware::CurrentUser,
    envelope,
    problem::{ApiError, Trace},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/users/me", get(me))
}

async fn me(
    State(state): State<AppState>,
    user: CurrentUser,
    trace: Trace,
) -> Result<Response, ApiError> {
    let profile = state
        .password_auth
        .profile(user.user_id)
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(profile))
}
