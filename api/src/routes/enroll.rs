use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    response::Response,
    routing::post,
    Router,
};
use domain::{BiometricVerifyRequest, EnrollChallengeRequest};

use crate::{
    auth_middleware::CurrentUser,
    envelope,
    problem::{ApiError, ApiJson, Trace},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/enroll/challenge", post(challenge))
        .route("/enroll/verify", post(verify))
}

async fn challenge(
    State(state): State<AppState>,
    user: CurrentUser,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    trace: Trace,
    ApiJson(payload): ApiJson<EnrollChallengeRequest>,
) -> Result<Response, ApiError> {
    let challenge = state
        .enrollment
        .challenge(user.user_id, payload.device_name, addr.ip())
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(challenge))
}

/// Unauthenticated by design: the user binding comes from the consumed
/// challenge state, not from a bearer token.
async fn verify(
    State(state): State<AppState>,
    trace: Trace,
    ApiJson(payload): ApiJson<BiometricVerifyRequest>,
) -> Result<Response, ApiError> {
    let enrolled = state
        .enrollment
        .verify(payload)
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(enrolled))
}
