use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    response::Response,
    routing::post,
    Router,
};
use domain::{BiometricChallengeRequest, BiometricVerifyRequest, StepUpChallengeRequest};

use crate::{
    auth_middleware::CurrentUser,
    envelope,
    problem::{ApiError, ApiJson, Trace},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/challenge", post(login_challenge))
        .route("/auth/verify", post(login_verify))
        .route("/auth/step-up/challenge", post(step_up_challenge))
        .route("/auth/step-up/verify", post(step_up_verify))
}

async fn login_challenge(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    trace: Trace,
    ApiJson(payload): ApiJson<BiometricChallengeRequest>,
) -> Result<Response, ApiError> {
    let challenge = state
        .biometric
        .login_challenge(payload, addr.ip())
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(challenge))
}

async fn login_verify(
    State(state): State<AppState>,
    trace: Trace,
    ApiJson(payload): ApiJson<BiometricVerifyRequest>,
) -> Result<Response, ApiError> {
    let session = state
        .biometric
        .login_verify(payload)
        .await
        .map_err(|err| trace.problem(err))?;
    metrics::counter!("auth_sessions_issued_total").increment(1);
    Ok(envelope::data(session))
}

async fn step_up_challenge(
    State(state): State<AppState>,
    user: CurrentUser,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    trace: Trace,
    ApiJson(payload): ApiJson<StepUpChallengeRequest>,
) -> Result<Response, ApiError> {
    let challenge = state
        .biometric
        .step_up_challenge(user.user_id, payload.purpose, addr.ip())
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(challenge))
}

async fn step_up_verify(
    State(state): State<AppState>,
    user: CurrentUser,
    trace: Trace,
    ApiJson(payload): ApiJson<BiometricVerifyRequest>,
) -> Result<Response, ApiError> {
    let token = state
        .biometric
        .step_up_verify(user.user_id, payload)
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(token))
}
