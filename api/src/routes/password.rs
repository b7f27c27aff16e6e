use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    response::Response,
    routing::post,
    Router,
};
use domain::{
    ConfirmPasswordResetRequest, ConfirmVerificationRequest, EmailRequest, LoginRequest,
    LogoutRequest, RefreshRequest, RegisterRequest, SuccessResponse,
};

use crate::{
    envelope,
    problem::{ApiError, ApiJson, Trace},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/password/register", post(register))
        .route("/auth/password/login", post(login))
        .route("/auth/password/refresh", post(refresh))
        .route("/auth/password/logout", post(logout))
        .route("/auth/password/verify/request", post(request_verification))
        .route("/auth/password/verify/confirm", post(confirm_verification))
        .route("/auth/password/reset/request", post(request_reset))
        .route("/auth/password/reset/confirm", post(confirm_reset))
}

async fn register(
    State(state): State<AppState>,
    trace: Trace,
    ApiJson(payload): ApiJson<RegisterRequest>,
) -> Result<Response, ApiError> {
    let session = state
        .password_auth
        .register(payload)
        .await
        .map_err(|err| trace.problem(err))?;
    metrics::counter!("auth_sessions_issued_total").increment(1);
    let location = format!("/v1/users/{}", session.user.id);
    Ok(envelope::created(Some(location), session))
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    trace: Trace,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> Result<Response, ApiError> {
    let session = state
        .password_auth
        .login(payload, addr.ip())
        .await
        .map_err(|err| trace.problem(err))?;
    metrics::counter!("auth_sessions_issued_total").increment(1);
    Ok(envelope::data(session))
}

async fn refresh(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    trace: Trace,
    ApiJson(payload): ApiJson<RefreshRequest>,
) -> Result<Response, ApiError> {
    let session = state
        .password_auth
        .refresh(&payload.refresh_token, addr.ip())
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(session))
}

async fn logout(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<LogoutRequest>,
) -> Response {
    state.password_auth.logout(&payload.refresh_token).await;
    envelope::data(SuccessResponse { success: true })
}

async fn request_verification(
    State(state): State<AppState>,
    trace: Trace,
    ApiJson(payload): ApiJson<EmailRequest>,
) -> Result<Response, ApiError> {
    state
        .password_auth
        .request_verification(&payload.email)
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(SuccessResponse { success: true }))
}

async fn confirm_verification(
    State(state): State<AppState>,
    trace: Trace,
    ApiJson(payload): ApiJson<ConfirmVerificationRequest>,
) -> Result<Response, ApiError> {
    state
        .password_auth
        .confirm_verification(&payload.token)
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(SuccessResponse { success: true }))
}

async fn request_reset(
    State(state): State<AppState>,
    trace: Trace,
    ApiJson(payload): ApiJson<EmailRequest>,
) -> Result<Response, ApiError> {
    state
        .password_auth
        .request_password_reset(&payload.email)
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(SuccessResponse { success: true }))
}

async fn confirm_reset(
    State(state): State<AppState>,
    trace: Trace,
    ApiJson(payload): ApiJson<ConfirmPasswordResetRequest>,
) -> Result<Response, ApiError> {
    state
        .password_auth
        .confirm_password_reset(&payload.token, payload.new_password)
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(SuccessResponse { success: true }))
}
