use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
    routing::{get, post},
    Router,
};
use domain::{CreateTransferRequest, ResolveRecipientRequest};
use uuid::Uuid;

use crate::{
    auth_middleware::CurrentUser,
    envelope,
    problem::{ApiError, ApiJson, Trace},
    state::AppState,
};

pub const STEP_UP_TOKEN_HEADER: &str = "x-step-up-token";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/transactions/transfer", post(create_transfer))
        .route("/transactions/recipients/resolve", post(resolve_recipient))
        .route("/transactions/:transaction_id", get(get_transaction))
}

async fn create_transfer(
    State(state): State<AppState>,
    user: CurrentUser,
    trace: Trace,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<CreateTransferRequest>,
) -> Result<Response, ApiError> {
    let header_step_up = headers
        .get(STEP_UP_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let transfer = state
        .transfers
        .create_transfer(user.user_id, payload, header_step_up)
        .await
        .map_err(|err| trace.problem(err))?;
    metrics::counter!("transfers_completed_total").increment(1);

    let location = format!("/v1/transactions/{}", transfer.id);
    Ok(envelope::created(Some(location), transfer))
}

async fn resolve_recipient(
    State(state): State<AppState>,
    _user: CurrentUser,
    trace: Trace,
    ApiJson(payload): ApiJson<ResolveRecipientRequest>,
) -> Result<Response, ApiError> {
    let resolved = state
        .wallets
        .resolve_recipient(&payload.identifier)
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(resolved))
}

async fn get_transaction(
    State(state): State<AppState>,
    user: CurrentUser,
    trace: Trace,
    Path(transaction_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let transaction = state
        .wallets
        .get_transaction_for_user(user.user_id, transaction_id)
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(transaction))
}
