use axum::{
    extract::{Query, State},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::{
    auth_middleware::CurrentUser,
    envelope,
    problem::{ApiError, Trace},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/wallets/me", get(my_wallet))
        .route("/wallets/me/transactions", get(my_transactions))
}

async fn my_wallet(
    State(state): State<AppState>,
    user: CurrentUser,
    trace: Trace,
) -> Result<Response, ApiError> {
    let view = state
        .wallets
        .view_for_user(user.user_id)
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::data(view))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    cursor: Option<String>,
    limit: Option<i64>,
}

async fn my_transactions(
    State(state): State<AppState>,
    user: CurrentUser,
    trace: Trace,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    let (items, next_cursor, limit) = state
        .wallets
        .list_transactions_for_user(user.user_id, query.cursor.as_deref(), query.limit)
        .await
        .map_err(|err| trace.problem(err))?;
    Ok(envelope::page(items, next_cursor, limit))
}
