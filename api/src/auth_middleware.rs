use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    typed_header::TypedHeader,
};
use uuid::Uuid;

use crate::{
    problem::{trace_from_parts, ApiError, ErrorCode},
    state::AppState,
};

/// Bearer-authenticated caller, resolved from a verified access token.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: Uuid,
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let trace = trace_from_parts(parts);
        let unauthorized = || {
            ApiError::new(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized).with_trace(&trace)
        };

        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| unauthorized())?;

        let claims = state
            .signer
            .verify_access(bearer.token())
            .map_err(|_| unauthorized())?;
        let user_id = claims.user_id().map_err(|_| unauthorized())?;

        Ok(CurrentUser { user_id })
    }
}
