use auth::AuthError;
use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Request},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tower_http::request_id::RequestId;
use uuid::Uuid;
use wallet::WalletError;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    EmailNotVerified,
    ValidationFailed,
    Conflict,
    NotFound,
    RateLimited,
    IdempotencyInProgress,
    Internal,
    NoCredentials,
    ChallengeExpired,
    CredentialCompromised,
    InsufficientFunds,
    LimitExceeded,
    WalletBlocked,
    SameWalletTransfer,
    RecipientNotFound,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::EmailNotVerified => "EMAIL_NOT_VERIFIED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::IdempotencyInProgress => "IDEMPOTENCY_IN_PROGRESS",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::NoCredentials => "NO_CREDENTIALS",
            ErrorCode::ChallengeExpired => "CHALLENGE_EXPIRED",
            ErrorCode::CredentialCompromised => "CREDENTIAL_COMPROMISED",
            ErrorCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorCode::LimitExceeded => "LIMIT_EXCEEDED",
            ErrorCode::WalletBlocked => "WALLET_BLOCKED",
            ErrorCode::SameWalletTransfer => "SAME_WALLET_TRANSFER",
            ErrorCode::RecipientNotFound => "RECIPIENT_NOT_FOUND",
        }
    }

    fn title(self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::Forbidden => "Forbidden",
            ErrorCode::EmailNotVerified => "Email Not Verified",
            ErrorCode::ValidationFailed => "Validation Failed",
            ErrorCode::Conflict => "Conflict",
            ErrorCode::NotFound => "Not Found",
            ErrorCode::RateLimited => "Too Many Requests",
            ErrorCode::IdempotencyInProgress => "Request In Progress",
            ErrorCode::Internal => "Internal Server Error",
            ErrorCode::NoCredentials => "No Credentials",
            ErrorCode::ChallengeExpired => "Challenge Expired",
            ErrorCode::CredentialCompromised => "Credential Compromised",
            ErrorCode::InsufficientFunds => "Insufficient Funds",
            ErrorCode::LimitExceeded => "Limit Exceeded",
            ErrorCode::WalletBlocked => "Wallet Blocked",
            ErrorCode::SameWalletTransfer => "Same Wallet Transfer",
            ErrorCode::RecipientNotFound => "Recipient Not Found",
        }
    }
}

/// RFC-7807 style problem response with the closed `code` set.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub detail: Option<String>,
    pub trace_id: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: ErrorCode) -> Self {
        Self {
            status,
            code,
            detail: None,
            trace_id: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_trace(mut self, trace_id: &str) -> Self {
        self.trace_id = Some(trace_id.to_string());
        self
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal)
    }
}

#[derive(Serialize)]
struct ProblemBody<'a> {
    r#type: &'a str,
    title: &'a str,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
    code: &'a str,
    #[serde(rename = "traceId", skip_serializing_if = "Option::is_none")]
    trace_id: Option<&'a str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ProblemBody {
            r#type: "about:blank",
            title: self.code.title(),
            status: self.status.as_u16(),
            detail: self.detail.as_deref(),
            code: self.code.as_str(),
            trace_id: self.trace_id.as_deref(),
        };
        let mut response = (self.status, Json(&body)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
        );
        response
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials | AuthError::InvalidToken => {
                ApiError::new(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized)
            }
            AuthError::EmailNotVerified => {
                ApiError::new(StatusCode::FORBIDDEN, ErrorCode::EmailNotVerified)
            }
            AuthError::EmailTaken => ApiError::new(StatusCode::CONFLICT, ErrorCode::Conflict)
                .with_detail("email already registered"),
            AuthError::Validation(detail) => {
                ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::ValidationFailed)
                    .with_detail(detail)
            }
            AuthError::RateLimited => {
                ApiError::new(StatusCode::TOO_MANY_REQUESTS, ErrorCode::RateLimited)
            }
            AuthError::NoCredentials => {
                ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::NoCredentials)
            }
            AuthError::ChallengeNotFound => {
                ApiError::new(StatusCode::NOT_FOUND, ErrorCode::NotFound)
                    .with_detail("challenge not found")
            }
            AuthError::ChallengeExpired => {
                ApiError::new(StatusCode::UNAUTHORIZED, ErrorCode::ChallengeExpired)
            }
            AuthError::CredentialCompromised => {
                ApiError::new(StatusCode::UNAUTHORIZED, ErrorCode::CredentialCompromised)
            }
            AuthError::CredentialConflict => {
                ApiError::new(StatusCode::CONFLICT, ErrorCode::Conflict)
                    .with_detail("credential enrolled to another user")
            }
            AuthError::Forbidden => ApiError::new(StatusCode::FORBIDDEN, ErrorCode::Forbidden),
            AuthError::NotFound => ApiError::new(StatusCode::NOT_FOUND, ErrorCode::NotFound),
            AuthError::Internal(detail) => {
                tracing::error!(detail, "auth internal error");
                ApiError::internal()
            }
        }
    }
}

impl From<WalletError> for ApiError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::RecipientNotFound => {
                ApiError::new(StatusCode::NOT_FOUND, ErrorCode::RecipientNotFound)
            }
            WalletError::SameWalletTransfer => {
                ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::SameWalletTransfer)
            }
            WalletError::WalletBlocked => {
                ApiError::new(StatusCode::FORBIDDEN, ErrorCode::WalletBlocked)
            }
            WalletError::RecipientClosed => {
                ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::ValidationFailed)
                    .with_detail("recipient wallet cannot receive transfers")
            }
            WalletError::Validation(detail) => {
                ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::ValidationFailed)
                    .with_detail(detail)
            }
            WalletError::LimitExceeded | WalletError::DailyLimitExceeded => {
                ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::LimitExceeded)
            }
            WalletError::InsufficientFunds => {
                ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::InsufficientFunds)
            }
            WalletError::StepUpRequired => {
                ApiError::new(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized)
                    .with_detail("step-up required")
            }
            WalletError::StepUpInvalid => {
                ApiError::new(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized)
                    .with_detail("step-up token invalid")
            }
            WalletError::StepUpForbidden => {
                ApiError::new(StatusCode::FORBIDDEN, ErrorCode::Forbidden)
                    .with_detail("step-up token not valid for transfers")
            }
            WalletError::ReferenceConflict => {
                ApiError::new(StatusCode::CONFLICT, ErrorCode::Conflict)
                    .with_detail("client reference already used with different parameters")
            }
            WalletError::NotFound => ApiError::new(StatusCode::NOT_FOUND, ErrorCode::NotFound),
            WalletError::Internal(detail) => {
                tracing::error!(detail, "wallet internal error");
                ApiError::internal()
            }
        }
    }
}

/// Request trace id, taken from the request-id layer and echoed into every
/// problem body.
#[derive(Debug, Clone)]
pub struct Trace(pub String);

impl Trace {
    pub fn problem(&self, err: impl Into<ApiError>) -> ApiError {
        err.into().with_trace(&self.0)
    }
}

pub fn trace_from_parts(parts: &Parts) -> String {
    parts
        .extensions
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[async_trait]
impl<S> FromRequestParts<S> for Trace
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Trace(trace_from_parts(parts)))
    }
}

/// JSON body extractor whose rejection is a `VALIDATION_FAILED` problem
/// instead of the framework default.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let trace = trace_from_parts(&parts);
        let req = Request::from_parts(parts, body);
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                ErrorCode::ValidationFailed,
            )
            .with_detail(rejection.body_text())
            .with_trace(&trace)),
        }
    }
}
