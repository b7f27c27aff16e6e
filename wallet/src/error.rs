use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("recipient not found")]
    RecipientNotFound,
    #[error("transfer to own wallet")]
    SameWalletTransfer,
    #[error("wallet is blocked")]
    WalletBlocked,
    #[error("recipient wallet cannot receive transfers")]
    RecipientClosed,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("transfer limit exceeded")]
    LimitExceeded,
    #[error("daily transfer limit exceeded")]
    DailyLimitExceeded,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("step-up required")]
    StepUpRequired,
    #[error("step-up token invalid")]
    StepUpInvalid,
    #[error("step-up token not valid for transfers")]
    StepUpForbidden,
    #[error("client reference already used with different parameters")]
    ReferenceConflict,
    #[error("transaction not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type WalletResult<T> = Result<T, WalletError>;

impl From<sqlx::Error> for WalletError {
    fn from(err: sqlx::Error) -> Self {
        WalletError::Internal(format!("database error: {err}"))
    }
}
