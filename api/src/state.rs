use std::sync::Arc;

use auth::{
    BiometricAuthService, CredentialStore, EnrollmentService, PasswordAuthService, TokenSigner,
};
use cache::Kv;
use sqlx::PgPool;
use wallet::{TransferEngine, WalletService};

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: PgPool,
    pub kv: Kv,
    pub signer: Arc<TokenSigner>,
    pub password_auth: Arc<PasswordAuthService>,
    pub biometric: Arc<BiometricAuthService>,
    pub enrollment: Arc<EnrollmentService>,
    pub credentials: Arc<CredentialStore>,
    pub wallets: Arc<WalletService>,
    pub transfers: Arc<TransferEngine>,
}

// Ensure critical dependencies uphold Send/Sync for Axum state usage.
#[allow(dead_code)]
fn _assert_state_types_are_send_sync()
where
    AppConfig: Send + Sync + 'static,
    PgPool: Send + Sync + 'static,
    Kv: Send + Sync + 'static,
    TokenSigner: Send + Sync,
    PasswordAuthService: Send + Sync,
    BiometricAuthService: Send + Sync,
    EnrollmentService: Send + Sync,
    CredentialStore: Send + Sync,
    WalletService: Send + Sync,
    TransferEngine: Send + Sync,
{
}

#[allow(dead_code)]
fn _assert_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
