use std::sync::Arc;

use anyhow::{Context, Result};
use auth::{
    BiometricAuthService, ChallengeCache, CredentialStore, EnrollmentService, LoggingMailer,
    PasswordAuthService, PendingTokenStore, RelyingParty, SessionManager, TokenSigner,
    TokenSignerConfig, UserStore, WebauthnSettings,
};
use cache::{Kv, RateLimiter};
use sqlx::PgPool;
use url::Url;
use wallet::{TransferEngine, WalletConfig, WalletService};

use crate::{config::AppConfig, state::AppState};

pub async fn build_state(config: &AppConfig) -> Result<AppState> {
    let pool = PgPool::connect(&config.database_url).await?;
    sqlx::migrate!("../migrations").run(&pool).await?;

    let kv = match &config.redis_url {
        Some(url) => Kv::connect(url).context("failed to open redis client")?,
        None => {
            tracing::warn!("REDIS_URL not set; using in-process ephemeral store");
            Kv::in_memory()
        }
    };

    let signer = Arc::new(TokenSigner::new(TokenSignerConfig {
        access_secret: config.access_secret.clone(),
        refresh_secret: config.refresh_secret.clone(),
        access_ttl: config.access_ttl,
        refresh_ttl: config.refresh_ttl,
        step_up_ttl: config.step_up_ttl,
    }));

    let origins = config
        .webauthn_origins
        .iter()
        .map(|raw| {
            Url::parse(raw).map_err(|err| anyhow::anyhow!("invalid WEBAUTHN_ORIGINS entry {raw}: {err}"))
        })
        .collect::<Result<Vec<_>>>()?;
    let adapter = Arc::new(
        RelyingParty::new(WebauthnSettings {
            rp_id: config.rp_id.clone(),
            rp_name: config.rp_name.clone(),
            origins,
            challenge_ttl: config.challenge_ttl,
            sign_count_mode: config.sign_count_mode,
        })
        .map_err(|err| anyhow::anyhow!("failed to build webauthn relying party: {err}"))?,
    );

    let users = UserStore::new(pool.clone());
    let credential_store = CredentialStore::new(pool.clone());
    let credentials = Arc::new(credential_store.clone());
    let sessions = SessionManager::new(pool.clone(), signer.clone());
    let pending = PendingTokenStore::new(pool.clone());
    let challenges = ChallengeCache::new(kv.clone());
    let limiter = RateLimiter::new(kv.clone());
    let mailer = Arc::new(LoggingMailer);

    let password_auth = Arc::new(PasswordAuthService::new(
        users.clone(),
        sessions.clone(),
        pending,
        signer.clone(),
        mailer,
        limiter.clone(),
    ));
    let biometric = Arc::new(BiometricAuthService::new(
        users.clone(),
        credential_store.clone(),
        challenges.clone(),
        adapter.clone(),
        sessions.clone(),
        signer.clone(),
        limiter.clone(),
    ));
    let enrollment = Arc::new(EnrollmentService::new(
        users,
        credential_store,
        challenges,
        adapter,
        limiter,
    ));

    let wallets = Arc::new(WalletService::new(
        pool.clone(),
        WalletConfig {
            default_currency: config.default_currency.clone(),
            min_amount_minor: config.transfer_min_amount_minor,
            max_amount_minor: config.transfer_max_amount_minor,
            absolute_max_minor: config.transfer_absolute_max_minor,
            daily_limit_minor: config.transfer_daily_limit_minor,
            high_value_threshold_minor: config.high_value_threshold_minor,
        },
    ));
    let transfers = Arc::new(TransferEngine::new(
        pool.clone(),
        wallets.clone(),
        signer.clone(),
    ));

    Ok(AppState {
        config: config.clone(),
        db: pool,
        kv,
        signer,
        password_auth,
        biometric,
        enrollment,
        credentials,
        wallets,
        transfers,
    })
}
