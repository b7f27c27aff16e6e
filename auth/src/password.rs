use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use cache::RateLimiter;
use domain::{AuthSession, LoginRequest, RegisterRequest, UserProfile};
use sha2::Digest;
use tracing::info;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::hashing;
use crate::mailer::Mailer;
use crate::pending::{PendingTokenKind, PendingTokenStore};
use crate::session::SessionManager;
use crate::tokens::TokenSigner;
use crate::users::{normalize_email, UserStore};

const LOGIN_RATE_LIMIT: i64 = 5;
const REFRESH_RATE_LIMIT: i64 = 20;
const RATE_WINDOW: Duration = Duration::from_secs(60);
const VERIFICATION_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const RESET_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);
const MIN_PASSWORD_LEN: usize = 8;

/// Knowledge-factor ladder: registration, login, refresh rotation, logout,
/// email verification and password reset.
pub struct PasswordAuthService {
    users: UserStore,
    sessions: SessionManager,
    pending: PendingTokenStore,
    signer: Arc<TokenSigner>,
    mailer: Arc<dyn Mailer>,
    limiter: RateLimiter,
}

impl PasswordAuthService {
    pub fn new(
        users: UserStore,
        sessions: SessionManager,
        pending: PendingTokenStore,
        signer: Arc<TokenSigner>,
        mailer: Arc<dyn Mailer>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            users,
            sessions,
            pending,
            signer,
            mailer,
            limiter,
        }
    }

    fn validate_email(email: &str) -> AuthResult<()> {
        let normalized = normalize_email(email);
        match normalized.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
            _ => Err(AuthError::Validation("email is not valid".to_string())),
        }
    }

    fn validate_password(password: &str) -> AuthResult<()> {
        if password.trim().len() < MIN_PASSWORD_LEN {
            return Err(AuthError::Validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        Ok(())
    }

    pub async fn register(&self, request: RegisterRequest) -> AuthResult<AuthSession> {
        Self::validate_email(&request.email)?;
        Self::validate_password(&request.password)?;

        let password_hash = hashing::hash(request.password).await?;
        let user = self
            .users
            .create(
                &request.email,
                request.first_name,
                request.last_name,
                password_hash,
            )
            .await?;

        let tokens = self.sessions.issue(user.id).await?;

        let token = self
            .pending
            .create(PendingTokenKind::EmailVerification, user.id, VERIFICATION_TOKEN_TTL)
            .await?;
        self.users.touch_verification_requested(user.id).await?;
        self.mailer.send_verification(&user.email, &token).await?;

        info!(user_id = %user.id, "user registered");

        Ok(AuthSession {
            user: UserProfile::from(user),
            tokens,
        })
    }

    pub async fn login(&self, request: LoginRequest, ip: IpAddr) -> AuthResult<AuthSession> {
        let email = normalize_email(&request.email);
        self.limiter
            .consume(&format!("rl:login:{email}:{ip}"), LOGIN_RATE_LIMIT, RATE_WINDOW)
            .await?;

        let user = self.users.find_by_email(&email).await?;
        let Some(user) = user else {
            hashing::burn(request.password).await;
            return Err(AuthError::InvalidCredentials);
        };
        let Some(password_hash) = user.password_hash.clone() else {
            // Biometric-only account; burn anyway so timing stays flat.
            hashing::burn(request.password).await;
            return Err(AuthError::InvalidCredentials);
        };

        if !hashing::verify(password_hash, request.password).await? {
            return Err(AuthError::InvalidCredentials);
        }
        if !user.email_verified {
            return Err(AuthError::EmailNotVerified);
        }

        let tokens = self.sessions.issue(user.id).await?;
        Ok(AuthSession {
            user: UserProfile::from(user),
            tokens,
        })
    }

    pub async fn refresh(&self, raw_refresh: &str, ip: IpAddr) -> AuthResult<AuthSession> {
        let digest = hex::encode(sha2::Sha256::digest(raw_refresh.as_bytes()));
        self.limiter
            .consume(
                &format!("rl:refresh:{digest}:{ip}"),
                REFRESH_RATE_LIMIT,
                RATE_WINDOW,
            )
            .await?;

        let claims = self.signer.verify_refresh(raw_refresh)?;
        let user = self
            .users
            .find_by_id(claims.user_id()?)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if !user.email_verified {
            return Err(AuthError::EmailNotVerified);
        }

        let (_, tokens) = self.sessions.rotate(raw_refresh).await?;
        Ok(AuthSession {
            user: UserProfile::from(user),
            tokens,
        })
    }

    pub async fn logout(&self, raw_refresh: &str) {
        self.sessions.revoke_presented(raw_refresh).await;
    }

    /// Silent success whether or not the email exists.
    pub async fn request_verification(&self, email: &str) -> AuthResult<()> {
        let Some(user) = self.users.find_by_email(email).await? else {
            return Ok(());
        };
        if user.email_verified {
            return Ok(());
        }

        let token = self
            .pending
            .create(PendingTokenKind::EmailVerification, user.id, VERIFICATION_TOKEN_TTL)
            .await?;
        self.users.touch_verification_requested(user.id).await?;
        self.mailer.send_verification(&user.email, &token).await?;
        Ok(())
    }

    pub async fn confirm_verification(&self, token: &str) -> AuthResult<()> {
        let user_id = self
            .pending
            .consume(PendingTokenKind::EmailVerification, token)
            .await?
            .ok_or_else(|| AuthError::Validation("token is invalid or expired".to_string()))?;
        self.users.mark_email_verified(user_id).await?;
        info!(%user_id, "email verified");
        Ok(())
    }

    /// Silent success whether or not the email exists.
    pub async fn request_password_reset(&self, email: &str) -> AuthResult<()> {
        let Some(user) = self.users.find_by_email(email).await? else {
            return Ok(());
        };

        let token = self
            .pending
            .create(PendingTokenKind::PasswordReset, user.id, RESET_TOKEN_TTL)
            .await?;
        self.mailer.send_password_reset(&user.email, &token).await?;
        Ok(())
    }

    pub async fn confirm_password_reset(
        &self,
        token: &str,
        new_password: String,
    ) -> AuthResult<()> {
        Self::validate_password(&new_password)?;
        let user_id = self
            .pending
            .consume(PendingTokenKind::PasswordReset, token)
            .await?
            .ok_or_else(|| AuthError::Validation("token is invalid or expired".to_string()))?;

        let password_hash = hashing::hash(new_password).await?;
        self.users.set_password_hash(user_id, &password_hash).await?;
        // Every outstanding session dies with the old password.
        self.sessions.revoke_all_for_user(user_id).await?;
        info!(%user_id, "password reset");
        Ok(())
    }

    pub async fn profile(&self, user_id: Uuid) -> AuthResult<UserProfile> {
        self.users
            .find_by_id(user_id)
            .await?
            .map(UserProfile::from)
            .ok_or(AuthError::NotFound)
    }
}
