use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use cache::RateLimiter;
use chrono::Utc;
use domain::{
    AuthSession, BiometricChallengeRequest, BiometricVerifyRequest, ChallengeResponse, Credential,
    StepUpTokenResponse, User, UserProfile,
};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::challenge::{ChallengeCache, ChallengeContext, ChallengeState};
use crate::credentials::CredentialStore;
use crate::error::{AuthError, AuthResult};
use crate::session::SessionManager;
use crate::tokens::TokenSigner;
use crate::users::{normalize_email, UserStore};
use crate::webauthn::WebauthnAdapter;

const LOGIN_CHALLENGE_LIMIT: i64 = 10;
const STEP_UP_CHALLENGE_LIMIT: i64 = 20;
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Possession/biometric ladder: passkey login producing session tokens, and
/// the authenticated step-up ceremony producing a purpose-scoped token.
pub struct BiometricAuthService {
    users: UserStore,
    credentials: CredentialStore,
    challenges: ChallengeCache,
    adapter: Arc<dyn WebauthnAdapter>,
    sessions: SessionManager,
    signer: Arc<TokenSigner>,
    limiter: RateLimiter,
}

impl BiometricAuthService {
    pub fn new(
        users: UserStore,
        credentials: CredentialStore,
        challenges: ChallengeCache,
        adapter: Arc<dyn WebauthnAdapter>,
        sessions: SessionManager,
        signer: Arc<TokenSigner>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            users,
            credentials,
            challenges,
            adapter,
            sessions,
            signer,
            limiter,
        }
    }

    pub async fn login_challenge(
        &self,
        request: BiometricChallengeRequest,
        ip: IpAddr,
    ) -> AuthResult<ChallengeResponse> {
        let (identifier, user) = match (request.email.as_deref(), request.user_id) {
            (Some(email), None) => {
                let email = normalize_email(email);
                let user = self.users.find_by_email(&email).await?;
                (email, user)
            }
            (None, Some(user_id)) => (user_id.to_string(), self.users.find_by_id(user_id).await?),
            _ => {
                return Err(AuthError::Validation(
                    "provide exactly one of email or userId".to_string(),
                ))
            }
        };

        // Unknown identifiers read the same as accounts with no passkeys.
        let Some(user) = user else {
            return Err(AuthError::NoCredentials);
        };
        if !user.email_verified {
            return Err(AuthError::EmailNotVerified);
        }

        self.limiter
            .consume(
                &format!("rl:webauthn:login:{}:{identifier}:{ip}", user.id),
                LOGIN_CHALLENGE_LIMIT,
                RATE_WINDOW,
            )
            .await?;

        let usable = self.credentials.list_usable_for_user(user.id).await?;
        if usable.is_empty() {
            return Err(AuthError::NoCredentials);
        }

        let generated = self.adapter.generate_authentication_options(&usable)?;
        let challenge_id = self
            .challenges
            .put(
                &ChallengeState {
                    context: ChallengeContext::Login,
                    user_id: user.id,
                    email: user.email.clone(),
                    device_name: None,
                    purpose: None,
                    state: generated.state,
                    created_at: Utc::now(),
                },
                self.adapter.challenge_ttl(),
            )
            .await?;

        Ok(ChallengeResponse {
            challenge_id,
            public_key_credential_options: generated.options,
        })
    }

    pub async fn login_verify(&self, request: BiometricVerifyRequest) -> AuthResult<AuthSession> {
        let state = self.take_login_state(&request.challenge_id).await?;

        let user = self.recheck_user(state.user_id).await?;
        let stored = self
            .load_assertable_credential(&request.credential, user.id)
            .await?;

        let verified = self
            .adapter
            .verify_authentication(&request.credential, &state.state, &stored)?
            .ok_or(AuthError::InvalidCredentials)?;
        self.credentials
            .reconcile_sign_count(&stored, verified.new_sign_count, self.adapter.sign_count_mode())
            .await?;

        let tokens = self.sessions.issue(user.id).await?;
        info!(user_id = %user.id, "biometric login");
        Ok(AuthSession {
            user: UserProfile::from(user),
            tokens,
        })
    }

    pub async fn step_up_challenge(
        &self,
        user_id: Uuid,
        purpose: Option<String>,
        ip: IpAddr,
    ) -> AuthResult<ChallengeResponse> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::NotFound)?;
        if !user.email_verified {
            return Err(AuthError::EmailNotVerified);
        }

        self.limiter
            .consume(
                &format!(
                    "rl:webauthn:stepup:{user_id}:{}:{ip}",
                    purpose.as_deref().unwrap_or("-")
                ),
                STEP_UP_CHALLENGE_LIMIT,
                RATE_WINDOW,
            )
            .await?;

        let usable = self.credentials.list_usable_for_user(user.id).await?;
        if usable.is_empty() {
            return Err(AuthError::NoCredentials);
        }

        let generated = self.adapter.generate_authentication_options(&usable)?;
        let challenge_id = self
            .challenges
            .put(
                &ChallengeState {
                    context: ChallengeContext::Login,
                    user_id: user.id,
                    email: user.email.clone(),
                    device_name: None,
                    purpose,
                    state: generated.state,
                    created_at: Utc::now(),
                },
                self.adapter.challenge_ttl(),
            )
            .await?;

        Ok(ChallengeResponse {
            challenge_id,
            public_key_credential_options: generated.options,
        })
    }

    pub async fn step_up_verify(
        &self,
        requesting_user_id: Uuid,
        request: BiometricVerifyRequest,
    ) -> AuthResult<StepUpTokenResponse> {
        let state = self.take_login_state(&request.challenge_id).await?;
        if state.user_id != requesting_user_id {
            return Err(AuthError::Forbidden);
        }

        let user = self.recheck_user(state.user_id).await?;
        let stored = self
            .load_assertable_credential(&request.credential, user.id)
            .await?;

        let verified = self
            .adapter
            .verify_authentication(&request.credential, &state.state, &stored)?
            .ok_or(AuthError::InvalidCredentials)?;
        self.credentials
            .reconcile_sign_count(&stored, verified.new_sign_count, self.adapter.sign_count_mode())
            .await?;

        let step_up_token =
            self.signer
                .issue_step_up(user.id, state.purpose.clone(), &request.challenge_id)?;
        info!(user_id = %user.id, purpose = ?state.purpose, "step-up assertion verified");
        Ok(StepUpTokenResponse { step_up_token })
    }

    async fn take_login_state(&self, challenge_id: &str) -> AuthResult<ChallengeState> {
        let state = self
            .challenges
            .take(challenge_id)
            .await?
            .ok_or(AuthError::ChallengeNotFound)?;
        if state.context != ChallengeContext::Login {
            return Err(AuthError::ChallengeNotFound);
        }

        let age = Utc::now().signed_duration_since(state.created_at);
        let ttl = chrono::Duration::from_std(self.adapter.challenge_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if age > ttl {
            return Err(AuthError::ChallengeExpired);
        }
        Ok(state)
    }

    async fn recheck_user(&self, user_id: Uuid) -> AuthResult<User> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        if !user.email_verified {
            return Err(AuthError::EmailNotVerified);
        }
        Ok(user)
    }

    async fn load_assertable_credential(
        &self,
        response: &Value,
        user_id: Uuid,
    ) -> AuthResult<Credential> {
        let credential_id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Validation("credential id is missing".to_string()))?;

        let stored = self
            .credentials
            .find(credential_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        if stored.user_id != user_id || stored.revoked {
            return Err(AuthError::InvalidCredentials);
        }
        if !self
            .credentials
            .has_active_device(&stored.credential_id)
            .await?
        {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(stored)
    }
}
