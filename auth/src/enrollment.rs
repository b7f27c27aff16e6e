use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use cache::RateLimiter;
use chrono::Utc;
use domain::{BiometricVerifyRequest, ChallengeResponse, EnrollVerifyResponse};
use tracing::info;
use uuid::Uuid;

use crate::challenge::{ChallengeCache, ChallengeContext, ChallengeState};
use crate::credentials::CredentialStore;
use crate::error::{AuthError, AuthResult};
use crate::users::UserStore;
use crate::webauthn::WebauthnAdapter;

const ENROLL_RATE_LIMIT: i64 = 10;
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Binds a new passkey and its device record to an authenticated, verified
/// user.
pub struct EnrollmentService {
    users: UserStore,
    credentials: CredentialStore,
    challenges: ChallengeCache,
    adapter: Arc<dyn WebauthnAdapter>,
    limiter: RateLimiter,
}

impl EnrollmentService {
    pub fn new(
        users: UserStore,
        credentials: CredentialStore,
        challenges: ChallengeCache,
        adapter: Arc<dyn WebauthnAdapter>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            users,
            credentials,
            challenges,
            adapter,
            limiter,
        }
    }

    pub async fn challenge(
        &self,
        user_id: Uuid,
        device_name: Option<String>,
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
                &format!("rl:enroll:{user_id}:{ip}"),
                ENROLL_RATE_LIMIT,
                RATE_WINDOW,
            )
            .await?;

        let live = self.credentials.list_live_for_user(user.id).await?;
        let generated = self.adapter.generate_registration_options(
            user.id,
            &user.email,
            &user.display_name(),
            &live,
        )?;

        let challenge_id = self
            .challenges
            .put(
                &ChallengeState {
                    context: ChallengeContext::Enroll,
                    user_id: user.id,
                    email: user.email.clone(),
                    device_name,
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

    pub async fn verify(&self, request: BiometricVerifyRequest) -> AuthResult<EnrollVerifyResponse> {
        let state = self
            .challenges
            .take(&request.challenge_id)
            .await?
            .ok_or(AuthError::ChallengeNotFound)?;
        if state.context != ChallengeContext::Enroll {
            return Err(AuthError::ChallengeNotFound);
        }

        let age = Utc::now().signed_duration_since(state.created_at);
        let ttl = chrono::Duration::from_std(self.adapter.challenge_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if age > ttl {
            return Err(AuthError::ChallengeExpired);
        }

        let registered = self
            .adapter
            .verify_registration(&request.credential, &state.state)?
            .ok_or_else(|| {
                AuthError::Validation("credential attestation could not be verified".to_string())
            })?;

        if let Some(existing) = self.credentials.find(&registered.credential_id).await? {
            if existing.user_id != state.user_id {
                return Err(AuthError::CredentialConflict);
            }
        }

        let device_id = self
            .credentials
            .enroll(state.user_id, &registered, state.device_name.clone())
            .await?;

        info!(
            user_id = %state.user_id,
            credential_id = %registered.credential_id,
            %device_id,
            "credential enrolled"
        );

        Ok(EnrollVerifyResponse {
            credential_id: registered.credential_id,
            device_id,
        })
    }
}
