use std::time::Duration;

use cache::Kv;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AuthResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeContext {
    Enroll,
    Login,
}

/// In-flight WebAuthn ceremony state, held only in the ephemeral store.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeState {
    pub context: ChallengeContext,
    pub user_id: Uuid,
    pub email: String,
    pub device_name: Option<String>,
    pub purpose: Option<String>,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ChallengeCache {
    kv: Kv,
}

impl ChallengeCache {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    fn key(challenge_id: &str) -> String {
        format!("webauthn:auth:challenge:{challenge_id}")
    }

    pub async fn put(&self, state: &ChallengeState, ttl: Duration) -> AuthResult<String> {
        let challenge_id = Uuid::new_v4().simple().to_string();
        self.kv
            .set_json_ex(&Self::key(&challenge_id), state, ttl)
            .await?;
        Ok(challenge_id)
    }

    /// Fetch-and-delete; a concurrent second verifier observes a miss.
    pub async fn take(&self, challenge_id: &str) -> AuthResult<Option<ChallengeState>> {
        Ok(self.kv.get_del_json(&Self::key(challenge_id)).await?)
    }
}
