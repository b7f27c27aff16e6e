use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::hashing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingTokenKind {
    EmailVerification,
    PasswordReset,
}

impl PendingTokenKind {
    fn table(self) -> &'static str {
        match self {
            PendingTokenKind::EmailVerification => "email_verification_tokens",
            PendingTokenKind::PasswordReset => "password_reset_tokens",
        }
    }
}

/// Issues and one-shot-consumes `<id>.<secret_hex>` composites. Only the
/// Argon2id hash of the secret half ever reaches storage.
#[derive(Clone)]
pub struct PendingTokenStore {
    pool: PgPool,
}

impl PendingTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        kind: PendingTokenKind,
        user_id: Uuid,
        ttl: Duration,
    ) -> AuthResult<String> {
        let id = Uuid::new_v4();
        let secret = hashing::generate_secret_hex();
        let token_hash = hashing::hash(secret.clone()).await?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|err| AuthError::Internal(format!("invalid token ttl: {err}")))?;

        let sql = format!(
            "INSERT INTO {} (id, user_id, token_hash, expires_at) VALUES ($1, $2, $3, $4)",
            kind.table()
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(user_id)
            .bind(token_hash)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|err| AuthError::Internal(format!("failed to persist token: {err}")))?;

        Ok(format!("{id}.{secret}"))
    }

    /// Returns the owning user id, or `None` for any unusable composite:
    /// malformed, unknown, expired, already consumed, or bad secret.
    pub async fn consume(
        &self,
        kind: PendingTokenKind,
        composite: &str,
    ) -> AuthResult<Option<Uuid>> {
        let Some((id_part, secret)) = composite.split_once('.') else {
            return Ok(None);
        };
        let Ok(id) = Uuid::parse_str(id_part) else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT user_id, token_hash, expires_at, consumed_at FROM {} WHERE id = $1",
            kind.table()
        );
        let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let consumed_at: Option<DateTime<Utc>> = row.try_get("consumed_at")?;
        if consumed_at.is_some() {
            return Ok(None);
        }
        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        if expires_at < Utc::now() {
            return Ok(None);
        }

        let token_hash: String = row.try_get("token_hash")?;
        if !hashing::verify(token_hash, secret.to_string()).await? {
            return Ok(None);
        }

        // The losing side of a concurrent consume sees zero rows updated.
        let sql = format!(
            "UPDATE {} SET consumed_at = NOW() WHERE id = $1 AND consumed_at IS NULL",
            kind.table()
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let user_id: Uuid = row.try_get("user_id")?;
        Ok(Some(user_id))
    }
}
