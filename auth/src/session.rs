use std::sync::Arc;

use chrono::{DateTime, Utc};
use domain::AuthTokens;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::hashing;
use crate::tokens::TokenSigner;

/// Issues access/refresh pairs and rotates refresh records. The refresh
/// record id is the JWT `jti`; storage holds only an Argon2id hash of the
/// raw token string.
#[derive(Clone)]
pub struct SessionManager {
    pool: PgPool,
    signer: Arc<TokenSigner>,
}

impl SessionManager {
    pub fn new(pool: PgPool, signer: Arc<TokenSigner>) -> Self {
        Self { pool, signer }
    }

    pub async fn issue(&self, user_id: Uuid) -> AuthResult<AuthTokens> {
        let jti = Uuid::new_v4();
        let refresh_token = self.signer.issue_refresh(user_id, jti)?;
        let token_hash = hashing::hash(refresh_token.clone()).await?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.signer.refresh_ttl())
                .unwrap_or_else(|_| chrono::Duration::seconds(604_800));

        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(jti)
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|err| AuthError::Internal(format!("failed to store refresh token: {err}")))?;

        let access_token = self.signer.issue_access(user_id)?;
        Ok(AuthTokens {
            access_token,
            refresh_token,
        })
    }

    /// Revokes the presented record and issues a new pair in one
    /// transaction. A concurrent presenter of the same token loses the
    /// `revoked = FALSE` guard and fails.
    pub async fn rotate(&self, raw_refresh: &str) -> AuthResult<(Uuid, AuthTokens)> {
        let claims = self.signer.verify_refresh(raw_refresh)?;
        let user_id = claims.user_id()?;
        let jti = claims
            .jti
            .as_deref()
            .and_then(|value| Uuid::parse_str(value).ok())
            .ok_or(AuthError::InvalidToken)?;

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT user_id, token_hash, expires_at, revoked FROM refresh_tokens \
             WHERE id = $1 FOR UPDATE",
        )
        .bind(jti)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(AuthError::InvalidToken);
        };

        let record_user: Uuid = row.try_get("user_id")?;
        let revoked: bool = row.try_get("revoked")?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        if record_user != user_id || revoked || expires_at < Utc::now() {
            return Err(AuthError::InvalidToken);
        }

        let token_hash: String = row.try_get("token_hash")?;
        if !hashing::verify(token_hash, raw_refresh.to_string()).await? {
            return Err(AuthError::InvalidToken);
        }

        let revoke = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE id = $1 AND revoked = FALSE",
        )
        .bind(jti)
        .execute(&mut *tx)
        .await?;
        if revoke.rows_affected() == 0 {
            return Err(AuthError::InvalidToken);
        }

        let new_jti = Uuid::new_v4();
        let new_refresh = self.signer.issue_refresh(user_id, new_jti)?;
        let new_hash = hashing::hash(new_refresh.clone()).await?;
        let new_expires = Utc::now()
            + chrono::Duration::from_std(self.signer.refresh_ttl())
                .unwrap_or_else(|_| chrono::Duration::seconds(604_800));

        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(new_jti)
        .bind(user_id)
        .bind(new_hash)
        .bind(new_expires)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|err| AuthError::Internal(format!("failed to commit rotation: {err}")))?;

        debug!(%user_id, "refresh token rotated");

        let access_token = self.signer.issue_access(user_id)?;
        Ok((
            user_id,
            AuthTokens {
                access_token,
                refresh_token: new_refresh,
            },
        ))
    }

    /// Best-effort revocation for logout; invalid input is ignored.
    pub async fn revoke_presented(&self, raw_refresh: &str) {
        let Ok(claims) = self.signer.verify_refresh(raw_refresh) else {
            return;
        };
        let Some(jti) = claims
            .jti
            .as_deref()
            .and_then(|value| Uuid::parse_str(value).ok())
        else {
            return;
        };
        let _ = sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE id = $1")
            .bind(jti)
            .execute(&self.pool)
            .await;
    }

    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> AuthResult<()> {
        sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = $1 AND revoked = FALSE")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
