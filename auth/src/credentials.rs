use chrono::{DateTime, Utc};
use domain::{Credential, Device};
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::webauthn::{RegisteredCredential, SignCountMode};

pub const SIGN_COUNT_REGRESSION_REASON: &str = "sign_count_regression";
pub const USER_REVOKED_REASON: &str = "user_revoked";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignCountAction {
    Advance(i64),
    Keep,
    Regression,
}

/// Counter reconciliation after a successful assertion. Equal counters
/// (including authenticators pinned at zero) are a no-op; anything smaller
/// than the stored value is a regression.
pub fn sign_count_action(stored: i64, reported: i64) -> SignCountAction {
    if reported > stored {
        SignCountAction::Advance(reported)
    } else if reported == stored {
        SignCountAction::Keep
    } else {
        SignCountAction::Regression
    }
}

#[derive(Clone)]
pub struct CredentialStore {
    pool: PgPool,
}

impl CredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    const COLUMNS: &'static str = "credential_id, user_id, public_key, sign_count, aaguid, \
         transports, device_name, revoked, revoked_at, created_at";

    fn row_to_credential(row: &sqlx::postgres::PgRow) -> AuthResult<Credential> {
        let revoked_at: Option<DateTime<Utc>> = row.try_get("revoked_at")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(Credential {
            credential_id: row.try_get("credential_id")?,
            user_id: row.try_get("user_id")?,
            public_key: row.try_get("public_key")?,
            sign_count: row.try_get("sign_count")?,
            aaguid: row.try_get("aaguid")?,
            transports: row.try_get("transports")?,
            device_name: row.try_get("device_name")?,
            revoked: row.try_get("revoked")?,
            revoked_at,
            created_at,
        })
    }

    fn row_to_device(row: &sqlx::postgres::PgRow) -> AuthResult<Device> {
        let deactivated_at: Option<DateTime<Utc>> = row.try_get("deactivated_at")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(Device {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            credential_id: row.try_get("credential_id")?,
            label: row.try_get("label")?,
            active: row.try_get("active")?,
            deactivated_at,
            deactivated_reason: row.try_get("deactivated_reason")?,
            created_at,
        })
    }

    pub async fn find(&self, credential_id: &str) -> AuthResult<Option<Credential>> {
        let sql = format!(
            "SELECT {} FROM credentials WHERE credential_id = $1",
            Self::COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(credential_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Self::row_to_credential(&row)).transpose()
    }

    /// All non-revoked credentials for a user (enrollment exclude list).
    pub async fn list_live_for_user(&self, user_id: Uuid) -> AuthResult<Vec<Credential>> {
        let sql = format!(
            "SELECT {} FROM credentials WHERE user_id = $1 AND revoked = FALSE \
             ORDER BY created_at ASC",
            Self::COLUMNS
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_credential).collect()
    }

    /// Non-revoked credentials that still have at least one active device.
    pub async fn list_usable_for_user(&self, user_id: Uuid) -> AuthResult<Vec<Credential>> {
        let sql = format!(
            "SELECT {} FROM credentials c WHERE c.user_id = $1 AND c.revoked = FALSE \
             AND EXISTS (SELECT 1 FROM devices d \
                         WHERE d.credential_id = c.credential_id AND d.active = TRUE) \
             ORDER BY c.created_at ASC",
            Self::COLUMNS
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_credential).collect()
    }

    pub async fn has_active_device(&self, credential_id: &str) -> AuthResult<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM devices WHERE credential_id = $1 AND active = TRUE LIMIT 1",
        )
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Binds a credential and a fresh device to the user in one transaction.
    /// An existing row for the same credential id is reassigned and revived.
    pub async fn enroll(
        &self,
        user_id: Uuid,
        registered: &RegisteredCredential,
        device_label: Option<String>,
    ) -> AuthResult<Uuid> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO credentials \
             (credential_id, user_id, public_key, sign_count, aaguid, transports, device_name) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (credential_id) DO UPDATE SET \
                 user_id = EXCLUDED.user_id, \
                 public_key = EXCLUDED.public_key, \
                 sign_count = EXCLUDED.sign_count, \
                 aaguid = EXCLUDED.aaguid, \
                 transports = EXCLUDED.transports, \
                 device_name = EXCLUDED.device_name, \
                 revoked = FALSE, \
                 revoked_at = NULL",
        )
        .bind(&registered.credential_id)
        .bind(user_id)
        .bind(&registered.public_key)
        .bind(registered.sign_count)
        .bind(&registered.aaguid)
        .bind(&registered.transports)
        .bind(&device_label)
        .execute(&mut *tx)
        .await?;

        let device_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO devices (id, user_id, credential_id, label, active) \
             VALUES ($1, $2, $3, $4, TRUE)",
        )
        .bind(device_id)
        .bind(user_id)
        .bind(&registered.credential_id)
        .bind(&device_label)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|err| AuthError::Internal(format!("failed to commit enrollment: {err}")))?;

        Ok(device_id)
    }

    /// Revokes the credential and deactivates every device bound to it.
    pub async fn revoke_credential(&self, credential_id: &str, reason: &str) -> AuthResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE credentials SET revoked = TRUE, revoked_at = NOW() \
             WHERE credential_id = $1 AND revoked = FALSE",
        )
        .bind(credential_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE devices SET active = FALSE, deactivated_at = NOW(), deactivated_reason = $2 \
             WHERE credential_id = $1 AND active = TRUE",
        )
        .bind(credential_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|err| AuthError::Internal(format!("failed to commit revocation: {err}")))?;

        Ok(())
    }

    pub async fn reconcile_sign_count(
        &self,
        credential: &Credential,
        reported: i64,
        mode: SignCountMode,
    ) -> AuthResult<()> {
        match sign_count_action(credential.sign_count, reported) {
            SignCountAction::Advance(count) => {
                sqlx::query(
                    "UPDATE credentials SET sign_count = $2 \
                     WHERE credential_id = $1 AND revoked = FALSE",
                )
                .bind(&credential.credential_id)
                .bind(count)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            SignCountAction::Keep => Ok(()),
            SignCountAction::Regression => match mode {
                SignCountMode::Strict => {
                    self.revoke_credential(
                        &credential.credential_id,
                        SIGN_COUNT_REGRESSION_REASON,
                    )
                    .await?;
                    Err(AuthError::CredentialCompromised)
                }
                SignCountMode::Lenient => {
                    warn!(
                        credential_id = %credential.credential_id,
                        stored = credential.sign_count,
                        reported,
                        "sign count regressed; continuing in lenient mode"
                    );
                    Ok(())
                }
            },
        }
    }

    pub async fn list_devices(&self, user_id: Uuid) -> AuthResult<Vec<Device>> {
        let rows = sqlx::query(
            "SELECT id, user_id, credential_id, label, active, deactivated_at, \
                    deactivated_reason, created_at \
             FROM devices WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_device).collect()
    }

    pub async fn deactivate_device(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        reason: &str,
    ) -> AuthResult<bool> {
        let result = sqlx::query(
            "UPDATE devices SET active = FALSE, deactivated_at = NOW(), deactivated_reason = $3 \
             WHERE id = $1 AND user_id = $2 AND active = TRUE",
        )
        .bind(device_id)
        .bind(user_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn larger_counter_advances() {
        assert_eq!(sign_count_action(3, 7), SignCountAction::Advance(7));
        assert_eq!(sign_count_action(0, 1), SignCountAction::Advance(1));
    }

    #[test]
    fn equal_counters_are_a_noop() {
        assert_eq!(sign_count_action(5, 5), SignCountAction::Keep);
        // Authenticators that never increment report zero forever.
        assert_eq!(sign_count_action(0, 0), SignCountAction::Keep);
    }

    #[test]
    fn smaller_counter_is_a_regression() {
        assert_eq!(sign_count_action(10, 5), SignCountAction::Regression);
        assert_eq!(sign_count_action(1, 0), SignCountAction::Regression);
    }
}
