use chrono::{DateTime, Utc};
use domain::User;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};

/// Emails are normalized at every boundary before they touch storage.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Clone)]
pub struct UserStore {
    pool: PgPool,
}

impl UserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_user(row: &sqlx::postgres::PgRow) -> AuthResult<User> {
        let verification_requested_at: Option<DateTime<Utc>> =
            row.try_get("verification_requested_at")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(User {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            password_hash: row.try_get("password_hash")?,
            email_verified: row.try_get("email_verified")?,
            verification_requested_at,
            created_at,
        })
    }

    const COLUMNS: &'static str = "id, email, first_name, last_name, password_hash, \
         email_verified, verification_requested_at, created_at";

    pub async fn find_by_email(&self, email: &str) -> AuthResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE email = $1", Self::COLUMNS);
        let row = sqlx::query(&sql)
            .bind(normalize_email(email))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Self::row_to_user(&row)).transpose()
    }

    pub async fn find_by_id(&self, user_id: Uuid) -> AuthResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", Self::COLUMNS);
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Self::row_to_user(&row)).transpose()
    }

    pub async fn create(
        &self,
        email: &str,
        first_name: Option<String>,
        last_name: Option<String>,
        password_hash: String,
    ) -> AuthResult<User> {
        let id = Uuid::new_v4();
        let sql = format!(
            "INSERT INTO users (id, email, first_name, last_name, password_hash) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            Self::COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(normalize_email(email))
            .bind(first_name)
            .bind(last_name)
            .bind(password_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| match &err {
                sqlx::Error::Database(db) if db.is_unique_violation() => AuthError::EmailTaken,
                _ => AuthError::from(err),
            })?;
        Self::row_to_user(&row)
    }

    pub async fn mark_email_verified(&self, user_id: Uuid) -> AuthResult<()> {
        sqlx::query(
            "UPDATE users SET email_verified = TRUE, verification_requested_at = NULL WHERE id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_verification_requested(&self, user_id: Uuid) -> AuthResult<()> {
        sqlx::query("UPDATE users SET verification_requested_at = NOW() WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_password_hash(&self, user_id: Uuid, password_hash: &str) -> AuthResult<()> {
        sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(user_id)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
