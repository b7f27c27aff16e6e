use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use domain::{
    CounterpartyView, TransactionListItem, TransactionStatus, TransferResponse, TransferRole,
    UserIdentifier, Wallet, WalletLimits, WalletStatus, WalletView,
};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{WalletError, WalletResult};

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub default_currency: String,
    pub min_amount_minor: i64,
    pub max_amount_minor: i64,
    pub absolute_max_minor: i64,
    pub daily_limit_minor: i64,
    pub high_value_threshold_minor: i64,
}

impl WalletConfig {
    pub fn per_transaction_max(&self) -> i64 {
        self.max_amount_minor.min(self.absolute_max_minor)
    }
}

/// Counterparty user fields needed for masking.
#[derive(Debug, Clone)]
pub struct RecipientUser {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl RecipientUser {
    pub fn masked(&self) -> CounterpartyView {
        CounterpartyView {
            masked_email: mask_email(&self.email),
            masked_name: mask_name(self.first_name.as_deref(), self.last_name.as_deref()),
        }
    }
}

/// Lazy wallet creation, balance/limit views and masked history.
pub struct WalletService {
    pool: PgPool,
    config: WalletConfig,
}

impl WalletService {
    pub fn new(pool: PgPool, config: WalletConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    fn row_to_wallet(row: &sqlx::postgres::PgRow) -> WalletResult<Wallet> {
        let status_raw: String = row.try_get("status")?;
        let status = WalletStatus::parse(&status_raw)
            .ok_or_else(|| WalletError::Internal(format!("unknown wallet status {status_raw}")))?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(Wallet {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            currency: row.try_get("currency")?,
            status,
            available_balance_minor: row.try_get("available_balance_minor")?,
            created_at,
        })
    }

    /// Upsert keyed by the unique `user_id`; currency is canonicalized to
    /// upper-case on write.
    pub async fn get_or_create_for_user(&self, user_id: Uuid) -> WalletResult<Wallet> {
        sqlx::query(
            "INSERT INTO wallets (id, user_id, currency) VALUES ($1, $2, $3) \
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(self.config.default_currency.to_uppercase())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, user_id, currency, status, available_balance_minor, created_at \
             FROM wallets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_wallet(&row)
    }

    /// Completed outgoing volume since UTC midnight.
    pub async fn daily_total(&self, wallet_id: Uuid) -> WalletResult<i64> {
        let midnight = utc_midnight();
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount_minor), 0)::BIGINT AS total FROM wallet_transactions \
             WHERE from_wallet_id = $1 AND status = 'COMPLETED' AND created_at >= $2",
        )
        .bind(wallet_id)
        .bind(midnight)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }

    pub async fn view_for_user(&self, user_id: Uuid) -> WalletResult<WalletView> {
        let wallet = self.get_or_create_for_user(user_id).await?;
        let daily_used = self.daily_total(wallet.id).await?;
        Ok(WalletView {
            id: wallet.id,
            currency: wallet.currency,
            status: wallet.status,
            available_balance_minor: wallet.available_balance_minor,
            limits: WalletLimits {
                min_amount_minor: self.config.min_amount_minor,
                per_transaction_max_minor: self.config.per_transaction_max(),
                daily_max_minor: self.config.daily_limit_minor,
                daily_used_minor: daily_used,
            },
        })
    }

    pub async fn find_user_by_identifier(
        &self,
        identifier: &UserIdentifier,
    ) -> WalletResult<Option<RecipientUser>> {
        let row = match (identifier.email.as_deref(), identifier.user_id) {
            (Some(email), None) => {
                sqlx::query(
                    "SELECT id, email, first_name, last_name FROM users WHERE email = $1",
                )
                .bind(auth::normalize_email(email))
                .fetch_optional(&self.pool)
                .await?
            }
            (None, Some(user_id)) => {
                sqlx::query("SELECT id, email, first_name, last_name FROM users WHERE id = $1")
                    .bind(user_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            _ => {
                return Err(WalletError::Validation(
                    "provide exactly one of email or userId".to_string(),
                ))
            }
        };

        row.map(|row| {
            Ok(RecipientUser {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                first_name: row.try_get("first_name")?,
                last_name: row.try_get("last_name")?,
            })
        })
        .transpose()
    }

    pub async fn resolve_recipient(
        &self,
        identifier: &UserIdentifier,
    ) -> WalletResult<domain::ResolvedRecipient> {
        let user = self
            .find_user_by_identifier(identifier)
            .await?
            .ok_or(WalletError::RecipientNotFound)?;
        let masked = user.masked();
        Ok(domain::ResolvedRecipient {
            user_id: user.id,
            masked_email: masked.masked_email,
            masked_name: masked.masked_name,
        })
    }

    pub async fn list_transactions_for_user(
        &self,
        user_id: Uuid,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> WalletResult<(Vec<TransactionListItem>, Option<String>, i64)> {
        let wallet = self.get_or_create_for_user(user_id).await?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let cursor = match cursor {
            Some(raw) => Some(
                decode_cursor(raw)
                    .ok_or_else(|| WalletError::Validation("cursor is not valid".to_string()))?,
            ),
            None => None,
        };

        let base = "SELECT t.id, t.status, t.amount_minor, t.currency, t.note, t.created_at, \
                    t.from_wallet_id, t.to_wallet_id, \
                    fu.email AS from_email, fu.first_name AS from_first, fu.last_name AS from_last, \
                    tu.email AS to_email, tu.first_name AS to_first, tu.last_name AS to_last \
             FROM wallet_transactions t \
             JOIN wallets fw ON fw.id = t.from_wallet_id JOIN users fu ON fu.id = fw.user_id \
             JOIN wallets tw ON tw.id = t.to_wallet_id JOIN users tu ON tu.id = tw.user_id \
             WHERE (t.from_wallet_id = $1 OR t.to_wallet_id = $1)";
        let rows = if let Some((ts, id)) = cursor {
            let sql = format!(
                "{base} AND (t.created_at, t.id) < ($2, $3) \
                 ORDER BY t.created_at DESC, t.id DESC LIMIT $4"
            );
            sqlx::query(&sql)
                .bind(wallet.id)
                .bind(ts)
                .bind(id)
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await?
        } else {
            let sql = format!("{base} ORDER BY t.created_at DESC, t.id DESC LIMIT $2");
            sqlx::query(&sql)
                .bind(wallet.id)
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await?
        };

        let has_more = rows.len() as i64 > limit;
        let mut items = Vec::with_capacity(rows.len().min(limit as usize));
        for row in rows.iter().take(limit as usize) {
            items.push(Self::row_to_list_item(row, wallet.id)?);
        }

        let next_cursor = if has_more {
            rows.get(limit as usize - 1)
                .map(|row| -> WalletResult<String> {
                    let created_at: DateTime<Utc> = row.try_get("created_at")?;
                    let id: Uuid = row.try_get("id")?;
                    Ok(encode_cursor(created_at, id))
                })
                .transpose()?
        } else {
            None
        };

        Ok((items, next_cursor, limit))
    }

    fn row_to_list_item(
        row: &sqlx::postgres::PgRow,
        wallet_id: Uuid,
    ) -> WalletResult<TransactionListItem> {
        let from_wallet_id: Uuid = row.try_get("from_wallet_id")?;
        let status_raw: String = row.try_get("status")?;
        let status = TransactionStatus::parse(&status_raw).ok_or_else(|| {
            WalletError::Internal(format!("unknown transaction status {status_raw}"))
        })?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        let (role, email, first, last) = if from_wallet_id == wallet_id {
            (
                TransferRole::Sender,
                row.try_get::<String, _>("to_email")?,
                row.try_get::<Option<String>, _>("to_first")?,
                row.try_get::<Option<String>, _>("to_last")?,
            )
        } else {
            (
                TransferRole::Recipient,
                row.try_get::<String, _>("from_email")?,
                row.try_get::<Option<String>, _>("from_first")?,
                row.try_get::<Option<String>, _>("from_last")?,
            )
        };

        Ok(TransactionListItem {
            id: row.try_get("id")?,
            role,
            status,
            amount_minor: row.try_get("amount_minor")?,
            currency: row.try_get("currency")?,
            note: row.try_get("note")?,
            counterparty: CounterpartyView {
                masked_email: mask_email(&email),
                masked_name: mask_name(first.as_deref(), last.as_deref()),
            },
            created_at,
        })
    }

    /// Symmetric lookup: the transaction is visible only to its two parties.
    pub async fn get_transaction_for_user(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
    ) -> WalletResult<TransferResponse> {
        let wallet = self.get_or_create_for_user(user_id).await?;
        let row = sqlx::query(
            "SELECT t.id, t.status, t.amount_minor, t.fee_minor, t.currency, t.note, \
                    t.client_reference, t.step_up_used, t.created_at, t.completed_at, \
                    t.from_wallet_id, t.to_wallet_id, \
                    fu.email AS from_email, fu.first_name AS from_first, fu.last_name AS from_last, \
                    tu.email AS to_email, tu.first_name AS to_first, tu.last_name AS to_last \
             FROM wallet_transactions t \
             JOIN wallets fw ON fw.id = t.from_wallet_id JOIN users fu ON fu.id = fw.user_id \
             JOIN wallets tw ON tw.id = t.to_wallet_id JOIN users tu ON tu.id = tw.user_id \
             WHERE t.id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(WalletError::NotFound);
        };

        let from_wallet_id: Uuid = row.try_get("from_wallet_id")?;
        let to_wallet_id: Uuid = row.try_get("to_wallet_id")?;
        if wallet.id != from_wallet_id && wallet.id != to_wallet_id {
            return Err(WalletError::NotFound);
        }

        let status_raw: String = row.try_get("status")?;
        let status = TransactionStatus::parse(&status_raw).ok_or_else(|| {
            WalletError::Internal(format!("unknown transaction status {status_raw}"))
        })?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;

        let (role, email, first, last) = if from_wallet_id == wallet.id {
            (
                TransferRole::Sender,
                row.try_get::<String, _>("to_email")?,
                row.try_get::<Option<String>, _>("to_first")?,
                row.try_get::<Option<String>, _>("to_last")?,
            )
        } else {
            (
                TransferRole::Recipient,
                row.try_get::<String, _>("from_email")?,
                row.try_get::<Option<String>, _>("from_first")?,
                row.try_get::<Option<String>, _>("from_last")?,
            )
        };

        Ok(TransferResponse {
            id: row.try_get("id")?,
            role,
            status,
            amount_minor: row.try_get("amount_minor")?,
            fee_minor: row.try_get("fee_minor")?,
            currency: row.try_get("currency")?,
            note: row.try_get("note")?,
            client_reference: row.try_get("client_reference")?,
            step_up_used: row.try_get("step_up_used")?,
            counterparty: CounterpartyView {
                masked_email: mask_email(&email),
                masked_name: mask_name(first.as_deref(), last.as_deref()),
            },
            created_at,
            completed_at,
        })
    }
}

pub fn utc_midnight() -> DateTime<Utc> {
    let today = Utc::now().date_naive();
    Utc.from_utc_datetime(&today.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

/// `alice@example.com` -> `ali***@example.com`.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let prefix: String = local.chars().take(3).collect();
            format!("{prefix}***@{domain}")
        }
        None => {
            let prefix: String = email.chars().take(3).collect();
            format!("{prefix}***")
        }
    }
}

/// `("Alice", "Brown")` -> `Alice B.`
pub fn mask_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    match (first, last) {
        (Some(first), Some(last)) => {
            let initial = last.chars().next()?;
            Some(format!("{first} {initial}."))
        }
        (Some(first), None) => Some(first.to_string()),
        (None, Some(last)) => {
            let initial = last.chars().next()?;
            Some(format!("{initial}."))
        }
        (None, None) => None,
    }
}

fn encode_cursor(created_at: DateTime<Utc>, id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}:{}", created_at.timestamp_micros(), id))
}

fn decode_cursor(raw: &str) -> Option<(DateTime<Utc>, Uuid)> {
    let decoded = URL_SAFE_NO_PAD.decode(raw).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (ts, id) = decoded.split_once(':')?;
    let ts = DateTime::from_timestamp_micros(ts.parse().ok()?)?;
    let id = Uuid::parse_str(id).ok()?;
    Some((ts, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_masking_keeps_three_local_chars() {
        assert_eq!(mask_email("alice@example.com"), "ali***@example.com");
        assert_eq!(mask_email("bo@x.io"), "bo***@x.io");
        assert_eq!(mask_email("no-at-sign"), "no-***");
    }

    #[test]
    fn name_masking_uses_last_initial() {
        assert_eq!(
            mask_name(Some("Alice"), Some("Brown")).as_deref(),
            Some("Alice B.")
        );
        assert_eq!(mask_name(Some("Alice"), None).as_deref(), Some("Alice"));
        assert_eq!(mask_name(None, Some("Brown")).as_deref(), Some("B."));
        assert_eq!(mask_name(None, None), None);
    }

    #[test]
    fn cursor_roundtrip() {
        let ts = DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        let id = Uuid::new_v4();
        let encoded = encode_cursor(ts, id);
        assert_eq!(decode_cursor(&encoded), Some((ts, id)));
        assert_eq!(decode_cursor("not-a-cursor"), None);
    }

    #[test]
    fn per_transaction_max_takes_the_smaller_bound() {
        let config = WalletConfig {
            default_currency: "IDR".to_string(),
            min_amount_minor: 1_000,
            max_amount_minor: 50_000_000,
            absolute_max_minor: 10_000_000,
            daily_limit_minor: 20_000_000,
            high_value_threshold_minor: 5_000_000,
        };
        assert_eq!(config.per_transaction_max(), 10_000_000);
    }
}
