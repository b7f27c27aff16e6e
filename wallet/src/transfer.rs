use std::sync::Arc;

use auth::TokenSigner;
use chrono::{DateTime, Utc};
use domain::{
    CreateTransferRequest, LedgerDirection, TransactionStatus, TransferResponse, TransferRole,
    WalletLedgerEntry, WalletStatus, WalletTransaction,
};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::error::{WalletError, WalletResult};
use crate::service::{RecipientUser, WalletService};

pub const TRANSFER_TYPE: &str = "P2P_TRANSFER";
pub const STEP_UP_TRANSFER_PURPOSE: &str = "transaction:transfer";

/// Validated, atomic, idempotent internal transfer with step-up gating and
/// double-entry ledger writes.
pub struct TransferEngine {
    pool: PgPool,
    wallets: Arc<WalletService>,
    signer: Arc<TokenSigner>,
}

impl TransferEngine {
    pub fn new(pool: PgPool, wallets: Arc<WalletService>, signer: Arc<TokenSigner>) -> Self {
        Self {
            pool,
            wallets,
            signer,
        }
    }

    /// Whether the transfer needs a fresh biometric proof: high-value, or
    /// pushing the day's volume into the final fifth of the daily limit.
    pub fn step_up_required(&self, amount_minor: i64, daily_total: i64) -> bool {
        let config = self.wallets.config();
        if amount_minor >= config.high_value_threshold_minor {
            return true;
        }
        (daily_total as i128 + amount_minor as i128) * 10
            >= config.daily_limit_minor as i128 * 8
    }

    pub async fn create_transfer(
        &self,
        sender_user_id: Uuid,
        request: CreateTransferRequest,
        header_step_up: Option<String>,
    ) -> WalletResult<TransferResponse> {
        let config = self.wallets.config().clone();

        let sender_wallet = self.wallets.get_or_create_for_user(sender_user_id).await?;
        let recipient_user = self
            .wallets
            .find_user_by_identifier(&request.recipient)
            .await?
            .ok_or(WalletError::RecipientNotFound)?;
        if recipient_user.id == sender_user_id {
            return Err(WalletError::SameWalletTransfer);
        }
        let recipient_wallet = self
            .wallets
            .get_or_create_for_user(recipient_user.id)
            .await?;

        if sender_wallet.status != WalletStatus::Active {
            return Err(WalletError::WalletBlocked);
        }
        if recipient_wallet.status == WalletStatus::Closed {
            return Err(WalletError::RecipientClosed);
        }

        let requested_currency = request.currency.trim();
        if !requested_currency.eq_ignore_ascii_case(&sender_wallet.currency)
            || !requested_currency.eq_ignore_ascii_case(&recipient_wallet.currency)
        {
            return Err(WalletError::Validation(
                "currency does not match both wallets".to_string(),
            ));
        }

        let amount = request.amount_minor;
        if amount < config.min_amount_minor || amount > config.per_transaction_max() {
            return Err(WalletError::LimitExceeded);
        }

        let daily_total = self.wallets.daily_total(sender_wallet.id).await?;
        if daily_total + amount > config.daily_limit_minor {
            return Err(WalletError::DailyLimitExceeded);
        }

        if sender_wallet.available_balance_minor < amount {
            return Err(WalletError::InsufficientFunds);
        }

        let step_up_used = self.step_up_required(amount, daily_total);
        if step_up_used {
            let token = header_step_up
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty())
                .or_else(|| request.step_up_token.clone());
            let Some(token) = token else {
                return Err(WalletError::StepUpRequired);
            };
            self.verify_step_up_token(&token, sender_user_id)?;
        }

        if let Some(reference) = request.client_reference.as_deref() {
            if let Some(existing) = self.find_by_reference(sender_wallet.id, reference).await? {
                return self.replay_existing(existing, recipient_wallet.id, &request, &recipient_user);
            }
        }

        match self
            .commit(
                sender_wallet.id,
                recipient_wallet.id,
                amount,
                &sender_wallet.currency,
                &request,
                step_up_used,
                &recipient_user,
            )
            .await
        {
            Err(WalletError::ReferenceConflict) => {
                // Lost the unique-index race to a concurrent duplicate.
                let reference = request
                    .client_reference
                    .as_deref()
                    .ok_or(WalletError::ReferenceConflict)?;
                let existing = self
                    .find_by_reference(sender_wallet.id, reference)
                    .await?
                    .ok_or(WalletError::ReferenceConflict)?;
                self.replay_existing(existing, recipient_wallet.id, &request, &recipient_user)
            }
            other => other,
        }
    }

    fn verify_step_up_token(&self, token: &str, sender_user_id: Uuid) -> WalletResult<()> {
        let claims = self
            .signer
            .verify_step_up(token)
            .map_err(|_| WalletError::StepUpInvalid)?;
        let subject = claims.user_id().map_err(|_| WalletError::StepUpInvalid)?;
        if subject != sender_user_id {
            return Err(WalletError::StepUpInvalid);
        }
        if let Some(purpose) = claims.purpose.as_deref() {
            if !purpose.contains(STEP_UP_TRANSFER_PURPOSE) {
                return Err(WalletError::StepUpForbidden);
            }
        }
        Ok(())
    }

    fn replay_existing(
        &self,
        existing: WalletTransaction,
        recipient_wallet_id: Uuid,
        request: &CreateTransferRequest,
        recipient_user: &RecipientUser,
    ) -> WalletResult<TransferResponse> {
        let matches = existing.to_wallet_id == recipient_wallet_id
            && existing.amount_minor == request.amount_minor
            && existing.currency.eq_ignore_ascii_case(request.currency.trim());
        if !matches {
            return Err(WalletError::ReferenceConflict);
        }

        Ok(Self::response_from_transaction(existing, recipient_user))
    }

    fn response_from_transaction(
        transaction: WalletTransaction,
        recipient_user: &RecipientUser,
    ) -> TransferResponse {
        TransferResponse {
            id: transaction.id,
            role: TransferRole::Sender,
            status: transaction.status,
            amount_minor: transaction.amount_minor,
            fee_minor: transaction.fee_minor,
            currency: transaction.currency,
            note: transaction.note,
            client_reference: transaction.client_reference,
            step_up_used: transaction.step_up_used,
            counterparty: recipient_user.masked(),
            created_at: transaction.created_at,
            completed_at: transaction.completed_at,
        }
    }

    async fn find_by_reference(
        &self,
        from_wallet_id: Uuid,
        reference: &str,
    ) -> WalletResult<Option<WalletTransaction>> {
        let row = sqlx::query(
            "SELECT id, type, status, from_wallet_id, to_wallet_id, amount_minor, fee_minor, \
                    currency, note, client_reference, step_up_used, created_at, completed_at \
             FROM wallet_transactions WHERE from_wallet_id = $1 AND client_reference = $2",
        )
        .bind(from_wallet_id)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::row_to_transaction(&row)).transpose()
    }

    fn row_to_transaction(row: &sqlx::postgres::PgRow) -> WalletResult<WalletTransaction> {
        let status_raw: String = row.try_get("status")?;
        let status = TransactionStatus::parse(&status_raw).ok_or_else(|| {
            WalletError::Internal(format!("unknown transaction status {status_raw}"))
        })?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;
        Ok(WalletTransaction {
            id: row.try_get("id")?,
            r#type: row.try_get("type")?,
            status,
            from_wallet_id: row.try_get("from_wallet_id")?,
            to_wallet_id: row.try_get("to_wallet_id")?,
            amount_minor: row.try_get("amount_minor")?,
            fee_minor: row.try_get("fee_minor")?,
            currency: row.try_get("currency")?,
            note: row.try_get("note")?,
            client_reference: row.try_get("client_reference")?,
            step_up_used: row.try_get("step_up_used")?,
            created_at,
            completed_at,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        sender_wallet_id: Uuid,
        recipient_wallet_id: Uuid,
        amount: i64,
        currency: &str,
        request: &CreateTransferRequest,
        step_up_used: bool,
        recipient_user: &RecipientUser,
    ) -> WalletResult<TransferResponse> {
        let mut tx = self.pool.begin().await?;

        // Lock both wallets in ascending id order so opposite-direction
        // transfers cannot deadlock.
        let mut ordered = [sender_wallet_id, recipient_wallet_id];
        ordered.sort();
        let mut balances = [0_i64; 2];
        for (slot, wallet_id) in ordered.iter().enumerate() {
            let row = sqlx::query(
                "SELECT available_balance_minor FROM wallets WHERE id = $1 FOR UPDATE",
            )
            .bind(wallet_id)
            .fetch_one(&mut *tx)
            .await?;
            balances[slot] = row.try_get("available_balance_minor")?;
        }
        let sender_balance = balances[if ordered[0] == sender_wallet_id { 0 } else { 1 }];
        let recipient_balance = balances[if ordered[0] == recipient_wallet_id { 0 } else { 1 }];

        if sender_balance < amount {
            return Err(WalletError::InsufficientFunds);
        }

        let sender_after = sender_balance - amount;
        let recipient_after = recipient_balance
            .checked_add(amount)
            .ok_or_else(|| WalletError::Internal("recipient balance overflow".to_string()))?;

        let transaction_id = Uuid::new_v4();
        let completed_at = Utc::now();
        let insert = sqlx::query(
            "INSERT INTO wallet_transactions \
             (id, type, status, from_wallet_id, to_wallet_id, amount_minor, fee_minor, currency, \
              note, client_reference, step_up_used, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9, $10, $11)",
        )
        .bind(transaction_id)
        .bind(TRANSFER_TYPE)
        .bind(TransactionStatus::Completed.as_str())
        .bind(sender_wallet_id)
        .bind(recipient_wallet_id)
        .bind(amount)
        .bind(currency)
        .bind(&request.note)
        .bind(&request.client_reference)
        .bind(step_up_used)
        .bind(completed_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = insert {
            if let sqlx::Error::Database(db) = &err {
                if db.is_unique_violation() {
                    return Err(WalletError::ReferenceConflict);
                }
            }
            return Err(err.into());
        }

        let entries = [
            WalletLedgerEntry {
                id: Uuid::new_v4(),
                transaction_id,
                wallet_id: sender_wallet_id,
                direction: LedgerDirection::Debit,
                amount_minor: amount,
                balance_after_minor: sender_after,
            },
            WalletLedgerEntry {
                id: Uuid::new_v4(),
                transaction_id,
                wallet_id: recipient_wallet_id,
                direction: LedgerDirection::Credit,
                amount_minor: amount,
                balance_after_minor: recipient_after,
            },
        ];
        for entry in &entries {
            sqlx::query(
                "INSERT INTO wallet_ledger_entries \
                 (id, transaction_id, wallet_id, direction, amount_minor, balance_after_minor) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(entry.id)
            .bind(entry.transaction_id)
            .bind(entry.wallet_id)
            .bind(entry.direction.as_str())
            .bind(entry.amount_minor)
            .bind(entry.balance_after_minor)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE wallets SET available_balance_minor = $2 WHERE id = $1")
            .bind(sender_wallet_id)
            .bind(sender_after)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE wallets SET available_balance_minor = $2 WHERE id = $1")
            .bind(recipient_wallet_id)
            .bind(recipient_after)
            .execute(&mut *tx)
            .await?;

        tx.commit()
            .await
            .map_err(|err| WalletError::Internal(format!("failed to commit transfer: {err}")))?;

        info!(
            %transaction_id,
            amount_minor = amount,
            step_up_used,
            "transfer completed"
        );

        let row = sqlx::query(
            "SELECT id, type, status, from_wallet_id, to_wallet_id, amount_minor, fee_minor, \
                    currency, note, client_reference, step_up_used, created_at, completed_at \
             FROM wallet_transactions WHERE id = $1",
        )
        .bind(transaction_id)
        .fetch_one(&self.pool)
        .await?;
        let transaction = Self::row_to_transaction(&row)?;

        Ok(Self::response_from_transaction(transaction, recipient_user))
    }
}
