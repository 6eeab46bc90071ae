//! Postgres-backed store.
//!
//! Every mutation runs in one transaction. The account row is locked with
//! `SELECT ... FOR UPDATE` before its balance is checked, so the check and the
//! write cannot be separated by a concurrent update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{
    Applied, BalanceAudit, BillOutcome, Ledger, OrderStore, StoreError, StoreResult, TokenStore,
};
use crate::models::{
    Consumed, DedupKey, GatewayEcho, LedgerDelta, LedgerEntry, LedgerReason, NewPaymentOrder,
    OrderStatus, PaymentOrder, PointsAccount,
};

/// Store backed by a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Applies one delta inside an open transaction.
async fn apply_delta_in(
    conn: &mut PgConnection,
    ledger_id: Uuid,
    delta: &LedgerDelta,
) -> StoreResult<Applied> {
    if delta.delta == 0 {
        return Err(StoreError::InvalidDelta("delta must be non-zero".to_string()));
    }

    let balance: i64 = sqlx::query_scalar(
        r#"
        SELECT balance
        FROM points_accounts
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(&delta.account_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| StoreError::AccountNotFound(delta.account_id.clone()))?;

    let balance_after = balance.checked_add(delta.delta).ok_or_else(|| {
        StoreError::InvalidDelta(format!("balance overflow for {}", delta.account_id))
    })?;

    if balance_after < 0 {
        return Err(StoreError::InsufficientBalance {
            balance,
            required: -delta.delta,
        });
    }

    sqlx::query(
        r#"
        INSERT INTO ledger_entries (id, account_id, delta, balance_after, reason, link_id, platform, bucket, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
        "#,
    )
    .bind(ledger_id)
    .bind(&delta.account_id)
    .bind(delta.delta)
    .bind(balance_after)
    .bind(delta.reason.to_string())
    .bind(&delta.link_id)
    .bind(&delta.platform)
    .bind(delta.bucket)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE points_accounts
        SET balance = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(&delta.account_id)
    .bind(balance_after)
    .execute(&mut *conn)
    .await?;

    Ok(Applied {
        ledger_id,
        balance_after,
    })
}

/// Returns the JSON payload, or `None` when the echo carried nothing.
fn payload_of(echo: &GatewayEcho) -> Option<&serde_json::Value> {
    (!echo.payload.is_null()).then_some(&echo.payload)
}

#[async_trait]
impl Ledger for PgStore {
    async fn open_account(&self, account_id: &str) -> StoreResult<PointsAccount> {
        sqlx::query(
            r#"
            INSERT INTO points_accounts (id, balance, created_at, updated_at)
            VALUES ($1, 0, NOW(), NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        self.account(account_id)
            .await?
            .ok_or_else(|| StoreError::AccountNotFound(account_id.to_string()))
    }

    async fn account(&self, account_id: &str) -> StoreResult<Option<PointsAccount>> {
        let account = sqlx::query_as(
            r#"
            SELECT id, balance, email_verified_at, created_at, updated_at
            FROM points_accounts
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn apply_delta(&self, delta: LedgerDelta) -> StoreResult<Applied> {
        let mut tx = self.pool.begin().await?;
        let applied = apply_delta_in(&mut tx, Uuid::new_v4(), &delta).await?;
        tx.commit().await?;
        Ok(applied)
    }

    async fn bill_download(&self, key: &DedupKey, cost: i64) -> StoreResult<BillOutcome> {
        if cost <= 0 {
            return Err(StoreError::InvalidDelta(format!("download cost must be positive, got {}", cost)));
        }

        let mut tx = self.pool.begin().await?;
        let ledger_id = Uuid::new_v4();

        // The primary key is the concurrency primitive: a racing transaction on the
        // same key blocks here until this one commits or rolls back.
        let claimed = sqlx::query(
            r#"
            INSERT INTO download_charges (account_id, link_id, bucket, platform, ledger_id, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (account_id, link_id, bucket, platform) DO NOTHING
            "#,
        )
        .bind(&key.account_id)
        .bind(&key.link_id)
        .bind(key.bucket)
        .bind(key.platform.as_str())
        .bind(ledger_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !claimed {
            tx.rollback().await?;
            return Ok(BillOutcome::Deduped);
        }

        // On error the transaction is dropped and the claim rolls back with it.
        let applied = apply_delta_in(&mut tx, ledger_id, &LedgerDelta::download(key, cost)).await?;
        tx.commit().await?;

        Ok(BillOutcome::Charged { cost, applied })
    }

    async fn entries(&self, account_id: &str, limit: i64) -> StoreResult<Vec<LedgerEntry>> {
        let entries = sqlx::query_as(
            r#"
            SELECT id, account_id, delta, balance_after, reason, link_id, platform, bucket, created_at
            FROM ledger_entries
            WHERE account_id = $1
            ORDER BY created_at DESC, id
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn audit(&self, account_id: &str) -> StoreResult<BalanceAudit> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT a.balance, COALESCE(SUM(l.delta), 0)::BIGINT
            FROM points_accounts a
            LEFT JOIN ledger_entries l ON l.account_id = a.id
            WHERE a.id = $1
            GROUP BY a.balance
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        let (balance, ledger_sum) =
            row.ok_or_else(|| StoreError::AccountNotFound(account_id.to_string()))?;
        Ok(BalanceAudit {
            balance,
            ledger_sum,
        })
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn create_order(&self, order: NewPaymentOrder) -> StoreResult<PaymentOrder> {
        sqlx::query_as(
            r#"
            INSERT INTO payment_orders (trade_no, account_id, points, amount, currency, description, item_name, custom_fields, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            RETURNING trade_no, account_id, points, amount, currency, description, item_name, custom_fields, status,
                      payment_type, gateway_trade_no, trade_amount, payment_date, ledger_id, balance_after,
                      payment_info, notify_payload, created_at, updated_at
            "#,
        )
        .bind(&order.trade_no)
        .bind(&order.account_id)
        .bind(order.points)
        .bind(order.amount)
        .bind(&order.currency)
        .bind(&order.description)
        .bind(&order.item_name)
        .bind(&order.custom_fields)
        .bind(OrderStatus::Pending)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateTradeNo(order.trade_no.clone())
            }
            _ => StoreError::from(e),
        })
    }

    async fn get_order(&self, trade_no: &str) -> StoreResult<Option<PaymentOrder>> {
        let order = sqlx::query_as(
            r#"
            SELECT trade_no, account_id, points, amount, currency, description, item_name, custom_fields, status,
                   payment_type, gateway_trade_no, trade_amount, payment_date, ledger_id, balance_after,
                   payment_info, notify_payload, created_at, updated_at
            FROM payment_orders
            WHERE trade_no = $1
            "#,
        )
        .bind(trade_no)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn record_payment_info(
        &self,
        trade_no: &str,
        echo: &GatewayEcho,
    ) -> StoreResult<PaymentOrder> {
        let order: Option<PaymentOrder> = sqlx::query_as(
            r#"
            UPDATE payment_orders
            SET payment_type = COALESCE($2, payment_type),
                gateway_trade_no = COALESCE($3, gateway_trade_no),
                payment_info = COALESCE($4, payment_info),
                updated_at = NOW()
            WHERE trade_no = $1 AND status = 'PENDING'
            RETURNING trade_no, account_id, points, amount, currency, description, item_name, custom_fields, status,
                      payment_type, gateway_trade_no, trade_amount, payment_date, ledger_id, balance_after,
                      payment_info, notify_payload, created_at, updated_at
            "#,
        )
        .bind(trade_no)
        .bind(&echo.payment_type)
        .bind(&echo.gateway_trade_no)
        .bind(payload_of(echo))
        .fetch_optional(&self.pool)
        .await?;

        match order {
            Some(order) => Ok(order),
            None => self
                .get_order(trade_no)
                .await?
                .ok_or_else(|| StoreError::OrderNotFound(trade_no.to_string())),
        }
    }

    async fn credit_order(&self, trade_no: &str) -> StoreResult<Applied> {
        let mut tx = self.pool.begin().await?;

        let order: PaymentOrder = sqlx::query_as(
            r#"
            SELECT trade_no, account_id, points, amount, currency, description, item_name, custom_fields, status,
                   payment_type, gateway_trade_no, trade_amount, payment_date, ledger_id, balance_after,
                   payment_info, notify_payload, created_at, updated_at
            FROM payment_orders
            WHERE trade_no = $1
            FOR UPDATE
            "#,
        )
        .bind(trade_no)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::OrderNotFound(trade_no.to_string()))?;

        if order.is_failed() {
            return Err(StoreError::OrderFailed(trade_no.to_string()));
        }
        if let (Some(ledger_id), Some(balance_after)) = (order.ledger_id, order.balance_after) {
            return Ok(Applied {
                ledger_id,
                balance_after,
            });
        }

        // Credited before a crash could mark the order paid.
        let reason = LedgerReason::Recharge(trade_no.to_string());
        let existing: Option<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT id, balance_after
            FROM ledger_entries
            WHERE reason = $1
            "#,
        )
        .bind(reason.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((ledger_id, balance_after)) = existing {
            tx.rollback().await?;
            return Ok(Applied {
                ledger_id,
                balance_after,
            });
        }

        let delta = LedgerDelta::recharge(order.account_id, trade_no, order.points);
        let applied = apply_delta_in(&mut tx, Uuid::new_v4(), &delta).await?;
        tx.commit().await?;

        Ok(applied)
    }

    async fn existing_credit(&self, trade_no: &str) -> StoreResult<Option<Applied>> {
        let existing: Option<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT id, balance_after
            FROM ledger_entries
            WHERE reason = $1
            "#,
        )
        .bind(LedgerReason::Recharge(trade_no.to_string()).to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(existing.map(|(ledger_id, balance_after)| Applied {
            ledger_id,
            balance_after,
        }))
    }

    async fn mark_paid(
        &self,
        trade_no: &str,
        echo: &GatewayEcho,
        applied: Applied,
    ) -> StoreResult<PaymentOrder> {
        let updated: Option<PaymentOrder> = sqlx::query_as(
            r#"
            UPDATE payment_orders
            SET status = $2,
                payment_type = COALESCE($3, payment_type),
                gateway_trade_no = COALESCE($4, gateway_trade_no),
                trade_amount = COALESCE($5, trade_amount),
                payment_date = COALESCE($6, payment_date),
                notify_payload = COALESCE($7, notify_payload),
                ledger_id = COALESCE(ledger_id, $8),
                balance_after = COALESCE(balance_after, $9),
                updated_at = NOW()
            WHERE trade_no = $1 AND status = 'PENDING'
            RETURNING trade_no, account_id, points, amount, currency, description, item_name, custom_fields, status,
                      payment_type, gateway_trade_no, trade_amount, payment_date, ledger_id, balance_after,
                      payment_info, notify_payload, created_at, updated_at
            "#,
        )
        .bind(trade_no)
        .bind(OrderStatus::Paid)
        .bind(&echo.payment_type)
        .bind(&echo.gateway_trade_no)
        .bind(echo.trade_amount)
        .bind(&echo.payment_date)
        .bind(payload_of(echo))
        .bind(applied.ledger_id)
        .bind(applied.balance_after)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(order) => Ok(order),
            None => self
                .get_order(trade_no)
                .await?
                .ok_or_else(|| StoreError::OrderNotFound(trade_no.to_string())),
        }
    }

    async fn mark_failed(&self, trade_no: &str, echo: &GatewayEcho) -> StoreResult<PaymentOrder> {
        let updated: Option<PaymentOrder> = sqlx::query_as(
            r#"
            UPDATE payment_orders
            SET status = $2,
                payment_type = COALESCE($3, payment_type),
                gateway_trade_no = COALESCE($4, gateway_trade_no),
                trade_amount = COALESCE($5, trade_amount),
                payment_date = COALESCE($6, payment_date),
                notify_payload = COALESCE($7, notify_payload),
                updated_at = NOW()
            WHERE trade_no = $1 AND status = 'PENDING'
              AND NOT EXISTS (
                  SELECT 1 FROM ledger_entries WHERE reason = 'recharge:' || $1
              )
            RETURNING trade_no, account_id, points, amount, currency, description, item_name, custom_fields, status,
                      payment_type, gateway_trade_no, trade_amount, payment_date, ledger_id, balance_after,
                      payment_info, notify_payload, created_at, updated_at
            "#,
        )
        .bind(trade_no)
        .bind(OrderStatus::Failed)
        .bind(&echo.payment_type)
        .bind(&echo.gateway_trade_no)
        .bind(echo.trade_amount)
        .bind(&echo.payment_date)
        .bind(payload_of(echo))
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(order) => Ok(order),
            None => self
                .get_order(trade_no)
                .await?
                .ok_or_else(|| StoreError::OrderNotFound(trade_no.to_string())),
        }
    }

    async fn list_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentOrder>> {
        let orders = sqlx::query_as(
            r#"
            SELECT trade_no, account_id, points, amount, currency, description, item_name, custom_fields, status,
                   payment_type, gateway_trade_no, trade_amount, payment_date, ledger_id, balance_after,
                   payment_info, notify_payload, created_at, updated_at
            FROM payment_orders
            WHERE status = 'PENDING' AND created_at <= $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn issue_token(
        &self,
        subject: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO verification_tokens (subject, token_hash, expires_at, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (subject)
            DO UPDATE SET token_hash = EXCLUDED.token_hash,
                          expires_at = EXCLUDED.expires_at,
                          created_at = EXCLUDED.created_at
            "#,
        )
        .bind(subject)
        .bind(token_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn consume_token(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<Consumed> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            DELETE FROM verification_tokens
            WHERE token_hash = $1
            RETURNING subject, expires_at
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let consumed = match row {
            None => Consumed::Invalid,
            Some((_, expires_at)) if expires_at <= now => Consumed::Expired,
            Some((subject, _)) => {
                sqlx::query(
                    r#"
                    UPDATE points_accounts
                    SET email_verified_at = COALESCE(email_verified_at, $2), updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(&subject)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                Consumed::Success(subject)
            }
        };

        tx.commit().await?;
        Ok(consumed)
    }
}
