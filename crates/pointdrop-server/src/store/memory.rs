//! In-memory store for tests and local runs without a database.
//!
//! All state sits behind one write lock, so each operation is atomic: every
//! check happens before the first mutation. Transient failures can be injected
//! to exercise the reconciliation retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    Applied, BalanceAudit, BillOutcome, Ledger, OrderStore, StoreError, StoreResult, TokenStore,
};
use crate::models::{
    Consumed, DedupKey, GatewayEcho, LedgerDelta, LedgerEntry, LedgerReason, NewPaymentOrder,
    OrderStatus, PaymentOrder, PointsAccount, VerificationToken,
};

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, PointsAccount>,
    entries: Vec<LedgerEntry>,
    charges: HashMap<DedupKey, Uuid>,
    orders: HashMap<String, PaymentOrder>,
    /// Keyed by subject.
    tokens: HashMap<String, VerificationToken>,
}

impl MemoryState {
    fn apply(&mut self, ledger_id: Uuid, delta: &LedgerDelta) -> StoreResult<Applied> {
        if delta.delta == 0 {
            return Err(StoreError::InvalidDelta("delta must be non-zero".to_string()));
        }

        let account = self
            .accounts
            .get_mut(&delta.account_id)
            .ok_or_else(|| StoreError::AccountNotFound(delta.account_id.clone()))?;

        let balance_after = account.balance.checked_add(delta.delta).ok_or_else(|| {
            StoreError::InvalidDelta(format!("balance overflow for {}", delta.account_id))
        })?;

        if balance_after < 0 {
            return Err(StoreError::InsufficientBalance {
                balance: account.balance,
                required: -delta.delta,
            });
        }

        account.balance = balance_after;
        account.updated_at = Utc::now();
        self.entries
            .push(delta.clone().into_entry(ledger_id, balance_after));

        Ok(Applied {
            ledger_id,
            balance_after,
        })
    }

    /// Ledger entry crediting `trade_no`, if one was written.
    fn credit_for(&self, trade_no: &str) -> Option<Applied> {
        let reason = LedgerReason::Recharge(trade_no.to_string()).to_string();
        self.entries
            .iter()
            .find(|e| e.reason == reason)
            .map(|entry| Applied {
                ledger_id: entry.id,
                balance_after: entry.balance_after,
            })
    }

    fn transition(
        &mut self,
        trade_no: &str,
        status: OrderStatus,
        echo: &GatewayEcho,
        applied: Option<Applied>,
    ) -> StoreResult<PaymentOrder> {
        let credited = self.credit_for(trade_no).is_some();
        let order = self
            .orders
            .get_mut(trade_no)
            .ok_or_else(|| StoreError::OrderNotFound(trade_no.to_string()))?;

        if order.status.is_terminal() {
            return Ok(order.clone());
        }
        if status == OrderStatus::Failed && credited {
            return Ok(order.clone());
        }

        order.merge_echo(echo);
        if !echo.payload.is_null() {
            order.notify_payload = Some(echo.payload.clone());
        }
        if let Some(applied) = applied {
            order.ledger_id.get_or_insert(applied.ledger_id);
            order.balance_after.get_or_insert(applied.balance_after);
        }
        order.status = status;

        Ok(order.clone())
    }
}

/// Store holding all state in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    fail_credits: AtomicU32,
    fail_mark_paid: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls to `credit_order` fail with a transient error.
    pub fn fail_next_credits(&self, n: u32) {
        self.fail_credits.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` calls to `mark_paid` fail with a transient error.
    pub fn fail_next_mark_paid(&self, n: u32) {
        self.fail_mark_paid.store(n, Ordering::SeqCst);
    }

    /// Number of ledger entries across all accounts.
    pub async fn entry_count(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

fn take_failure(counter: &AtomicU32) -> StoreResult<()> {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(StoreError::Transient("injected failure".to_string())),
        Err(_) => Ok(()),
    }
}

#[async_trait]
impl Ledger for MemoryStore {
    async fn open_account(&self, account_id: &str) -> StoreResult<PointsAccount> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| PointsAccount::new(account_id));
        Ok(account.clone())
    }

    async fn account(&self, account_id: &str) -> StoreResult<Option<PointsAccount>> {
        Ok(self.state.read().await.accounts.get(account_id).cloned())
    }

    async fn apply_delta(&self, delta: LedgerDelta) -> StoreResult<Applied> {
        self.state.write().await.apply(Uuid::new_v4(), &delta)
    }

    async fn bill_download(&self, key: &DedupKey, cost: i64) -> StoreResult<BillOutcome> {
        if cost <= 0 {
            return Err(StoreError::InvalidDelta(format!(
                "download cost must be positive, got {}",
                cost
            )));
        }

        let mut state = self.state.write().await;
        if state.charges.contains_key(key) {
            return Ok(BillOutcome::Deduped);
        }

        let applied = state.apply(Uuid::new_v4(), &LedgerDelta::download(key, cost))?;
        state.charges.insert(key.clone(), applied.ledger_id);

        Ok(BillOutcome::Charged { cost, applied })
    }

    async fn entries(&self, account_id: &str, limit: i64) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn audit(&self, account_id: &str) -> StoreResult<BalanceAudit> {
        let state = self.state.read().await;
        let account = state
            .accounts
            .get(account_id)
            .ok_or_else(|| StoreError::AccountNotFound(account_id.to_string()))?;

        let ledger_sum = state
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .map(|e| e.delta)
            .sum();

        Ok(BalanceAudit {
            balance: account.balance,
            ledger_sum,
        })
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn create_order(&self, order: NewPaymentOrder) -> StoreResult<PaymentOrder> {
        let mut state = self.state.write().await;
        if state.orders.contains_key(&order.trade_no) {
            return Err(StoreError::DuplicateTradeNo(order.trade_no));
        }

        let order = order.into_pending();
        state.orders.insert(order.trade_no.clone(), order.clone());
        Ok(order)
    }

    async fn get_order(&self, trade_no: &str) -> StoreResult<Option<PaymentOrder>> {
        Ok(self.state.read().await.orders.get(trade_no).cloned())
    }

    async fn record_payment_info(
        &self,
        trade_no: &str,
        echo: &GatewayEcho,
    ) -> StoreResult<PaymentOrder> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(trade_no)
            .ok_or_else(|| StoreError::OrderNotFound(trade_no.to_string()))?;

        if order.status.is_terminal() {
            return Ok(order.clone());
        }
        if echo.payment_type.is_some() {
            order.payment_type = echo.payment_type.clone();
        }
        if echo.gateway_trade_no.is_some() {
            order.gateway_trade_no = echo.gateway_trade_no.clone();
        }
        if !echo.payload.is_null() {
            order.payment_info = Some(echo.payload.clone());
        }
        order.updated_at = Utc::now();

        Ok(order.clone())
    }

    async fn credit_order(&self, trade_no: &str) -> StoreResult<Applied> {
        take_failure(&self.fail_credits)?;

        let mut state = self.state.write().await;
        let order = state
            .orders
            .get(trade_no)
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

        let delta = LedgerDelta::recharge(order.account_id.clone(), trade_no, order.points);
        if let Some(applied) = state.credit_for(trade_no) {
            return Ok(applied);
        }

        state.apply(Uuid::new_v4(), &delta)
    }

    async fn existing_credit(&self, trade_no: &str) -> StoreResult<Option<Applied>> {
        Ok(self.state.read().await.credit_for(trade_no))
    }

    async fn mark_paid(
        &self,
        trade_no: &str,
        echo: &GatewayEcho,
        applied: Applied,
    ) -> StoreResult<PaymentOrder> {
        take_failure(&self.fail_mark_paid)?;
        self.state
            .write()
            .await
            .transition(trade_no, OrderStatus::Paid, echo, Some(applied))
    }

    async fn mark_failed(&self, trade_no: &str, echo: &GatewayEcho) -> StoreResult<PaymentOrder> {
        self.state
            .write()
            .await
            .transition(trade_no, OrderStatus::Failed, echo, None)
    }

    async fn list_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentOrder>> {
        let state = self.state.read().await;
        let mut pending: Vec<PaymentOrder> = state
            .orders
            .values()
            .filter(|o| o.is_pending() && o.created_at <= created_before)
            .cloned()
            .collect();
        pending.sort_by_key(|o| o.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn issue_token(
        &self,
        subject: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let token = VerificationToken {
            subject: subject.to_string(),
            token_hash: token_hash.to_string(),
            expires_at,
            created_at: Utc::now(),
        };
        self.state
            .write()
            .await
            .tokens
            .insert(subject.to_string(), token);
        Ok(())
    }

    async fn consume_token(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<Consumed> {
        let mut state = self.state.write().await;
        let subject = state
            .tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .map(|t| t.subject.clone());

        let Some(token) = subject.and_then(|s| state.tokens.remove(&s)) else {
            return Ok(Consumed::Invalid);
        };

        if token.is_expired_at(now) {
            return Ok(Consumed::Expired);
        }

        if let Some(account) = state.accounts.get_mut(&token.subject) {
            account.email_verified_at.get_or_insert(now);
            account.updated_at = now;
        }
        Ok(Consumed::Success(token.subject))
    }
}
