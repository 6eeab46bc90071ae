//! Reconciliation of gateway payment notices into ledger credits.
//!
//! A notice is settled by crediting the order and then marking it PAID (or
//! FAILED). Both store calls are idempotent, so a notice that is processed
//! twice, or re-delivered after a crash between the two calls, still credits
//! the account once. The in-flight set only stops two copies of the same
//! notice from racing inside one process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::models::PaymentOrder;
use crate::payments::PaymentNotice;
use crate::store::{Applied, OrderStore, StoreError};

/// Exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: f32,
    pub max_delay: Duration,
    /// Total attempts, including the first.
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ReconcileConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            factor: config.factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

/// Errors surfaced to the caller after reconciliation gives up.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("gave up on {trade_no} after {attempts} attempts: {source}")]
    Exhausted {
        trade_no: String,
        attempts: usize,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of processing one notice.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// The order is PAID; `applied` is its one ledger credit.
    Paid {
        order: PaymentOrder,
        applied: Applied,
    },
    /// The order is FAILED.
    Failed(PaymentOrder),
    /// The order was already terminal; nothing changed.
    Unchanged(PaymentOrder),
    /// Another task is processing this trade number.
    InFlight,
}

impl Settlement {
    pub fn order(&self) -> Option<&PaymentOrder> {
        match self {
            Settlement::Paid { order, .. } | Settlement::Failed(order) | Settlement::Unchanged(order) => {
                Some(order)
            }
            Settlement::InFlight => None,
        }
    }
}

/// Removes its trade number from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    trade_no: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.trade_no);
    }
}

/// Turns verified payment notices into ledger credits and final order states.
pub struct ReconcileQueue<S: ?Sized> {
    store: Arc<S>,
    policy: RetryPolicy,
    in_flight: Mutex<HashSet<String>>,
}

impl<S: OrderStore + ?Sized> ReconcileQueue<S> {
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, trade_no: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.insert(trade_no.to_string()).then(|| InFlightGuard {
            set: &self.in_flight,
            trade_no: trade_no.to_string(),
        })
    }

    /// Processes one verified notice, retrying transient store failures.
    pub async fn process(&self, notice: &PaymentNotice) -> Result<Settlement, ReconcileError> {
        let Some(_guard) = self.claim(&notice.trade_no) else {
            debug!(trade_no = %notice.trade_no, "Notice already in flight, dropping duplicate");
            return Ok(Settlement::InFlight);
        };

        let attempts = AtomicUsize::new(0);
        let attempts_ref = &attempts;

        let result = (|| async move {
            attempts_ref.fetch_add(1, Ordering::SeqCst);
            self.settle(notice).await
        })
        .retry(self.policy.backoff())
        .when(|e: &StoreError| e.is_transient())
        .notify(|err: &StoreError, dur: Duration| {
            warn!(
                trade_no = %notice.trade_no,
                attempt = attempts_ref.load(Ordering::SeqCst),
                error = %err,
                delay = ?dur,
                "Transient store error during reconciliation, retrying"
            );
        })
        .await;

        match result {
            Ok(settlement) => Ok(settlement),
            Err(source) if source.is_transient() => {
                let attempts = attempts.load(Ordering::SeqCst);
                error!(
                    trade_no = %notice.trade_no,
                    attempts,
                    error = %source,
                    "Reconciliation retries exhausted; order left PENDING"
                );
                Err(ReconcileError::Exhausted {
                    trade_no: notice.trade_no.clone(),
                    attempts,
                    source,
                })
            }
            Err(e) => Err(ReconcileError::Store(e)),
        }
    }

    /// One attempt at settling a notice.
    async fn settle(&self, notice: &PaymentNotice) -> Result<Settlement, StoreError> {
        let trade_no = notice.trade_no.as_str();
        let order = self
            .store
            .get_order(trade_no)
            .await?
            .ok_or_else(|| StoreError::OrderNotFound(trade_no.to_string()))?;

        if order.status.is_terminal() {
            debug!(trade_no = %trade_no, status = order.status.as_str(), "Order already settled");
            return Ok(Settlement::Unchanged(order));
        }

        if !notice.succeeded {
            info!(
                trade_no = %trade_no,
                rtn_code = %notice.rtn_code,
                rtn_msg = %notice.rtn_msg,
                "Gateway reported payment failure"
            );
            return self.fail(notice).await;
        }

        if let Some(paid) = notice.trade_amount() {
            if paid != order.amount {
                warn!(
                    trade_no = %trade_no,
                    expected = order.amount,
                    paid,
                    "Gateway amount does not match order, marking failed"
                );
                return self.fail(notice).await;
            }
        }

        let applied = match self.store.credit_order(trade_no).await {
            Ok(applied) => applied,
            Err(StoreError::AccountNotFound(account_id)) => {
                warn!(
                    trade_no = %trade_no,
                    account_id = %account_id,
                    "Account missing for paid order, marking failed"
                );
                return self.fail(notice).await;
            }
            Err(StoreError::OrderFailed(_)) => {
                let order = self
                    .store
                    .get_order(trade_no)
                    .await?
                    .ok_or_else(|| StoreError::OrderNotFound(trade_no.to_string()))?;
                return Ok(Settlement::Unchanged(order));
            }
            Err(e) => return Err(e),
        };

        let order = self.store.mark_paid(trade_no, &notice.echo, applied).await?;
        info!(
            trade_no = %trade_no,
            account_id = %order.account_id,
            points = order.points,
            balance_after = applied.balance_after,
            "Payment reconciled"
        );

        Ok(Settlement::Paid { order, applied })
    }

    /// Marks the order FAILED unless its credit already committed, in which
    /// case the points stay and the order settles PAID.
    async fn fail(&self, notice: &PaymentNotice) -> Result<Settlement, StoreError> {
        let trade_no = notice.trade_no.as_str();
        if let Some(applied) = self.store.existing_credit(trade_no).await? {
            return self.settle_credited(notice, applied).await;
        }

        let order = self.store.mark_failed(trade_no, &notice.echo).await?;
        if order.is_pending() {
            // A credit committed between the lookup and the update.
            if let Some(applied) = self.store.existing_credit(trade_no).await? {
                return self.settle_credited(notice, applied).await;
            }
        }

        Ok(Settlement::Failed(order))
    }

    async fn settle_credited(
        &self,
        notice: &PaymentNotice,
        applied: Applied,
    ) -> Result<Settlement, StoreError> {
        warn!(
            trade_no = %notice.trade_no,
            ledger_id = %applied.ledger_id,
            rtn_code = %notice.rtn_code,
            "Order already credited, settling PAID instead of FAILED"
        );
        let order = self
            .store
            .mark_paid(&notice.trade_no, &notice.echo, applied)
            .await?;
        Ok(Settlement::Paid { order, applied })
    }
}
