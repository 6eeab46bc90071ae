//! Background sweep of stale PENDING orders.
//!
//! Gateway callbacks can be lost. Orders still PENDING after `min_age` are
//! checked against the gateway's trade query, and paid ones are fed through
//! the reconciliation queue like any other notice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gateway::TradeQuery;
use crate::payments::PaymentNotice;
use crate::reconcile::{ReconcileQueue, Settlement};
use crate::store::OrderStore;

/// Orders examined per sweep.
const SWEEP_BATCH: i64 = 50;

/// Summary of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub settled: usize,
    pub errors: usize,
}

pub struct Sweeper<S: ?Sized> {
    store: Arc<S>,
    queue: Arc<ReconcileQueue<S>>,
    gateway: Arc<dyn TradeQuery>,
    interval: Duration,
    min_age: Duration,
}

impl<S: OrderStore + ?Sized + 'static> Sweeper<S> {
    pub fn new(
        store: Arc<S>,
        queue: Arc<ReconcileQueue<S>>,
        gateway: Arc<dyn TradeQuery>,
        interval: Duration,
        min_age: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            gateway,
            interval,
            min_age,
        }
    }

    /// Checks one batch of stale pending orders against the gateway.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let min_age = chrono::Duration::from_std(self.min_age).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - min_age;

        let pending = match self.store.list_pending(cutoff, SWEEP_BATCH).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Failed to list pending orders");
                report.errors += 1;
                return report;
            }
        };

        for order in pending {
            report.examined += 1;

            let fields = match self.gateway.query_trade(&order.trade_no).await {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(trade_no = %order.trade_no, error = %e, "Trade query failed");
                    report.errors += 1;
                    continue;
                }
            };

            let notice = match PaymentNotice::from_trade_query(&fields) {
                Ok(Some(notice)) => notice,
                Ok(None) => {
                    debug!(trade_no = %order.trade_no, "Trade not paid yet");
                    continue;
                }
                Err(e) => {
                    warn!(trade_no = %order.trade_no, error = %e, "Unusable trade query response");
                    report.errors += 1;
                    continue;
                }
            };

            match self.queue.process(&notice).await {
                Ok(Settlement::InFlight) => {}
                Ok(_) => report.settled += 1,
                Err(e) => {
                    warn!(trade_no = %order.trade_no, error = %e, "Sweep reconciliation failed");
                    report.errors += 1;
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                settled = report.settled,
                errors = report.errors,
                "Pending order sweep finished"
            );
        }
        report
    }

    /// Runs sweeps every `interval` until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Pending order sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
