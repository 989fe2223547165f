//! Drives orders to terminal states with per-symbol serialization,
//! timeouts, idempotent cancels, and retry.

use crate::config::ExecutionConfig;
use crate::exchange::{ConnectorError, OrderSide};
use crate::execution::backend::{ExecutionBackend, ExecutionEvent};
use crate::execution::order::{ExecutionError, Order, OrderIntent, OrderState};
use crate::ledger::{EventKind, Ledger, LedgerEntry};
use crate::risk::OrderRequest;
use crate::utils::decimal::weighted_average;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Extra wait after a timeout cancel for late fills or the cancel ack.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Aggregate result of driving one order request, across retries.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub intent: OrderIntent,
    pub final_state: OrderState,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Decimal,
    pub fees_paid: Decimal,
    pub attempts: u32,
}

impl ExecutionOutcome {
    pub fn is_filled(&self) -> bool {
        self.final_state == OrderState::Filled
    }

    pub fn is_rejected(&self) -> bool {
        self.final_state == OrderState::Rejected
    }
}

enum WaitResult {
    Terminal,
    TimedOut,
}

pub struct ExecutionManager {
    backend: Arc<dyn ExecutionBackend>,
    ledger: Arc<Ledger>,
    config: ExecutionConfig,
    locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
    waiters: Arc<TokioMutex<HashMap<String, mpsc::Sender<ExecutionEvent>>>>,
    seq: AtomicU64,
}

impl ExecutionManager {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        ledger: Arc<Ledger>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            backend,
            ledger,
            config,
            locks: Mutex::new(HashMap::new()),
            waiters: Arc::new(TokioMutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
        }
    }

    /// Route backend events to the in-flight order waiting on them.
    /// Events for unknown client order ids (stale cancels after a timeout)
    /// are logged and dropped.
    pub fn spawn_dispatcher(
        &self,
        mut events: mpsc::Receiver<ExecutionEvent>,
    ) -> JoinHandle<()> {
        let waiters = Arc::clone(&self.waiters);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let id = event.client_order_id().to_string();
                let target = waiters.lock().await.get(&id).cloned();
                match target {
                    Some(tx) => {
                        if tx.send(event).await.is_err() {
                            debug!(client_order_id = %id, "Waiter gone, dropping event");
                        }
                    }
                    None => {
                        debug!(client_order_id = %id, "No waiter for event, dropping");
                    }
                }
            }
        })
    }

    /// Per-symbol execution lock. The engine also holds this around
    /// accrual and signal evaluation for the symbol.
    pub fn symbol_lock(&self, symbol: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        Arc::clone(locks.entry(symbol.to_string()).or_default())
    }

    fn next_client_order_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("farb-{}-{}", Utc::now().timestamp_millis(), seq)
    }

    /// Drive one approved order request to a terminal state.
    ///
    /// The idempotency key is generated once and reused across retries, so
    /// a duplicate submit cannot create a second exchange order. Exhausted
    /// retries come back as a Cancelled outcome, not an error; errors are
    /// reserved for invariant violations and unusable backends.
    pub async fn execute(
        &self,
        request: &OrderRequest,
        intent: OrderIntent,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let lock = self.symbol_lock(&request.symbol);
        let _guard = lock.lock().await;

        let client_order_id = self.next_client_order_id();
        let (tx, mut rx) = mpsc::channel(32);
        self.waiters
            .lock()
            .await
            .insert(client_order_id.clone(), tx);

        let result = self.drive(request, intent, &client_order_id, &mut rx).await;

        self.waiters.lock().await.remove(&client_order_id);
        result
    }

    async fn drive(
        &self,
        request: &OrderRequest,
        intent: OrderIntent,
        client_order_id: &str,
        rx: &mut mpsc::Receiver<ExecutionEvent>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let timeout = Duration::from_secs(self.config.order_timeout_secs);
        let mut remaining = request.quantity;
        let mut fills: Vec<(Decimal, Decimal)> = Vec::new();
        let mut total_fees = Decimal::ZERO;
        let mut last_state = OrderState::Pending;
        let mut attempts = 0;

        for attempt in 1..=self.config.max_retries {
            attempts = attempt;
            let mut order = Order::new(
                client_order_id.to_string(),
                request.symbol.clone(),
                request.side,
                remaining,
                intent,
            );

            match self.backend.submit(&order).await {
                Ok(()) => {
                    order.transition(OrderState::Submitted)?;
                    self.journal_order(EventKind::OrderSubmitted, &order, intent, attempt, None);
                }
                Err(ConnectorError::Rejected { code, reason }) => {
                    order.transition(OrderState::Rejected)?;
                    self.journal_order(
                        EventKind::OrderRejected,
                        &order,
                        intent,
                        attempt,
                        Some(format!("code {}: {}", code, reason)),
                    );
                    last_state = OrderState::Rejected;
                    break;
                }
                Err(e) if e.is_retryable() => {
                    warn!(symbol = %request.symbol, attempt, "Submit failed: {}", e);
                    let hint = match &e {
                        ConnectorError::RateLimited { retry_after_secs } => {
                            Some(Duration::from_secs(*retry_after_secs))
                        }
                        _ => None,
                    };
                    // The request may have reached the exchange; cancel by
                    // the idempotency key before trying again.
                    if let Err(cancel_err) =
                        self.backend.cancel(&request.symbol, client_order_id).await
                    {
                        error!("Cancel after failed submit also failed: {}", cancel_err);
                    }
                    last_state = OrderState::Pending;
                    if attempt < self.config.max_retries {
                        self.retry_backoff(attempt, hint).await;
                        continue;
                    }
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let wait = self
                .wait_for_terminal(&mut order, intent, rx, timeout)
                .await?;

            let timed_out = match wait {
                WaitResult::Terminal => false,
                WaitResult::TimedOut => {
                    warn!(
                        symbol = %request.symbol,
                        client_order_id,
                        attempt,
                        "Order timed out, cancelling"
                    );
                    if let Err(e) = self.backend.cancel(&request.symbol, client_order_id).await {
                        error!("Timeout cancel failed: {}", e);
                    }

                    // Give late fills and the cancel ack a moment to land.
                    let grace = self
                        .wait_for_terminal(&mut order, intent, rx, CANCEL_GRACE)
                        .await?;

                    if matches!(grace, WaitResult::TimedOut) && !order.state.is_terminal() {
                        order.transition(OrderState::Cancelled)?;
                        self.journal_order(
                            EventKind::OrderCancelled,
                            &order,
                            intent,
                            attempt,
                            Some("timeout".to_string()),
                        );
                    }
                    true
                }
            };

            if order.filled_quantity > Decimal::ZERO {
                fills.push((order.avg_fill_price, order.filled_quantity));
                total_fees += order.fees_paid;
                remaining -= order.filled_quantity;
            }
            last_state = order.state;

            if !timed_out || remaining == Decimal::ZERO || last_state == OrderState::Filled {
                break;
            }
            if attempt < self.config.max_retries {
                self.retry_backoff(attempt, None).await;
            } else {
                info!(
                    symbol = %request.symbol,
                    client_order_id,
                    "Retries exhausted with {} still unfilled",
                    remaining
                );
            }
        }

        let filled_quantity = request.quantity - remaining;
        let final_state = if filled_quantity == request.quantity {
            OrderState::Filled
        } else {
            last_state
        };

        Ok(ExecutionOutcome {
            client_order_id: client_order_id.to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            intent,
            final_state,
            requested_quantity: request.quantity,
            filled_quantity,
            avg_fill_price: weighted_average(&fills),
            fees_paid: total_fees,
            attempts,
        })
    }

    /// Process events for one order until it reaches a terminal state or
    /// the deadline passes.
    async fn wait_for_terminal(
        &self,
        order: &mut Order,
        intent: OrderIntent,
        rx: &mut mpsc::Receiver<ExecutionEvent>,
        timeout: Duration,
    ) -> Result<WaitResult, ExecutionError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(WaitResult::TimedOut);
            }

            let event = match tokio::time::timeout(deadline - now, rx.recv()).await {
                Err(_) => return Ok(WaitResult::TimedOut),
                Ok(None) => return Err(ExecutionError::ChannelClosed),
                Ok(Some(event)) => event,
            };

            match event {
                ExecutionEvent::Accepted { .. } => {
                    debug!(client_order_id = %order.client_order_id, "Order accepted");
                }
                ExecutionEvent::Fill {
                    quantity,
                    price,
                    fee,
                    ..
                } => match order.apply_fill(quantity, price, fee) {
                    Ok(OrderState::Filled) => {
                        self.journal_fill(order, intent, quantity, price, fee, true);
                        return Ok(WaitResult::Terminal);
                    }
                    Ok(_) => {
                        self.journal_fill(order, intent, quantity, price, fee, false);
                    }
                    Err(e @ ExecutionError::FillOverflow { .. }) => {
                        error!(
                            symbol = %order.symbol,
                            client_order_id = %order.client_order_id,
                            "Fill overflow: {}",
                            e
                        );
                        self.journal_order(
                            EventKind::OrderRejected,
                            order,
                            intent,
                            0,
                            Some(format!("invariant violation: {}", e)),
                        );
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                },
                ExecutionEvent::Cancelled { .. } => {
                    order.transition(OrderState::Cancelled)?;
                    self.journal_order(EventKind::OrderCancelled, order, intent, 0, None);
                    return Ok(WaitResult::Terminal);
                }
                ExecutionEvent::Rejected { reason, .. } => {
                    order.transition(OrderState::Rejected)?;
                    self.journal_order(EventKind::OrderRejected, order, intent, 0, Some(reason));
                    return Ok(WaitResult::Terminal);
                }
            }
        }
    }

    /// Linear backoff between attempts. A rate-limit hint from the
    /// exchange extends the wait when it is longer than the linear step.
    async fn retry_backoff(&self, attempt: u32, hint: Option<Duration>) {
        let linear = Duration::from_millis(self.config.retry_backoff_ms * attempt as u64);
        let backoff = match hint {
            Some(hint) => linear.max(hint),
            None => linear,
        };
        tokio::time::sleep(backoff).await;
    }

    fn journal_order(
        &self,
        event: EventKind,
        order: &Order,
        intent: OrderIntent,
        attempt: u32,
        reason: Option<String>,
    ) {
        let mut details = serde_json::json!({ "intent": intent_str(intent) });
        if attempt > 0 {
            details["attempt"] = serde_json::json!(attempt);
        }
        if let Some(reason) = reason {
            details["reason"] = serde_json::json!(reason);
        }

        let entry = LedgerEntry::new(event)
            .symbol(&order.symbol)
            .client_order_id(&order.client_order_id)
            .side(order.side)
            .quantity(order.quantity)
            .details(details);

        if let Err(e) = self.ledger.append(&entry) {
            error!("Failed to journal order event: {}", e);
        }
    }

    fn journal_fill(
        &self,
        order: &Order,
        intent: OrderIntent,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
        terminal: bool,
    ) {
        let event = if terminal {
            EventKind::OrderFilled
        } else {
            EventKind::OrderPartialFill
        };

        let entry = LedgerEntry::new(event)
            .symbol(&order.symbol)
            .client_order_id(&order.client_order_id)
            .side(order.side)
            .quantity(quantity)
            .price(price)
            .amount(fee)
            .details(serde_json::json!({ "intent": intent_str(intent) }));

        if let Err(e) = self.ledger.append(&entry) {
            error!("Failed to journal fill: {}", e);
        }
    }
}

fn intent_str(intent: OrderIntent) -> &'static str {
    match intent {
        OrderIntent::Open => "open",
        OrderIntent::Close => "close",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::backend::MockExecutionBackend;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;

    fn test_exec_config(timeout_secs: u64) -> ExecutionConfig {
        ExecutionConfig {
            order_timeout_secs: timeout_secs,
            max_retries: 3,
            retry_backoff_ms: 1,
            cancel_on_shutdown: false,
            paper_slippage: dec!(0.0002),
            ledger_path: ":memory:".to_string(),
        }
    }

    fn test_request(quantity: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            quantity,
            reference_price: dec!(100),
            reduce_only: false,
        }
    }

    fn manager_with(
        backend: MockExecutionBackend,
        config: ExecutionConfig,
    ) -> (Arc<ExecutionManager>, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let manager = Arc::new(ExecutionManager::new(
            Arc::new(backend),
            Arc::clone(&ledger),
            config,
        ));
        (manager, ledger)
    }

    #[tokio::test]
    async fn test_partial_fills_reach_filled_with_weighted_average() {
        let (events_tx, events_rx) = mpsc::channel(32);

        let mut backend = MockExecutionBackend::new();
        let tx = events_tx.clone();
        backend.expect_submit().times(1).returning(move |order| {
            let id = order.client_order_id.clone();
            tx.try_send(ExecutionEvent::Accepted {
                client_order_id: id.clone(),
            })
            .unwrap();
            tx.try_send(ExecutionEvent::Fill {
                client_order_id: id.clone(),
                quantity: dec!(4),
                price: dec!(100),
                fee: dec!(0.1),
            })
            .unwrap();
            tx.try_send(ExecutionEvent::Fill {
                client_order_id: id,
                quantity: dec!(6),
                price: dec!(101),
                fee: dec!(0.1),
            })
            .unwrap();
            Ok(())
        });

        let (manager, ledger) = manager_with(backend, test_exec_config(5));
        let _dispatcher = manager.spawn_dispatcher(events_rx);

        let outcome = manager
            .execute(&test_request(dec!(10)), OrderIntent::Open)
            .await
            .unwrap();

        assert!(outcome.is_filled());
        assert_eq!(outcome.filled_quantity, dec!(10));
        assert_eq!(outcome.avg_fill_price, dec!(100.6));
        assert_eq!(outcome.fees_paid, dec!(0.2));
        assert_eq!(outcome.attempts, 1);

        // submitted + partial fill + filled
        assert_eq!(ledger.entry_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_pre_ack_rejection_is_terminal() {
        let (_events_tx, events_rx) = mpsc::channel::<ExecutionEvent>(32);

        let mut backend = MockExecutionBackend::new();
        backend.expect_submit().times(1).returning(|_| {
            Err(ConnectorError::Rejected {
                code: -2019,
                reason: "Margin is insufficient.".to_string(),
            })
        });

        let (manager, ledger) = manager_with(backend, test_exec_config(5));
        let _dispatcher = manager.spawn_dispatcher(events_rx);

        let outcome = manager
            .execute(&test_request(dec!(1)), OrderIntent::Open)
            .await
            .unwrap();

        assert!(outcome.is_rejected());
        assert_eq!(outcome.filled_quantity, Decimal::ZERO);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(ledger.entry_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timeout_cancels_then_retries_with_same_key() {
        let (events_tx, events_rx) = mpsc::channel(32);

        let calls = Arc::new(AtomicU32::new(0));
        let submit_calls = Arc::clone(&calls);
        let tx = events_tx.clone();

        let mut backend = MockExecutionBackend::new();
        backend.expect_submit().times(2).returning(move |order| {
            let call = submit_calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                // First attempt: no events, let it time out
                return Ok(());
            }
            let id = order.client_order_id.clone();
            tx.try_send(ExecutionEvent::Fill {
                client_order_id: id,
                quantity: order.quantity,
                price: dec!(100),
                fee: dec!(0.05),
            })
            .unwrap();
            Ok(())
        });
        backend.expect_cancel().times(1).returning(|_, _| Ok(()));

        let (manager, _ledger) = manager_with(backend, test_exec_config(1));
        let _dispatcher = manager.spawn_dispatcher(events_rx);

        let outcome = manager
            .execute(&test_request(dec!(2)), OrderIntent::Open)
            .await
            .unwrap();

        assert!(outcome.is_filled());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.filled_quantity, dec!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_extends_backoff() {
        let (_events_tx, events_rx) = mpsc::channel::<ExecutionEvent>(32);

        let mut backend = MockExecutionBackend::new();
        backend.expect_submit().times(3).returning(|_| {
            Err(ConnectorError::RateLimited {
                retry_after_secs: 5,
            })
        });
        backend.expect_cancel().times(3).returning(|_, _| Ok(()));

        let (manager, _ledger) = manager_with(backend, test_exec_config(5));
        let _dispatcher = manager.spawn_dispatcher(events_rx);

        let start = tokio::time::Instant::now();
        let outcome = manager
            .execute(&test_request(dec!(1)), OrderIntent::Open)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.filled_quantity, Decimal::ZERO);
        // Two backoffs between three attempts, each at least the 5s hint
        // (far above the configured 1ms linear step).
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let (_events_tx, events_rx) = mpsc::channel::<ExecutionEvent>(32);

        let mut backend = MockExecutionBackend::new();
        backend.expect_submit().times(1).returning(|_| {
            Err(ConnectorError::AuthFailure(
                "Invalid API-key, IP, or permissions".to_string(),
            ))
        });

        let (manager, _ledger) = manager_with(backend, test_exec_config(5));
        let _dispatcher = manager.spawn_dispatcher(events_rx);

        let err = manager
            .execute(&test_request(dec!(1)), OrderIntent::Open)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Backend(ConnectorError::AuthFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_fills_aggregate_across_attempts() {
        let (events_tx, events_rx) = mpsc::channel(32);

        let calls = Arc::new(AtomicU32::new(0));
        let submit_calls = Arc::clone(&calls);
        let tx = events_tx.clone();

        let mut backend = MockExecutionBackend::new();
        backend.expect_submit().times(2).returning(move |order| {
            let call = submit_calls.fetch_add(1, Ordering::SeqCst);
            let id = order.client_order_id.clone();
            if call == 0 {
                // First attempt: partial fill only, then silence until the
                // timeout cancels it.
                tx.try_send(ExecutionEvent::Fill {
                    client_order_id: id,
                    quantity: dec!(3),
                    price: dec!(100),
                    fee: dec!(0.03),
                })
                .unwrap();
                return Ok(());
            }
            // Second attempt carries only the remainder.
            assert_eq!(order.quantity, dec!(7));
            tx.try_send(ExecutionEvent::Fill {
                client_order_id: id,
                quantity: dec!(7),
                price: dec!(101),
                fee: dec!(0.07),
            })
            .unwrap();
            Ok(())
        });
        backend.expect_cancel().times(1).returning(|_, _| Ok(()));

        let (manager, _ledger) = manager_with(backend, test_exec_config(1));
        let _dispatcher = manager.spawn_dispatcher(events_rx);

        let outcome = manager
            .execute(&test_request(dec!(10)), OrderIntent::Open)
            .await
            .unwrap();

        assert!(outcome.is_filled());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.filled_quantity, dec!(10));
        assert_eq!(outcome.avg_fill_price, dec!(100.7));
        assert_eq!(outcome.fees_paid, dec!(0.10));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_as_cancelled() {
        let (_events_tx, events_rx) = mpsc::channel::<ExecutionEvent>(32);

        let mut backend = MockExecutionBackend::new();
        backend.expect_submit().times(2).returning(|_| Ok(()));
        backend.expect_cancel().times(2).returning(|_, _| Ok(()));

        let mut config = test_exec_config(0);
        config.max_retries = 2;

        let (manager, _ledger) = manager_with(backend, config);
        let _dispatcher = manager.spawn_dispatcher(events_rx);

        let outcome = manager
            .execute(&test_request(dec!(1)), OrderIntent::Open)
            .await
            .unwrap();

        assert_eq!(outcome.final_state, OrderState::Cancelled);
        assert_eq!(outcome.filled_quantity, Decimal::ZERO);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_fill_overflow_is_fatal() {
        let (events_tx, events_rx) = mpsc::channel(32);

        let mut backend = MockExecutionBackend::new();
        let tx = events_tx.clone();
        backend.expect_submit().times(1).returning(move |order| {
            tx.try_send(ExecutionEvent::Fill {
                client_order_id: order.client_order_id.clone(),
                quantity: dec!(11),
                price: dec!(100),
                fee: dec!(0),
            })
            .unwrap();
            Ok(())
        });

        let (manager, _ledger) = manager_with(backend, test_exec_config(5));
        let _dispatcher = manager.spawn_dispatcher(events_rx);

        let err = manager
            .execute(&test_request(dec!(10)), OrderIntent::Open)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::FillOverflow { .. }));
    }

    #[tokio::test]
    async fn test_dispatcher_drops_unknown_ids() {
        let (events_tx, events_rx) = mpsc::channel(32);
        let backend = MockExecutionBackend::new();
        let (manager, _ledger) = manager_with(backend, test_exec_config(5));
        let _dispatcher = manager.spawn_dispatcher(events_rx);

        // No waiter registered; must not panic or wedge the dispatcher
        events_tx
            .send(ExecutionEvent::Cancelled {
                client_order_id: "farb-0-unknown".to_string(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!events_tx.is_closed());
    }

    #[tokio::test]
    async fn test_client_order_ids_are_unique() {
        let backend = MockExecutionBackend::new();
        let (manager, _ledger) = manager_with(backend, test_exec_config(5));

        let a = manager.next_client_order_id();
        let b = manager.next_client_order_id();
        assert_ne!(a, b);
        assert!(a.starts_with("farb-"));
    }
}
