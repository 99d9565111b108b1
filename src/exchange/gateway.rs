use std::time::Duration;

use super::{BackoffPolicy, CircuitBreaker, Clock, Exchange, GatewayError, SystemClock};
use crate::models::{AccountState, OrderRequest, OrderResult};

/// Retry, timeout and circuit-breaker settings for the gateway
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub backoff: BackoffPolicy,
    pub call_timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: i64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            call_timeout: Duration::from_secs(10),
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
        }
    }
}

/// Result of an order submission together with every attempt that failed on the way
#[derive(Debug)]
pub struct SubmitOutcome {
    pub result: Result<OrderResult, GatewayError>,
    pub failed_attempts: Vec<GatewayError>,
}

enum Query<'a> {
    Price(&'a str),
    Account(&'a str),
    Leverage(&'a str, u32),
}

enum Reply {
    Price(f64),
    Account(AccountState),
    Done,
}

impl Query<'_> {
    fn label(&self) -> &'static str {
        match self {
            Query::Price(_) => "get_price",
            Query::Account(_) => "get_account_state",
            Query::Leverage(..) => "set_leverage",
        }
    }
}

/// Exchange gateway: wraps a raw [`Exchange`] with bounded timeouts,
/// exponential backoff for transient failures and a circuit breaker.
///
/// The gateway does not deduplicate orders. Retries of a submission reuse the
/// caller's `client_order_id`, which the exchange uses as idempotency token.
pub struct Gateway<E, C = SystemClock> {
    exchange: E,
    clock: C,
    backoff: BackoffPolicy,
    call_timeout: Duration,
    breaker: CircuitBreaker,
}

impl<E: Exchange, C: Clock> Gateway<E, C> {
    pub fn new(exchange: E, clock: C, settings: GatewaySettings) -> Self {
        Self {
            exchange,
            clock,
            backoff: settings.backoff,
            call_timeout: settings.call_timeout,
            breaker: CircuitBreaker::new(
                settings.breaker_failure_threshold,
                settings.breaker_cooldown_secs,
            ),
        }
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn supports_stop_orders(&self) -> bool {
        self.exchange.supports_stop_orders()
    }

    /// Submit an order. A timeout is reported as `UnknownOutcome` and is not
    /// retried: the caller must reconcile before issuing another order.
    pub async fn submit_order(&mut self, request: &OrderRequest) -> SubmitOutcome {
        let mut failed_attempts = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if let Err(err) = self.acquire() {
                return SubmitOutcome {
                    result: Err(err),
                    failed_attempts,
                };
            }

            let outcome =
                match tokio::time::timeout(self.call_timeout, self.exchange.place_order(request))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(GatewayError::UnknownOutcome(format!(
                        "order {} not confirmed within {:?}",
                        request.client_order_id, self.call_timeout
                    ))),
                };

            match outcome {
                Ok(result) => {
                    self.breaker.record_success();
                    if attempt > 1 {
                        tracing::info!(
                            client_order_id = %request.client_order_id,
                            attempt,
                            "Order accepted after retry"
                        );
                    }
                    return SubmitOutcome {
                        result: Ok(result),
                        failed_attempts,
                    };
                }
                Err(err) => {
                    self.record_failure(&err);

                    if err.is_retryable() && self.backoff.should_retry(attempt) {
                        let delay = self.retry_delay(attempt, &err);
                        tracing::warn!(
                            client_order_id = %request.client_order_id,
                            attempt,
                            max_attempts = self.backoff.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Order submission failed, retrying"
                        );
                        failed_attempts.push(err);
                        self.clock.sleep(delay).await;
                        continue;
                    }

                    return SubmitOutcome {
                        result: Err(err),
                        failed_attempts,
                    };
                }
            }
        }
    }

    pub async fn get_price(&mut self, symbol: &str) -> Result<f64, GatewayError> {
        match self.query(Query::Price(symbol)).await? {
            Reply::Price(price) => Ok(price),
            _ => Err(GatewayError::Validation("unexpected reply to price query".into())),
        }
    }

    pub async fn get_account_state(&mut self, symbol: &str) -> Result<AccountState, GatewayError> {
        match self.query(Query::Account(symbol)).await? {
            Reply::Account(account) => Ok(account),
            _ => Err(GatewayError::Validation("unexpected reply to account query".into())),
        }
    }

    pub async fn set_leverage(&mut self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        self.query(Query::Leverage(symbol, leverage)).await.map(|_| ())
    }

    async fn query(&mut self, query: Query<'_>) -> Result<Reply, GatewayError> {
        let label = query.label();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.acquire()?;

            let exchange = &self.exchange;
            let call = async {
                match query {
                    Query::Price(symbol) => exchange.fetch_price(symbol).await.map(Reply::Price),
                    Query::Account(symbol) => {
                        exchange.fetch_account(symbol).await.map(Reply::Account)
                    }
                    Query::Leverage(symbol, leverage) => exchange
                        .set_leverage(symbol, leverage)
                        .await
                        .map(|_| Reply::Done),
                }
            };

            let outcome = match tokio::time::timeout(self.call_timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(GatewayError::TransientNetwork(format!(
                    "{} timed out after {:?}",
                    label, self.call_timeout
                ))),
            };

            match outcome {
                Ok(reply) => {
                    self.breaker.record_success();
                    return Ok(reply);
                }
                Err(err) => {
                    self.record_failure(&err);

                    if err.is_retryable() && self.backoff.should_retry(attempt) {
                        let delay = self.retry_delay(attempt, &err);
                        tracing::warn!(
                            call = label,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Exchange query failed, retrying"
                        );
                        self.clock.sleep(delay).await;
                        continue;
                    }

                    return Err(err);
                }
            }
        }
    }

    fn acquire(&mut self) -> Result<(), GatewayError> {
        self.breaker.try_acquire(self.clock.now()).map_err(|wait| {
            GatewayError::TransientNetwork(format!(
                "circuit breaker open, next trial call in {}s",
                wait.num_seconds().max(0)
            ))
        })
    }

    fn record_failure(&mut self, err: &GatewayError) {
        if err.is_degradation() {
            self.breaker.record_failure(self.clock.now());
        } else {
            self.breaker.record_neutral();
        }
    }

    fn retry_delay(&self, attempt: u32, err: &GatewayError) -> Duration {
        match err {
            GatewayError::RateLimited { retry_after } => {
                self.backoff.delay_after(attempt, *retry_after)
            }
            _ => self.backoff.delay_for(attempt),
        }
    }
}
