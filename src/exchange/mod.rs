// Exchange boundary: raw client, retry policy, circuit breaker and the gateway that composes them
pub mod backoff;
pub mod bitget;
pub mod circuit_breaker;
pub mod gateway;

pub use backoff::{BackoffPolicy, Clock, SystemClock};
pub use bitget::{BitgetClient, BitgetCredentials};
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use gateway::{Gateway, GatewaySettings, SubmitOutcome};

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::models::{AccountState, OrderRequest, OrderResult};

/// Every exchange-facing failure is translated into one of these kinds
/// before it reaches the position manager.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited by exchange (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("request rejected: {0}")]
    Validation(String),

    #[error("order outcome unknown: {0}")]
    UnknownOutcome(String),
}

impl GatewayError {
    /// Errors worth another attempt under the backoff policy
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::TransientNetwork(_) | GatewayError::RateLimited { .. }
        )
    }

    /// Errors that count against the circuit breaker
    pub fn is_degradation(&self) -> bool {
        matches!(
            self,
            GatewayError::TransientNetwork(_)
                | GatewayError::RateLimited { .. }
                | GatewayError::UnknownOutcome(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::TransientNetwork(_) => "transient_network",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Authentication(_) => "authentication",
            GatewayError::Validation(_) => "validation",
            GatewayError::UnknownOutcome(_) => "unknown_outcome",
        }
    }
}

/// Single-attempt calls against a perpetual-futures exchange.
///
/// Implementations translate transport errors into [`GatewayError`] and never
/// retry on their own; retries, timeouts and the circuit breaker live in
/// [`Gateway`].
pub trait Exchange: Send + Sync {
    fn place_order(
        &self,
        request: &OrderRequest,
    ) -> impl Future<Output = Result<OrderResult, GatewayError>> + Send;

    fn fetch_price(&self, symbol: &str) -> impl Future<Output = Result<f64, GatewayError>> + Send;

    fn fetch_account(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<AccountState, GatewayError>> + Send;

    fn set_leverage(
        &self,
        symbol: &str,
        leverage: u32,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Whether open positions stay protected by exchange-side stop orders
    fn supports_stop_orders(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(GatewayError::TransientNetwork("reset".into()).is_retryable());
        assert!(GatewayError::RateLimited { retry_after: None }.is_retryable());
        assert!(!GatewayError::Authentication("bad key".into()).is_retryable());
        assert!(!GatewayError::Validation("min size".into()).is_retryable());
        assert!(!GatewayError::UnknownOutcome("timeout".into()).is_retryable());
    }

    #[test]
    fn test_degradation_excludes_caller_errors() {
        assert!(GatewayError::UnknownOutcome("timeout".into()).is_degradation());
        assert!(!GatewayError::Validation("min size".into()).is_degradation());
        assert!(!GatewayError::Authentication("bad key".into()).is_degradation());
    }
}
