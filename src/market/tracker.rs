use chrono::{Duration, NaiveDate};

use super::{PriceHistory, SessionConfig};
use crate::exchange::{Clock, Exchange, Gateway, GatewayError};
use crate::models::{MarketSnapshot, SessionPhase, TrendBias};

// One sample per tick is plenty for a day-scale trend; bounds memory on fast ticks
const MAX_HISTORY_SAMPLES: usize = 20_000;

/// Trend classification settings
#[derive(Debug, Clone, PartialEq)]
pub struct TrendConfig {
    pub lookback_hours: i64,
    pub bias_pct: f64, // |change| above this is Bullish/Bearish
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            lookback_hours: 24,
            bias_pct: 0.005, // 0.5%, as the daily filter classifies trend
        }
    }
}

/// Builds one [`MarketSnapshot`] per tick from the gateway price, the
/// session clock and a rolling price history.
pub struct MarketStateTracker {
    symbol: String,
    session: SessionConfig,
    trend: TrendConfig,
    history: PriceHistory,
    anchor: Option<(NaiveDate, f64)>,
    last: Option<MarketSnapshot>,
}

impl MarketStateTracker {
    pub fn new(symbol: impl Into<String>, session: SessionConfig, trend: TrendConfig) -> Self {
        let history = PriceHistory::new(Duration::hours(trend.lookback_hours), MAX_HISTORY_SAMPLES);
        Self {
            symbol: symbol.into(),
            session,
            trend,
            history,
            anchor: None,
            last: None,
        }
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub fn last_snapshot(&self) -> Option<&MarketSnapshot> {
        self.last.as_ref()
    }

    /// Session anchor price for the given trading date, if observed
    pub fn anchor_price(&self, date: NaiveDate) -> Option<f64> {
        self.anchor.filter(|(d, _)| *d == date).map(|(_, price)| price)
    }

    /// Fetch the current price and produce a fresh snapshot.
    ///
    /// A failed price fetch yields the previous snapshot's prices marked
    /// `stale`, with the phase recomputed from the clock. Authentication
    /// failures and a failure before any snapshot exists are returned as errors.
    pub async fn refresh<E: Exchange, C: Clock>(
        &mut self,
        gateway: &mut Gateway<E, C>,
    ) -> Result<MarketSnapshot, GatewayError> {
        let now = gateway.clock().now();
        let (phase, date) = self.session.phase_at(now);

        let price = match gateway.get_price(&self.symbol).await {
            Ok(price) => price,
            Err(err @ GatewayError::Authentication(_)) => return Err(err),
            Err(err) => {
                let Some(previous) = self.last.as_ref() else {
                    return Err(err);
                };
                tracing::warn!(
                    symbol = %self.symbol,
                    error = %err,
                    last_price = previous.last_price,
                    "Price refresh failed, using stale snapshot"
                );
                let open_move_pct = if previous.session_date == date {
                    previous.open_move_pct
                } else {
                    None
                };
                let snapshot = MarketSnapshot {
                    timestamp: now,
                    session_phase: phase,
                    session_date: date,
                    open_move_pct,
                    stale: true,
                    ..previous.clone()
                };
                self.last = Some(snapshot.clone());
                return Ok(snapshot);
            }
        };

        self.history.push(now, price);

        if phase == SessionPhase::OpenWindow && self.anchor_price(date).is_none() {
            tracing::info!(
                symbol = %self.symbol,
                %date,
                price,
                "🔔 Session anchor price recorded"
            );
            self.anchor = Some((date, price));
        }

        let open_move_pct = self
            .anchor_price(date)
            .map(|anchor| (price - anchor) / anchor);
        let daily_change_pct = self.history.change_pct().unwrap_or(0.0);
        let daily_trend_bias = classify_trend(daily_change_pct, self.trend.bias_pct);

        let snapshot = MarketSnapshot {
            timestamp: now,
            last_price: price,
            session_phase: phase,
            session_date: date,
            daily_trend_bias,
            daily_change_pct,
            open_move_pct,
            stale: false,
        };

        tracing::debug!(
            symbol = %self.symbol,
            price,
            phase = ?phase,
            bias = ?daily_trend_bias,
            open_move_pct = ?open_move_pct,
            "Market snapshot refreshed"
        );

        self.last = Some(snapshot.clone());
        Ok(snapshot)
    }
}

pub fn classify_trend(change_pct: f64, bias_pct: f64) -> TrendBias {
    if change_pct > bias_pct {
        TrendBias::Bullish
    } else if change_pct < -bias_pct {
        TrendBias::Bearish
    } else {
        TrendBias::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::GatewaySettings;
    use crate::models::{AccountState, OrderRequest, OrderResult};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        fn set(&self, t: DateTime<Utc>) {
            *self.0.lock().unwrap() = t;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }

        async fn sleep(&self, _duration: std::time::Duration) {}
    }

    struct PriceScript(Mutex<VecDeque<Result<f64, GatewayError>>>);

    impl Exchange for PriceScript {
        async fn place_order(&self, _request: &OrderRequest) -> Result<OrderResult, GatewayError> {
            Err(GatewayError::Validation("not scripted".into()))
        }

        async fn fetch_price(&self, _symbol: &str) -> Result<f64, GatewayError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(GatewayError::Validation("script exhausted".into())))
        }

        async fn fetch_account(&self, _symbol: &str) -> Result<AccountState, GatewayError> {
            Err(GatewayError::Validation("not scripted".into()))
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), GatewayError> {
            Ok(())
        }

        fn supports_stop_orders(&self) -> bool {
            true
        }
    }

    // Wednesday 2025-01-15, NY open at 14:30 UTC
    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, h, m, 0).unwrap()
    }

    fn gateway(prices: Vec<Result<f64, GatewayError>>) -> Gateway<PriceScript, FixedClock> {
        let settings = GatewaySettings {
            backoff: crate::exchange::BackoffPolicy {
                max_attempts: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        Gateway::new(
            PriceScript(Mutex::new(prices.into())),
            FixedClock(Mutex::new(at(14, 0))),
            settings,
        )
    }

    fn tracker() -> MarketStateTracker {
        MarketStateTracker::new("BTCUSDT", SessionConfig::default(), TrendConfig::default())
    }

    #[tokio::test]
    async fn test_anchor_set_on_first_open_window_price() {
        let mut gw = gateway(vec![Ok(60100.0), Ok(60000.0), Ok(59940.0)]);
        let mut tracker = tracker();

        gw.clock().set(at(14, 20));
        let pre = tracker.refresh(&mut gw).await.unwrap();
        assert_eq!(pre.session_phase, SessionPhase::PreOpen);
        assert_eq!(pre.open_move_pct, None);

        gw.clock().set(at(14, 30));
        let open = tracker.refresh(&mut gw).await.unwrap();
        assert_eq!(open.session_phase, SessionPhase::OpenWindow);
        assert_eq!(open.open_move_pct, Some(0.0));

        gw.clock().set(at(14, 31));
        let moved = tracker.refresh(&mut gw).await.unwrap();
        assert!((moved.open_move_pct.unwrap() + 0.001).abs() < 1e-9); // -0.1%
    }

    #[tokio::test]
    async fn test_trend_bias_from_history() {
        let mut gw = gateway(vec![Ok(100.0), Ok(101.0)]);
        let mut tracker = tracker();

        tracker.refresh(&mut gw).await.unwrap();
        gw.clock().set(at(14, 5));
        let snapshot = tracker.refresh(&mut gw).await.unwrap();

        assert_eq!(snapshot.daily_trend_bias, TrendBias::Bullish);
        assert!((snapshot.daily_change_pct - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failure_returns_stale_snapshot() {
        let mut gw = gateway(vec![
            Ok(60000.0),
            Err(GatewayError::TransientNetwork("reset".into())),
        ]);
        let mut tracker = tracker();

        tracker.refresh(&mut gw).await.unwrap();
        gw.clock().set(at(14, 35));
        let stale = tracker.refresh(&mut gw).await.unwrap();

        assert!(stale.stale);
        assert_eq!(stale.last_price, 60000.0);
        assert_eq!(stale.session_phase, SessionPhase::OpenWindow); // recomputed
        assert_eq!(stale.timestamp, at(14, 35));
    }

    #[tokio::test]
    async fn test_failure_without_history_is_error() {
        let mut gw = gateway(vec![Err(GatewayError::TransientNetwork("reset".into()))]);
        let mut tracker = tracker();

        assert!(tracker.refresh(&mut gw).await.is_err());
    }

    #[tokio::test]
    async fn test_authentication_failure_never_stale() {
        let mut gw = gateway(vec![
            Ok(60000.0),
            Err(GatewayError::Authentication("40037".into())),
        ]);
        let mut tracker = tracker();

        tracker.refresh(&mut gw).await.unwrap();
        let err = tracker.refresh(&mut gw).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(_)));
    }

    #[test]
    fn test_classify_trend_thresholds() {
        assert_eq!(classify_trend(0.006, 0.005), TrendBias::Bullish);
        assert_eq!(classify_trend(-0.006, 0.005), TrendBias::Bearish);
        assert_eq!(classify_trend(0.005, 0.005), TrendBias::Neutral);
    }
}
