use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::event_log::{EventLogger, EventType, LogRecord};
use crate::exchange::{Clock, Exchange, Gateway, GatewayError};
use crate::execution::position_manager::{ExecutionOutcome, PositionManager};
use crate::market::MarketStateTracker;
use crate::models::{ExitReason, LifecycleState, MarketSnapshot, SessionPhase, TradeAction};
use crate::strategy::{self, StrategyConfig};

/// Control loop settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub close_on_shutdown: bool, // Close even when an exchange-side stop protects the position
    pub shutdown_close_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            close_on_shutdown: false,
            shutdown_close_timeout: Duration::from_secs(30),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub snapshot: Option<MarketSnapshot>,
    pub action: TradeAction,
    pub outcome: ExecutionOutcome,
}

/// Drives one decision cycle per tick: reconcile, refresh, decide, execute.
///
/// Owns every piece of mutable trading state; nothing is shared across tasks.
pub struct TradingEngine<E, C> {
    gateway: Gateway<E, C>,
    tracker: MarketStateTracker,
    manager: PositionManager,
    logger: EventLogger,
    strategy: StrategyConfig,
    config: EngineConfig,
    shutting_down: bool,
    no_entry_logged: Option<NaiveDate>, // Session already given its `no_entry` record
}

impl<E: Exchange, C: Clock> TradingEngine<E, C> {
    pub fn new(
        gateway: Gateway<E, C>,
        tracker: MarketStateTracker,
        manager: PositionManager,
        logger: EventLogger,
        strategy: StrategyConfig,
        config: EngineConfig,
    ) -> Self {
        Self {
            gateway,
            tracker,
            manager,
            logger,
            strategy,
            config,
            shutting_down: false,
            no_entry_logged: None,
        }
    }

    pub fn gateway(&self) -> &Gateway<E, C> {
        &self.gateway
    }

    pub fn manager(&self) -> &PositionManager {
        &self.manager
    }

    pub fn tracker(&self) -> &MarketStateTracker {
        &self.tracker
    }

    pub fn logger(&self) -> &EventLogger {
        &self.logger
    }

    /// Stop taking new entries; open positions are still managed
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }

    /// Set leverage, adopt any open exchange position and log `bot_started`
    pub async fn start(&mut self) -> Result<(), GatewayError> {
        let symbol = self.manager.config().symbol.clone();
        let leverage = self.manager.config().leverage;

        match self.gateway.set_leverage(&symbol, leverage).await {
            Ok(()) => tracing::info!(%symbol, leverage, "⚙️  Leverage set"),
            Err(err @ GatewayError::Authentication(_)) => return Err(err),
            Err(err) => tracing::warn!(%symbol, error = %err, "Failed to set leverage, continuing"),
        }

        self.manager
            .sync_on_startup(&mut self.gateway, &mut self.logger)
            .await?;

        let now = self.gateway.clock().now();
        self.logger.record(
            LogRecord::new(EventType::BotStarted, &symbol, now)
                .with_position(self.manager.position())
                .with_state(self.manager.state())
                .with_reason(format!("leverage {}x", leverage)),
        );
        Ok(())
    }

    /// One decision cycle. Only authentication failures are returned as errors.
    pub async fn tick(&mut self) -> Result<TickReport, GatewayError> {
        if self.manager.needs_reconciliation()
            && !self
                .manager
                .reconcile(&mut self.gateway, &mut self.logger)
                .await?
        {
            // No orders until the pending one is resolved
            return Ok(TickReport {
                snapshot: self.tracker.last_snapshot().cloned(),
                action: TradeAction::NoOp,
                outcome: ExecutionOutcome::NoOrder,
            });
        }

        let snapshot = match self.tracker.refresh(&mut self.gateway).await {
            Ok(snapshot) => snapshot,
            Err(err @ GatewayError::Authentication(_)) => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "No market data yet, skipping tick");
                return Ok(TickReport {
                    snapshot: None,
                    action: TradeAction::NoOp,
                    outcome: ExecutionOutcome::NoOrder,
                });
            }
        };

        let last_price = (!snapshot.stale).then_some(snapshot.last_price);
        self.manager
            .sync_position(last_price, &mut self.gateway, &mut self.logger)
            .await?;

        let mut action = strategy::decide(&snapshot, self.manager.position(), &self.strategy);
        if self.shutting_down && matches!(action, TradeAction::Enter { .. }) {
            tracing::info!("Shutting down, entry suppressed");
            action = TradeAction::NoOp;
        }
        if action == TradeAction::NoOp {
            self.note_missed_entry(&snapshot);
        }

        let outcome = self
            .manager
            .execute(action, &snapshot, &mut self.gateway, &mut self.logger)
            .await?;

        Ok(TickReport {
            snapshot: Some(snapshot),
            action,
            outcome,
        })
    }

    /// Write one `no_entry` record per session when a candidate entry is vetoed
    /// or the open window passes while flat
    fn note_missed_entry(&mut self, snapshot: &MarketSnapshot) {
        let date = snapshot.session_date;
        if snapshot.stale
            || self.manager.state() != LifecycleState::Flat
            || self.manager.entries_for(date) > 0
            || self.no_entry_logged == Some(date)
        {
            return;
        }

        let reason = match snapshot.session_phase {
            SessionPhase::OpenWindow => match strategy::entry_veto(snapshot, &self.strategy) {
                Some(reason) => reason,
                None => return,
            },
            SessionPhase::Regular => "open window passed without an entry signal".to_string(),
            SessionPhase::PreOpen | SessionPhase::Closed => return,
        };

        let symbol = &self.manager.config().symbol;
        tracing::info!(%symbol, %reason, "⏭️  No entry this session");
        self.logger.record(
            LogRecord::new(EventType::NoEntry, symbol, self.gateway.clock().now())
                .with_price(snapshot.last_price)
                .with_state(self.manager.state())
                .with_reason(reason),
        );
        self.no_entry_logged = Some(date);
    }

    /// Tick until `shutdown` flips to true, then run the shutdown sequence.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), GatewayError> {
        self.start().await?;

        tracing::info!(
            symbol = %self.manager.config().symbol,
            interval_secs = self.config.tick_interval.as_secs(),
            stop_orders = self.gateway.supports_stop_orders(),
            "🚀 Trading loop started"
        );

        let mut ticker = interval_at(Instant::now(), self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => {
                            tracing::debug!(
                                action = ?report.action,
                                outcome = ?report.outcome,
                                state = ?self.manager.state(),
                                "Tick complete"
                            );
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "🛑 Authentication failed, stopping");
                            break Err(err);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        self.begin_shutdown();
        if result.is_ok() {
            self.close_for_shutdown().await;
        }
        self.log_stopped(result.as_ref().err());
        result
    }

    /// Best-effort close when the position would otherwise be unprotected
    pub async fn close_for_shutdown(&mut self) {
        if self.manager.position().is_flat() {
            return;
        }
        if self.gateway.supports_stop_orders() && !self.config.close_on_shutdown {
            tracing::info!(
                stop = ?self.manager.position().stop_price,
                "Position left open under its exchange-side stop"
            );
            return;
        }

        tracing::warn!(
            size = self.manager.position().size,
            "⚠️  Closing position before shutdown"
        );

        let timeout = self.config.shutdown_close_timeout;
        let closing = async {
            if self.manager.needs_reconciliation() {
                self.manager
                    .reconcile(&mut self.gateway, &mut self.logger)
                    .await?;
            }
            let snapshot = self.tracker.refresh(&mut self.gateway).await?;
            self.manager
                .execute(
                    TradeAction::FullExit {
                        reason: ExitReason::Shutdown,
                    },
                    &snapshot,
                    &mut self.gateway,
                    &mut self.logger,
                )
                .await
        };

        match tokio::time::timeout(timeout, closing).await {
            Ok(Ok(ExecutionOutcome::Filled)) => tracing::info!("Position closed for shutdown"),
            Ok(Ok(outcome)) => tracing::error!(?outcome, "Shutdown close not confirmed"),
            Ok(Err(err)) => tracing::error!(error = %err, "Shutdown close failed"),
            Err(_) => tracing::error!(
                timeout_secs = timeout.as_secs(),
                "Shutdown close timed out, position may still be open"
            ),
        }
    }

    fn log_stopped(&mut self, error: Option<&GatewayError>) {
        let symbol = self.manager.config().symbol.clone();
        let now = self.gateway.clock().now();
        let reason = match error {
            Some(err) => format!("{}: {}", err.kind(), err),
            None => "shutdown requested".to_string(),
        };

        tracing::info!(
            %symbol,
            state = ?self.manager.state(),
            realized_pnl = self.manager.realized_pnl(),
            log_records = self.logger.records_written(),
            dropped = self.logger.records_dropped(),
            "👋 Trading loop stopped"
        );
        self.logger.record(
            LogRecord::new(EventType::BotStopped, &symbol, now)
                .with_position(self.manager.position())
                .with_state(self.manager.state())
                .with_pnl(self.manager.realized_pnl())
                .with_reason(reason),
        );
    }
}
