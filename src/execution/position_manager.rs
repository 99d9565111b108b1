use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::event_log::{EventLogger, EventType, LogRecord};
use crate::exchange::{Clock, Exchange, Gateway, GatewayError, SubmitOutcome};
use crate::models::{
    Direction, ExchangePosition, ExitReason, LifecycleState, MarketSnapshot, OrderRequest,
    OrderResult, OrderType, Position, TradeAction,
};
use crate::strategy::{self, sizing};

const QTY_EPSILON: f64 = 1e-9;

/// Execution settings for the single traded symbol
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub symbol: String,
    pub leverage: u32,
    pub stop_loss_pct: f64,
    pub partial_tp_pct: f64,
    pub capital_pct_max: f64,
    pub reference_capital: Option<f64>, // Equity that capital tiers grow from
    pub min_order_size: f64,
    pub size_step: f64,
    pub max_entries_per_session: u32,
    pub position_sync_ticks: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            leverage: 25,
            stop_loss_pct: 0.02,
            partial_tp_pct: 0.03,
            capital_pct_max: 0.50,
            reference_capital: None,
            min_order_size: 0.001,
            size_step: 0.001,
            max_entries_per_session: 1, // One trade per session at the open
            position_sync_ticks: 1,
        }
    }
}

/// What the in-flight order is meant to do once confirmed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderIntent {
    Entry { direction: Direction },
    PartialExit { quantity: f64 },
    FullExit { reason: ExitReason },
    StopUpdate { new_stop: f64 },
}

/// The single order allowed in flight at a time
#[derive(Debug, Clone)]
pub struct InFlightOrder {
    pub request: OrderRequest,
    pub intent: OrderIntent,
    pub prior_state: LifecycleState,
    pub prior_size: f64,
    pub session_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Nothing to send (hold, no-op, serialized behind an in-flight order)
    NoOrder,
    Filled,
    Rejected,
    Failed,
    /// Submission outcome unknown; reconciliation runs before the next order
    Pending,
}

/// Owns the live [`Position`] and drives it through
/// `Flat -> Entering -> Open -> PartiallyClosed -> Exiting -> Flat`.
///
/// State only changes on a confirmed [`OrderResult`] or on an account-state
/// query during reconciliation and position sync.
pub struct PositionManager {
    config: ManagerConfig,
    position: Position,
    state: LifecycleState,
    in_flight: Option<InFlightOrder>,
    needs_reconciliation: bool,
    applied_order_ids: HashSet<String>,
    session_entries: Option<(NaiveDate, u32)>,
    ticks_since_sync: u32,
    realized_pnl: f64,
}

impl PositionManager {
    pub fn new(config: ManagerConfig) -> Self {
        let position = Position::flat(config.symbol.clone(), config.leverage);
        Self {
            config,
            position,
            state: LifecycleState::Flat,
            in_flight: None,
            needs_reconciliation: false,
            applied_order_ids: HashSet::new(),
            session_entries: None,
            ticks_since_sync: 0,
            realized_pnl: 0.0,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Last stable position; strategy decisions are evaluated against this
    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn in_flight(&self) -> Option<&InFlightOrder> {
        self.in_flight.as_ref()
    }

    pub fn needs_reconciliation(&self) -> bool {
        self.needs_reconciliation
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    /// Confirmed entries during the session of `date`
    pub fn entries_for(&self, date: NaiveDate) -> u32 {
        match self.session_entries {
            Some((d, n)) if d == date => n,
            _ => 0,
        }
    }

    /// Carry out one strategy action.
    ///
    /// Returns `Err` only for authentication failures, which must stop the
    /// bot. Every other failure is written to the event log and reported as
    /// an [`ExecutionOutcome`].
    pub async fn execute<E: Exchange, C: Clock>(
        &mut self,
        action: TradeAction,
        snapshot: &MarketSnapshot,
        gateway: &mut Gateway<E, C>,
        logger: &mut EventLogger,
    ) -> Result<ExecutionOutcome, GatewayError> {
        if self.in_flight.is_some() || self.needs_reconciliation {
            if !matches!(action, TradeAction::NoOp | TradeAction::HoldStop) {
                tracing::debug!(?action, state = ?self.state, "Order in flight, action deferred");
            }
            return Ok(ExecutionOutcome::NoOrder);
        }

        match action {
            TradeAction::NoOp | TradeAction::HoldStop => Ok(ExecutionOutcome::NoOrder),
            TradeAction::Enter {
                direction,
                size_pct,
            } => self.enter(direction, size_pct, snapshot, gateway, logger).await,
            TradeAction::TrailStop { new_stop } => {
                self.trail(new_stop, snapshot, gateway, logger).await
            }
            TradeAction::PartialExit { fraction } => {
                self.partial_exit(fraction, snapshot, gateway, logger).await
            }
            TradeAction::FullExit { reason } => self.close(reason, snapshot, gateway, logger).await,
        }
    }

    async fn enter<E: Exchange, C: Clock>(
        &mut self,
        direction: Direction,
        size_pct: f64,
        snapshot: &MarketSnapshot,
        gateway: &mut Gateway<E, C>,
        logger: &mut EventLogger,
    ) -> Result<ExecutionOutcome, GatewayError> {
        let now = gateway.clock().now();

        if self.state != LifecycleState::Flat {
            return Ok(self.reject(logger, now, "position already open".to_string()));
        }
        let entries = self.entries_for(snapshot.session_date);
        if entries >= self.config.max_entries_per_session {
            return Ok(self.reject(
                logger,
                now,
                format!(
                    "entry limit reached for session {} ({}/{})",
                    snapshot.session_date, entries, self.config.max_entries_per_session
                ),
            ));
        }

        let account = match gateway.get_account_state(&self.config.symbol).await {
            Ok(account) => account,
            Err(err) => return self.query_failed(logger, now, err, "account query before entry"),
        };

        // Untracked exchange position: manage it rather than stack a second entry
        if let Some(existing) = account.position_for(&self.config.symbol).cloned() {
            let reason = "adopted exchange position found before entry";
            self.adopt_logged(&existing, now, logger, reason);
            self.count_entry(snapshot.session_date);
            return Ok(ExecutionOutcome::NoOrder);
        }

        let pct = sizing::tiered_capital_pct(
            size_pct,
            self.config.capital_pct_max,
            account.equity,
            self.config.reference_capital,
        );
        let quantity = sizing::order_quantity(
            account.equity,
            pct,
            self.config.leverage,
            snapshot.last_price,
            self.config.size_step,
        );
        if quantity + QTY_EPSILON < self.config.min_order_size {
            return Ok(self.reject(
                logger,
                now,
                format!(
                    "size {} below exchange minimum {} (equity {:.2}, pct {:.2})",
                    quantity, self.config.min_order_size, account.equity, pct
                ),
            ));
        }

        let preset_stop =
            strategy::initial_stop(direction, snapshot.last_price, self.config.stop_loss_pct);
        let request = self.begin_entry(direction, quantity, preset_stop, snapshot.session_date);

        tracing::info!(
            symbol = %self.config.symbol,
            ?direction,
            quantity,
            price = snapshot.last_price,
            capital_pct = pct,
            equity = account.equity,
            client_order_id = %request.client_order_id,
            "📈 Submitting entry"
        );

        let outcome = gateway.submit_order(&request).await;
        self.finish(outcome, &request, now, logger)
    }

    /// Reserve the in-flight slot for an entry and move to `Entering`.
    ///
    /// `preset_stop` only rides along as the exchange-side backstop; the local
    /// stop is set from the fill price once the result is applied.
    pub fn begin_entry(
        &mut self,
        direction: Direction,
        quantity: f64,
        preset_stop: f64,
        session_date: NaiveDate,
    ) -> OrderRequest {
        let request = OrderRequest {
            symbol: self.config.symbol.clone(),
            side: direction.entry_side(),
            quantity,
            order_type: OrderType::Market,
            price: None,
            reduce_only: false,
            preset_stop_loss: Some(preset_stop),
            client_order_id: new_client_order_id(),
        };
        self.begin(request.clone(), OrderIntent::Entry { direction }, session_date);
        request
    }

    async fn trail<E: Exchange, C: Clock>(
        &mut self,
        new_stop: f64,
        snapshot: &MarketSnapshot,
        gateway: &mut Gateway<E, C>,
        logger: &mut EventLogger,
    ) -> Result<ExecutionOutcome, GatewayError> {
        let now = gateway.clock().now();

        let Some(direction) = self.position.side.direction() else {
            return Ok(self.reject(logger, now, "no open position to trail".to_string()));
        };
        if !strategy::is_tighter(direction, new_stop, self.position.stop_price) {
            return Ok(self.reject(
                logger,
                now,
                format!(
                    "stop {:.2} is not tighter than {:?}",
                    new_stop, self.position.stop_price
                ),
            ));
        }

        if !gateway.supports_stop_orders() {
            // Stop lives only in our state; the control loop enforces it
            self.position.stop_price = Some(new_stop);
            logger.record(
                LogRecord::new(EventType::TrailStop, &self.config.symbol, now)
                    .with_position(&self.position)
                    .with_state(self.state)
                    .with_price(snapshot.last_price)
                    .with_reason("local stop"),
            );
            return Ok(ExecutionOutcome::NoOrder);
        }

        let request = OrderRequest {
            symbol: self.config.symbol.clone(),
            side: direction.exit_side(),
            quantity: self.position.size,
            order_type: OrderType::StopLoss,
            price: Some(new_stop),
            reduce_only: true,
            preset_stop_loss: None,
            client_order_id: new_client_order_id(),
        };
        self.begin(
            request.clone(),
            OrderIntent::StopUpdate { new_stop },
            snapshot.session_date,
        );

        tracing::info!(
            symbol = %self.config.symbol,
            old_stop = ?self.position.stop_price,
            new_stop,
            price = snapshot.last_price,
            "🔒 Trailing stop"
        );

        let outcome = gateway.submit_order(&request).await;
        self.finish(outcome, &request, now, logger)
    }

    async fn partial_exit<E: Exchange, C: Clock>(
        &mut self,
        fraction: f64,
        snapshot: &MarketSnapshot,
        gateway: &mut Gateway<E, C>,
        logger: &mut EventLogger,
    ) -> Result<ExecutionOutcome, GatewayError> {
        let now = gateway.clock().now();

        let Some(direction) = self.position.side.direction() else {
            return Ok(self.reject(logger, now, "no open position for partial exit".to_string()));
        };
        if self.position.partial_exit_taken {
            return Ok(self.reject(logger, now, "partial exit already taken".to_string()));
        }

        let quantity = sizing::floor_to_step(self.position.size * fraction, self.config.size_step);
        if quantity + QTY_EPSILON < self.config.min_order_size
            || quantity + QTY_EPSILON >= self.position.size
        {
            // Position too small to scale out; skip the partial for this position
            self.position.partial_exit_taken = true;
            return Ok(self.reject(
                logger,
                now,
                format!(
                    "partial size {} not tradable for position of {}; scale-out skipped",
                    quantity, self.position.size
                ),
            ));
        }

        let request = OrderRequest {
            symbol: self.config.symbol.clone(),
            side: direction.exit_side(),
            quantity,
            order_type: OrderType::Market,
            price: None,
            reduce_only: true,
            preset_stop_loss: None,
            client_order_id: new_client_order_id(),
        };
        self.begin(
            request.clone(),
            OrderIntent::PartialExit { quantity },
            snapshot.session_date,
        );

        tracing::info!(
            symbol = %self.config.symbol,
            quantity,
            fraction,
            price = snapshot.last_price,
            "💰 Taking partial profit"
        );

        let outcome = gateway.submit_order(&request).await;
        self.finish(outcome, &request, now, logger)
    }

    async fn close<E: Exchange, C: Clock>(
        &mut self,
        reason: ExitReason,
        snapshot: &MarketSnapshot,
        gateway: &mut Gateway<E, C>,
        logger: &mut EventLogger,
    ) -> Result<ExecutionOutcome, GatewayError> {
        let now = gateway.clock().now();

        let Some(direction) = self.position.side.direction() else {
            return Ok(self.reject(logger, now, "no open position to close".to_string()));
        };

        let request = OrderRequest {
            symbol: self.config.symbol.clone(),
            side: direction.exit_side(),
            quantity: self.position.size,
            order_type: OrderType::Market,
            price: None,
            reduce_only: true,
            preset_stop_loss: None,
            client_order_id: new_client_order_id(),
        };
        self.begin(
            request.clone(),
            OrderIntent::FullExit { reason },
            snapshot.session_date,
        );

        tracing::info!(
            symbol = %self.config.symbol,
            reason = reason.as_str(),
            size = self.position.size,
            price = snapshot.last_price,
            unrealized_pnl = self.position.unrealized_pnl(snapshot.last_price),
            "📉 Closing position"
        );

        let outcome = gateway.submit_order(&request).await;
        self.finish(outcome, &request, now, logger)
    }

    fn begin(&mut self, request: OrderRequest, intent: OrderIntent, session_date: NaiveDate) {
        self.in_flight = Some(InFlightOrder {
            request,
            intent,
            prior_state: self.state,
            prior_size: self.position.size,
            session_date,
        });
        match intent {
            OrderIntent::Entry { .. } => self.state = LifecycleState::Entering,
            OrderIntent::FullExit { .. } => self.state = LifecycleState::Exiting,
            OrderIntent::PartialExit { .. } | OrderIntent::StopUpdate { .. } => {}
        }
    }

    /// Fold a confirmed result into the position.
    ///
    /// Applied only when it answers the in-flight order and its exchange
    /// order id has not been applied before; returns whether it was applied.
    pub fn apply_result(&mut self, result: &OrderResult) -> bool {
        let matches_in_flight = self
            .in_flight
            .as_ref()
            .is_some_and(|p| p.request.client_order_id == result.client_order_id);
        if !matches_in_flight {
            tracing::warn!(
                client_order_id = %result.client_order_id,
                order_id = %result.order_id,
                "Ignoring order result that does not match the in-flight order"
            );
            return false;
        }
        if !result.order_id.is_empty() && self.applied_order_ids.contains(&result.order_id) {
            tracing::warn!(order_id = %result.order_id, "Ignoring already applied order result");
            return false;
        }
        let Some(pending) = self.in_flight.take() else {
            return false;
        };

        if !result.order_id.is_empty() {
            self.applied_order_ids.insert(result.order_id.clone());
        }
        self.needs_reconciliation = false;

        match pending.intent {
            OrderIntent::Entry { direction } => {
                self.position = Position {
                    symbol: self.config.symbol.clone(),
                    side: direction.into(),
                    entry_price: result.fill_price,
                    size: result.filled_quantity,
                    leverage: self.config.leverage,
                    stop_price: Some(strategy::initial_stop(
                        direction,
                        result.fill_price,
                        self.config.stop_loss_pct,
                    )),
                    take_profit_price: Some(strategy::take_profit_price(
                        direction,
                        result.fill_price,
                        self.config.partial_tp_pct,
                    )),
                    opened_at: Some(result.timestamp),
                    partial_exit_taken: false,
                };
                self.state = LifecycleState::Open;
                self.count_entry(pending.session_date);
            }
            OrderIntent::PartialExit { .. } => {
                let quantity = result.filled_quantity.min(self.position.size);
                self.realized_pnl += self.position.pnl_for(result.fill_price, quantity);
                self.position.size -= quantity;
                self.position.partial_exit_taken = true;
                self.state = LifecycleState::PartiallyClosed;
            }
            OrderIntent::FullExit { .. } => {
                let quantity = result.filled_quantity.min(self.position.size);
                self.realized_pnl += self.position.pnl_for(result.fill_price, quantity);
                let remaining = self.position.size - quantity;
                if remaining > self.config.size_step / 2.0 {
                    tracing::warn!(
                        remaining,
                        "Close order filled partially, position remains open"
                    );
                    self.position.size = remaining;
                    self.state = pending.prior_state;
                } else {
                    self.reset_flat();
                }
            }
            OrderIntent::StopUpdate { new_stop } => {
                if let Some(direction) = self.position.side.direction() {
                    if strategy::is_tighter(direction, new_stop, self.position.stop_price) {
                        self.position.stop_price = Some(new_stop);
                    }
                }
            }
        }

        true
    }

    /// Definitive failure: release the slot and return to the prior stable state
    fn fail_in_flight(&mut self) {
        if let Some(pending) = self.in_flight.take() {
            self.state = pending.prior_state;
        }
        self.needs_reconciliation = false;
    }

    fn finish(
        &mut self,
        outcome: SubmitOutcome,
        request: &OrderRequest,
        now: DateTime<Utc>,
        logger: &mut EventLogger,
    ) -> Result<ExecutionOutcome, GatewayError> {
        let failed = outcome.failed_attempts.len() as u32;
        for (i, err) in outcome.failed_attempts.iter().enumerate() {
            logger.record(self.error_record(err, request, i as u32 + 1, now));
        }

        let Some(intent) = self.in_flight.as_ref().map(|p| p.intent) else {
            return Ok(ExecutionOutcome::Failed);
        };

        match outcome.result {
            Ok(result) => {
                let before = self.position.clone();
                if !self.apply_result(&result) {
                    self.fail_in_flight();
                    return Ok(ExecutionOutcome::Failed);
                }
                let record = self.fill_record(intent, &before, &result, now);
                tracing::info!(
                    event = ?record.event_type,
                    fill_price = result.fill_price,
                    quantity = result.filled_quantity,
                    order_id = %result.order_id,
                    state = ?self.state,
                    "✅ Order confirmed"
                );
                logger.record(record);
                Ok(ExecutionOutcome::Filled)
            }
            Err(err) => {
                logger.record(self.error_record(&err, request, failed + 1, now));
                let is_stop_update = matches!(intent, OrderIntent::StopUpdate { .. });
                match err {
                    // A lost stop replacement leaves the previous stop in force
                    GatewayError::UnknownOutcome(_) if is_stop_update => {
                        tracing::warn!(
                            error = %err,
                            "Stop update unconfirmed, keeping previous stop"
                        );
                        self.fail_in_flight();
                        Ok(ExecutionOutcome::Failed)
                    }
                    GatewayError::UnknownOutcome(_) => {
                        tracing::warn!(
                            client_order_id = %request.client_order_id,
                            state = ?self.state,
                            "⚠️  Order outcome unknown, reconciling before next order"
                        );
                        self.needs_reconciliation = true;
                        Ok(ExecutionOutcome::Pending)
                    }
                    GatewayError::Authentication(_) => {
                        self.fail_in_flight();
                        Err(err)
                    }
                    _ => {
                        tracing::error!(
                            error = %err,
                            client_order_id = %request.client_order_id,
                            "❌ Order failed"
                        );
                        self.fail_in_flight();
                        Ok(ExecutionOutcome::Failed)
                    }
                }
            }
        }
    }

    /// Resolve an unknown-outcome order from authoritative account state.
    ///
    /// Returns `Ok(false)` if the account could not be queried; the order
    /// stays pending and reconciliation is retried next tick.
    pub async fn reconcile<E: Exchange, C: Clock>(
        &mut self,
        gateway: &mut Gateway<E, C>,
        logger: &mut EventLogger,
    ) -> Result<bool, GatewayError> {
        if !self.needs_reconciliation {
            return Ok(true);
        }
        let now = gateway.clock().now();
        let Some(pending) = self.in_flight.clone() else {
            self.needs_reconciliation = false;
            return Ok(true);
        };

        let account = match gateway.get_account_state(&self.config.symbol).await {
            Ok(account) => account,
            Err(err) => {
                self.query_failed(logger, now, err, "account query during reconciliation")?;
                return Ok(false);
            }
        };
        let on_exchange = account.position_for(&self.config.symbol).cloned();

        self.in_flight = None;
        self.needs_reconciliation = false;

        let resolution = match (pending.intent, on_exchange) {
            (OrderIntent::Entry { .. }, Some(p)) => {
                self.adopt(&p, now);
                self.count_entry(pending.session_date);
                "entry filled on exchange"
            }
            (OrderIntent::Entry { .. }, None) => {
                self.reset_flat();
                "entry not filled"
            }
            (OrderIntent::FullExit { .. }, None) => {
                self.reset_flat();
                "exit filled on exchange"
            }
            (OrderIntent::FullExit { .. }, Some(p)) => {
                self.position.size = p.size;
                self.state = pending.prior_state;
                "exit not filled, position still open"
            }
            (OrderIntent::PartialExit { .. }, Some(p))
                if p.size + QTY_EPSILON < pending.prior_size =>
            {
                self.position.size = p.size;
                self.position.partial_exit_taken = true;
                self.state = LifecycleState::PartiallyClosed;
                "partial exit filled on exchange"
            }
            (OrderIntent::PartialExit { .. }, Some(_)) => {
                self.state = pending.prior_state;
                "partial exit not filled"
            }
            (OrderIntent::PartialExit { .. }, None) => {
                self.reset_flat();
                "position no longer on exchange"
            }
            (OrderIntent::StopUpdate { .. }, _) => {
                self.state = pending.prior_state;
                "stop update unresolved, previous stop kept"
            }
        };

        tracing::info!(
            symbol = %self.config.symbol,
            resolution,
            state = ?self.state,
            "🔄 Reconciled with exchange"
        );
        logger.record(
            LogRecord::new(EventType::Reconciled, &self.config.symbol, now)
                .with_position(&self.position)
                .with_state(self.state)
                .with_client_order_id(&pending.request.client_order_id)
                .with_reason(resolution),
        );

        Ok(true)
    }

    /// Adopt a position the exchange already holds (startup or restart)
    pub async fn sync_on_startup<E: Exchange, C: Clock>(
        &mut self,
        gateway: &mut Gateway<E, C>,
        logger: &mut EventLogger,
    ) -> Result<(), GatewayError> {
        let now = gateway.clock().now();
        let account = gateway.get_account_state(&self.config.symbol).await?;

        tracing::info!(
            equity = account.equity,
            available = account.available,
            "💼 Account state loaded"
        );

        if let Some(existing) = account.position_for(&self.config.symbol).cloned() {
            self.adopt_logged(&existing, now, logger, "adopted existing exchange position");
        }
        Ok(())
    }

    /// Periodic check that the exchange still holds our position.
    ///
    /// Detects stops hit on the exchange, liquidations and manual closes.
    pub async fn sync_position<E: Exchange, C: Clock>(
        &mut self,
        last_price: Option<f64>,
        gateway: &mut Gateway<E, C>,
        logger: &mut EventLogger,
    ) -> Result<(), GatewayError> {
        if self.position.is_flat() || self.in_flight.is_some() {
            self.ticks_since_sync = 0;
            return Ok(());
        }
        self.ticks_since_sync += 1;
        if self.ticks_since_sync < self.config.position_sync_ticks {
            return Ok(());
        }
        self.ticks_since_sync = 0;

        let now = gateway.clock().now();
        let account = match gateway.get_account_state(&self.config.symbol).await {
            Ok(account) => account,
            Err(err) => {
                self.query_failed(logger, now, err, "position sync")?;
                return Ok(());
            }
        };

        match account.position_for(&self.config.symbol).cloned() {
            None => {
                let pnl = last_price.map(|p| self.position.unrealized_pnl(p));
                tracing::warn!(
                    symbol = %self.config.symbol,
                    last_price = ?last_price,
                    estimated_pnl = ?pnl,
                    "⚠️  Position closed outside the bot"
                );

                let mut record = LogRecord::new(EventType::FullExit, &self.config.symbol, now)
                    .with_position(&self.position)
                    .with_state(LifecycleState::Flat)
                    .with_reason(ExitReason::ExternalClose.as_str());
                if let Some(price) = last_price {
                    record = record.with_price(price);
                }
                if let Some(pnl) = pnl {
                    record = record.with_pnl(pnl);
                    self.realized_pnl += pnl;
                }
                logger.record(record);
                self.reset_flat();
            }
            Some(p) if Some(p.side) != self.position.side.direction() => {
                self.adopt(&p, now);
                logger.record(
                    LogRecord::new(EventType::Reconciled, &self.config.symbol, now)
                        .with_position(&self.position)
                        .with_state(self.state)
                        .with_reason("exchange holds the opposite side; adopted"),
                );
            }
            Some(p) if (p.size - self.position.size).abs() > self.config.size_step / 2.0 => {
                tracing::info!(
                    local_size = self.position.size,
                    exchange_size = p.size,
                    "Position size synced with exchange"
                );
                self.position.size = p.size;
                logger.record(
                    LogRecord::new(EventType::Reconciled, &self.config.symbol, now)
                        .with_position(&self.position)
                        .with_state(self.state)
                        .with_reason("size synced with exchange"),
                );
            }
            Some(_) => {}
        }

        Ok(())
    }

    fn adopt(&mut self, exchange_position: &ExchangePosition, now: DateTime<Utc>) {
        let direction = exchange_position.side;
        let entry = exchange_position.entry_price;
        self.position = Position {
            symbol: self.config.symbol.clone(),
            side: direction.into(),
            entry_price: entry,
            size: exchange_position.size,
            leverage: self.config.leverage,
            stop_price: Some(strategy::initial_stop(direction, entry, self.config.stop_loss_pct)),
            take_profit_price: Some(strategy::take_profit_price(
                direction,
                entry,
                self.config.partial_tp_pct,
            )),
            opened_at: Some(now),
            partial_exit_taken: false,
        };
        self.state = LifecycleState::Open;
    }

    fn adopt_logged(
        &mut self,
        exchange_position: &ExchangePosition,
        now: DateTime<Utc>,
        logger: &mut EventLogger,
        reason: &str,
    ) {
        self.adopt(exchange_position, now);
        tracing::warn!(
            side = ?exchange_position.side,
            size = exchange_position.size,
            entry_price = exchange_position.entry_price,
            "Adopted position already open on exchange"
        );
        logger.record(
            LogRecord::new(EventType::Reconciled, &self.config.symbol, now)
                .with_position(&self.position)
                .with_state(self.state)
                .with_reason(reason),
        );
    }

    fn reset_flat(&mut self) {
        self.position = Position::flat(self.config.symbol.clone(), self.config.leverage);
        self.state = LifecycleState::Flat;
    }

    fn count_entry(&mut self, date: NaiveDate) {
        let entries = self.entries_for(date) + 1;
        self.session_entries = Some((date, entries));
    }

    fn reject(
        &self,
        logger: &mut EventLogger,
        now: DateTime<Utc>,
        reason: String,
    ) -> ExecutionOutcome {
        tracing::info!(symbol = %self.config.symbol, %reason, "🚫 Action rejected");
        logger.record(
            LogRecord::new(EventType::Rejected, &self.config.symbol, now)
                .with_position(&self.position)
                .with_state(self.state)
                .with_reason(reason),
        );
        ExecutionOutcome::Rejected
    }

    fn query_failed(
        &self,
        logger: &mut EventLogger,
        now: DateTime<Utc>,
        err: GatewayError,
        context: &str,
    ) -> Result<ExecutionOutcome, GatewayError> {
        tracing::error!(error = %err, context, "❌ Exchange query failed");
        logger.record(
            LogRecord::new(EventType::Error, &self.config.symbol, now)
                .with_position(&self.position)
                .with_state(self.state)
                .with_reason(format!("{}: {} ({})", err.kind(), err, context)),
        );
        match err {
            GatewayError::Authentication(_) => Err(err),
            _ => Ok(ExecutionOutcome::Failed),
        }
    }

    fn error_record(
        &self,
        err: &GatewayError,
        request: &OrderRequest,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> LogRecord {
        LogRecord::new(EventType::Error, &self.config.symbol, now)
            .with_position(&self.position)
            .with_state(self.state)
            .with_quantity(request.quantity)
            .with_client_order_id(&request.client_order_id)
            .with_attempt(attempt)
            .with_reason(format!("{}: {}", err.kind(), err))
    }

    fn fill_record(
        &self,
        intent: OrderIntent,
        before: &Position,
        result: &OrderResult,
        now: DateTime<Utc>,
    ) -> LogRecord {
        let record = match intent {
            OrderIntent::Entry { .. } => LogRecord::new(EventType::Entry, &self.config.symbol, now)
                .with_position(&self.position)
                .with_fill(result),
            OrderIntent::PartialExit { .. } => {
                let quantity = result.filled_quantity.min(before.size);
                LogRecord::new(EventType::PartialExit, &self.config.symbol, now)
                    .with_position(&self.position)
                    .with_fill(result)
                    .with_pnl(before.pnl_for(result.fill_price, quantity))
            }
            OrderIntent::FullExit { reason } => {
                let quantity = result.filled_quantity.min(before.size);
                LogRecord::new(EventType::FullExit, &self.config.symbol, now)
                    .with_position(before)
                    .with_fill(result)
                    .with_pnl(before.pnl_for(result.fill_price, quantity))
                    .with_reason(reason.as_str())
            }
            OrderIntent::StopUpdate { .. } => {
                LogRecord::new(EventType::TrailStop, &self.config.symbol, now)
                    .with_fill(result)
                    .with_position(&self.position)
            }
        };
        record.with_state(self.state)
    }
}

fn new_client_order_id() -> String {
    Uuid::new_v4().to_string()
}
