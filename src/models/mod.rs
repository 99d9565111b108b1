use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a new entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Order side that opens a position in this direction
    pub fn entry_side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction
    pub fn exit_side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }

    /// Sign applied to price moves: +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

/// Side of the live position. Flat is a valid position, not the absence of one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Flat,
    Long,
    Short,
}

impl PositionSide {
    pub fn direction(self) -> Option<Direction> {
        match self {
            PositionSide::Flat => None,
            PositionSide::Long => Some(Direction::Long),
            PositionSide::Short => Some(Direction::Short),
        }
    }
}

impl From<Direction> for PositionSide {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Long => PositionSide::Long,
            Direction::Short => PositionSide::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// The single live position on the traded symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub size: f64, // Base-asset quantity still open
    pub leverage: u32,
    pub stop_price: Option<f64>,
    pub take_profit_price: Option<f64>, // Partial take-profit trigger
    pub opened_at: Option<DateTime<Utc>>,
    pub partial_exit_taken: bool,
}

impl Position {
    pub fn flat(symbol: impl Into<String>, leverage: u32) -> Self {
        Self {
            symbol: symbol.into(),
            side: PositionSide::Flat,
            entry_price: 0.0,
            size: 0.0,
            leverage,
            stop_price: None,
            take_profit_price: None,
            opened_at: None,
            partial_exit_taken: false,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat
    }

    /// Signed price move in the position's favor, as a fraction of entry.
    /// Positive means in profit. Zero when flat.
    pub fn favorable_move(&self, price: f64) -> f64 {
        match self.side.direction() {
            Some(direction) if self.entry_price > 0.0 => {
                direction.sign() * (price - self.entry_price) / self.entry_price
            }
            _ => 0.0,
        }
    }

    /// Realized P&L for closing `quantity` at `exit_price`
    pub fn pnl_for(&self, exit_price: f64, quantity: f64) -> f64 {
        match self.side.direction() {
            Some(direction) => direction.sign() * (exit_price - self.entry_price) * quantity,
            None => 0.0,
        }
    }

    /// Unrealized P&L of the whole remaining size
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.pnl_for(price, self.size)
    }

    /// Order side that reduces this position
    pub fn closing_side(&self) -> Option<OrderSide> {
        self.side.direction().map(Direction::exit_side)
    }
}

/// Position lifecycle as seen by the position manager
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Flat,
    Entering, // Entry order in flight
    Open,
    PartiallyClosed,
    Exiting, // Closing order in flight
}

impl LifecycleState {
    /// Waiting on an order confirmation
    pub fn is_transient(self) -> bool {
        matches!(self, LifecycleState::Entering | LifecycleState::Exiting)
    }
}

/// Coarse classification of the current time against the session anchor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    PreOpen,
    OpenWindow,
    Regular,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrendBias {
    Bullish,
    Bearish,
    Neutral,
}

/// Market view for a single tick. Replaced wholesale each tick, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub timestamp: DateTime<Utc>,
    pub last_price: f64,
    pub session_phase: SessionPhase,
    pub session_date: NaiveDate,
    pub daily_trend_bias: TrendBias,
    pub daily_change_pct: f64,
    pub open_move_pct: Option<f64>, // None until the session anchor price is known
    pub stale: bool,
}

/// Why a position is being closed in full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    SessionClose,
    Shutdown,
    ExternalClose,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::SessionClose => "session_close",
            ExitReason::Shutdown => "shutdown",
            ExitReason::ExternalClose => "external_close",
        }
    }
}

/// Output of the strategy engine, consumed exactly once by the position manager
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TradeAction {
    Enter { direction: Direction, size_pct: f64 },
    HoldStop,
    TrailStop { new_stop: f64 },
    PartialExit { fraction: f64 },
    FullExit { reason: ExitReason },
    NoOp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    /// Sets (or replaces) the exchange-side stop-loss of the open position at `price`
    StopLoss,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub preset_stop_loss: Option<f64>,
    pub client_order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResult {
    pub order_id: String,
    pub client_order_id: String,
    pub fill_price: f64,
    pub filled_quantity: f64,
    pub timestamp: DateTime<Utc>,
}

/// A position as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Direction,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountState {
    pub equity: f64,
    pub available: f64,
    pub positions: Vec<ExchangePosition>,
}

impl AccountState {
    pub fn position_for(&self, symbol: &str) -> Option<&ExchangePosition> {
        self.positions
            .iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol) && p.size > 0.0)
    }
}
