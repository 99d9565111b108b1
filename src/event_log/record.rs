use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{LifecycleState, OrderResult, Position, PositionSide};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Entry,
    TrailStop,
    PartialExit,
    FullExit,
    Rejected,
    NoEntry,
    Error,
    Reconciled,
    BotStarted,
    BotStopped,
}

/// One line of the audit log. Built once, written once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<PositionSide>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl LogRecord {
    pub fn new(event_type: EventType, symbol: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            event_type,
            symbol: symbol.into(),
            side: None,
            state: None,
            price: None,
            quantity: None,
            entry_price: None,
            stop_price: None,
            take_profit_price: None,
            order_id: None,
            client_order_id: None,
            pnl: None,
            reason: None,
            attempt: None,
        }
    }

    /// Copy side, size, entry, stop and take-profit from the position
    pub fn with_position(mut self, position: &Position) -> Self {
        self.side = Some(position.side);
        if !position.is_flat() {
            self.quantity = Some(position.size);
            self.entry_price = Some(position.entry_price);
        }
        self.stop_price = position.stop_price;
        self.take_profit_price = position.take_profit_price;
        self
    }

    /// Copy fill price, quantity and order ids from a confirmed result
    pub fn with_fill(mut self, result: &OrderResult) -> Self {
        self.price = Some(result.fill_price);
        self.quantity = Some(result.filled_quantity);
        self.order_id = Some(result.order_id.clone());
        self.client_order_id = Some(result.client_order_id.clone());
        self
    }

    pub fn with_state(mut self, state: LifecycleState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn with_stop_price(mut self, stop_price: f64) -> Self {
        self.stop_price = Some(stop_price);
        self
    }

    pub fn with_client_order_id(mut self, client_order_id: impl Into<String>) -> Self {
        self.client_order_id = Some(client_order_id.into());
        self
    }

    pub fn with_pnl(mut self, pnl: f64) -> Self {
        self.pnl = Some(pnl);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}
