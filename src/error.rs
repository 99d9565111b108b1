use thiserror::Error;

use crate::config::ConfigError;
use crate::event_log::PersistenceError;
use crate::exchange::GatewayError;

/// Top-level error for the trading core
#[derive(Debug, Error)]
pub enum BotError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("exchange error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("event log error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("{0}")]
    Fatal(String),
}

impl BotError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, BotError::Gateway(GatewayError::Authentication(_)))
    }

    /// Process exit code for a fatal error
    pub fn exit_code(&self) -> u8 {
        match self {
            BotError::Config(_) => 2,
            e if e.is_authentication() => 3,
            _ => 1,
        }
    }
}
