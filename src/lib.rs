// Core modules
pub mod config;
pub mod error;
pub mod event_log;
pub mod exchange;
pub mod execution;
pub mod market;
pub mod models;
pub mod strategy;

// Re-export commonly used types
pub use error::BotError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;
