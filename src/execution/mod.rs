// Position lifecycle and the control loop that drives it
pub mod engine;
pub mod position_manager;

pub use engine::{EngineConfig, TickReport, TradingEngine};
pub use position_manager::{
    ExecutionOutcome, InFlightOrder, ManagerConfig, OrderIntent, PositionManager,
};
