// Market State Tracker: session phase, opening move and daily trend context
pub mod price_history;
pub mod session;
pub mod tracker;

pub use price_history::PriceHistory;
pub use session::SessionConfig;
pub use tracker::{classify_trend, MarketStateTracker, TrendConfig};
