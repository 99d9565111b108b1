#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use perpbot::event_log::{read_log, EventLogger, EventType, LogRecord};
use perpbot::exchange::{
    BackoffPolicy, Clock, Exchange, Gateway, GatewayError, GatewaySettings,
};
use perpbot::execution::{EngineConfig, ManagerConfig, PositionManager, TradingEngine};
use perpbot::market::{MarketStateTracker, SessionConfig, TrendConfig};
use perpbot::strategy::StrategyConfig;
use perpbot::{
    AccountState, Direction, ExchangePosition, OrderRequest, OrderResult, OrderSide, OrderType,
};

pub const SYMBOL: &str = "BTCUSDT";

/// Wednesday 2025-01-15 09:35 New York, inside the open window
pub fn session_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 14, 35, 0).unwrap()
}

/// Clock that only moves when told to; sleeps advance it instantly
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        self.advance(duration);
    }
}

/// What the fake exchange does with the next submitted order
#[derive(Debug, Clone)]
pub enum OrderScript {
    Fill,
    FillAt(f64),
    Fail(GatewayError),
    /// Never answers; nothing happens on the exchange
    Hang,
    /// Fills on the exchange, then never answers
    HangAfterFill,
    /// Fills on the exchange, then answers with an error
    FillThenFail(GatewayError),
}

struct FakeState {
    prices: VecDeque<Result<f64, GatewayError>>,
    last_price: f64,
    orders: VecDeque<OrderScript>,
    account_failures: VecDeque<GatewayError>,
    equity: f64,
    position: Option<ExchangePosition>,
    exchange_stop: Option<f64>,
    submitted: Vec<OrderRequest>,
    leverage_calls: Vec<u32>,
    next_order_id: u64,
}

/// In-memory exchange with scripted prices and order outcomes.
///
/// Fills move the exchange-side position so account queries stay consistent
/// with what was filled.
#[derive(Clone)]
pub struct FakeExchange {
    state: Arc<Mutex<FakeState>>,
    stop_orders: bool,
}

impl FakeExchange {
    pub fn new(equity: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                prices: VecDeque::new(),
                last_price: 60000.0,
                orders: VecDeque::new(),
                account_failures: VecDeque::new(),
                equity,
                position: None,
                exchange_stop: None,
                submitted: Vec::new(),
                leverage_calls: Vec::new(),
                next_order_id: 0,
            })),
            stop_orders: true,
        }
    }

    pub fn without_stop_orders(mut self) -> Self {
        self.stop_orders = false;
        self
    }

    pub fn push_price(&self, price: f64) {
        self.state.lock().unwrap().prices.push_back(Ok(price));
    }

    pub fn push_price_error(&self, err: GatewayError) {
        self.state.lock().unwrap().prices.push_back(Err(err));
    }

    pub fn push_order(&self, script: OrderScript) {
        self.state.lock().unwrap().orders.push_back(script);
    }

    pub fn push_account_error(&self, err: GatewayError) {
        self.state.lock().unwrap().account_failures.push_back(err);
    }

    pub fn open_position(&self, side: Direction, size: f64, entry_price: f64) {
        self.state.lock().unwrap().position = Some(ExchangePosition {
            symbol: SYMBOL.to_string(),
            side,
            size,
            entry_price,
            mark_price: entry_price,
        });
    }

    /// Simulate the exchange closing the position on its own (stop hit, liquidation)
    pub fn clear_position(&self) {
        self.state.lock().unwrap().position = None;
    }

    pub fn position(&self) -> Option<ExchangePosition> {
        self.state.lock().unwrap().position.clone()
    }

    pub fn exchange_stop(&self) -> Option<f64> {
        self.state.lock().unwrap().exchange_stop
    }

    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn leverage_calls(&self) -> Vec<u32> {
        self.state.lock().unwrap().leverage_calls.clone()
    }

    fn fill(&self, request: &OrderRequest, price: Option<f64>) -> OrderResult {
        let mut state = self.state.lock().unwrap();
        state.next_order_id += 1;
        let order_id = format!("fake-{}", state.next_order_id);
        let price = price.unwrap_or(state.last_price);

        let (fill_price, filled_quantity) = match request.order_type {
            OrderType::StopLoss => {
                state.exchange_stop = request.price;
                (request.price.unwrap_or(price), 0.0)
            }
            OrderType::Market if request.reduce_only => {
                let emptied = match state.position.as_mut() {
                    Some(position) => {
                        position.size -= request.quantity;
                        position.size <= 1e-9
                    }
                    None => false,
                };
                if emptied {
                    state.position = None;
                    state.exchange_stop = None;
                }
                (price, request.quantity)
            }
            OrderType::Market => {
                let side = match request.side {
                    OrderSide::Buy => Direction::Long,
                    OrderSide::Sell => Direction::Short,
                };
                state.position = Some(ExchangePosition {
                    symbol: request.symbol.clone(),
                    side,
                    size: request.quantity,
                    entry_price: price,
                    mark_price: price,
                });
                state.exchange_stop = request.preset_stop_loss;
                (price, request.quantity)
            }
        };

        OrderResult {
            order_id,
            client_order_id: request.client_order_id.clone(),
            fill_price,
            filled_quantity,
            timestamp: Utc::now(),
        }
    }
}

impl Exchange for FakeExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, GatewayError> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.submitted.push(request.clone());
            state.orders.pop_front().unwrap_or(OrderScript::Fill)
        };

        match script {
            OrderScript::Fill => Ok(self.fill(request, None)),
            OrderScript::FillAt(price) => Ok(self.fill(request, Some(price))),
            OrderScript::Fail(err) => Err(err),
            OrderScript::Hang => std::future::pending().await,
            OrderScript::HangAfterFill => {
                self.fill(request, None);
                std::future::pending().await
            }
            OrderScript::FillThenFail(err) => {
                self.fill(request, None);
                Err(err)
            }
        }
    }

    async fn fetch_price(&self, _symbol: &str) -> Result<f64, GatewayError> {
        let mut state = self.state.lock().unwrap();
        match state.prices.pop_front() {
            Some(Ok(price)) => {
                state.last_price = price;
                if let Some(position) = state.position.as_mut() {
                    position.mark_price = price;
                }
                Ok(price)
            }
            Some(Err(err)) => Err(err),
            None => Ok(state.last_price),
        }
    }

    async fn fetch_account(&self, _symbol: &str) -> Result<AccountState, GatewayError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.account_failures.pop_front() {
            return Err(err);
        }
        Ok(AccountState {
            equity: state.equity,
            available: state.equity,
            positions: state.position.iter().cloned().collect(),
        })
    }

    async fn set_leverage(&self, _symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        self.state.lock().unwrap().leverage_calls.push(leverage);
        Ok(())
    }

    fn supports_stop_orders(&self) -> bool {
        self.stop_orders
    }
}

pub fn gateway_settings() -> GatewaySettings {
    GatewaySettings {
        backoff: BackoffPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        },
        call_timeout: Duration::from_millis(50),
        breaker_failure_threshold: 10,
        breaker_cooldown_secs: 30,
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        tick_interval: Duration::from_millis(10),
        close_on_shutdown: false,
        shutdown_close_timeout: Duration::from_secs(2),
    }
}

/// Engine wired to a fake exchange, a manual clock and a temp event log
pub struct Harness {
    pub exchange: FakeExchange,
    pub clock: ManualClock,
    pub log_path: PathBuf,
    pub engine: TradingEngine<FakeExchange, ManualClock>,
    _log_dir: TempDir,
}

impl Harness {
    pub fn new(exchange: FakeExchange) -> Self {
        Self::with_configs(exchange, StrategyConfig::default(), engine_config())
    }

    pub fn with_configs(
        exchange: FakeExchange,
        strategy: StrategyConfig,
        config: EngineConfig,
    ) -> Self {
        let clock = ManualClock::new(session_start());
        let log_dir = TempDir::new().unwrap();
        let log_path = log_dir.path().join("bot_log.jsonl");

        let gateway = Gateway::new(exchange.clone(), clock.clone(), gateway_settings());
        let tracker =
            MarketStateTracker::new(SYMBOL, SessionConfig::default(), TrendConfig::default());
        let manager = PositionManager::new(ManagerConfig::default());
        let logger = EventLogger::new(&log_path);

        let engine = TradingEngine::new(gateway, tracker, manager, logger, strategy, config);

        Self {
            exchange,
            clock,
            log_path,
            engine,
            _log_dir: log_dir,
        }
    }

    /// Queue `price` and run one tick a minute after the previous one
    pub async fn tick_at(&mut self, price: f64) -> perpbot::execution::TickReport {
        self.exchange.push_price(price);
        let report = self.engine.tick().await.unwrap();
        self.clock.advance(Duration::from_secs(60));
        report
    }

    pub fn records(&self) -> Vec<LogRecord> {
        read_records(&self.log_path)
    }

    pub fn events(&self) -> Vec<EventType> {
        self.records().iter().map(|r| r.event_type).collect()
    }
}

pub fn read_records(path: &Path) -> Vec<LogRecord> {
    if !path.exists() {
        return Vec::new();
    }
    read_log(path).unwrap()
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
