use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

use crate::exchange::{BackoffPolicy, BitgetCredentials, GatewaySettings};
use crate::execution::{EngineConfig, ManagerConfig};
use crate::market::{SessionConfig, TrendConfig};
use crate::strategy::StrategyConfig;

/// Looked up as conf.toml / conf.yaml / conf.json when no path is given
const DEFAULT_CONFIG_NAME: &str = "conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Credential string that never shows up in Debug output or logs
#[derive(Clone, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***\"")
    }
}

/// Flat bot configuration. Keys are lowercase in files; environment variables
/// use the same names uppercased (`BITGET_API_KEY`, `LEVERAGE`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    // Credentials
    pub bitget_api_key: Secret,
    pub bitget_api_secret: Secret,
    pub bitget_api_passphrase: Secret,
    #[serde(default = "default_true")]
    pub bitget_sandbox: bool,

    // Market
    #[serde(default = "default_symbol")]
    pub symbol: String,

    // Sizing
    pub leverage: u32,
    #[serde(alias = "initial_capital_pct")]
    pub capital_pct_base: f64,
    pub capital_pct_max: f64,
    #[serde(default)]
    pub reference_capital: Option<f64>,
    #[serde(default = "default_size_step")]
    pub min_order_size: f64,
    #[serde(default = "default_size_step")]
    pub size_step: f64,
    #[serde(default = "default_one", alias = "max_trades_per_session")]
    pub max_entries_per_session: u32,

    // Strategy
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: f64,
    #[serde(default)]
    pub trailing_activation_pct: f64,
    #[serde(default = "default_partial_tp_pct")]
    pub partial_tp_pct: f64,
    #[serde(default = "default_partial_tp_fraction")]
    pub partial_tp_fraction: f64,
    #[serde(default = "default_true")]
    pub trend_filter_enabled: bool,
    #[serde(default = "default_entry_move_threshold_pct")]
    pub entry_move_threshold_pct: f64,
    #[serde(default = "default_trend_bias_pct")]
    pub trend_bias_pct: f64,
    #[serde(default = "default_trend_veto_pct")]
    pub trend_veto_pct: f64,
    #[serde(default = "default_trend_lookback_hours")]
    pub trend_lookback_hours: i64,
    #[serde(default)]
    pub exit_at_session_close: bool,

    // Session anchor
    #[serde(default = "default_session_timezone", alias = "ny_open_tz")]
    pub session_timezone: String,
    #[serde(default = "default_session_open")]
    pub session_open: String, // HH:MM local time
    #[serde(default = "default_thirty", alias = "pre_open_window_min")]
    pub pre_open_minutes: i64,
    #[serde(default = "default_thirty")]
    pub open_window_minutes: i64,
    #[serde(default = "default_session_minutes")]
    pub session_minutes: i64,
    #[serde(default)]
    pub trade_weekends: bool,

    // Control loop and gateway
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_thirty")]
    pub breaker_cooldown_secs: i64,
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,
    #[serde(default = "default_one")]
    pub position_sync_ticks: u32,

    // Shutdown and audit log
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default)]
    pub close_on_shutdown: bool,
    #[serde(default = "default_shutdown_close_timeout_secs")]
    pub shutdown_close_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_one() -> u32 {
    1
}
fn default_thirty() -> i64 {
    30
}
fn default_symbol() -> String {
    "BTCUSDT".to_string()
}
fn default_size_step() -> f64 {
    0.001 // BTCUSDT perpetual lot size
}
fn default_stop_loss_pct() -> f64 {
    0.02
}
fn default_trailing_stop_pct() -> f64 {
    0.01
}
fn default_partial_tp_pct() -> f64 {
    0.03
}
fn default_partial_tp_fraction() -> f64 {
    0.5
}
fn default_entry_move_threshold_pct() -> f64 {
    0.0008
}
fn default_trend_bias_pct() -> f64 {
    0.005
}
fn default_trend_veto_pct() -> f64 {
    0.015
}
fn default_trend_lookback_hours() -> i64 {
    24
}
fn default_session_timezone() -> String {
    "America/New_York".to_string()
}
fn default_session_open() -> String {
    "09:30".to_string()
}
fn default_session_minutes() -> i64 {
    390
}
fn default_tick_interval_secs() -> u64 {
    60
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    8000
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_rate_limit_per_sec() -> u32 {
    10
}
fn default_log_path() -> PathBuf {
    PathBuf::from("bot_log.jsonl")
}
fn default_shutdown_close_timeout_secs() -> u64 {
    15
}

impl BotConfig {
    /// Resolve configuration: `.env`, then the config file, then environment variables.
    ///
    /// An explicit `path` must exist; without one an optional `conf.*` in the
    /// working directory is used.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Ok(env_file) = dotenvy::dotenv() {
            tracing::debug!(path = %env_file.display(), "Loaded .env");
        }

        let file = match path {
            Some(path) => config::File::from(path),
            None => config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::default())
            .build()?;

        settings.try_deserialize::<BotConfig>()?.validated()
    }

    /// Parse configuration from TOML text only (no environment overlay)
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;

        settings.try_deserialize::<BotConfig>()?.validated()
    }

    /// Normalize derived fields and reject values the core cannot run with
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.symbol = normalize_symbol(&self.symbol);

        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        for (name, value) in [
            ("bitget_api_key", &self.bitget_api_key),
            ("bitget_api_secret", &self.bitget_api_secret),
            ("bitget_api_passphrase", &self.bitget_api_passphrase),
        ] {
            if value.expose().trim().is_empty() {
                return invalid(format!("{} must not be empty", name));
            }
        }
        if self.symbol.is_empty() {
            return invalid("symbol must not be empty".to_string());
        }
        if !(1..=125).contains(&self.leverage) {
            return invalid(format!("leverage must be 1-125, got {}", self.leverage));
        }
        if !(self.capital_pct_base > 0.0 && self.capital_pct_base <= self.capital_pct_max) {
            return invalid(format!(
                "capital_pct_base must be in (0, capital_pct_max], got {}",
                self.capital_pct_base
            ));
        }
        if self.capital_pct_max > 1.0 {
            return invalid(format!(
                "capital_pct_max must be <= 1.0, got {}",
                self.capital_pct_max
            ));
        }
        if !(self.stop_loss_pct > 0.0 && self.stop_loss_pct < 1.0) {
            return invalid(format!("stop_loss_pct must be in (0, 1), got {}", self.stop_loss_pct));
        }
        if !(0.0..1.0).contains(&self.trailing_stop_pct) {
            return invalid(format!(
                "trailing_stop_pct must be in [0, 1), got {}",
                self.trailing_stop_pct
            ));
        }
        if !(0.0..=1.0).contains(&self.partial_tp_fraction) || self.partial_tp_pct <= 0.0 {
            return invalid(
                "partial_tp_fraction must be in [0, 1] and partial_tp_pct > 0".to_string(),
            );
        }
        if self.size_step <= 0.0 || self.min_order_size <= 0.0 {
            return invalid("size_step and min_order_size must be positive".to_string());
        }
        if matches!(self.reference_capital, Some(c) if c <= 0.0) {
            return invalid("reference_capital must be positive".to_string());
        }
        if self.tick_interval_secs == 0 || self.request_timeout_secs == 0 {
            return invalid(
                "tick_interval_secs and request_timeout_secs must be positive".to_string(),
            );
        }
        if self.max_retries == 0 || self.rate_limit_per_sec == 0 || self.position_sync_ticks == 0 {
            return invalid(
                "max_retries, rate_limit_per_sec and position_sync_ticks must be at least 1"
                    .to_string(),
            );
        }
        if self.open_window_minutes <= 0 || self.session_minutes < self.open_window_minutes {
            return invalid("session_minutes must cover a positive open window".to_string());
        }

        // Surface timezone and open-time errors now rather than on first use
        self.session()?;

        Ok(self)
    }

    pub fn credentials(&self) -> BitgetCredentials {
        BitgetCredentials {
            api_key: self.bitget_api_key.expose().to_string(),
            secret_key: self.bitget_api_secret.expose().to_string(),
            passphrase: self.bitget_api_passphrase.expose().to_string(),
        }
    }

    pub fn strategy(&self) -> StrategyConfig {
        StrategyConfig {
            leverage: self.leverage,
            capital_pct_base: self.capital_pct_base,
            capital_pct_max: self.capital_pct_max,
            stop_loss_pct: self.stop_loss_pct,
            trailing_stop_pct: self.trailing_stop_pct,
            trailing_activation_pct: self.trailing_activation_pct,
            partial_tp_pct: self.partial_tp_pct,
            partial_tp_fraction: self.partial_tp_fraction,
            trend_filter_enabled: self.trend_filter_enabled,
            entry_move_threshold_pct: self.entry_move_threshold_pct,
            trend_veto_pct: self.trend_veto_pct,
            exit_at_session_close: self.exit_at_session_close,
        }
    }

    pub fn session(&self) -> Result<SessionConfig, ConfigError> {
        let timezone: Tz = self.session_timezone.parse().map_err(|e| {
            ConfigError::Invalid(format!(
                "unknown session_timezone '{}': {}",
                self.session_timezone, e
            ))
        })?;
        let open_time = NaiveTime::parse_from_str(&self.session_open, "%H:%M").map_err(|e| {
            ConfigError::Invalid(format!(
                "session_open must be HH:MM, got '{}': {}",
                self.session_open, e
            ))
        })?;

        Ok(SessionConfig {
            timezone,
            open_time,
            pre_open_minutes: self.pre_open_minutes,
            open_window_minutes: self.open_window_minutes,
            session_minutes: self.session_minutes,
            trade_weekends: self.trade_weekends,
        })
    }

    pub fn trend(&self) -> TrendConfig {
        TrendConfig {
            lookback_hours: self.trend_lookback_hours,
            bias_pct: self.trend_bias_pct,
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            backoff: BackoffPolicy {
                max_attempts: self.max_retries,
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms),
            },
            call_timeout: Duration::from_secs(self.request_timeout_secs),
            breaker_failure_threshold: self.breaker_failure_threshold,
            breaker_cooldown_secs: self.breaker_cooldown_secs,
        }
    }

    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            symbol: self.symbol.clone(),
            leverage: self.leverage,
            stop_loss_pct: self.stop_loss_pct,
            partial_tp_pct: self.partial_tp_pct,
            capital_pct_max: self.capital_pct_max,
            reference_capital: self.reference_capital,
            min_order_size: self.min_order_size,
            size_step: self.size_step,
            max_entries_per_session: self.max_entries_per_session,
            position_sync_ticks: self.position_sync_ticks,
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            close_on_shutdown: self.close_on_shutdown,
            shutdown_close_timeout: Duration::from_secs(self.shutdown_close_timeout_secs),
        }
    }
}

/// `BTC/USDT:USDT` (ccxt unified form) -> `BTCUSDT`
pub fn normalize_symbol(symbol: &str) -> String {
    let base = symbol.split(':').next().unwrap_or(symbol);
    base.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        bitget_api_key = "key"
        bitget_api_secret = "secret"
        bitget_api_passphrase = "phrase"
        leverage = 25
        capital_pct_base = 0.35
        capital_pct_max = 0.50
    "#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = BotConfig::from_toml(MINIMAL).unwrap();

        assert!(config.bitget_sandbox); // Sandbox unless explicitly disabled
        assert_eq!(config.symbol, "BTCUSDT");
        assert_eq!(config.stop_loss_pct, 0.02);
        assert_eq!(config.max_entries_per_session, 1);
        assert_eq!(config.log_path, PathBuf::from("bot_log.jsonl"));

        let session = config.session().unwrap();
        assert_eq!(session.timezone, chrono_tz::America::New_York);
        assert_eq!(session.open_time, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
    }

    #[test]
    fn test_environment_overlay_keeps_credentials_verbatim() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("conf.toml");
        std::fs::write(
            &path,
            "leverage = 25\ncapital_pct_base = 0.35\ncapital_pct_max = 0.50\n",
        )
        .unwrap();

        std::env::set_var("BITGET_API_KEY", "bg_key");
        std::env::set_var("BITGET_API_SECRET", "1e5");
        std::env::set_var("BITGET_API_PASSPHRASE", "0123456");
        std::env::set_var("STOP_LOSS_PCT", "0.03");
        let loaded = BotConfig::load(Some(&path));
        for key in [
            "BITGET_API_KEY",
            "BITGET_API_SECRET",
            "BITGET_API_PASSPHRASE",
            "STOP_LOSS_PCT",
        ] {
            std::env::remove_var(key);
        }

        let config = loaded.unwrap();
        assert_eq!(config.bitget_api_passphrase.expose(), "0123456");
        assert_eq!(config.bitget_api_secret.expose(), "1e5");
        assert_eq!(config.stop_loss_pct, 0.03); // Numeric fields still coerce from strings
        assert_eq!(config.leverage, 25);
    }

    #[test]
    fn test_missing_capital_is_fatal() {
        let text = r#"
            bitget_api_key = "key"
            bitget_api_secret = "secret"
            bitget_api_passphrase = "phrase"
            leverage = 25
        "#;
        assert!(matches!(BotConfig::from_toml(text), Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_sandbox_independent_of_passphrase() {
        let text = format!("{}\nbitget_sandbox = false\n", MINIMAL);
        let config = BotConfig::from_toml(&text).unwrap();
        assert!(!config.bitget_sandbox);
        assert_eq!(config.bitget_api_passphrase.expose(), "phrase");
    }

    #[test]
    fn test_ccxt_symbol_normalized() {
        let text = format!("{}\nsymbol = \"BTC/USDT:USDT\"\n", MINIMAL);
        let config = BotConfig::from_toml(&text).unwrap();
        assert_eq!(config.symbol, "BTCUSDT");
        assert_eq!(normalize_symbol("eth/usdt"), "ETHUSDT");
    }

    #[test]
    fn test_legacy_key_aliases() {
        let text = r#"
            bitget_api_key = "key"
            bitget_api_secret = "secret"
            bitget_api_passphrase = "phrase"
            leverage = 25
            initial_capital_pct = 0.35
            capital_pct_max = 0.50
            max_trades_per_session = 3
        "#;
        let config = BotConfig::from_toml(text).unwrap();
        assert_eq!(config.capital_pct_base, 0.35);
        assert_eq!(config.max_entries_per_session, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_leverage = MINIMAL.replace("leverage = 25", "leverage = 0");
        assert!(matches!(
            BotConfig::from_toml(&bad_leverage),
            Err(ConfigError::Invalid(_))
        ));

        let inverted = MINIMAL.replace("capital_pct_max = 0.50", "capital_pct_max = 0.20");
        assert!(matches!(BotConfig::from_toml(&inverted), Err(ConfigError::Invalid(_))));

        let bad_tz = format!("{}\nsession_timezone = \"Mars/Olympus\"\n", MINIMAL);
        assert!(matches!(BotConfig::from_toml(&bad_tz), Err(ConfigError::Invalid(_))));

        let empty_key = MINIMAL.replace("bitget_api_key = \"key\"", "bitget_api_key = \" \"");
        assert!(matches!(BotConfig::from_toml(&empty_key), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let config = BotConfig::from_toml(MINIMAL).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("\"secret\""));
        assert!(!rendered.contains("\"phrase\""));
    }

    #[test]
    fn test_sub_configs() {
        let config = BotConfig::from_toml(MINIMAL).unwrap();

        let gateway = config.gateway_settings();
        assert_eq!(gateway.backoff.max_attempts, 4);
        assert_eq!(gateway.call_timeout, Duration::from_secs(10));

        let strategy = config.strategy();
        assert_eq!(strategy.leverage, 25);
        assert_eq!(strategy.capital_pct_base, 0.35);

        assert_eq!(config.engine().tick_interval, Duration::from_secs(60));
        assert_eq!(config.manager().symbol, "BTCUSDT");
    }
}
