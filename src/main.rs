use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use perpbot::config::BotConfig;
use perpbot::event_log::EventLogger;
use perpbot::exchange::{BitgetClient, Gateway, SystemClock};
use perpbot::execution::{PositionManager, TradingEngine};
use perpbot::market::MarketStateTracker;
use perpbot::{BotError, Result};

#[derive(Parser)]
#[command(name = "perpbot", version, about = "Session-open perpetual futures bot for Bitget")]
struct Cli {
    /// Configuration file (toml, yaml or json); defaults to ./conf.*
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run the trading loop (default)
    Run,
    /// Authenticate, print price, equity and open positions, then exit
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();

    let cli = Cli::parse();
    let outcome = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(cli.config).await,
        Command::Check => check(cli.config).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "❌ perpbot exited with error");
            ExitCode::from(err.exit_code())
        }
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("perpbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<PathBuf>) -> Result<BotConfig> {
    let config = BotConfig::load(path.as_deref())?;
    Ok(config)
}

fn build_gateway(config: &BotConfig) -> Result<Gateway<BitgetClient, SystemClock>> {
    let client = BitgetClient::new(
        config.credentials(),
        config.bitget_sandbox,
        config.rate_limit_per_sec,
    )
    .map_err(|e| BotError::Fatal(format!("{:#}", e)))?;

    Ok(Gateway::new(client, SystemClock, config.gateway_settings()))
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;

    tracing::info!("🤖 Starting perpbot");
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Symbol: {}", config.symbol);
    tracing::info!("  Sandbox: {}", config.bitget_sandbox);
    tracing::info!("  Leverage: {}x", config.leverage);
    tracing::info!(
        "  Capital: {:.0}% base, {:.0}% max",
        config.capital_pct_base * 100.0,
        config.capital_pct_max * 100.0
    );
    tracing::info!(
        "  Stop loss: {}%, trailing {}%",
        config.stop_loss_pct * 100.0,
        config.trailing_stop_pct * 100.0
    );
    tracing::info!(
        "  Session: {} {} (entries per session: {})",
        config.session_open,
        config.session_timezone,
        config.max_entries_per_session
    );
    tracing::info!("  Tick: every {}s", config.tick_interval_secs);

    let gateway = build_gateway(&config)?;
    let tracker = MarketStateTracker::new(config.symbol.clone(), config.session()?, config.trend());
    let manager = PositionManager::new(config.manager());
    let logger = EventLogger::new(config.log_path.clone());

    let mut engine = TradingEngine::new(
        gateway,
        tracker,
        manager,
        logger,
        config.strategy(),
        config.engine(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("\n⚠️  Shutdown signal received, finishing current tick...");
        shutdown_tx.send(true).ok();
    });

    tracing::info!("\nPress Ctrl+C to stop...\n");
    engine.run(shutdown_rx).await?;
    Ok(())
}

async fn check(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let mut gateway = build_gateway(&config)?;

    tracing::info!(
        symbol = %config.symbol,
        sandbox = config.bitget_sandbox,
        "🔌 Testing Bitget connection"
    );

    let price = gateway.get_price(&config.symbol).await?;
    let account = gateway.get_account_state(&config.symbol).await?;

    println!("✅ Connected to Bitget ({})", if config.bitget_sandbox { "demo" } else { "live" });
    println!("  {} price: {:.2}", config.symbol, price);
    println!("  Equity: {:.2} USDT (available {:.2})", account.equity, account.available);

    if account.positions.is_empty() {
        println!("  Open positions: none");
    } else {
        println!("  Open positions:");
        for position in &account.positions {
            println!(
                "    {} {:?} size {} entry {:.2} mark {:.2}",
                position.symbol,
                position.side,
                position.size,
                position.entry_price,
                position.mark_price
            );
        }
    }

    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler, Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
