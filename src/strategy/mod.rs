// Strategy engine: pure decision function over market snapshot and position
pub mod sizing;

use crate::models::{
    Direction, ExitReason, MarketSnapshot, Position, SessionPhase, TradeAction, TrendBias,
};

/// Strategy parameters. Percentages are fractions (0.02 = 2%).
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub leverage: u32,
    pub capital_pct_base: f64,
    pub capital_pct_max: f64,
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: f64,
    pub trailing_activation_pct: f64, // Favorable move required before trailing starts
    pub partial_tp_pct: f64,
    pub partial_tp_fraction: f64,
    pub trend_filter_enabled: bool,
    pub entry_move_threshold_pct: f64, // Opening move that defines the fade direction
    pub trend_veto_pct: f64,
    pub exit_at_session_close: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            leverage: 25,
            capital_pct_base: 0.35,
            capital_pct_max: 0.50,
            stop_loss_pct: 0.02,
            trailing_stop_pct: 0.01,
            trailing_activation_pct: 0.0,
            partial_tp_pct: 0.03,
            partial_tp_fraction: 0.5,
            trend_filter_enabled: true,
            entry_move_threshold_pct: 0.0008, // 0.08%
            trend_veto_pct: 0.015,            // 1.5% daily move blocks counter-trend fades
            exit_at_session_close: false,
        }
    }
}

/// Direction that fades the opening move, if the move is large enough
pub fn candidate_direction(open_move_pct: f64, threshold: f64) -> Option<Direction> {
    if open_move_pct <= -threshold {
        Some(Direction::Long)
    } else if open_move_pct >= threshold {
        Some(Direction::Short)
    } else {
        None
    }
}

/// Whether the daily trend allows an entry in `direction`.
///
/// Only a strong move against the entry vetoes it; a mild opposing bias is
/// exactly what a fade trades into.
pub fn trend_allows(direction: Direction, snapshot: &MarketSnapshot, veto_pct: f64) -> bool {
    match direction {
        Direction::Long => !(snapshot.daily_trend_bias == TrendBias::Bearish
            && snapshot.daily_change_pct <= -veto_pct),
        Direction::Short => !(snapshot.daily_trend_bias == TrendBias::Bullish
            && snapshot.daily_change_pct >= veto_pct),
    }
}

/// Map the current snapshot and position to exactly one action.
///
/// Rules, first match wins:
/// 1. stale snapshot: hold an open position, otherwise do nothing
/// 2. flat: enter during the open window when the opening move qualifies
/// 3. stop breached: full exit
/// 4. session closed and exit-at-close enabled: full exit
/// 5. partial take-profit threshold reached and not yet taken
/// 6. trailing stop would tighten
/// 7. hold
pub fn decide(
    snapshot: &MarketSnapshot,
    position: &Position,
    config: &StrategyConfig,
) -> TradeAction {
    let Some(direction) = position.side.direction() else {
        if snapshot.stale {
            return TradeAction::NoOp;
        }
        return decide_entry(snapshot, config);
    };

    if snapshot.stale {
        return TradeAction::HoldStop;
    }

    let price = snapshot.last_price;
    let favorable = position.favorable_move(price);

    // Hard stop first
    let stop_breached = match (direction, position.stop_price) {
        (Direction::Long, Some(stop)) => price <= stop,
        (Direction::Short, Some(stop)) => price >= stop,
        (_, None) => false,
    };
    if stop_breached || -favorable >= config.stop_loss_pct {
        return TradeAction::FullExit {
            reason: ExitReason::StopLoss,
        };
    }

    if config.exit_at_session_close && snapshot.session_phase == SessionPhase::Closed {
        return TradeAction::FullExit {
            reason: ExitReason::SessionClose,
        };
    }

    if !position.partial_exit_taken
        && config.partial_tp_fraction > 0.0
        && favorable >= config.partial_tp_pct
    {
        return TradeAction::PartialExit {
            fraction: config.partial_tp_fraction,
        };
    }

    if favorable > config.trailing_activation_pct && config.trailing_stop_pct > 0.0 {
        let candidate = trailing_stop(direction, price, config.trailing_stop_pct);
        if is_tighter(direction, candidate, position.stop_price) {
            return TradeAction::TrailStop {
                new_stop: candidate,
            };
        }
    }

    TradeAction::HoldStop
}

fn decide_entry(snapshot: &MarketSnapshot, config: &StrategyConfig) -> TradeAction {
    if snapshot.session_phase != SessionPhase::OpenWindow {
        return TradeAction::NoOp;
    }
    let Some(open_move) = snapshot.open_move_pct else {
        return TradeAction::NoOp;
    };
    let Some(direction) = candidate_direction(open_move, config.entry_move_threshold_pct) else {
        return TradeAction::NoOp;
    };

    if let Some(reason) = entry_veto(snapshot, config) {
        tracing::debug!(%reason, "Entry vetoed by daily trend");
        return TradeAction::NoOp;
    }

    TradeAction::Enter {
        direction,
        size_pct: config.capital_pct_base,
    }
}

/// Why the trend filter blocks the entry the opening move asks for, if it does
pub fn entry_veto(snapshot: &MarketSnapshot, config: &StrategyConfig) -> Option<String> {
    if !config.trend_filter_enabled
        || snapshot.stale
        || snapshot.session_phase != SessionPhase::OpenWindow
    {
        return None;
    }
    let direction = candidate_direction(snapshot.open_move_pct?, config.entry_move_threshold_pct)?;
    if trend_allows(direction, snapshot, config.trend_veto_pct) {
        return None;
    }
    Some(format!(
        "{:?} entry vetoed by {:?} daily trend ({:+.2}%)",
        direction,
        snapshot.daily_trend_bias,
        snapshot.daily_change_pct * 100.0
    ))
}

/// Stop price trailing `trail_pct` behind `price`
pub fn trailing_stop(direction: Direction, price: f64, trail_pct: f64) -> f64 {
    match direction {
        Direction::Long => price * (1.0 - trail_pct),
        Direction::Short => price * (1.0 + trail_pct),
    }
}

/// Initial protective stop for a fill
pub fn initial_stop(direction: Direction, fill_price: f64, stop_loss_pct: f64) -> f64 {
    trailing_stop(direction, fill_price, stop_loss_pct)
}

/// Partial take-profit trigger for a fill
pub fn take_profit_price(direction: Direction, fill_price: f64, partial_tp_pct: f64) -> f64 {
    match direction {
        Direction::Long => fill_price * (1.0 + partial_tp_pct),
        Direction::Short => fill_price * (1.0 - partial_tp_pct),
    }
}

/// Whether `candidate` moves the stop in the position's favor
pub fn is_tighter(direction: Direction, candidate: f64, current: Option<f64>) -> bool {
    match (direction, current) {
        (_, None) => true,
        (Direction::Long, Some(stop)) => candidate > stop,
        (Direction::Short, Some(stop)) => candidate < stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSide;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn snapshot(price: f64) -> MarketSnapshot {
        MarketSnapshot {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 15, 14, 35, 0).unwrap(),
            last_price: price,
            session_phase: SessionPhase::Regular,
            session_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            daily_trend_bias: TrendBias::Neutral,
            daily_change_pct: 0.0,
            open_move_pct: None,
            stale: false,
        }
    }

    fn opening(open_move: f64) -> MarketSnapshot {
        MarketSnapshot {
            session_phase: SessionPhase::OpenWindow,
            open_move_pct: Some(open_move),
            ..snapshot(60000.0)
        }
    }

    fn long_at(entry: f64, stop: f64) -> Position {
        Position {
            side: PositionSide::Long,
            entry_price: entry,
            size: 0.01,
            stop_price: Some(stop),
            ..Position::flat("BTCUSDT", 25)
        }
    }

    fn short_at(entry: f64, stop: f64) -> Position {
        Position {
            side: PositionSide::Short,
            ..long_at(entry, stop)
        }
    }

    fn flat() -> Position {
        Position::flat("BTCUSDT", 25)
    }

    #[test]
    fn test_fade_opening_move() {
        let config = StrategyConfig::default();

        // Down 0.1% from the anchor: buy the dip
        assert_eq!(
            decide(&opening(-0.001), &flat(), &config),
            TradeAction::Enter {
                direction: Direction::Long,
                size_pct: 0.35
            }
        );
        // Up 0.1%: fade it short
        assert_eq!(
            decide(&opening(0.001), &flat(), &config),
            TradeAction::Enter {
                direction: Direction::Short,
                size_pct: 0.35
            }
        );
        // Inside the threshold
        assert_eq!(decide(&opening(0.0005), &flat(), &config), TradeAction::NoOp);
    }

    #[test]
    fn test_no_entry_outside_open_window() {
        let config = StrategyConfig::default();
        let mut snap = opening(-0.002);
        snap.session_phase = SessionPhase::Regular;
        assert_eq!(decide(&snap, &flat(), &config), TradeAction::NoOp);

        let anchorless = MarketSnapshot {
            open_move_pct: None,
            ..opening(0.0)
        };
        assert_eq!(decide(&anchorless, &flat(), &config), TradeAction::NoOp);
    }

    #[test]
    fn test_strong_trend_vetoes_counter_entry() {
        let config = StrategyConfig::default();
        let mut snap = opening(-0.002);
        snap.daily_trend_bias = TrendBias::Bearish;
        snap.daily_change_pct = -0.02;
        assert_eq!(decide(&snap, &flat(), &config), TradeAction::NoOp);

        // Mild bearish bias does not veto
        snap.daily_change_pct = -0.008;
        assert!(matches!(
            decide(&snap, &flat(), &config),
            TradeAction::Enter { .. }
        ));

        // Filter disabled ignores the trend entirely
        snap.daily_change_pct = -0.02;
        let unfiltered = StrategyConfig {
            trend_filter_enabled: false,
            ..config
        };
        assert!(matches!(
            decide(&snap, &flat(), &unfiltered),
            TradeAction::Enter { .. }
        ));
    }

    #[test]
    fn test_entry_veto_reason() {
        let config = StrategyConfig::default();
        let mut snap = opening(-0.002);
        snap.daily_trend_bias = TrendBias::Bearish;
        snap.daily_change_pct = -0.02;

        let reason = entry_veto(&snap, &config).unwrap();
        assert!(reason.contains("Long"));
        assert!(reason.contains("Bearish"));
        assert!(reason.contains("-2.00%"));

        // No candidate, no veto
        assert_eq!(entry_veto(&opening(0.0001), &config), None);
        // Agreeing trend
        snap.daily_change_pct = -0.008;
        assert_eq!(entry_veto(&snap, &config), None);
        // Outside the window nothing is being vetoed
        snap.daily_change_pct = -0.02;
        snap.session_phase = SessionPhase::Regular;
        assert_eq!(entry_veto(&snap, &config), None);
    }

    #[test]
    fn test_stale_snapshot() {
        let config = StrategyConfig::default();
        let mut snap = opening(-0.002);
        snap.stale = true;
        assert_eq!(decide(&snap, &flat(), &config), TradeAction::NoOp);

        let mut crash = snapshot(50000.0);
        crash.stale = true;
        assert_eq!(decide(&crash, &long_at(60000.0, 58800.0), &config), TradeAction::HoldStop);
    }

    #[test]
    fn test_stop_breach_beats_everything() {
        let config = StrategyConfig::default();
        assert_eq!(
            decide(&snapshot(58700.0), &long_at(60000.0, 58800.0), &config),
            TradeAction::FullExit {
                reason: ExitReason::StopLoss
            }
        );
        // Trailed stop above entry is hit before the adverse threshold
        assert_eq!(
            decide(&snapshot(60800.0), &long_at(60000.0, 60885.0), &config),
            TradeAction::FullExit {
                reason: ExitReason::StopLoss
            }
        );
        assert_eq!(
            decide(&snapshot(61300.0), &short_at(60000.0, 61200.0), &config),
            TradeAction::FullExit {
                reason: ExitReason::StopLoss
            }
        );
    }

    #[test]
    fn test_trail_to_60885() {
        let config = StrategyConfig::default();
        match decide(&snapshot(61500.0), &long_at(60000.0, 58800.0), &config) {
            TradeAction::TrailStop { new_stop } => assert!((new_stop - 60885.0).abs() < 1e-6),
            other => panic!("expected trail, got {:?}", other),
        }
    }

    #[test]
    fn test_trail_never_loosens() {
        let config = StrategyConfig::default();
        // Price pulled back: 61000 * 0.99 = 60390 < current 60885
        assert_eq!(
            decide(&snapshot(61000.0), &long_at(60000.0, 60885.0), &config),
            TradeAction::HoldStop
        );
        // Short: 59000 * 1.01 = 59590, tighter than 61200
        match decide(&snapshot(59000.0), &short_at(60000.0, 61200.0), &config) {
            TradeAction::TrailStop { new_stop } => assert!((new_stop - 59590.0).abs() < 1e-6),
            other => panic!("expected trail, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_exit_once() {
        let config = StrategyConfig::default();
        let mut position = long_at(60000.0, 58800.0);
        assert_eq!(
            decide(&snapshot(61900.0), &position, &config),
            TradeAction::PartialExit { fraction: 0.5 }
        );

        position.partial_exit_taken = true;
        assert!(matches!(
            decide(&snapshot(61900.0), &position, &config),
            TradeAction::TrailStop { .. }
        ));
    }

    #[test]
    fn test_session_close_exit() {
        let config = StrategyConfig {
            exit_at_session_close: true,
            ..Default::default()
        };
        let mut snap = snapshot(60100.0);
        snap.session_phase = SessionPhase::Closed;
        assert_eq!(
            decide(&snap, &long_at(60000.0, 59500.0), &config),
            TradeAction::FullExit {
                reason: ExitReason::SessionClose
            }
        );
    }

    #[test]
    fn test_losing_position_holds() {
        let config = StrategyConfig::default();
        assert_eq!(
            decide(&snapshot(59500.0), &long_at(60000.0, 58800.0), &config),
            TradeAction::HoldStop
        );
    }
}
