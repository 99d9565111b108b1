/// Capital allocation steps: (equity growth over reference, extra fraction of equity)
const CAPITAL_TIERS: [(f64, f64); 3] = [(1.00, 0.15), (0.50, 0.10), (0.20, 0.05)];

/// Fraction of equity to allocate to an entry.
///
/// Starts at `base_pct` and steps up as equity grows past `reference_capital`
/// (+5% at +20%, +10% at +50%, +15% at +100%), never above `max_pct`.
///
/// # Example
/// ```
/// use perpbot::strategy::sizing::tiered_capital_pct;
///
/// // 50% above reference: 0.35 + 0.10
/// let pct = tiered_capital_pct(0.35, 0.50, 750.0, Some(500.0));
/// assert!((pct - 0.45).abs() < 1e-12);
/// ```
pub fn tiered_capital_pct(
    base_pct: f64,
    max_pct: f64,
    equity: f64,
    reference_capital: Option<f64>,
) -> f64 {
    let bonus = match reference_capital {
        Some(reference) if reference > 0.0 => {
            let growth = (equity - reference) / reference;
            CAPITAL_TIERS
                .iter()
                .find(|(threshold, _)| growth >= *threshold)
                .map(|(_, extra)| *extra)
                .unwrap_or(0.0)
        }
        _ => 0.0,
    };

    (base_pct + bonus).min(max_pct)
}

/// Base-asset quantity for a leveraged entry, floored to the exchange size step
pub fn order_quantity(equity: f64, pct: f64, leverage: u32, price: f64, size_step: f64) -> f64 {
    if price <= 0.0 || equity <= 0.0 || pct <= 0.0 {
        return 0.0;
    }
    let raw = equity * pct * leverage as f64 / price;
    floor_to_step(raw, size_step)
}

/// Floor `value` to a multiple of `step`, tolerating float noise just below a step
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let steps = (value / step + 1e-9).floor();
    // Strip representation noise such as 0.030000000000000002
    (steps * step * 1e8).round() / 1e8
}
