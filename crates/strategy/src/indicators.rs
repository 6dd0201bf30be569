use fx_engine_core::events::Bar;
use rust_decimal::Decimal;

/// Simple moving average of the closes in `bars[..end]` over `period`.
///
/// Returns `None` when fewer than `period` bars are available.
#[must_use]
pub fn sma(bars: &[Bar], end: usize, period: usize) -> Option<Decimal> {
    if period == 0 || end > bars.len() || end < period {
        return None;
    }
    let sum: Decimal = bars[end - period..end].iter().map(|b| b.close).sum();
    Some(sum / Decimal::from(period))
}

/// Average true range over the last `period` bars.
#[must_use]
pub fn atr(bars: &[Bar], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let window = &bars[bars.len() - period - 1..];
    let sum: Decimal = window
        .windows(2)
        .map(|pair| {
            let (prev, bar) = (&pair[0], &pair[1]);
            (bar.high - bar.low)
                .max((bar.high - prev.close).abs())
                .max((bar.low - prev.close).abs())
        })
        .sum();
    Some(sum / Decimal::from(period))
}
