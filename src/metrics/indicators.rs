//! Volatility indicators over bar and close series.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::Bar;

/// Average True Range with Wilder smoothing.
///
/// Bars must belong to one symbol and be sorted by time. The seed is the
/// mean of the first `period` true ranges. Returns `None` when fewer than
/// `period` bars are available.
pub fn average_true_range(bars: &[Bar], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period {
        return None;
    }

    let mut prev_close = None;
    let ranges: Vec<Decimal> = bars
        .iter()
        .map(|bar| {
            let tr = bar.true_range(prev_close);
            prev_close = Some(bar.close);
            tr
        })
        .collect();

    let n = Decimal::from(period as u64);
    let seed = ranges[..period].iter().copied().sum::<Decimal>() / n;

    let atr = ranges[period..]
        .iter()
        .fold(seed, |atr, tr| (atr * (n - Decimal::ONE) + *tr) / n);

    Some(atr)
}

/// Annualized volatility: sample std of log returns times sqrt(periods per year).
///
/// Needs at least three positive closes (two returns).
pub fn annualized_volatility(closes: &[Decimal], periods_per_year: u32) -> Option<f64> {
    let prices: Vec<f64> = closes
        .iter()
        .filter(|c| **c > Decimal::ZERO)
        .filter_map(|c| c.to_f64())
        .collect();

    let returns: Vec<f64> = prices.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    if returns.len() < 2 {
        return None;
    }

    let std_dev = returns.iter().std_dev();
    if !std_dev.is_finite() {
        return None;
    }
    Some(std_dev * f64::from(periods_per_year).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn bars(ranges: &[(Decimal, Decimal, Decimal)]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ranges
            .iter()
            .enumerate()
            .map(|(i, (high, low, close))| Bar {
                timestamp: start + Duration::days(i as i64),
                symbol: "SPY".to_string(),
                open: *close,
                high: *high,
                low: *low,
                close: *close,
                volume: dec!(100),
            })
            .collect()
    }

    #[test]
    fn test_atr_seed_and_smoothing() {
        let series = bars(&[
            (dec!(11), dec!(9), dec!(10)),
            (dec!(12), dec!(10), dec!(11)),
            (dec!(13), dec!(11), dec!(12)),
        ]);
        // Seed over two ranges of 2, then a third range of 2
        assert_eq!(average_true_range(&series, 2), Some(dec!(2)));
        assert_eq!(average_true_range(&series, 4), None);

        let gap = bars(&[
            (dec!(11), dec!(9), dec!(10)),
            (dec!(11), dec!(9), dec!(10)),
            (dec!(21), dec!(19), dec!(20)),
        ]);
        // Third true range is 21 - 10 = 11: (2 * 1 + 11) / 2
        assert_eq!(average_true_range(&gap, 2), Some(dec!(6.5)));
    }

    #[test]
    fn test_annualized_volatility() {
        assert_eq!(annualized_volatility(&[dec!(100), dec!(101)], 252), None);

        let flat = annualized_volatility(&[dec!(100), dec!(100), dec!(100)], 252).unwrap();
        assert_eq!(flat, 0.0);

        let vol = annualized_volatility(&[dec!(100), dec!(102), dec!(99), dec!(103)], 252).unwrap();
        assert!(vol > 0.0);
    }
}
