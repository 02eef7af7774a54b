//! CSV bar ingestion.
//!
//! Expected header: `timestamp,symbol,open,high,low,close,volume`.
//! Timestamps must carry an offset; naive timestamps are rejected.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use crate::db::Store;
use crate::metrics::average_true_range;
use crate::models::Bar;

/// Bars loaded per symbol when refreshing the ATR cache, in ATR periods.
const ATR_HISTORY_PERIODS: usize = 5;

#[derive(Debug, Deserialize)]
struct BarRecord {
    timestamp: String,
    symbol: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

/// Result of an ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub bars: usize,
    pub symbols: usize,
    /// Symbols whose ATR was refreshed.
    pub atr_updates: usize,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z"))
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("timestamp {:?} is not timezone-aware RFC 3339", raw))
}

/// Parse and validate bars from CSV, sorted by (symbol, timestamp).
pub fn parse_bars<R: Read>(reader: R) -> Result<Vec<Bar>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut bars = Vec::new();

    for (index, result) in rdr.deserialize::<BarRecord>().enumerate() {
        // Header is line 1
        let line = index + 2;
        let record = result.with_context(|| format!("invalid bar on line {}", line))?;
        let timestamp =
            parse_timestamp(&record.timestamp).with_context(|| format!("line {}", line))?;

        if record.symbol.is_empty() {
            bail!("line {}: empty symbol", line);
        }
        if record.high < record.low {
            bail!(
                "line {}: high {} below low {} for {}",
                line,
                record.high,
                record.low,
                record.symbol
            );
        }
        if record.close <= Decimal::ZERO {
            bail!("line {}: non-positive close {} for {}", line, record.close, record.symbol);
        }

        bars.push(Bar {
            timestamp,
            symbol: record.symbol,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
        });
    }

    bars.sort_by(|a, b| {
        a.symbol
            .cmp(&b.symbol)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
    Ok(bars)
}

/// Load bars from a CSV file.
pub fn load_bars_csv(path: &Path) -> Result<Vec<Bar>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open bar file {}", path.display()))?;
    parse_bars(file).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Store bars and refresh the ATR cache of every touched symbol.
pub async fn ingest_bars(store: &dyn Store, bars: &[Bar], atr_period: usize) -> Result<IngestReport> {
    let inserted = store.insert_bars(bars).await?;
    let symbols: BTreeSet<&str> = bars.iter().map(|b| b.symbol.as_str()).collect();

    let history = atr_period.saturating_mul(ATR_HISTORY_PERIODS).max(atr_period + 1);
    let mut atr_updates = 0;
    for symbol in &symbols {
        let recent = store.recent_bars(symbol, history).await?;
        let (Some(atr), Some(last)) = (average_true_range(&recent, atr_period), recent.last()) else {
            debug!(symbol, bars = recent.len(), "Not enough bars for ATR");
            continue;
        };
        store.record_atr(symbol, last.timestamp, atr).await?;
        atr_updates += 1;
    }

    let report = IngestReport {
        bars: inserted,
        symbols: symbols.len(),
        atr_updates,
    };
    info!(
        bars = report.bars,
        symbols = report.symbols,
        atr_updates = report.atr_updates,
        "Bars ingested"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use rust_decimal_macros::dec;

    const CSV: &str = "\
timestamp,symbol,open,high,low,close,volume
2024-03-01T14:31:00Z,MSFT,400,401,399,400.5,1000
2024-03-01T14:30:00+00:00,AAPL,100,101,99,100.5,500
2024-03-01T14:31:00Z,AAPL,100.5,102,100,101.5,600
2024-03-01 14:32:00+00:00,AAPL,101.5,103,101,102,700
";

    #[test]
    fn test_parse_sorts_by_symbol_and_time() {
        let bars = parse_bars(CSV.as_bytes()).unwrap();
        assert_eq!(bars.len(), 4);
        let order: Vec<(&str, Decimal)> = bars.iter().map(|b| (b.symbol.as_str(), b.close)).collect();
        assert_eq!(
            order,
            vec![
                ("AAPL", dec!(100.5)),
                ("AAPL", dec!(101.5)),
                ("AAPL", dec!(102)),
                ("MSFT", dec!(400.5)),
            ]
        );
    }

    #[test]
    fn test_rejects_naive_timestamp() {
        let csv = "timestamp,symbol,open,high,low,close,volume\n2024-03-01T14:30:00,AAPL,1,2,1,1.5,10\n";
        let err = parse_bars(csv.as_bytes()).unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[test]
    fn test_rejects_inconsistent_bars() {
        let inverted = "timestamp,symbol,open,high,low,close,volume\n2024-03-01T14:30:00Z,AAPL,1,1,2,1.5,10\n";
        assert!(parse_bars(inverted.as_bytes()).is_err());

        let zero_close = "timestamp,symbol,open,high,low,close,volume\n2024-03-01T14:30:00Z,AAPL,1,2,1,0,10\n";
        assert!(parse_bars(zero_close.as_bytes()).is_err());
    }

    #[tokio::test]
    async fn test_ingest_refreshes_atr() {
        let store = MemoryStore::new();
        let bars = parse_bars(CSV.as_bytes()).unwrap();

        let report = ingest_bars(&store, &bars, 2).await.unwrap();
        assert_eq!(report.bars, 4);
        assert_eq!(report.symbols, 2);
        // MSFT has a single bar
        assert_eq!(report.atr_updates, 1);

        // TRs: 2, 2, 2 -> ATR(2) = 2
        assert_eq!(store.latest_atr("AAPL").await.unwrap(), Some(dec!(2)));
        assert_eq!(store.latest_atr("MSFT").await.unwrap(), None);
    }
}
