use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info};

use crate::domain::errors::DataError;
use crate::domain::market::candle::{Candle, VisibleRange, validate_series};
use crate::domain::market::timeframe::Timeframe;
use crate::domain::ports::CandleSource;

/// One CSV row: `timestamp,open,high,low,close,volume[,spread]`.
#[derive(Debug, Deserialize)]
struct CandleRecord {
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default)]
    spread: Option<f64>,
}

impl From<CandleRecord> for Candle {
    fn from(record: CandleRecord) -> Self {
        Candle {
            timestamp: record.timestamp,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
            spread: record.spread,
        }
    }
}

/// Parse candle rows from CSV text. Shape problems become
/// `DataError::MalformedRow`; series-level checks happen in
/// [`load_candles`].
pub fn parse_candles<R: Read>(reader: R) -> Result<Vec<Candle>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut candles = Vec::new();
    for (idx, record) in csv_reader.deserialize::<CandleRecord>().enumerate() {
        let record = record.map_err(|error| {
            // line 1 is the header
            let row = error
                .position()
                .map_or(idx + 2, |position| position.line() as usize);
            DataError::MalformedRow {
                row,
                reason: error.to_string(),
            }
        })?;
        candles.push(Candle::from(record));
    }
    Ok(candles)
}

/// Load a candle series from a CSV file and validate it for the engine.
pub fn load_candles(path: &Path, symbol: &str) -> Result<Vec<Candle>> {
    let file = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
    let candles =
        parse_candles(file).with_context(|| format!("Parsing {}", path.display()))?;
    validate_series(symbol, &candles)?;
    info!(
        "Data: Loaded {} candles for {} from {}",
        candles.len(),
        symbol,
        path.display()
    );
    Ok(candles)
}

/// Candle source backed by a pre-validated in-memory series.
///
/// `fetch` serves the requested window together with all preceding
/// history, so indicator warmup never truncates at the window edge.
#[derive(Debug)]
pub struct CsvSource {
    symbol: String,
    candles: Vec<Candle>,
}

impl CsvSource {
    pub fn from_path(path: &Path, symbol: &str) -> Result<Self> {
        let candles = load_candles(path, symbol)?;
        Ok(Self {
            symbol: symbol.to_string(),
            candles,
        })
    }

    pub fn new(symbol: &str, candles: Vec<Candle>) -> Result<Self> {
        validate_series(symbol, &candles)?;
        Ok(Self {
            symbol: symbol.to_string(),
            candles,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Range spanning the whole loaded series.
    pub fn full_range(&self) -> VisibleRange {
        let from_ts = self.candles.first().map_or(0, |c| c.timestamp);
        let to_ts = self.candles.last().map_or(0, |c| c.timestamp);
        VisibleRange::new(from_ts, to_ts)
    }
}

impl CandleSource for CsvSource {
    fn fetch(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        range: &VisibleRange,
    ) -> Result<Vec<Candle>> {
        if symbol != self.symbol {
            bail!("CsvSource holds {}, not {}", self.symbol, symbol);
        }
        let window: Vec<Candle> = self
            .candles
            .iter()
            .copied()
            .take_while(|c| c.timestamp <= range.to_ts)
            .collect();
        debug!(
            "Data: Serving {} candles up to {} for {}",
            window.len(),
            range.to_ts,
            symbol
        );
        Ok(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const PLAIN: &str = "\
timestamp,open,high,low,close,volume
60,1.1000,1.1010,1.0990,1.1005,1500
120,1.1005,1.1015,1.1000,1.1010,1800
180,1.1010,1.1012,1.0995,1.1001,900
";

    const WITH_SPREAD: &str = "\
timestamp,open,high,low,close,volume,spread
60,1.1000,1.1010,1.0990,1.1005,1500,0.0002
120,1.1005,1.1015,1.1000,1.1010,1800,0.0003
";

    #[test]
    fn test_parse_plain_rows() {
        let candles = parse_candles(Cursor::new(PLAIN)).unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].timestamp, 60);
        assert!((candles[1].close - 1.1010).abs() < 1e-9);
        assert!(candles.iter().all(|c| c.spread.is_none()));
    }

    #[test]
    fn test_parse_spread_column() {
        let candles = parse_candles(Cursor::new(WITH_SPREAD)).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].spread, Some(0.0002));
        assert_eq!(candles[1].spread, Some(0.0003));
    }

    #[test]
    fn test_parse_rejects_non_numeric_volume() {
        let text = "timestamp,open,high,low,close,volume\n60,1.0,1.1,0.9,1.0,lots\n";
        let error = parse_candles(Cursor::new(text)).unwrap_err();
        let message = format!("{:#}", error);
        assert!(message.contains("Malformed candle row 2"), "{}", message);
    }

    #[test]
    fn test_parse_rejects_short_row() {
        let text = "timestamp,open,high,low,close,volume\n60,1.0,1.1\n";
        let error = parse_candles(Cursor::new(text)).unwrap_err();
        assert!(format!("{:#}", error).contains("Malformed candle row"));
    }

    #[test]
    fn test_source_rejects_unvalidated_series() {
        let descending = vec![
            Candle::new(120, 1.0, 1.1, 0.9, 1.0, 100.0),
            Candle::new(60, 1.0, 1.1, 0.9, 1.0, 100.0),
        ];
        let error = CsvSource::new("EURUSD", descending).unwrap_err();
        assert!(format!("{:#}", error).contains("non-ascending timestamp"));
    }

    #[test]
    fn test_fetch_includes_history_and_clips_tail() {
        let candles: Vec<Candle> = (1..=10)
            .map(|i| Candle::new(i * 60, 1.0, 1.1, 0.9, 1.0, 100.0))
            .collect();
        let source = CsvSource::new("EURUSD", candles).unwrap();

        let window = source
            .fetch("EURUSD", Timeframe::OneMin, &VisibleRange::new(300, 480))
            .unwrap();
        // everything before the window is kept for warmup, after it dropped
        assert_eq!(window.first().unwrap().timestamp, 60);
        assert_eq!(window.last().unwrap().timestamp, 480);
        assert_eq!(window.len(), 8);
    }

    #[test]
    fn test_fetch_checks_symbol() {
        let candles = vec![Candle::new(60, 1.0, 1.1, 0.9, 1.0, 100.0)];
        let source = CsvSource::new("EURUSD", candles).unwrap();
        assert!(
            source
                .fetch("GBPUSD", Timeframe::OneMin, &VisibleRange::new(0, 600))
                .is_err()
        );
    }

    #[test]
    fn test_full_range_spans_series() {
        let candles: Vec<Candle> = (1..=5)
            .map(|i| Candle::new(i * 60, 1.0, 1.1, 0.9, 1.0, 100.0))
            .collect();
        let source = CsvSource::new("EURUSD", candles).unwrap();
        assert_eq!(source.full_range(), VisibleRange::new(60, 300));
    }
}
