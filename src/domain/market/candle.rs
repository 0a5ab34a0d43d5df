use serde::{Deserialize, Serialize};

use crate::domain::errors::DataError;

/// A single OHLCV bar, timestamped in epoch seconds.
///
/// Prices are plain `f64`: the engine only ever derives ratio statistics
/// (R-multiples, win rates, score blends) from them and performs no
/// monetary accounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Bid/ask spread at bar close, when the feed provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            spread: None,
        }
    }

    /// True range against the previous bar's close.
    pub fn true_range(&self, prev_close: f64) -> f64 {
        (self.high - self.low)
            .max((self.high - prev_close).abs())
            .max((self.low - prev_close).abs())
    }
}

/// The chart window under analysis, in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisibleRange {
    pub from_ts: i64,
    pub to_ts: i64,
}

impl VisibleRange {
    pub fn new(from_ts: i64, to_ts: i64) -> Self {
        Self { from_ts, to_ts }
    }

    pub fn duration_secs(&self) -> i64 {
        self.to_ts - self.from_ts
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.from_ts && ts <= self.to_ts
    }
}

/// Checks the series invariants the engine relies on: strictly ascending
/// unique timestamps, finite prices and `high >= low` per bar.
///
/// Called once where candles enter the system (CSV loader, data port);
/// everything downstream assumes a validated series.
pub fn validate_series(symbol: &str, candles: &[Candle]) -> Result<(), DataError> {
    if candles.is_empty() {
        return Err(DataError::EmptySeries {
            symbol: symbol.to_string(),
        });
    }

    for (i, candle) in candles.iter().enumerate() {
        let prices_finite = candle.open.is_finite()
            && candle.high.is_finite()
            && candle.low.is_finite()
            && candle.close.is_finite();
        if !prices_finite {
            return Err(DataError::InvalidSeries {
                symbol: symbol.to_string(),
                reason: format!("non-finite price at index {}", i),
            });
        }
        if candle.high < candle.low {
            return Err(DataError::InvalidSeries {
                symbol: symbol.to_string(),
                reason: format!("high below low at index {}", i),
            });
        }
        if i > 0 && candle.timestamp <= candles[i - 1].timestamp {
            return Err(DataError::InvalidSeries {
                symbol: symbol.to_string(),
                reason: format!("non-ascending timestamp at index {}", i),
            });
        }
    }

    Ok(())
}
