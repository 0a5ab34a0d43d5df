use thiserror::Error;

/// Errors raised at the data-ingestion boundary.
///
/// The analysis core assumes validated candle series; anything that would
/// make a series unusable is rejected here, before engine code runs.
/// Validation verdicts, skipped folds and filtered entries are ordinary
/// result data, never errors.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Invalid candle series for {symbol}: {reason}")]
    InvalidSeries { symbol: String, reason: String },

    #[error("Empty candle series for {symbol}")]
    EmptySeries { symbol: String },

    #[error("Malformed candle row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_series_formatting() {
        let err = DataError::InvalidSeries {
            symbol: "EURUSD".to_string(),
            reason: "non-ascending timestamp at index 3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid candle series for EURUSD: non-ascending timestamp at index 3"
        );
    }

    #[test]
    fn test_empty_series_formatting() {
        let err = DataError::EmptySeries {
            symbol: "BTC/USD".to_string(),
        };
        assert_eq!(err.to_string(), "Empty candle series for BTC/USD");
    }

    #[test]
    fn test_malformed_row_formatting() {
        let err = DataError::MalformedRow {
            row: 17,
            reason: "volume is not a number".to_string(),
        };
        assert_eq!(err.to_string(), "Malformed candle row 17: volume is not a number");
    }
}
