use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::application::analyzer::{AnalysisResult, ChartAnalyzer};
use crate::domain::market::candle::{Candle, VisibleRange};
use crate::domain::market::timeframe::Timeframe;
use crate::domain::ports::CandleSource;
use crate::infrastructure::cache::CacheStats;

/// Bars generated before the visible window so indicators have lookback.
const WARMUP_BARS: i64 = 100;

/// Deterministic random-walk candle source for demos and tests.
///
/// The same (seed, symbol, timeframe, range) always yields the same
/// series; different symbols walk independently.
pub struct SyntheticSource {
    seed: u64,
    volatility_pct: f64,
}

impl SyntheticSource {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            volatility_pct: 0.5,
        }
    }

    /// Per-bar close-to-close variance, as a percentage.
    pub fn with_volatility(mut self, volatility_pct: f64) -> Self {
        self.volatility_pct = volatility_pct.max(0.01);
        self
    }

    fn base_price(symbol: &str) -> f64 {
        if symbol.contains("BTC") {
            96_000.0
        } else if symbol.contains("ETH") {
            3_400.0
        } else if symbol.contains("JPY") {
            155.0
        } else if symbol.contains("USD") {
            1.08
        } else {
            150.0
        }
    }

    fn walk_seed(&self, symbol: &str, timeframe: Timeframe) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        symbol.hash(&mut hasher);
        timeframe.hash(&mut hasher);
        hasher.finish()
    }
}

impl CandleSource for SyntheticSource {
    fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &VisibleRange,
    ) -> Result<Vec<Candle>> {
        let step = timeframe.to_seconds();
        let start = range.from_ts - WARMUP_BARS * step;
        let mut rng = StdRng::seed_from_u64(self.walk_seed(symbol, timeframe));
        let mut price = Self::base_price(symbol);
        let mut candles = Vec::new();

        let mut ts = start;
        while ts <= range.to_ts {
            let drift = rng.random_range(-self.volatility_pct..self.volatility_pct) / 100.0;
            let open = price;
            let close = open * (1.0 + drift);
            let wick = open.max(close) * rng.random_range(0.0..self.volatility_pct) / 200.0;
            let high = open.max(close) + wick;
            let low = (open.min(close) - wick).max(0.0);
            let volume = rng.random_range(500.0..5_000.0);
            candles.push(Candle::new(ts, open, high, low, close, volume));
            price = close;
            ts += step;
        }

        debug!(
            "SyntheticSource: Generated {} {} candles for {}",
            candles.len(),
            timeframe,
            symbol
        );
        Ok(candles)
    }
}

/// Wraps another analyzer and counts how often each entry point runs.
/// Used by runner tests to tell full analyses from incremental ones.
pub struct CountingAnalyzer {
    inner: Arc<dyn ChartAnalyzer>,
    full_calls: AtomicUsize,
    incremental_calls: AtomicUsize,
}

impl CountingAnalyzer {
    pub fn wrap(inner: Arc<dyn ChartAnalyzer>) -> Self {
        Self {
            inner,
            full_calls: AtomicUsize::new(0),
            incremental_calls: AtomicUsize::new(0),
        }
    }

    pub fn full_calls(&self) -> usize {
        self.full_calls.load(Ordering::SeqCst)
    }

    pub fn incremental_calls(&self) -> usize {
        self.incremental_calls.load(Ordering::SeqCst)
    }
}

impl ChartAnalyzer for CountingAnalyzer {
    fn analyze(
        &self,
        range: VisibleRange,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Arc<AnalysisResult>> {
        self.full_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.analyze(range, symbol, timeframe)
    }

    fn analyze_with_candles(
        &self,
        range: VisibleRange,
        symbol: &str,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    ) -> Result<Arc<AnalysisResult>> {
        self.incremental_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .analyze_with_candles(range, symbol, timeframe, candles)
    }

    fn cache_stats(&self) -> Option<CacheStats> {
        self.inner.cache_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hour_range() -> VisibleRange {
        VisibleRange::new(3_600_000, 3_603_600)
    }

    #[test]
    fn test_same_seed_reproduces_series() {
        let source = SyntheticSource::new(42);
        let first = source
            .fetch("EURUSD", Timeframe::OneMin, &one_hour_range())
            .unwrap();
        let second = source
            .fetch("EURUSD", Timeframe::OneMin, &one_hour_range())
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_symbols_walk_independently() {
        let source = SyntheticSource::new(42);
        let eur = source
            .fetch("EURUSD", Timeframe::OneMin, &one_hour_range())
            .unwrap();
        let btc = source
            .fetch("BTCUSDT", Timeframe::OneMin, &one_hour_range())
            .unwrap();
        assert_ne!(eur[0].close, btc[0].close);
    }

    #[test]
    fn test_series_includes_warmup_and_is_well_formed() {
        let source = SyntheticSource::new(7);
        let range = one_hour_range();
        let candles = source.fetch("EURUSD", Timeframe::OneMin, &range).unwrap();

        // 100 warmup bars plus the 61 in-window ones
        assert_eq!(candles.len(), 161);
        assert_eq!(candles[0].timestamp, range.from_ts - 100 * 60);
        assert_eq!(candles.last().unwrap().timestamp, range.to_ts);
        for candle in &candles {
            assert!(candle.high >= candle.open.max(candle.close));
            assert!(candle.low <= candle.open.min(candle.close));
            assert!(candle.volume > 0.0);
        }
        for pair in candles.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, 60);
        }
    }

    #[test]
    fn test_counting_analyzer_delegates_and_counts() {
        struct NullAnalyzer;

        impl ChartAnalyzer for NullAnalyzer {
            fn analyze(
                &self,
                range: VisibleRange,
                symbol: &str,
                timeframe: Timeframe,
            ) -> Result<Arc<AnalysisResult>> {
                self.analyze_with_candles(range, symbol, timeframe, Vec::new())
            }

            fn analyze_with_candles(
                &self,
                range: VisibleRange,
                symbol: &str,
                timeframe: Timeframe,
                candles: Vec<Candle>,
            ) -> Result<Arc<AnalysisResult>> {
                use crate::application::trading::trade_filter::FilterStats;
                use crate::domain::market::regime::{MarketRegime, RegimeSnapshot};

                Ok(Arc::new(AnalysisResult {
                    symbol: symbol.to_string(),
                    timeframe,
                    range,
                    regime: RegimeSnapshot::new(MarketRegime::Unknown, 0.0, 0.0, 0.0),
                    entries: Vec::new(),
                    candles,
                    best_set: None,
                    validation: None,
                    filter_stats: FilterStats::default(),
                    elapsed_ms: 0.0,
                }))
            }
        }

        let counting = CountingAnalyzer::wrap(Arc::new(NullAnalyzer));
        let range = one_hour_range();

        counting.analyze(range, "EURUSD", Timeframe::OneMin).unwrap();
        counting
            .analyze_with_candles(range, "EURUSD", Timeframe::OneMin, Vec::new())
            .unwrap();
        counting.analyze(range, "EURUSD", Timeframe::OneMin).unwrap();

        assert_eq!(counting.full_calls(), 2);
        // the null analyzer's internal delegation does not count
        assert_eq!(counting.incremental_calls(), 1);
        assert!(counting.cache_stats().is_none());
    }
}
