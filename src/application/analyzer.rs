use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::application::optimization::optimizer::{FastOptimizer, OptimizerConfig};
use crate::application::optimization::signals::generate_entries;
use crate::application::optimization::simulator::compute_atr;
use crate::application::trading::trade_filter::{FilterConfig, FilterStats, TradeFilter};
use crate::application::validation::walk_forward::{
    ValidationConfig, ValidationResult, WalkForwardValidator,
};
use crate::domain::indicators::{IndicatorSet, StopConfig, default_set};
use crate::domain::market::candle::{Candle, VisibleRange};
use crate::domain::market::features::FeatureSeries;
use crate::domain::market::regime::{RegimeDetector, RegimeSnapshot};
use crate::domain::market::timeframe::Timeframe;
use crate::domain::ports::CandleSource;
use crate::infrastructure::cache::{AnalyzerCache, CacheStats, Fingerprint};

/// Everything one analysis pass produced for a chart window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub range: VisibleRange,
    pub regime: RegimeSnapshot,
    /// Filtered entries in ascending timestamp order.
    pub entries: Vec<crate::domain::trading::types::EntryEvent>,
    pub candles: Vec<Candle>,
    /// The optimizer's winning set; `None` when optimization was disabled
    /// or found no candidate worth keeping.
    pub best_set: Option<IndicatorSet>,
    pub validation: Option<ValidationResult>,
    pub filter_stats: FilterStats,
    pub elapsed_ms: f64,
}

/// The analysis seam the runner schedules work through; a counting test
/// double stands in for the real analyzer in runner tests.
pub trait ChartAnalyzer: Send + Sync {
    fn analyze(
        &self,
        range: VisibleRange,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Arc<AnalysisResult>>;

    fn analyze_with_candles(
        &self,
        range: VisibleRange,
        symbol: &str,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    ) -> Result<Arc<AnalysisResult>>;

    /// Result-cache counters, for metrics reporting. `None` when the
    /// implementation does not cache.
    fn cache_stats(&self) -> Option<CacheStats> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// When false, entries come from the catalog defaults and no
    /// walk-forward validation runs.
    pub use_optimizer: bool,
    pub validation: ValidationConfig,
    pub filter: FilterConfig,
    pub optimizer: OptimizerConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            use_optimizer: true,
            validation: ValidationConfig::default(),
            filter: FilterConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// Runs the full pipeline for a visible chart window: regime detection,
/// parameter search, walk-forward validation and entry filtering, with
/// results cached by fingerprint so repeated requests for an unchanged
/// window cost one lookup.
pub struct VisibleChartAnalyzer {
    source: Arc<dyn CandleSource>,
    cache: Arc<AnalyzerCache<AnalysisResult>>,
    config: AnalyzerConfig,
    detector: RegimeDetector,
    validator: WalkForwardValidator,
    optimizer: FastOptimizer,
}

impl VisibleChartAnalyzer {
    pub fn new(
        source: Arc<dyn CandleSource>,
        cache: Arc<AnalyzerCache<AnalysisResult>>,
        config: AnalyzerConfig,
    ) -> Self {
        let validator = WalkForwardValidator::new(config.validation.clone())
            .with_optimizer(FastOptimizer::new(config.optimizer));
        let optimizer = FastOptimizer::new(config.optimizer);
        Self {
            source,
            cache,
            config,
            detector: RegimeDetector::default(),
            validator,
            optimizer,
        }
    }

    pub fn cache(&self) -> &Arc<AnalyzerCache<AnalysisResult>> {
        &self.cache
    }

    fn run_analysis(
        &self,
        range: VisibleRange,
        symbol: &str,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    ) -> Result<AnalysisResult> {
        let started = Instant::now();
        let snapshot = self.detector.detect(&candles);
        let features = compute_features(&candles);

        let (raw_entries, best_set, validation) = if self.config.use_optimizer {
            let validation =
                self.validator
                    .validate(&candles, snapshot.regime, Some(&features));
            let seed = self
                .config
                .validation
                .seed
                .unwrap_or_else(|| rand::rng().random());
            let mut rng = StdRng::seed_from_u64(seed);
            let optimized =
                self.optimizer
                    .optimize(&candles, snapshot.regime, Some(&features), &mut rng);
            match optimized.best_set {
                Some(set) => (optimized.entries, Some(set), Some(validation)),
                None => {
                    debug!(
                        "Analyzer: No candidate validated for {}, falling back to defaults",
                        symbol
                    );
                    let set = default_set();
                    (generate_entries(&set, &candles), None, Some(validation))
                }
            }
        } else {
            let set = default_set();
            (generate_entries(&set, &candles), None, None)
        };

        let spreads = spread_series(&candles);
        let mut filter = TradeFilter::new(self.config.filter.clone());
        let entries = filter.filter_entries(raw_entries, &candles, spreads.as_deref());
        let filter_stats = filter.stats().clone();

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            "Analyzer: {} {} [{} bars] -> {} entries ({} regime) in {:.0}ms",
            symbol,
            timeframe,
            candles.len(),
            entries.len(),
            snapshot.regime,
            elapsed_ms
        );

        Ok(AnalysisResult {
            symbol: symbol.to_string(),
            timeframe,
            range,
            regime: snapshot,
            entries,
            candles,
            best_set,
            validation,
            filter_stats,
            elapsed_ms,
        })
    }

    /// Folds every semantics-affecting knob into the cache key.
    fn config_digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.config.use_optimizer.hash(&mut hasher);
        self.config.optimizer.min_trades.hash(&mut hasher);
        self.config.optimizer.max_candidates.hash(&mut hasher);
        if let Ok(json) = serde_json::to_string(&(&self.config.validation, &self.config.filter)) {
            json.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl ChartAnalyzer for VisibleChartAnalyzer {
    fn analyze(
        &self,
        range: VisibleRange,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Arc<AnalysisResult>> {
        let candles = self
            .source
            .fetch(symbol, timeframe, &range)
            .with_context(|| format!("Fetching {} {} candles", symbol, timeframe))?;
        self.analyze_with_candles(range, symbol, timeframe, candles)
    }

    fn analyze_with_candles(
        &self,
        range: VisibleRange,
        symbol: &str,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    ) -> Result<Arc<AnalysisResult>> {
        let fingerprint =
            Fingerprint::compute(symbol, timeframe, &range, self.config_digest(), &candles);
        self.cache.get_or_compute(fingerprint, || {
            self.run_analysis(range, symbol, timeframe, candles)
        })
    }

    fn cache_stats(&self) -> Option<CacheStats> {
        Some(self.cache.stats())
    }
}

/// Precomputes the per-bar columns the optimizer, simulator and validator
/// share; currently the stop-placement ATR.
pub fn compute_features(candles: &[Candle]) -> FeatureSeries {
    let mut features = FeatureSeries::new(candles.len());
    let atr = compute_atr(candles, StopConfig::default().atr_period);
    if let Err(error) = features.insert(FeatureSeries::ATR, atr) {
        warn!("Analyzer: Dropping ATR feature column: {:#}", error);
    }
    features
}

/// The filter's spread input; only available when every bar carries one.
fn spread_series(candles: &[Candle]) -> Option<Vec<f64>> {
    candles.iter().map(|candle| candle.spread).collect()
}
