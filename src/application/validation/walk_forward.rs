use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::application::optimization::objective::ObjectiveFunction;
use crate::application::optimization::optimizer::FastOptimizer;
use crate::application::optimization::simulator::TradeSimulator;
use crate::domain::indicators::IndicatorSet;
use crate::domain::market::candle::Candle;
use crate::domain::market::features::FeatureSeries;
use crate::domain::market::regime::MarketRegime;
use crate::domain::trading::types::EntryEvent;

/// A fold counts as overfit on its own when train looks more than twice as
/// good as test.
const FOLD_OVERFIT_RATIO: f64 = 2.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub n_folds: usize,
    /// Fraction of the series reserved for training; the rest is tiled into
    /// test windows.
    pub train_ratio: f64,
    /// Bars dropped between train and test so indicator lookback windows
    /// cannot straddle the boundary.
    pub embargo_bars: usize,
    pub min_train_bars: usize,
    pub min_test_bars: usize,
    /// Fixed seed for reproducible runs; drawn at random when unset and
    /// recorded in the result either way.
    pub seed: Option<u64>,
    pub require_positive_oos: bool,
    pub max_train_test_ratio: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            n_folds: 3,
            train_ratio: 0.7,
            embargo_bars: 5,
            min_train_bars: 50,
            min_test_bars: 20,
            seed: None,
            require_positive_oos: true,
            max_train_test_ratio: 2.0,
        }
    }
}

/// One train/test split and everything measured on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldResult {
    pub fold_idx: usize,
    /// `[start, end)` bar indices into the validated series.
    pub train_range: (usize, usize),
    pub test_range: (usize, usize),
    pub train_score: f64,
    pub test_score: f64,
    pub train_trades: usize,
    pub test_trades: usize,
    pub train_win_rate: f64,
    pub test_win_rate: f64,
    pub train_profit_factor: f64,
    pub test_profit_factor: f64,
    /// Winning set from the training slice; `None` when no candidate
    /// validated (a legitimate, uninformative fold).
    pub best_set: Option<IndicatorSet>,
    pub optimize_ms: f64,
    pub test_entries: Vec<EntryEvent>,
}

impl FoldResult {
    fn empty(fold_idx: usize, train_range: (usize, usize), test_range: (usize, usize)) -> Self {
        Self {
            fold_idx,
            train_range,
            test_range,
            train_score: 0.0,
            test_score: 0.0,
            train_trades: 0,
            test_trades: 0,
            train_win_rate: 0.0,
            test_win_rate: 0.0,
            train_profit_factor: 0.0,
            test_profit_factor: 0.0,
            best_set: None,
            optimize_ms: 0.0,
            test_entries: Vec::new(),
        }
    }

    /// A fold is overfit when it has nothing to show out of sample, or when
    /// in-sample performance dwarfs it.
    pub fn is_overfit(&self) -> bool {
        self.test_score <= 0.0
            || (self.train_score > 0.0 && self.train_score / self.test_score > FOLD_OVERFIT_RATIO)
    }
}

/// Aggregate verdict over all folds. `is_valid` holds exactly when
/// `failure_reasons` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub failure_reasons: Vec<String>,
    pub folds: Vec<FoldResult>,
    pub mean_train_score: f64,
    pub mean_test_score: f64,
    /// Mean train/test ratio over folds with a positive test score;
    /// `+inf` when no fold has one.
    pub mean_train_test_ratio: f64,
    /// Trade-count-weighted across folds, so a 30-trade fold moves the
    /// aggregate three times as much as a 10-trade fold.
    pub oos_win_rate: f64,
    pub oos_profit_factor: f64,
    pub total_test_trades: usize,
    pub best_fold_idx: Option<usize>,
    /// Every test-slice entry across folds, ordered by timestamp.
    pub all_test_entries: Vec<EntryEvent>,
    pub seed_used: u64,
    pub total_time_ms: f64,
}

impl ValidationResult {
    fn failed(reasons: Vec<String>, seed_used: u64, total_time_ms: f64) -> Self {
        Self {
            is_valid: false,
            failure_reasons: reasons,
            folds: Vec::new(),
            mean_train_score: 0.0,
            mean_test_score: 0.0,
            mean_train_test_ratio: 0.0,
            oos_win_rate: 0.0,
            oos_profit_factor: 0.0,
            total_test_trades: 0,
            best_fold_idx: None,
            all_test_entries: Vec::new(),
            seed_used,
            total_time_ms,
        }
    }

    pub fn from_folds(
        folds: Vec<FoldResult>,
        config: &ValidationConfig,
        seed_used: u64,
        total_time_ms: f64,
    ) -> Self {
        let n = folds.len().max(1) as f64;
        let mean_train_score = folds.iter().map(|f| f.train_score).sum::<f64>() / n;
        let mean_test_score = folds.iter().map(|f| f.test_score).sum::<f64>() / n;

        let positive_test: Vec<f64> = folds
            .iter()
            .filter(|f| f.test_score > 0.0)
            .map(|f| f.train_score / f.test_score)
            .collect();
        let mean_train_test_ratio = if positive_test.is_empty() {
            f64::INFINITY
        } else {
            positive_test.iter().sum::<f64>() / positive_test.len() as f64
        };

        let total_test_trades: usize = folds.iter().map(|f| f.test_trades).sum();
        let (oos_win_rate, oos_profit_factor) = if total_test_trades > 0 {
            let weight = total_test_trades as f64;
            let win = folds
                .iter()
                .map(|f| f.test_win_rate * f.test_trades as f64)
                .sum::<f64>()
                / weight;
            let pf = folds
                .iter()
                .map(|f| f.test_profit_factor * f.test_trades as f64)
                .sum::<f64>()
                / weight;
            (win, pf)
        } else {
            (0.0, 0.0)
        };

        let mut best_fold_idx: Option<(usize, f64)> = None;
        for fold in &folds {
            if best_fold_idx.is_none_or(|(_, score)| fold.test_score > score) {
                best_fold_idx = Some((fold.fold_idx, fold.test_score));
            }
        }

        let mut all_test_entries: Vec<EntryEvent> =
            folds.iter().flat_map(|f| f.test_entries.clone()).collect();
        all_test_entries.sort_by_key(|entry| entry.timestamp);

        let mut failure_reasons = Vec::new();
        if config.require_positive_oos && mean_test_score <= 0.0 {
            failure_reasons.push(format!(
                "Mean OOS score {:.4} is not positive",
                mean_test_score
            ));
        }
        if mean_train_test_ratio > config.max_train_test_ratio {
            failure_reasons.push(format!(
                "Train/test ratio {:.2} exceeds {:.2}",
                mean_train_test_ratio, config.max_train_test_ratio
            ));
        }
        let overfit_folds = folds.iter().filter(|f| f.is_overfit()).count();
        if overfit_folds * 2 > folds.len() {
            failure_reasons.push(format!(
                "{} of {} folds look overfit",
                overfit_folds,
                folds.len()
            ));
        }
        // min_test_bars doubles as the OOS trade-count floor here. Different
        // unit, same field; kept for compatibility with existing configs.
        if total_test_trades < config.min_test_bars {
            failure_reasons.push(format!(
                "Only {} OOS trades, below the {} floor",
                total_test_trades, config.min_test_bars
            ));
        }

        Self {
            is_valid: failure_reasons.is_empty(),
            failure_reasons,
            folds,
            mean_train_score,
            mean_test_score,
            mean_train_test_ratio,
            oos_win_rate,
            oos_profit_factor,
            total_test_trades,
            best_fold_idx: best_fold_idx.map(|(idx, _)| idx),
            all_test_entries,
            seed_used,
            total_time_ms,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FoldSplit {
    fold_idx: usize,
    train: (usize, usize),
    test: (usize, usize),
}

/// Anchored walk-forward validation of the optimizer's selections.
///
/// Test windows are carved backward from the end of the series and tile the
/// most recent `1 - train_ratio` fraction; training always starts at bar 0
/// and stops `embargo_bars` short of the test window. Each fold optimizes on
/// its training slice only and replays the frozen winner on the test slice,
/// so no test bar can influence parameter choice.
pub struct WalkForwardValidator {
    config: ValidationConfig,
    optimizer: FastOptimizer,
}

impl WalkForwardValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            optimizer: FastOptimizer::default(),
        }
    }

    pub fn with_optimizer(mut self, optimizer: FastOptimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn validate(
        &self,
        candles: &[Candle],
        regime: MarketRegime,
        features: Option<&FeatureSeries>,
    ) -> ValidationResult {
        let started = Instant::now();
        let seed_used = self.config.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed_used);

        let required =
            self.config.min_train_bars + self.config.embargo_bars + self.config.min_test_bars;
        if candles.len() < required {
            return ValidationResult::failed(
                vec![format!(
                    "Insufficient data: {} < {} bars",
                    candles.len(),
                    required
                )],
                seed_used,
                elapsed_ms(started),
            );
        }

        let splits = self.build_fold_splits(candles.len());
        if splits.is_empty() {
            return ValidationResult::failed(
                vec!["Could not create valid fold splits".to_string()],
                seed_used,
                elapsed_ms(started),
            );
        }

        info!(
            "WalkForward: Validating {} bars over {} folds ({} regime, seed {})",
            candles.len(),
            splits.len(),
            regime,
            seed_used
        );

        let mut folds = Vec::with_capacity(splits.len());
        for split in splits {
            folds.push(self.run_fold(split, candles, regime, features, &mut rng));
        }

        let result = ValidationResult::from_folds(folds, &self.config, seed_used, elapsed_ms(started));
        if result.is_valid {
            info!(
                "WalkForward: PASS - mean OOS score {:.4}, {} OOS trades in {:.0}ms",
                result.mean_test_score, result.total_test_trades, result.total_time_ms
            );
        } else {
            info!(
                "WalkForward: FAIL - {} ({:.0}ms)",
                result.failure_reasons.join("; "),
                result.total_time_ms
            );
        }
        result
    }

    /// Carves `n_folds` test windows backward from the end. Fold 0 gets the
    /// most recent window; each later fold slides one window further back
    /// and trains on less data.
    fn build_fold_splits(&self, n_bars: usize) -> Vec<FoldSplit> {
        let total_test = (n_bars as f64 * (1.0 - self.config.train_ratio)).floor() as usize;
        let mut splits = Vec::new();
        let mut test_end = n_bars;
        let mut allocated = 0usize;

        for fold_idx in 0..self.config.n_folds {
            let remaining = self.config.n_folds - fold_idx;
            let test_size = (total_test.saturating_sub(allocated) / remaining)
                .max(self.config.min_test_bars);

            let window = test_end
                .checked_sub(test_size)
                .map(|test_start| (test_start, test_start.checked_sub(self.config.embargo_bars)));
            let Some((test_start, Some(train_end))) = window else {
                debug!("WalkForward: Fold {} window underflows, skipping", fold_idx);
                test_end = test_end.saturating_sub(test_size);
                allocated += test_size;
                continue;
            };

            let train_bars = train_end;
            let test_bars = test_end - test_start;
            let valid = train_end > 0
                && test_end > test_start
                && train_bars >= self.config.min_train_bars
                && test_bars >= self.config.min_test_bars;
            if valid {
                splits.push(FoldSplit {
                    fold_idx,
                    train: (0, train_end),
                    test: (test_start, test_end),
                });
            } else {
                debug!(
                    "WalkForward: Skipping fold {} (train {} bars, test {} bars)",
                    fold_idx, train_bars, test_bars
                );
            }

            test_end = test_start;
            allocated += test_size;
        }
        splits
    }

    fn run_fold(
        &self,
        split: FoldSplit,
        candles: &[Candle],
        regime: MarketRegime,
        features: Option<&FeatureSeries>,
        rng: &mut StdRng,
    ) -> FoldResult {
        let train_candles = &candles[split.train.0..split.train.1];
        let test_candles = &candles[split.test.0..split.test.1];
        let train_features = features.map(|f| f.slice(split.train.0, split.train.1));
        let test_features = features.map(|f| f.slice(split.test.0, split.test.1));

        debug!(
            "WalkForward: Fold {} train [{}, {}) test [{}, {})",
            split.fold_idx, split.train.0, split.train.1, split.test.0, split.test.1
        );

        let optimize_started = Instant::now();
        let optimized = self
            .optimizer
            .optimize(train_candles, regime, train_features.as_ref(), rng);
        let optimize_ms = elapsed_ms(optimize_started);

        let Some(best_set) = optimized.best_set else {
            debug!(
                "WalkForward: Fold {} found no valid parameter set",
                split.fold_idx
            );
            let mut fold = FoldResult::empty(split.fold_idx, split.train, split.test);
            fold.optimize_ms = optimize_ms;
            return fold;
        };

        // One objective instance scores both sides of the fold.
        let objective = ObjectiveFunction::for_regime(regime);
        let (_, train_stats) = TradeSimulator::simulate(
            &optimized.entries,
            train_candles,
            &best_set.stops,
            train_features.as_ref(),
        );
        let train_score = objective.score(&train_stats);

        // The frozen winner replays on the test slice; no re-optimization.
        let test_entries = self.optimizer.generate_entries_for(&best_set, test_candles);
        let (_, test_stats) = TradeSimulator::simulate(
            &test_entries,
            test_candles,
            &best_set.stops,
            test_features.as_ref(),
        );
        let test_score = objective.score(&test_stats);

        info!(
            "WalkForward: Fold {} {} - train {:.4} ({} trades), test {:.4} ({} trades)",
            split.fold_idx,
            best_set.describe(),
            train_score,
            train_stats.n_trades,
            test_score,
            test_stats.n_trades
        );

        FoldResult {
            fold_idx: split.fold_idx,
            train_range: split.train,
            test_range: split.test,
            train_score,
            test_score,
            train_trades: train_stats.n_trades,
            test_trades: test_stats.n_trades,
            train_win_rate: train_stats.win_rate,
            test_win_rate: test_stats.win_rate,
            train_profit_factor: train_stats.profit_factor,
            test_profit_factor: test_stats.profit_factor,
            best_set: Some(best_set),
            optimize_ms,
            test_entries,
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
