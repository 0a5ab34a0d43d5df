use crate::application::optimization::optimizer::OptimizerConfig;
use crate::application::runner::background_runner::RunnerConfig;
use crate::application::trading::trade_filter::FilterConfig;
use crate::application::validation::walk_forward::ValidationConfig;
use crate::domain::indicators::IndicatorFamily;
use crate::domain::market::timeframe::Timeframe;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use tracing::warn;

/// Everything the analysis pipeline reads from the environment, assembled
/// once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub validation: ValidationConfig,
    pub filter: FilterConfig,
    pub optimizer: OptimizerConfig,
    pub runner: RunnerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let symbol = env::var("CHARTLAB_SYMBOL").unwrap_or_else(|_| "EURUSD".to_string());

        let timeframe_str = env::var("CHARTLAB_TIMEFRAME").unwrap_or_else(|_| "1m".to_string());
        let timeframe = Timeframe::from_str(&timeframe_str)?;

        // Walk-forward validation
        let n_folds = env::var("CHARTLAB_N_FOLDS")
            .unwrap_or_else(|_| "3".to_string())
            .parse::<usize>()
            .context("Failed to parse CHARTLAB_N_FOLDS")?;

        let train_ratio = env::var("CHARTLAB_TRAIN_RATIO")
            .unwrap_or_else(|_| "0.7".to_string())
            .parse::<f64>()
            .context("Failed to parse CHARTLAB_TRAIN_RATIO")?;

        let embargo_bars = env::var("CHARTLAB_EMBARGO_BARS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<usize>()
            .context("Failed to parse CHARTLAB_EMBARGO_BARS")?;

        let min_train_bars = env::var("CHARTLAB_MIN_TRAIN_BARS")
            .unwrap_or_else(|_| "50".to_string())
            .parse::<usize>()
            .context("Failed to parse CHARTLAB_MIN_TRAIN_BARS")?;

        let min_test_bars = env::var("CHARTLAB_MIN_TEST_BARS")
            .unwrap_or_else(|_| "20".to_string())
            .parse::<usize>()
            .context("Failed to parse CHARTLAB_MIN_TEST_BARS")?;

        // Optional fixed seed; runs draw a random one when unset
        let seed = if let Ok(seed_str) = env::var("CHARTLAB_SEED") {
            Some(
                seed_str
                    .parse::<u64>()
                    .context("Failed to parse CHARTLAB_SEED")?,
            )
        } else {
            None
        };

        let require_positive_oos = env::var("CHARTLAB_REQUIRE_POSITIVE_OOS")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .unwrap_or(true);

        let max_train_test_ratio = env::var("CHARTLAB_MAX_TRAIN_TEST_RATIO")
            .unwrap_or_else(|_| "2.0".to_string())
            .parse::<f64>()
            .context("Failed to parse CHARTLAB_MAX_TRAIN_TEST_RATIO")?;

        // Entry quality filter
        let vol_spike_threshold = env::var("CHARTLAB_MAX_VOLATILITY_RATIO")
            .unwrap_or_else(|_| "2.5".to_string())
            .parse::<f64>()
            .context("Failed to parse CHARTLAB_MAX_VOLATILITY_RATIO")?;

        let spread_spike_threshold = env::var("CHARTLAB_MAX_SPREAD_RATIO")
            .unwrap_or_else(|_| "3.0".to_string())
            .parse::<f64>()
            .context("Failed to parse CHARTLAB_MAX_SPREAD_RATIO")?;

        let gap_threshold_pct = env::var("CHARTLAB_MAX_GAP_PCT")
            .unwrap_or_else(|_| "0.5".to_string())
            .parse::<f64>()
            .context("Failed to parse CHARTLAB_MAX_GAP_PCT")?;

        let min_volume_ratio = env::var("CHARTLAB_MIN_VOLUME_RATIO")
            .unwrap_or_else(|_| "0.3".to_string())
            .parse::<f64>()
            .context("Failed to parse CHARTLAB_MIN_VOLUME_RATIO")?;

        let excluded_hours_str = env::var("CHARTLAB_EXCLUDED_HOURS").unwrap_or_default();
        let mut excluded_hours_utc = Vec::new();
        for entry in excluded_hours_str.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            excluded_hours_utc.push(
                entry
                    .parse::<u32>()
                    .context("Failed to parse CHARTLAB_EXCLUDED_HOURS")?,
            );
        }

        let excluded_weekdays_str =
            env::var("CHARTLAB_EXCLUDED_WEEKDAYS").unwrap_or_else(|_| "5,6".to_string());
        let mut excluded_weekdays = Vec::new();
        for entry in excluded_weekdays_str.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            excluded_weekdays.push(
                entry
                    .parse::<u32>()
                    .context("Failed to parse CHARTLAB_EXCLUDED_WEEKDAYS")?,
            );
        }

        let atr_period = env::var("CHARTLAB_ATR_PERIOD")
            .unwrap_or_else(|_| "14".to_string())
            .parse::<usize>()
            .context("Failed to parse CHARTLAB_ATR_PERIOD")?;

        let avg_window = env::var("CHARTLAB_AVG_WINDOW")
            .unwrap_or_else(|_| "20".to_string())
            .parse::<usize>()
            .context("Failed to parse CHARTLAB_AVG_WINDOW")?;

        // Optimizer
        let min_trades = env::var("CHARTLAB_MIN_TRADES")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<usize>()
            .context("Failed to parse CHARTLAB_MIN_TRADES")?;

        let max_candidates = env::var("CHARTLAB_MAX_CANDIDATES")
            .unwrap_or_else(|_| "500".to_string())
            .parse::<usize>()
            .context("Failed to parse CHARTLAB_MAX_CANDIDATES")?;

        // Background runner
        let reanalyze_interval_sec = env::var("CHARTLAB_REANALYZE_INTERVAL_SEC")
            .unwrap_or_else(|_| "60.0".to_string())
            .parse::<f64>()
            .context("Failed to parse CHARTLAB_REANALYZE_INTERVAL_SEC")?;

        let debounce_ms = env::var("CHARTLAB_DEBOUNCE_MS")
            .unwrap_or_else(|_| "500.0".to_string())
            .parse::<f64>()
            .context("Failed to parse CHARTLAB_DEBOUNCE_MS")?;

        let max_queue_size = env::var("CHARTLAB_MAX_QUEUE_SIZE")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<usize>()
            .context("Failed to parse CHARTLAB_MAX_QUEUE_SIZE")?;

        let use_optimizer = env::var("CHARTLAB_USE_OPTIMIZER")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .unwrap_or(true);

        let auto_start = env::var("CHARTLAB_AUTO_START")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let performance_log_interval = env::var("CHARTLAB_PERFORMANCE_LOG_INTERVAL")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .context("Failed to parse CHARTLAB_PERFORMANCE_LOG_INTERVAL")?;

        Ok(Config {
            symbol,
            timeframe,
            validation: ValidationConfig {
                n_folds,
                train_ratio,
                embargo_bars,
                min_train_bars,
                min_test_bars,
                seed,
                require_positive_oos,
                max_train_test_ratio,
            },
            filter: FilterConfig {
                vol_spike_threshold,
                spread_spike_threshold,
                gap_threshold_pct,
                min_volume_ratio,
                excluded_hours_utc,
                excluded_weekdays,
                atr_period,
                avg_window,
            },
            optimizer: OptimizerConfig {
                min_trades,
                max_candidates,
            },
            runner: RunnerConfig {
                reanalyze_interval_sec,
                debounce_ms,
                max_queue_size,
                use_optimizer,
                auto_start,
                performance_log_interval,
            },
        })
    }
}

/// Search-range overrides loaded from a TOML file, keyed by family name:
///
/// ```toml
/// [families]
/// rsi_reversal = [
///     { name = "period", min = 10, max = 14, step = 2 },
/// ]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct GridFile {
    #[serde(default)]
    pub families: BTreeMap<String, Vec<GridRange>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridRange {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    #[serde(default)]
    pub default: Option<f64>,
}

impl GridFile {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read grid config file: {}", path))?;
        let grid: GridFile = toml::from_str(&content)
            .context(format!("Failed to parse grid config TOML: {}", path))?;
        Ok(grid)
    }

    /// Overwrites matching parameter ranges in `space`. Unknown family or
    /// parameter names are skipped with a warning, never an error.
    pub fn apply(&self, space: &mut [IndicatorFamily]) {
        for (family_name, overrides) in &self.families {
            let Some(family) = space
                .iter_mut()
                .find(|family| family.name == family_name.as_str())
            else {
                warn!(
                    "Config: Grid file names unknown family '{}', skipping",
                    family_name
                );
                continue;
            };
            for over in overrides {
                let Some(range) = family
                    .ranges
                    .iter_mut()
                    .find(|range| range.name == over.name)
                else {
                    warn!(
                        "Config: Grid file names unknown parameter '{}.{}', skipping",
                        family_name, over.name
                    );
                    continue;
                };
                range.min_val = over.min;
                range.max_val = over.max;
                range.step = over.step;
                if let Some(default) = over.default {
                    range.default = default;
                }
            }
        }
    }
}
