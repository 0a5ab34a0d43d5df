use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::Result;
use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};
use tracing::{debug, info, warn};

use crate::domain::market::candle::Candle;
use crate::domain::trading::types::EntryEvent;

/// Injectable post-hoc check. `Ok(Some(details))` drops the entry,
/// `Ok(None)` lets it through; errors are logged and never drop anything.
pub type CustomFilter =
    Box<dyn Fn(&EntryEvent, &[Candle], usize) -> Result<Option<String>> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Drop when current ATR exceeds its rolling average by this factor.
    pub vol_spike_threshold: f64,
    /// Drop when current spread exceeds its rolling average by this factor;
    /// only checked when spread data is supplied.
    pub spread_spike_threshold: f64,
    /// Drop when the open gaps from the previous close by more than this
    /// percentage.
    pub gap_threshold_pct: f64,
    /// Drop when current volume falls below this fraction of its rolling
    /// average.
    pub min_volume_ratio: f64,
    pub excluded_hours_utc: Vec<u32>,
    /// UTC weekdays, 0 = Monday.
    pub excluded_weekdays: Vec<u32>,
    pub atr_period: usize,
    pub avg_window: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            vol_spike_threshold: 2.5,
            spread_spike_threshold: 3.0,
            gap_threshold_pct: 0.5,
            min_volume_ratio: 0.3,
            excluded_hours_utc: Vec::new(),
            excluded_weekdays: vec![5, 6],
            atr_period: 14,
            avg_window: 20,
        }
    }
}

impl FilterConfig {
    /// 24/7 markets: no session windows, looser spike and volume tolerances.
    pub fn crypto() -> Self {
        Self {
            vol_spike_threshold: 3.0,
            spread_spike_threshold: 4.0,
            gap_threshold_pct: 1.0,
            min_volume_ratio: 0.2,
            excluded_hours_utc: Vec::new(),
            excluded_weekdays: Vec::new(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FilterReason {
    VolatilitySpike,
    SpreadSpike,
    DataGap,
    LowVolume,
    TimeRestriction,
    Custom,
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterReason::VolatilitySpike => write!(f, "VOLATILITY_SPIKE"),
            FilterReason::SpreadSpike => write!(f, "SPREAD_SPIKE"),
            FilterReason::DataGap => write!(f, "DATA_GAP"),
            FilterReason::LowVolume => write!(f, "LOW_VOLUME"),
            FilterReason::TimeRestriction => write!(f, "TIME_RESTRICTION"),
            FilterReason::Custom => write!(f, "CUSTOM"),
        }
    }
}

/// One dropped entry and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResult {
    pub entry: EntryEvent,
    pub reason: FilterReason,
    pub details: String,
}

/// Counters for the most recent `filter_entries` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterStats {
    pub total: usize,
    pub passed: usize,
    pub filtered: usize,
    pub by_reason: BTreeMap<FilterReason, usize>,
    pub pass_rate: f64,
}

/// Per-series context shared by all checks of one `filter_entries` call.
struct SeriesContext {
    atr: Vec<f64>,
    avg_atr: Vec<f64>,
    avg_volume: Vec<f64>,
    avg_spread: Option<Vec<f64>>,
    /// Median of the first inter-candle gaps; `None` disables the time-gap
    /// check.
    expected_interval: Option<f64>,
}

/// Drops entries that fire into unfavorable microstructure: volatility or
/// spread spikes, data gaps, thin volume and excluded sessions.
///
/// Checks run in a fixed priority order and short-circuit, so every dropped
/// entry carries exactly one reason. Entries whose timestamp is missing from
/// the candle series pass through unfiltered; the filter never drops what it
/// cannot evaluate.
pub struct TradeFilter {
    config: FilterConfig,
    custom_filters: Vec<(String, CustomFilter)>,
    stats: FilterStats,
    rejected: Vec<FilterResult>,
}

impl Default for TradeFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

impl TradeFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            custom_filters: Vec::new(),
            stats: FilterStats::default(),
            rejected: Vec::new(),
        }
    }

    pub fn with_custom_filter(
        mut self,
        name: impl Into<String>,
        filter: CustomFilter,
    ) -> Self {
        self.custom_filters.push((name.into(), filter));
        self
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Stats from the most recent `filter_entries` call.
    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }

    /// Entries dropped by the most recent `filter_entries` call.
    pub fn rejected(&self) -> &[FilterResult] {
        &self.rejected
    }

    pub fn filter_entries(
        &mut self,
        entries: Vec<EntryEvent>,
        candles: &[Candle],
        spreads: Option<&[f64]>,
    ) -> Vec<EntryEvent> {
        self.stats = FilterStats::default();
        self.rejected.clear();
        if entries.is_empty() || candles.is_empty() {
            return entries;
        }

        let spreads = match spreads {
            Some(values) if values.len() != candles.len() => {
                warn!(
                    "TradeFilter: Spread series has {} values for {} candles, ignoring",
                    values.len(),
                    candles.len()
                );
                None
            }
            other => other,
        };

        let context = self.build_context(candles, spreads);
        let index_by_ts: HashMap<i64, usize> = candles
            .iter()
            .enumerate()
            .map(|(idx, candle)| (candle.timestamp, idx))
            .collect();

        self.stats.total = entries.len();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(&idx) = index_by_ts.get(&entry.timestamp) else {
                // Unknown timestamp: pass through rather than drop blind.
                kept.push(entry);
                continue;
            };

            match self.classify(&entry, idx, candles, spreads, &context) {
                Some((reason, details)) => {
                    debug!(
                        "TradeFilter: Entry at {} dropped as {} - {}",
                        entry.timestamp, reason, details
                    );
                    *self.stats.by_reason.entry(reason).or_insert(0) += 1;
                    self.rejected.push(FilterResult {
                        entry,
                        reason,
                        details,
                    });
                }
                None => kept.push(entry),
            }
        }

        self.stats.passed = kept.len();
        self.stats.filtered = self.stats.total - kept.len();
        self.stats.pass_rate = if self.stats.total > 0 {
            self.stats.passed as f64 / self.stats.total as f64
        } else {
            0.0
        };
        info!(
            "TradeFilter: {}/{} entries passed ({:.0}% pass rate)",
            self.stats.passed,
            self.stats.total,
            self.stats.pass_rate * 100.0
        );
        kept
    }

    fn build_context(&self, candles: &[Candle], spreads: Option<&[f64]>) -> SeriesContext {
        let atr = ema_atr(candles, self.config.atr_period);
        let avg_atr = rolling_average(&atr, self.config.avg_window);
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        let avg_volume = rolling_average(&volumes, self.config.avg_window);
        let avg_spread = spreads.map(|values| rolling_average(values, self.config.avg_window));
        SeriesContext {
            atr,
            avg_atr,
            avg_volume,
            avg_spread,
            expected_interval: expected_interval(candles),
        }
    }

    /// Checks run in priority order; the first match names the reason.
    fn classify(
        &self,
        entry: &EntryEvent,
        idx: usize,
        candles: &[Candle],
        spreads: Option<&[f64]>,
        context: &SeriesContext,
    ) -> Option<(FilterReason, String)> {
        // 1. Volatility spike
        if context.avg_atr[idx] > 0.0 {
            let ratio = context.atr[idx] / context.avg_atr[idx];
            if ratio > self.config.vol_spike_threshold {
                return Some((
                    FilterReason::VolatilitySpike,
                    format!(
                        "ATR {:.4} is {:.2}x the {:.4} average",
                        context.atr[idx], ratio, context.avg_atr[idx]
                    ),
                ));
            }
        }

        // 2. Spread spike (only with spread data)
        if let (Some(values), Some(avg)) = (spreads, context.avg_spread.as_ref()) {
            if avg[idx] > 0.0 {
                let ratio = values[idx] / avg[idx];
                if ratio > self.config.spread_spike_threshold {
                    return Some((
                        FilterReason::SpreadSpike,
                        format!(
                            "spread {:.5} is {:.2}x the {:.5} average",
                            values[idx], ratio, avg[idx]
                        ),
                    ));
                }
            }
        }

        // 3. Data gap (price or time); the first candle has no predecessor
        if idx > 0 {
            let prev = &candles[idx - 1];
            if prev.close != 0.0 {
                let gap_pct = (candles[idx].open - prev.close).abs() / prev.close * 100.0;
                if gap_pct > self.config.gap_threshold_pct {
                    return Some((
                        FilterReason::DataGap,
                        format!("price gap {:.2}% from previous close", gap_pct),
                    ));
                }
            }
            if let Some(expected) = context.expected_interval {
                let gap = (candles[idx].timestamp - prev.timestamp) as f64;
                if gap > 2.0 * expected {
                    return Some((
                        FilterReason::DataGap,
                        format!("time gap {:.0}s vs expected {:.0}s", gap, expected),
                    ));
                }
            }
        }

        // 4. Low volume
        if context.avg_volume[idx] > 0.0 {
            let ratio = candles[idx].volume / context.avg_volume[idx];
            if ratio < self.config.min_volume_ratio {
                return Some((
                    FilterReason::LowVolume,
                    format!(
                        "volume {:.0} is {:.2}x the {:.0} average",
                        candles[idx].volume, ratio, context.avg_volume[idx]
                    ),
                ));
            }
        }

        // 5. Time restriction
        if let Some(details) = self.time_restricted(entry.timestamp) {
            return Some((FilterReason::TimeRestriction, details));
        }

        // 6. Custom filters; failures pass the entry through
        for (name, filter) in &self.custom_filters {
            match filter(entry, candles, idx) {
                Ok(Some(details)) => {
                    return Some((FilterReason::Custom, format!("{}: {}", name, details)));
                }
                Ok(None) => {}
                Err(error) => {
                    warn!("TradeFilter: Custom filter '{}' failed: {:#}", name, error);
                }
            }
        }

        None
    }

    fn time_restricted(&self, timestamp: i64) -> Option<String> {
        // Unrepresentable timestamps fail open.
        let dt = chrono::DateTime::from_timestamp(timestamp, 0)?;
        let hour = dt.hour();
        if self.config.excluded_hours_utc.contains(&hour) {
            return Some(format!("hour {:02}:00 UTC is excluded", hour));
        }
        let weekday = dt.weekday().num_days_from_monday();
        if self.config.excluded_weekdays.contains(&weekday) {
            return Some(format!("weekday {} is excluded", dt.weekday()));
        }
        None
    }
}

/// EMA-smoothed ATR seeded with the first bar's true range.
fn ema_atr(candles: &[Candle], period: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(candles.len());
    let Some(first) = candles.first() else {
        return out;
    };
    let multiplier = 2.0 / (period.max(1) as f64 + 1.0);
    let mut atr = first.high - first.low;
    out.push(atr);
    for i in 1..candles.len() {
        let tr = candles[i].true_range(candles[i - 1].close);
        atr += (tr - atr) * multiplier;
        out.push(atr);
    }
    out
}

/// Trailing average over `window` values, expanding over `[0..=i]` while the
/// series is shorter than the window.
fn rolling_average(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, value) in values.iter().enumerate() {
        sum += value;
        if i >= window {
            sum -= values[i - window];
        }
        out.push(sum / (i + 1).min(window) as f64);
    }
    out
}

/// Median of the first 20 inter-candle gaps, in seconds.
fn expected_interval(candles: &[Candle]) -> Option<f64> {
    if candles.len() < 2 {
        return None;
    }
    let gaps: Vec<f64> = candles
        .windows(2)
        .take(20)
        .map(|pair| (pair[1].timestamp - pair[0].timestamp) as f64)
        .collect();
    let mut data = Data::new(gaps);
    let median = data.median();
    (median > 0.0).then_some(median)
}
