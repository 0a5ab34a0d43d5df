use std::collections::HashMap;

use ta::Next;
use ta::indicators::AverageTrueRange;

use crate::domain::indicators::StopConfig;
use crate::domain::market::candle::Candle;
use crate::domain::market::features::FeatureSeries;
use crate::domain::trading::stats::TradeStats;
use crate::domain::trading::types::{EntryEvent, Side, SimulatedTrade, TradeOutcome};

/// Time exits this close to break-even count as scratches, not wins/losses.
const SCRATCH_R: f64 = 0.05;

/// Replays entry signals against the candle series they were generated on
/// and resolves each into a win, loss or scratch with an R-multiple.
///
/// Stops and targets are ATR-based: a long entered at `close` risks
/// `atr_mult * ATR` down to the stop and targets `rr_ratio` times that risk;
/// shorts mirror. When a single bar's range touches both levels the stop is
/// assumed to have filled first, so simulated results never look better than
/// the worst intrabar ordering.
pub struct TradeSimulator;

impl TradeSimulator {
    pub fn simulate(
        entries: &[EntryEvent],
        candles: &[Candle],
        stops: &StopConfig,
        features: Option<&FeatureSeries>,
    ) -> (Vec<SimulatedTrade>, TradeStats) {
        if entries.is_empty() || candles.is_empty() {
            return (Vec::new(), TradeStats::default());
        }

        let atr = match features.and_then(|f| f.column(FeatureSeries::ATR)) {
            Some(column) if column.len() == candles.len() => column.to_vec(),
            _ => compute_atr(candles, stops.atr_period),
        };

        let index_of: HashMap<i64, usize> = candles
            .iter()
            .enumerate()
            .map(|(i, candle)| (candle.timestamp, i))
            .collect();

        let mut trades = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(&entry_idx) = index_of.get(&entry.timestamp) else {
                tracing::debug!(
                    "Simulator: No candle at ts {}, skipping entry",
                    entry.timestamp
                );
                continue;
            };
            if entry_idx + 1 >= candles.len() {
                // Nothing left to walk.
                continue;
            }
            let risk = stops.atr_mult * atr[entry_idx];
            if !risk.is_finite() || risk <= 0.0 {
                tracing::debug!(
                    "Simulator: Degenerate stop distance {} at ts {}, skipping entry",
                    risk,
                    entry.timestamp
                );
                continue;
            }

            trades.push(walk_trade(entry, candles, entry_idx, risk, stops));
        }

        let stats = TradeStats::from_trades(&trades);
        tracing::debug!(
            "Simulator: {} trades from {} entries (win rate {:.1}%)",
            stats.n_trades,
            entries.len(),
            stats.win_rate * 100.0
        );
        (trades, stats)
    }
}

fn walk_trade(
    entry: &EntryEvent,
    candles: &[Candle],
    entry_idx: usize,
    risk: f64,
    stops: &StopConfig,
) -> SimulatedTrade {
    let price = entry.price;
    let (stop, target) = match entry.side {
        Side::Long => (price - risk, price + stops.rr_ratio * risk),
        Side::Short => (price + risk, price - stops.rr_ratio * risk),
    };

    let last = candles.len().min(entry_idx + 1 + stops.max_hold_bars);
    for candle in &candles[entry_idx + 1..last] {
        let (stop_hit, target_hit) = match entry.side {
            Side::Long => (candle.low <= stop, candle.high >= target),
            Side::Short => (candle.high >= stop, candle.low <= target),
        };
        // Stop fills first when a bar touches both levels.
        if stop_hit {
            return SimulatedTrade {
                entry: entry.clone(),
                exit_price: stop,
                exit_timestamp: candle.timestamp,
                r_multiple: -1.0,
                outcome: TradeOutcome::Loss,
            };
        }
        if target_hit {
            return SimulatedTrade {
                entry: entry.clone(),
                exit_price: target,
                exit_timestamp: candle.timestamp,
                r_multiple: stops.rr_ratio,
                outcome: TradeOutcome::Win,
            };
        }
    }

    // Holding period exhausted: exit at the last walked bar's close.
    let exit = &candles[last - 1];
    let r_multiple = match entry.side {
        Side::Long => (exit.close - price) / risk,
        Side::Short => (price - exit.close) / risk,
    };
    let outcome = if r_multiple.abs() < SCRATCH_R {
        TradeOutcome::Scratch
    } else if r_multiple > 0.0 {
        TradeOutcome::Win
    } else {
        TradeOutcome::Loss
    };
    SimulatedTrade {
        entry: entry.clone(),
        exit_price: exit.close,
        exit_timestamp: exit.timestamp,
        r_multiple,
        outcome,
    }
}

/// Per-bar ATR over the whole series, used when no precomputed feature
/// column is supplied.
pub(crate) fn compute_atr(candles: &[Candle], period: usize) -> Vec<f64> {
    let mut atr = AverageTrueRange::new(period.max(1)).expect("atr period is clamped to >= 1");
    candles
        .iter()
        .map(|candle| {
            let item = ta::DataItem::builder()
                .high(candle.high)
                .low(candle.low)
                .close(candle.close)
                .open(candle.open)
                .volume(candle.volume)
                .build()
                .unwrap_or_else(|_| {
                    // Malformed bar: degrade to a flat bar at the close so the
                    // ATR stream keeps its alignment.
                    ta::DataItem::builder()
                        .high(candle.close)
                        .low(candle.close)
                        .close(candle.close)
                        .open(candle.close)
                        .volume(0.0)
                        .build()
                        .expect("flat bar is always a valid data item")
                });
            atr.next(&item)
        })
        .collect()
}
