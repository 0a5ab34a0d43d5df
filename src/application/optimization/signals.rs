use crate::domain::indicators::{IndicatorSet, IndicatorSpec, PostprocessConfig};
use crate::domain::market::candle::Candle;
use crate::domain::trading::types::{EntryEvent, Side};
use ta::Next;
use ta::indicators::{
    BollingerBands, ExponentialMovingAverage, MovingAverageConvergenceDivergence,
    RelativeStrengthIndex, SimpleMovingAverage,
};

/// Replays a candle series through every indicator of a set and returns the
/// surviving entry signals, oldest first.
///
/// Triggers propose entries at the bar close. Filter and confirmation
/// indicators vote on each proposal with their configured weight; a proposal
/// survives when the agreeing weight fraction reaches
/// `postprocess.min_confirmation` (a set without voters always passes). At
/// most one entry per bar, and `cooldown_bars` bars of silence follow every
/// accepted entry.
///
/// Deterministic for a fixed set and candle series. Warm-up bars, before an
/// indicator has seen a full period of history, never fire.
pub fn generate_entries(set: &IndicatorSet, candles: &[Candle]) -> Vec<EntryEvent> {
    if candles.len() < 2 {
        return Vec::new();
    }

    // One lane per trigger, in declaration order; the earliest trigger in the
    // set wins a contested bar.
    let trigger_lanes: Vec<(String, Vec<Option<Side>>)> = set
        .triggers()
        .map(|spec| (spec.name.clone(), trigger_signals(spec, candles)))
        .collect();
    if trigger_lanes.is_empty() {
        return Vec::new();
    }

    let voter_lanes: Vec<(f64, Vec<Option<Side>>)> = set
        .voters()
        .map(|spec| (spec.weight, voter_stance(spec, candles)))
        .collect();

    let entries = collect_entries(candles, &trigger_lanes, &voter_lanes, &set.postprocess);
    tracing::debug!(
        "Signals: {} entries from {} bars ({})",
        entries.len(),
        candles.len(),
        set.describe()
    );
    entries
}

/// Applies voting, the one-entry-per-bar rule and the cooldown to raw
/// per-bar signal lanes.
fn collect_entries(
    candles: &[Candle],
    trigger_lanes: &[(String, Vec<Option<Side>>)],
    voter_lanes: &[(f64, Vec<Option<Side>>)],
    postprocess: &PostprocessConfig,
) -> Vec<EntryEvent> {
    let voter_weight: f64 = voter_lanes.iter().map(|(weight, _)| weight).sum();

    let mut entries = Vec::new();
    let mut next_allowed = 0usize;
    for (i, candle) in candles.iter().enumerate() {
        if i < next_allowed {
            continue;
        }
        let Some((source, side)) = trigger_lanes
            .iter()
            .find_map(|(name, lane)| lane.get(i).copied().flatten().map(|side| (name, side)))
        else {
            continue;
        };

        let confidence = if voter_weight > 0.0 {
            let agreeing: f64 = voter_lanes
                .iter()
                .filter(|(_, lane)| lane.get(i).copied().flatten() == Some(side))
                .map(|(weight, _)| weight)
                .sum();
            agreeing / voter_weight
        } else {
            1.0
        };
        if voter_weight > 0.0 && confidence < postprocess.min_confirmation {
            continue;
        }

        entries.push(
            EntryEvent::new(candle.timestamp, side, candle.close, source.as_str())
                .with_confidence(confidence),
        );
        next_allowed = i + postprocess.cooldown_bars + 1;
    }
    entries
}

fn trigger_signals(spec: &IndicatorSpec, candles: &[Candle]) -> Vec<Option<Side>> {
    match spec.name.as_str() {
        "rsi_reversal" => rsi_reversal(spec, candles),
        "ema_cross" => ema_cross(spec, candles),
        "bollinger_fade" => bollinger_fade(spec, candles),
        other => {
            tracing::warn!("Signals: No trigger kernel named '{}', ignoring", other);
            vec![None; candles.len()]
        }
    }
}

fn voter_stance(spec: &IndicatorSpec, candles: &[Candle]) -> Vec<Option<Side>> {
    match spec.name.as_str() {
        "macd_momentum" => macd_momentum(spec, candles),
        "trend_sma" => trend_sma(spec, candles),
        other => {
            tracing::warn!("Signals: No voter kernel named '{}', ignoring", other);
            vec![None; candles.len()]
        }
    }
}

/// Long when RSI crosses up through the oversold level, short when it
/// crosses down through the overbought level.
fn rsi_reversal(spec: &IndicatorSpec, candles: &[Candle]) -> Vec<Option<Side>> {
    let period = spec.param_usize("period", 14).max(1);
    let oversold = spec.param_f64("oversold", 30.0);
    let overbought = spec.param_f64("overbought", 70.0);
    let mut rsi = RelativeStrengthIndex::new(period).expect("rsi period is clamped to >= 1");

    let mut lane = vec![None; candles.len()];
    let mut prev: Option<f64> = None;
    for (i, candle) in candles.iter().enumerate() {
        let value = rsi.next(candle.close);
        if let Some(prev) = prev {
            if i > period {
                if prev < oversold && value >= oversold {
                    lane[i] = Some(Side::Long);
                } else if prev > overbought && value <= overbought {
                    lane[i] = Some(Side::Short);
                }
            }
        }
        prev = Some(value);
    }
    lane
}

/// Long when the fast EMA crosses above the slow one, short on the mirrored
/// cross below.
fn ema_cross(spec: &IndicatorSpec, candles: &[Candle]) -> Vec<Option<Side>> {
    let fast_period = spec.param_usize("fast", 10).max(1);
    let slow_period = spec.param_usize("slow", 30).max(1);
    let mut fast = ExponentialMovingAverage::new(fast_period).expect("ema period is clamped to >= 1");
    let mut slow = ExponentialMovingAverage::new(slow_period).expect("ema period is clamped to >= 1");

    let mut lane = vec![None; candles.len()];
    let mut prev_diff: Option<f64> = None;
    for (i, candle) in candles.iter().enumerate() {
        let diff = fast.next(candle.close) - slow.next(candle.close);
        if let Some(prev) = prev_diff {
            if i > slow_period {
                if prev <= 0.0 && diff > 0.0 {
                    lane[i] = Some(Side::Long);
                } else if prev >= 0.0 && diff < 0.0 {
                    lane[i] = Some(Side::Short);
                }
            }
        }
        prev_diff = Some(diff);
    }
    lane
}

/// Mean-reversion fade: long when the close comes back above the lower band
/// after closing below it, short mirrored at the upper band.
fn bollinger_fade(spec: &IndicatorSpec, candles: &[Candle]) -> Vec<Option<Side>> {
    let period = spec.param_usize("period", 20).max(2);
    let k = spec.param_f64("k", 2.0);
    let mut bb = BollingerBands::new(period, k).expect("bollinger period is clamped to >= 2");

    let mut lane = vec![None; candles.len()];
    // (close, upper, lower) of the previous bar
    let mut prev: Option<(f64, f64, f64)> = None;
    for (i, candle) in candles.iter().enumerate() {
        let bands = bb.next(candle.close);
        if let Some((prev_close, prev_upper, prev_lower)) = prev {
            if i > period {
                if prev_close < prev_lower && candle.close > bands.lower {
                    lane[i] = Some(Side::Long);
                } else if prev_close > prev_upper && candle.close < bands.upper {
                    lane[i] = Some(Side::Short);
                }
            }
        }
        prev = Some((candle.close, bands.upper, bands.lower));
    }
    lane
}

/// Votes with the sign of the MACD histogram.
fn macd_momentum(spec: &IndicatorSpec, candles: &[Candle]) -> Vec<Option<Side>> {
    let fast = spec.param_usize("fast", 12).max(1);
    let slow = spec.param_usize("slow", 26).max(1);
    let signal = spec.param_usize("signal", 9).max(1);
    let mut macd = MovingAverageConvergenceDivergence::new(fast, slow, signal)
        .expect("macd periods are clamped to >= 1");

    let mut lane = vec![None; candles.len()];
    for (i, candle) in candles.iter().enumerate() {
        let out = macd.next(candle.close);
        if i >= slow {
            if out.histogram > 0.0 {
                lane[i] = Some(Side::Long);
            } else if out.histogram < 0.0 {
                lane[i] = Some(Side::Short);
            }
        }
    }
    lane
}

/// Votes long above the trend SMA, short below it.
fn trend_sma(spec: &IndicatorSpec, candles: &[Candle]) -> Vec<Option<Side>> {
    let period = spec.param_usize("period", 50).max(1);
    let mut sma = SimpleMovingAverage::new(period).expect("sma period is clamped to >= 1");

    let mut lane = vec![None; candles.len()];
    for (i, candle) in candles.iter().enumerate() {
        let value = sma.next(candle.close);
        if i + 1 >= period {
            if candle.close > value {
                lane[i] = Some(Side::Long);
            } else if candle.close < value {
                lane[i] = Some(Side::Short);
            }
        }
    }
    lane
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicators::{Combination, IndicatorRole, ParamValue, default_set};

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                Candle::new(
                    i as i64 * 60,
                    close,
                    close + 0.5,
                    close - 0.5,
                    close,
                    1_000.0,
                )
            })
            .collect()
    }

    fn spec_with(name: &str, role: IndicatorRole, params: &[(&str, ParamValue)]) -> IndicatorSpec {
        let combo: Combination = params
            .iter()
            .map(|(key, value)| (key.to_string(), *value))
            .collect();
        IndicatorSpec::new(name, role, combo, 1.0)
    }

    #[test]
    fn test_rsi_reversal_fires_long_after_selloff_recovery() {
        // Steady decline drives RSI toward zero, then a sharp rally pushes it
        // back up through the oversold level.
        let mut closes = vec![100.0, 100.0, 100.0];
        for i in 1..=6 {
            closes.push(100.0 - 2.0 * i as f64);
        }
        for i in 1..=6 {
            closes.push(88.0 + 3.0 * i as f64);
        }
        let candles = candles_from_closes(&closes);
        let spec = spec_with(
            "rsi_reversal",
            IndicatorRole::Trigger,
            &[
                ("period", ParamValue::Int(2)),
                ("oversold", ParamValue::Float(30.0)),
                ("overbought", ParamValue::Float(70.0)),
            ],
        );

        let lane = rsi_reversal(&spec, &candles);
        let fired: Vec<Side> = lane.iter().filter_map(|s| *s).collect();
        assert!(!fired.is_empty(), "recovery should fire at least once");
        assert!(
            fired.contains(&Side::Long),
            "crossing up through oversold must yield a long"
        );
        // Nothing fires during the warm-up window.
        assert!(lane[..=2].iter().all(Option::is_none));
    }

    #[test]
    fn test_ema_cross_fires_once_on_trend_reversal() {
        let mut closes: Vec<f64> = (0..10).map(|i| 100.0 - i as f64).collect();
        closes.extend((0..10).map(|i| 91.0 + 3.0 * i as f64));
        let candles = candles_from_closes(&closes);
        let spec = spec_with(
            "ema_cross",
            IndicatorRole::Trigger,
            &[("fast", ParamValue::Int(2)), ("slow", ParamValue::Int(4))],
        );

        let lane = ema_cross(&spec, &candles);
        let fired: Vec<(usize, Side)> = lane
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|side| (i, side)))
            .collect();
        assert_eq!(fired.len(), 1, "one reversal, one cross: {:?}", fired);
        assert_eq!(fired[0].1, Side::Long);
        assert!(fired[0].0 >= 10, "cross must land in the rally half");
    }

    #[test]
    fn test_bollinger_fade_fires_on_reentry() {
        // One plunge bar well below the band, then a snap back inside.
        let closes = [100.0, 100.0, 100.0, 100.0, 100.0, 90.0, 100.0, 100.0, 100.0, 100.0];
        let candles = candles_from_closes(&closes);
        let spec = spec_with(
            "bollinger_fade",
            IndicatorRole::Trigger,
            &[("period", ParamValue::Int(4)), ("k", ParamValue::Float(1.0))],
        );

        let lane = bollinger_fade(&spec, &candles);
        assert_eq!(lane[6], Some(Side::Long), "lane: {:?}", lane);
        assert_eq!(lane.iter().filter(|s| s.is_some()).count(), 1);
    }

    #[test]
    fn test_bollinger_fade_short_mirrors_at_upper_band() {
        let closes = [100.0, 100.0, 100.0, 100.0, 100.0, 110.0, 100.0, 100.0, 100.0, 100.0];
        let candles = candles_from_closes(&closes);
        let spec = spec_with(
            "bollinger_fade",
            IndicatorRole::Trigger,
            &[("period", ParamValue::Int(4)), ("k", ParamValue::Float(1.0))],
        );

        let lane = bollinger_fade(&spec, &candles);
        assert_eq!(lane[6], Some(Side::Short), "lane: {:?}", lane);
    }

    #[test]
    fn test_macd_votes_long_in_rally() {
        let mut closes = vec![100.0; 5];
        closes.extend((1..=20).map(|i| 100.0 + 2.0 * i as f64));
        let candles = candles_from_closes(&closes);
        let spec = spec_with(
            "macd_momentum",
            IndicatorRole::Confirmation,
            &[
                ("fast", ParamValue::Int(3)),
                ("slow", ParamValue::Int(6)),
                ("signal", ParamValue::Int(3)),
            ],
        );

        let lane = macd_momentum(&spec, &candles);
        assert!(lane.iter().all(|s| *s != Some(Side::Short)));
        assert!(
            lane[15..].iter().all(|s| *s == Some(Side::Long)),
            "sustained rally must keep the histogram positive: {:?}",
            &lane[15..]
        );
    }

    #[test]
    fn test_trend_sma_stance_follows_price_location() {
        let rising: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let candles = candles_from_closes(&rising);
        let spec = spec_with(
            "trend_sma",
            IndicatorRole::Filter,
            &[("period", ParamValue::Int(3))],
        );

        let lane = trend_sma(&spec, &candles);
        assert!(lane[..2].iter().all(Option::is_none), "warm-up votes nothing");
        assert!(lane[2..].iter().all(|s| *s == Some(Side::Long)));

        let falling: Vec<f64> = (0..10).map(|i| 100.0 - i as f64).collect();
        let lane = trend_sma(&spec, &candles_from_closes(&falling));
        assert!(lane[2..].iter().all(|s| *s == Some(Side::Short)));
    }

    #[test]
    fn test_cooldown_spaces_out_entries() {
        let candles = candles_from_closes(&vec![100.0; 12]);
        let lane = vec![Some(Side::Long); 12];
        let postprocess = PostprocessConfig {
            cooldown_bars: 2,
            min_confirmation: 0.5,
        };

        let entries = collect_entries(
            &candles,
            &[("rsi_reversal".to_string(), lane)],
            &[],
            &postprocess,
        );

        let stamps: Vec<i64> = entries.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![0, 180, 360, 540]);
    }

    #[test]
    fn test_first_trigger_wins_a_contested_bar() {
        let candles = candles_from_closes(&[100.0, 100.0, 100.0]);
        let mut short_lane = vec![None; 3];
        short_lane[1] = Some(Side::Short);
        let mut long_lane = vec![None; 3];
        long_lane[1] = Some(Side::Long);

        let entries = collect_entries(
            &candles,
            &[
                ("ema_cross".to_string(), short_lane),
                ("rsi_reversal".to_string(), long_lane),
            ],
            &[],
            &PostprocessConfig::default(),
        );

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].side, Side::Short);
        assert_eq!(entries[0].source, "ema_cross");
    }

    #[test]
    fn test_voters_can_suppress_a_proposal() {
        let candles = candles_from_closes(&[100.0, 100.0, 100.0]);
        let mut lane = vec![None; 3];
        lane[1] = Some(Side::Long);

        // One dissenting voter with all the weight.
        let entries = collect_entries(
            &candles,
            &[("rsi_reversal".to_string(), lane.clone())],
            &[(1.0, vec![Some(Side::Short); 3])],
            &PostprocessConfig::default(),
        );
        assert!(entries.is_empty(), "unanimous dissent must suppress");

        // Majority agreement passes and lands in the confidence field.
        let entries = collect_entries(
            &candles,
            &[("rsi_reversal".to_string(), lane)],
            &[
                (1.0, vec![Some(Side::Long); 3]),
                (0.5, vec![Some(Side::Short); 3]),
            ],
            &PostprocessConfig::default(),
        );
        assert_eq!(entries.len(), 1);
        assert!((entries[0].confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_trigger_only_set_always_passes() {
        let candles = candles_from_closes(&[100.0, 100.0]);
        let mut lane = vec![None; 2];
        lane[0] = Some(Side::Long);

        let entries = collect_entries(
            &candles,
            &[("rsi_reversal".to_string(), lane)],
            &[],
            &PostprocessConfig {
                cooldown_bars: 5,
                min_confirmation: 1.0,
            },
        );

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].confidence, 1.0);
    }

    #[test]
    fn test_flat_market_generates_nothing() {
        let candles = candles_from_closes(&vec![100.0; 80]);
        let entries = generate_entries(&default_set(), &candles);
        assert!(entries.is_empty(), "no crosses on a flat series");
    }

    #[test]
    fn test_too_few_candles_is_a_no_op() {
        let candles = candles_from_closes(&[100.0]);
        assert!(generate_entries(&default_set(), &candles).is_empty());
    }
}
