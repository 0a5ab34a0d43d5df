use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::market::candle::Candle;

/// Classification of current market behavior, used to pick
/// regime-appropriate objective weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketRegime {
    TrendingUp,
    TrendingDown,
    Ranging,
    Volatile,
    Unknown,
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketRegime::TrendingUp => write!(f, "Trending Up"),
            MarketRegime::TrendingDown => write!(f, "Trending Down"),
            MarketRegime::Ranging => write!(f, "Ranging"),
            MarketRegime::Volatile => write!(f, "Volatile"),
            MarketRegime::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Detailed regime read for one candle window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub regime: MarketRegime,
    pub confidence: f64, // 0.0 to 1.0
    pub volatility_score: f64,
    pub trend_strength: f64,
}

impl RegimeSnapshot {
    pub fn new(
        regime: MarketRegime,
        confidence: f64,
        volatility_score: f64,
        trend_strength: f64,
    ) -> Self {
        Self {
            regime,
            confidence: confidence.clamp(0.0, 1.0),
            volatility_score,
            trend_strength,
        }
    }

    pub fn unknown() -> Self {
        Self {
            regime: MarketRegime::Unknown,
            confidence: 0.0,
            volatility_score: 0.0,
            trend_strength: 0.0,
        }
    }
}

/// Detects the market regime from price action over a trailing window
pub struct RegimeDetector {
    window_size: usize,
    trend_threshold: f64,
    volatility_threshold: f64,
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new(50, 25.0, 2.0)
    }
}

impl RegimeDetector {
    pub fn new(window_size: usize, trend_threshold: f64, volatility_threshold: f64) -> Self {
        Self {
            window_size: window_size.max(2),
            trend_threshold,
            volatility_threshold,
        }
    }

    pub fn detect(&self, candles: &[Candle]) -> RegimeSnapshot {
        if candles.len() < self.window_size {
            return RegimeSnapshot::unknown();
        }

        let recent = &candles[candles.len() - self.window_size..];
        let Some(last) = recent.last() else {
            return RegimeSnapshot::unknown();
        };

        // Volatility as ATR relative to price, in percent.
        let atr = Self::average_true_range(recent, 14);
        let volatility_score = if last.close > 0.0 {
            atr / last.close * 100.0
        } else {
            0.0
        };

        let trend_strength = Self::trend_strength(recent);
        let is_uptrend = Self::is_uptrend(recent);

        let regime = if trend_strength > self.trend_threshold {
            if is_uptrend {
                MarketRegime::TrendingUp
            } else {
                MarketRegime::TrendingDown
            }
        } else if volatility_score > self.volatility_threshold {
            MarketRegime::Volatile
        } else {
            MarketRegime::Ranging
        };

        let confidence = match regime {
            MarketRegime::TrendingUp | MarketRegime::TrendingDown => {
                let excess = (trend_strength - self.trend_threshold).max(0.0);
                (0.5 + excess * 0.02).min(1.0)
            }
            MarketRegime::Volatile => {
                let excess = (volatility_score - self.volatility_threshold).max(0.0);
                (0.5 + excess * 0.1).min(1.0)
            }
            MarketRegime::Ranging => 0.6,
            MarketRegime::Unknown => 0.0,
        };

        RegimeSnapshot::new(regime, confidence, volatility_score, trend_strength)
    }

    /// Simple mean of the last `period` true ranges.
    fn average_true_range(candles: &[Candle], period: usize) -> f64 {
        if candles.len() < period + 1 {
            return 0.0;
        }

        let start = candles.len() - period;
        let mut tr_sum = 0.0;
        for i in start..candles.len() {
            tr_sum += candles[i].true_range(candles[i - 1].close);
        }
        tr_sum / period as f64
    }

    /// Absolute linear-regression slope of closes, normalized by the first
    /// price and scaled so typical trending windows land above ~25.
    fn trend_strength(candles: &[Candle]) -> f64 {
        let n = candles.len();
        if n < 2 {
            return 0.0;
        }

        let n_f = n as f64;
        let x_sum: f64 = (0..n).map(|i| i as f64).sum();
        let y_sum: f64 = candles.iter().map(|c| c.close).sum();
        let xy_sum: f64 = candles
            .iter()
            .enumerate()
            .map(|(i, c)| i as f64 * c.close)
            .sum();
        let x2_sum: f64 = (0..n).map(|i| (i * i) as f64).sum();

        let denominator = n_f * x2_sum - x_sum * x_sum;
        if denominator == 0.0 {
            return 0.0;
        }

        let slope = (n_f * xy_sum - x_sum * y_sum) / denominator;
        let first_price = candles[0].close.max(0.0001);

        (slope / first_price).abs() * 1000.0
    }

    fn is_uptrend(candles: &[Candle]) -> bool {
        match (candles.first(), candles.last()) {
            (Some(first), Some(last)) => last.close > first.close,
            _ => false,
        }
    }
}
