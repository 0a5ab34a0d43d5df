use crate::domain::market::regime::MarketRegime;
use crate::domain::trading::stats::TradeStats;

/// Regime-aware scoring of a simulated trade batch. Higher is better.
///
/// The score blends total R, win rate and profit factor:
/// `w_r * total_r + w_win * 2*(win_rate - 0.5) + w_pf * (min(pf, 3)/3 - 0.5)`.
/// Trending regimes put most weight on total R, ranging regimes on win rate,
/// and volatile regimes additionally subtract a penalty per consecutive
/// loss. Scores can be negative.
///
/// One instance scores both the train and test slices of a fold, so the two
/// sides are always comparable.
#[derive(Debug, Clone, Copy)]
pub struct ObjectiveFunction {
    regime: MarketRegime,
    w_r: f64,
    w_win: f64,
    w_pf: f64,
    loss_streak_penalty: f64,
}

impl ObjectiveFunction {
    pub fn for_regime(regime: MarketRegime) -> Self {
        let (w_r, w_win, w_pf, loss_streak_penalty) = match regime {
            MarketRegime::TrendingUp | MarketRegime::TrendingDown => (0.6, 0.2, 0.2, 0.0),
            MarketRegime::Ranging => (0.2, 0.5, 0.3, 0.0),
            MarketRegime::Volatile => (0.4, 0.3, 0.3, 0.1),
            MarketRegime::Unknown => (0.4, 0.3, 0.3, 0.0),
        };
        Self {
            regime,
            w_r,
            w_win,
            w_pf,
            loss_streak_penalty,
        }
    }

    pub fn regime(&self) -> MarketRegime {
        self.regime
    }

    pub fn score(&self, stats: &TradeStats) -> f64 {
        // Profit factor is clamped so an all-win batch (pf = inf) cannot
        // dominate the blend.
        let pf_term = stats.profit_factor.min(3.0) / 3.0 - 0.5;
        self.w_r * stats.total_r
            + self.w_win * 2.0 * (stats.win_rate - 0.5)
            + self.w_pf * pf_term
            - self.loss_streak_penalty * stats.max_consecutive_losses as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total_r: f64, win_rate: f64, profit_factor: f64) -> TradeStats {
        TradeStats {
            n_trades: 10,
            total_r,
            win_rate,
            profit_factor,
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_regime_score_arithmetic() {
        let objective = ObjectiveFunction::for_regime(MarketRegime::Unknown);
        // Score = 0.4*2.0 + 0.3*2*(0.6-0.5) + 0.3*(1.8/3 - 0.5)
        //       = 0.8 + 0.06 + 0.03 = 0.89
        let score = objective.score(&stats(2.0, 0.6, 1.8));
        assert!((score - 0.89).abs() < 1e-9, "score {}", score);
    }

    #[test]
    fn test_trending_and_ranging_rank_differently() {
        let grinder = stats(2.0, 0.4, 1.5);
        let scalper = stats(1.2, 0.9, 2.5);

        let trending = ObjectiveFunction::for_regime(MarketRegime::TrendingUp);
        assert!(trending.score(&grinder) > trending.score(&scalper));

        let ranging = ObjectiveFunction::for_regime(MarketRegime::Ranging);
        assert!(ranging.score(&scalper) > ranging.score(&grinder));
    }

    #[test]
    fn test_volatile_punishes_loss_streaks() {
        let mut streaky = stats(1.0, 0.5, 1.5);
        streaky.max_consecutive_losses = 6;
        let mut steady = stats(1.0, 0.5, 1.5);
        steady.max_consecutive_losses = 0;

        let volatile = ObjectiveFunction::for_regime(MarketRegime::Volatile);
        assert!((volatile.score(&steady) - volatile.score(&streaky) - 0.6).abs() < 1e-9);

        // Other regimes ignore the streak.
        let trending = ObjectiveFunction::for_regime(MarketRegime::TrendingDown);
        assert_eq!(trending.score(&steady), trending.score(&streaky));
    }

    #[test]
    fn test_infinite_profit_factor_is_clamped() {
        let objective = ObjectiveFunction::for_regime(MarketRegime::Unknown);
        let all_wins = objective.score(&stats(3.0, 1.0, f64::INFINITY));
        let capped = objective.score(&stats(3.0, 1.0, 3.0));
        assert_eq!(all_wins, capped);
        assert!(all_wins.is_finite());
    }

    #[test]
    fn test_losing_batch_scores_negative() {
        let objective = ObjectiveFunction::for_regime(MarketRegime::Unknown);
        assert!(objective.score(&stats(-3.0, 0.2, 0.5)) < 0.0);
    }
}
