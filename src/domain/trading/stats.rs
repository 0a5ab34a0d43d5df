use serde::{Deserialize, Serialize};

use crate::domain::trading::types::SimulatedTrade;

/// Aggregate statistics over a batch of simulated trades.
///
/// `win_rate` is a fraction in 0..1. `profit_factor` is gross winning R
/// over gross losing R: infinity when there are wins and no losses, 0.0
/// for an empty batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeStats {
    pub n_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_r: f64,
    pub avg_r: f64,
    pub max_consecutive_losses: usize,
}

impl TradeStats {
    pub fn from_trades(trades: &[SimulatedTrade]) -> Self {
        if trades.is_empty() {
            return Self::default();
        }

        let mut wins = 0usize;
        let mut losses = 0usize;
        let mut gross_win = 0.0;
        let mut gross_loss = 0.0;
        let mut total_r = 0.0;
        let mut loss_streak = 0usize;
        let mut max_loss_streak = 0usize;

        for trade in trades {
            total_r += trade.r_multiple;
            if trade.r_multiple > 0.0 {
                wins += 1;
                gross_win += trade.r_multiple;
                loss_streak = 0;
            } else if trade.r_multiple < 0.0 {
                losses += 1;
                gross_loss += -trade.r_multiple;
                loss_streak += 1;
                max_loss_streak = max_loss_streak.max(loss_streak);
            } else {
                loss_streak = 0;
            }
        }

        let n_trades = trades.len();
        let profit_factor = if gross_loss > 0.0 {
            gross_win / gross_loss
        } else if gross_win > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        Self {
            n_trades,
            wins,
            losses,
            win_rate: wins as f64 / n_trades as f64,
            profit_factor,
            total_r,
            avg_r: total_r / n_trades as f64,
            max_consecutive_losses: max_loss_streak,
        }
    }
}
