use std::cmp::Ordering;

use rand::rngs::StdRng;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::application::optimization::objective::ObjectiveFunction;
use crate::application::optimization::param_space::CombinationGenerator;
use crate::application::optimization::signals::generate_entries;
use crate::application::optimization::simulator::TradeSimulator;
use crate::domain::indicators::{
    IndicatorFamily, IndicatorRole, IndicatorSet, IndicatorSpec, candidate_space,
};
use crate::domain::market::candle::Candle;
use crate::domain::market::features::FeatureSeries;
use crate::domain::market::regime::MarketRegime;
use crate::domain::trading::types::EntryEvent;

#[derive(Debug, Clone, Copy)]
pub struct OptimizerConfig {
    /// Candidates with fewer simulated trades than this are rejected
    /// outright: too few samples to score.
    pub min_trades: usize,
    /// Cap on scored candidates; larger spaces are uniformly sampled down
    /// to this size with the caller's RNG.
    pub max_candidates: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_trades: 5,
            max_candidates: 500,
        }
    }
}

/// Outcome of one optimization pass over a candle window.
///
/// `best_set` is `None` (with empty entries) when no candidate produced
/// `min_trades` trades; `best_score` is meaningless in that case.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub best_set: Option<IndicatorSet>,
    pub entries: Vec<EntryEvent>,
    pub candidates_tried: usize,
    pub best_score: f64,
}

impl OptimizationResult {
    fn empty(candidates_tried: usize) -> Self {
        Self {
            best_set: None,
            entries: Vec::new(),
            candidates_tried,
            best_score: f64::NEG_INFINITY,
        }
    }
}

/// Searches the indicator catalog for the parameter set that scores best on
/// a candle window.
///
/// Each candidate pairs one trigger combination with the catalog's filter
/// and confirmation families at their defaults. Scoring fans out over a
/// rayon pool; ties and the parallel reduction both resolve to the lowest
/// candidate index, so a seeded RNG makes the whole pass reproducible.
pub struct FastOptimizer {
    config: OptimizerConfig,
    space: Vec<IndicatorFamily>,
}

impl FastOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            space: candidate_space(),
        }
    }

    /// Replaces the built-in catalog, e.g. with grid-file overrides.
    pub fn with_space(mut self, space: Vec<IndicatorFamily>) -> Self {
        self.space = space;
        self
    }

    pub fn optimize(
        &self,
        candles: &[Candle],
        regime: MarketRegime,
        features: Option<&FeatureSeries>,
        rng: &mut StdRng,
    ) -> OptimizationResult {
        let mut candidates = build_candidates(&self.space);
        let space_size = candidates.len();
        if candidates.is_empty() || candles.len() < 2 {
            return OptimizationResult::empty(0);
        }
        if space_size > self.config.max_candidates {
            let picked = rand::seq::index::sample(rng, space_size, self.config.max_candidates);
            let mut keep = vec![false; space_size];
            for idx in picked {
                keep[idx] = true;
            }
            // Filtering in place keeps enumeration order, so the index
            // tie-break still favors earlier catalog entries.
            candidates = candidates
                .into_iter()
                .enumerate()
                .filter_map(|(idx, set)| keep[idx].then_some(set))
                .collect();
        }

        info!(
            "FastOptimizer: Scoring {} of {} candidate sets over {} bars ({} regime)",
            candidates.len(),
            space_size,
            candles.len(),
            regime
        );

        let objective = ObjectiveFunction::for_regime(regime);
        let min_trades = self.config.min_trades;
        let best = candidates
            .par_iter()
            .enumerate()
            .filter_map(|(idx, set)| {
                let entries = generate_entries(set, candles);
                let (_, stats) = TradeSimulator::simulate(&entries, candles, &set.stops, features);
                if stats.n_trades < min_trades {
                    return None;
                }
                Some((idx, objective.score(&stats)))
            })
            .reduce_with(prefer_higher_score);

        let candidates_tried = candidates.len();
        match best {
            Some((idx, score)) => {
                let best_set = candidates.swap_remove(idx);
                let entries = generate_entries(&best_set, candles);
                info!(
                    "FastOptimizer: Best set {} scored {:.4} with {} entries ({} candidates tried)",
                    best_set.describe(),
                    score,
                    entries.len(),
                    candidates_tried
                );
                OptimizationResult {
                    best_set: Some(best_set),
                    entries,
                    candidates_tried,
                    best_score: score,
                }
            }
            None => {
                debug!(
                    "FastOptimizer: No candidate reached {} trades over {} bars",
                    min_trades,
                    candles.len()
                );
                OptimizationResult::empty(candidates_tried)
            }
        }
    }

    /// Regenerates entries for an already-chosen set: no search, no RNG.
    ///
    /// The validator scores test slices through this path so winning train
    /// parameters are applied frozen to unseen bars.
    pub fn generate_entries_for(&self, set: &IndicatorSet, candles: &[Candle]) -> Vec<EntryEvent> {
        generate_entries(set, candles)
    }
}

impl Default for FastOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

/// Argmax step with a deterministic tie-break: equal (or incomparable)
/// scores go to the earlier candidate.
fn prefer_higher_score(a: (usize, f64), b: (usize, f64)) -> (usize, f64) {
    match b.1.partial_cmp(&a.1) {
        Some(Ordering::Greater) => b,
        Some(Ordering::Less) => a,
        _ => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
    }
}

/// One candidate per valid trigger combination, each carrying the
/// non-trigger families at their default parameters.
fn build_candidates(space: &[IndicatorFamily]) -> Vec<IndicatorSet> {
    let voters: Vec<IndicatorSpec> = space
        .iter()
        .filter(|family| family.role != IndicatorRole::Trigger)
        .map(|family| {
            IndicatorSpec::new(
                family.name,
                family.role,
                family.default_combination(),
                family.default_weight(),
            )
        })
        .collect();

    let mut candidates = Vec::new();
    for family in space.iter().filter(|f| f.role == IndicatorRole::Trigger) {
        let generator = CombinationGenerator::from_range_specs(&family.ranges);
        for combo in generator.generate() {
            if !family.combo_valid(&combo) {
                continue;
            }
            let mut indicators = Vec::with_capacity(1 + voters.len());
            indicators.push(IndicatorSpec::new(
                family.name,
                family.role,
                combo,
                family.default_weight(),
            ));
            indicators.extend(voters.iter().cloned());
            candidates.push(IndicatorSet::new(indicators));
        }
    }
    candidates
}
