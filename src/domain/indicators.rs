use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Whether a parameter takes integer or fractional values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    Int,
    Float,
}

/// One optimizable parameter with its search bounds.
///
/// Invariants (`min_val <= max_val`, `step > 0`, finite bounds) are not
/// enforced here: the combination generator drops invalid ranges with a
/// warning, so a partially bad configuration degrades the search space
/// instead of aborting a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub name: String,
    pub min_val: f64,
    pub max_val: f64,
    pub step: f64,
    pub default: f64,
    pub param_type: ParamType,
}

impl ParameterRange {
    pub fn int(name: &str, min_val: i64, max_val: i64, step: i64, default: i64) -> Self {
        Self {
            name: name.to_string(),
            min_val: min_val as f64,
            max_val: max_val as f64,
            step: step as f64,
            default: default as f64,
            param_type: ParamType::Int,
        }
    }

    pub fn float(name: &str, min_val: f64, max_val: f64, step: f64, default: f64) -> Self {
        Self {
            name: name.to_string(),
            min_val,
            max_val,
            step,
            default,
            param_type: ParamType::Float,
        }
    }

    pub fn is_expandable(&self) -> bool {
        self.min_val.is_finite()
            && self.max_val.is_finite()
            && self.min_val <= self.max_val
            && self.step > 0.0
    }

    pub fn default_value(&self) -> ParamValue {
        match self.param_type {
            ParamType::Int => ParamValue::Int(self.default.round() as i64),
            ParamType::Float => ParamValue::Float(self.default),
        }
    }
}

/// A concrete parameter value inside a combination
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            ParamValue::Int(v) => *v as f64,
            ParamValue::Float(v) => *v,
        }
    }

    pub fn as_usize(&self) -> usize {
        match self {
            ParamValue::Int(v) => (*v).max(0) as usize,
            ParamValue::Float(v) => v.max(0.0).round() as usize,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One fully assembled point of the search space, keyed by parameter name.
/// BTreeMap so iteration order is stable across runs.
pub type Combination = BTreeMap<String, ParamValue>;

/// How an indicator participates in a set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndicatorRole {
    /// Proposes entries
    Trigger,
    /// Vetoes entries against the prevailing trend or condition
    Filter,
    /// Votes on proposals without producing its own
    Confirmation,
}

impl fmt::Display for IndicatorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorRole::Trigger => write!(f, "trigger"),
            IndicatorRole::Filter => write!(f, "filter"),
            IndicatorRole::Confirmation => write!(f, "confirmation"),
        }
    }
}

/// One indicator family the search space can draw from.
///
/// `constraint` rejects structurally invalid combinations (e.g. a fast EMA
/// period at or above the slow one) during enumeration; rejected
/// combinations are skipped, never errors.
#[derive(Clone)]
pub struct IndicatorFamily {
    pub name: &'static str,
    pub role: IndicatorRole,
    pub ranges: Vec<ParameterRange>,
    pub constraint: Option<fn(&Combination) -> bool>,
}

impl IndicatorFamily {
    pub fn combo_valid(&self, combo: &Combination) -> bool {
        self.constraint.map_or(true, |check| check(combo))
    }

    pub fn default_combination(&self) -> Combination {
        self.ranges
            .iter()
            .map(|range| (range.name.clone(), range.default_value()))
            .collect()
    }

    /// Default weight an indicator of this role carries in a set.
    pub fn default_weight(&self) -> f64 {
        match self.role {
            IndicatorRole::Trigger => 1.0,
            IndicatorRole::Filter => 1.0,
            IndicatorRole::Confirmation => 0.5,
        }
    }
}

fn ema_cross_valid(combo: &Combination) -> bool {
    match (combo.get("fast"), combo.get("slow")) {
        (Some(fast), Some(slow)) => fast.as_f64() < slow.as_f64(),
        _ => true,
    }
}

fn macd_valid(combo: &Combination) -> bool {
    match (combo.get("fast"), combo.get("slow")) {
        (Some(fast), Some(slow)) => fast.as_f64() < slow.as_f64(),
        _ => true,
    }
}

/// The built-in indicator families and their search ranges.
pub fn candidate_space() -> Vec<IndicatorFamily> {
    vec![
        IndicatorFamily {
            name: "rsi_reversal",
            role: IndicatorRole::Trigger,
            ranges: vec![
                ParameterRange::int("period", 7, 21, 7, 14),
                ParameterRange::float("oversold", 20.0, 35.0, 5.0, 30.0),
                ParameterRange::float("overbought", 65.0, 80.0, 5.0, 70.0),
            ],
            constraint: None,
        },
        IndicatorFamily {
            name: "ema_cross",
            role: IndicatorRole::Trigger,
            ranges: vec![
                ParameterRange::int("fast", 5, 15, 5, 10),
                ParameterRange::int("slow", 20, 50, 10, 30),
            ],
            constraint: Some(ema_cross_valid),
        },
        IndicatorFamily {
            name: "bollinger_fade",
            role: IndicatorRole::Trigger,
            ranges: vec![
                ParameterRange::int("period", 14, 26, 6, 20),
                ParameterRange::float("k", 1.5, 2.5, 0.5, 2.0),
            ],
            constraint: None,
        },
        IndicatorFamily {
            name: "macd_momentum",
            role: IndicatorRole::Confirmation,
            ranges: vec![
                ParameterRange::int("fast", 8, 12, 4, 12),
                ParameterRange::int("slow", 21, 26, 5, 26),
                ParameterRange::int("signal", 9, 9, 1, 9),
            ],
            constraint: Some(macd_valid),
        },
        IndicatorFamily {
            name: "trend_sma",
            role: IndicatorRole::Filter,
            ranges: vec![ParameterRange::int("period", 30, 60, 15, 50)],
            constraint: None,
        },
    ]
}

/// Stop and target model applied to every entry of a set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopConfig {
    pub atr_period: usize,
    pub atr_mult: f64,
    /// Target distance as a multiple of the stop distance.
    pub rr_ratio: f64,
    pub max_hold_bars: usize,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            atr_mult: 1.5,
            rr_ratio: 2.0,
            max_hold_bars: 48,
        }
    }
}

/// Post-generation cleanup applied to raw trigger proposals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PostprocessConfig {
    /// Bars to suppress further entries after an accepted one.
    pub cooldown_bars: usize,
    /// Minimum weight-fraction of agreeing filter/confirmation votes.
    pub min_confirmation: f64,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            cooldown_bars: 5,
            min_confirmation: 0.5,
        }
    }
}

/// One indicator with concrete parameters inside a set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub name: String,
    pub role: IndicatorRole,
    pub params: Combination,
    pub weight: f64,
}

impl IndicatorSpec {
    pub fn new(name: &str, role: IndicatorRole, params: Combination, weight: f64) -> Self {
        Self {
            name: name.to_string(),
            role,
            params,
            weight,
        }
    }

    pub fn param_usize(&self, name: &str, fallback: usize) -> usize {
        self.params.get(name).map_or(fallback, ParamValue::as_usize)
    }

    pub fn param_f64(&self, name: &str, fallback: f64) -> f64 {
        self.params.get(name).map_or(fallback, ParamValue::as_f64)
    }
}

/// One candidate trading rule configuration: the unit the optimizer
/// searches over and the validator freezes per fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub indicators: Vec<IndicatorSpec>,
    pub postprocess: PostprocessConfig,
    pub stops: StopConfig,
}

impl IndicatorSet {
    pub fn new(indicators: Vec<IndicatorSpec>) -> Self {
        Self {
            indicators,
            postprocess: PostprocessConfig::default(),
            stops: StopConfig::default(),
        }
    }

    pub fn triggers(&self) -> impl Iterator<Item = &IndicatorSpec> {
        self.indicators
            .iter()
            .filter(|spec| spec.role == IndicatorRole::Trigger)
    }

    pub fn voters(&self) -> impl Iterator<Item = &IndicatorSpec> {
        self.indicators
            .iter()
            .filter(|spec| spec.role != IndicatorRole::Trigger)
    }

    /// Compact description for log lines, e.g.
    /// `rsi_reversal(oversold=30, overbought=70, period=14)+macd_momentum+trend_sma`.
    pub fn describe(&self) -> String {
        let mut parts = Vec::with_capacity(self.indicators.len());
        for spec in &self.indicators {
            if spec.role == IndicatorRole::Trigger {
                let params: Vec<String> = spec
                    .params
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect();
                parts.push(format!("{}({})", spec.name, params.join(", ")));
            } else {
                parts.push(spec.name.to_string());
            }
        }
        parts.join("+")
    }
}

/// The set used when optimization is disabled: every family at its default
/// parameters.
pub fn default_set() -> IndicatorSet {
    let specs = candidate_space()
        .iter()
        .map(|family| {
            IndicatorSpec::new(
                family.name,
                family.role,
                family.default_combination(),
                family.default_weight(),
            )
        })
        .collect();
    IndicatorSet::new(specs)
}
