use std::collections::BTreeMap;
use tracing::warn;

use crate::domain::indicators::{Combination, ParamType, ParamValue, ParameterRange};

/// Derivation applied to every generated combination, keyed by the new
/// parameter's name.
type DeriveFn = Box<dyn Fn(&Combination) -> ParamValue + Send + Sync>;

/// Expands sparse `{min, max, step}` range specs into the full discrete
/// search space and enumerates its cartesian product lazily.
///
/// Axes keep declaration order, so enumeration is stable: the first
/// declared parameter varies slowest, the last varies fastest. A fresh
/// call to [`CombinationGenerator::generate`] restarts from the first
/// combination.
pub struct CombinationGenerator {
    axes: Vec<(String, Vec<ParamValue>)>,
    derived: Vec<(String, DeriveFn)>,
}

impl CombinationGenerator {
    /// Builds a generator from already-expanded value lists.
    pub fn new(axes: Vec<(String, Vec<ParamValue>)>) -> Self {
        Self {
            axes,
            derived: Vec::new(),
        }
    }

    /// Builds a generator by expanding range specs.
    ///
    /// Ranges with unusable bounds (non-finite, inverted, zero step) are
    /// dropped with a warning rather than failing the whole space: a
    /// partially bad configuration shrinks the search, it never aborts it.
    pub fn from_range_specs(ranges: &[ParameterRange]) -> Self {
        let mut axes = Vec::with_capacity(ranges.len());
        for range in ranges {
            if !range.is_expandable() {
                warn!(
                    "ParamSpace: Dropping parameter '{}' with unusable range (min={}, max={}, step={})",
                    range.name, range.min_val, range.max_val, range.step
                );
                continue;
            }
            axes.push((range.name.clone(), expand_range(range)));
        }
        Self::new(axes)
    }

    /// Registers a derived parameter, computed from each assembled
    /// combination and appended under `name`.
    pub fn with_derived(
        mut self,
        name: &str,
        derive: impl Fn(&Combination) -> ParamValue + Send + Sync + 'static,
    ) -> Self {
        self.derived.push((name.to_string(), Box::new(derive)));
        self
    }

    /// Exact number of combinations without enumerating them.
    /// An empty space counts as one (the empty combination).
    pub fn count(&self) -> usize {
        self.axes.iter().map(|(_, values)| values.len()).product()
    }

    /// Lazily enumerates the cartesian product. Restartable: each call
    /// begins a fresh pass over the space.
    pub fn generate(&self) -> Combinations<'_> {
        Combinations {
            generator: self,
            indices: vec![0; self.axes.len()],
            done: self.axes.iter().any(|(_, values)| values.is_empty()),
        }
    }
}

/// Iterator over the cartesian product of a [`CombinationGenerator`].
pub struct Combinations<'a> {
    generator: &'a CombinationGenerator,
    indices: Vec<usize>,
    done: bool,
}

impl Iterator for Combinations<'_> {
    type Item = Combination;

    fn next(&mut self) -> Option<Combination> {
        if self.done {
            return None;
        }

        let mut combo = BTreeMap::new();
        for (axis, (name, values)) in self.generator.axes.iter().enumerate() {
            combo.insert(name.clone(), values[self.indices[axis]]);
        }
        for (name, derive) in &self.generator.derived {
            let value = derive(&combo);
            combo.insert(name.clone(), value);
        }

        // Odometer advance, last axis fastest; full wrap ends the pass.
        self.done = true;
        for axis in (0..self.indices.len()).rev() {
            self.indices[axis] += 1;
            if self.indices[axis] < self.generator.axes[axis].1.len() {
                self.done = false;
                break;
            }
            self.indices[axis] = 0;
        }

        Some(combo)
    }
}

/// Expands one range into its discrete values: start at `min`, add `step`
/// while the value stays at or below `max`. Float values are rounded to 3
/// decimals after each increment so binary drift never leaks into the
/// space, with consecutive post-round duplicates collapsed.
fn expand_range(range: &ParameterRange) -> Vec<ParamValue> {
    let mut values = Vec::new();
    match range.param_type {
        ParamType::Int => {
            let step = (range.step.round() as i64).max(1);
            let max = range.max_val.round() as i64;
            let mut current = range.min_val.round() as i64;
            while current <= max {
                values.push(ParamValue::Int(current));
                current += step;
            }
        }
        ParamType::Float => {
            let mut current = round3(range.min_val);
            while current <= range.max_val + 1e-9 {
                if values.last() != Some(&ParamValue::Float(current)) {
                    values.push(ParamValue::Float(current));
                }
                let next = round3(current + range.step);
                if next <= current {
                    // Step below rounding resolution; stop instead of spinning.
                    break;
                }
                current = next;
            }
        }
    }
    values
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
