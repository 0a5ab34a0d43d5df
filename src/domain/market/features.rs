use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-bar feature columns aligned with a candle series.
///
/// Computed once per analysis so the optimizer, simulator and validator
/// share the same values; the validator cuts fold-aligned views with
/// [`FeatureSeries::slice`] so train and test never see each other's bars.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureSeries {
    len: usize,
    columns: BTreeMap<String, Vec<f64>>,
}

impl FeatureSeries {
    /// Column name carrying the per-bar ATR used for stop placement.
    pub const ATR: &'static str = "atr";

    pub fn new(len: usize) -> Self {
        Self {
            len,
            columns: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adds a column; its length must match the series length.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        ensure!(
            values.len() == self.len,
            "Feature column '{}' has {} values, expected {}",
            name,
            values.len(),
            self.len
        );
        self.columns.insert(name, values);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Returns the `[start, end)` view of every column as a new series.
    pub fn slice(&self, start: usize, end: usize) -> FeatureSeries {
        let end = end.min(self.len);
        let start = start.min(end);
        let mut sliced = FeatureSeries::new(end - start);
        for (name, values) in &self.columns {
            sliced.columns.insert(name.clone(), values[start..end].to_vec());
        }
        sliced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_rejects_length_mismatch() {
        let mut features = FeatureSeries::new(5);
        assert!(features.insert("atr", vec![1.0; 4]).is_err());
        assert!(features.insert("atr", vec![1.0; 5]).is_ok());
    }

    #[test]
    fn test_slice_cuts_all_columns() {
        let mut features = FeatureSeries::new(10);
        features.insert("atr", (0..10).map(|i| i as f64).collect::<Vec<_>>()).unwrap();
        features.insert("trend", vec![0.5; 10]).unwrap();

        let sliced = features.slice(2, 6);
        assert_eq!(sliced.len(), 4);
        assert_eq!(sliced.column("atr"), Some(&[2.0, 3.0, 4.0, 5.0][..]));
        assert_eq!(sliced.column("trend"), Some(&[0.5; 4][..]));
    }

    #[test]
    fn test_slice_clamps_out_of_range() {
        let mut features = FeatureSeries::new(3);
        features.insert("atr", vec![1.0, 2.0, 3.0]).unwrap();

        let sliced = features.slice(1, 99);
        assert_eq!(sliced.len(), 2);
        assert_eq!(sliced.column("atr"), Some(&[2.0, 3.0][..]));
    }
}
