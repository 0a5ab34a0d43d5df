use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a proposed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// One entry signal produced by the entry generator.
///
/// Immutable once created; `source` names the indicator that fired it and
/// `confidence` carries the confirmation vote it received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryEvent {
    pub timestamp: i64,
    pub side: Side,
    pub price: f64,
    pub source: String,
    pub confidence: f64,
}

impl EntryEvent {
    pub fn new(timestamp: i64, side: Side, price: f64, source: impl Into<String>) -> Self {
        Self {
            timestamp,
            side,
            price,
            source: source.into(),
            confidence: 1.0,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// How a simulated trade ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOutcome {
    /// Target reached
    Win,
    /// Stop hit
    Loss,
    /// Timed out near break-even
    Scratch,
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeOutcome::Win => write!(f, "WIN"),
            TradeOutcome::Loss => write!(f, "LOSS"),
            TradeOutcome::Scratch => write!(f, "SCRATCH"),
        }
    }
}

/// A replayed trade with its resolved exit and R-multiple.
///
/// The R-multiple is the signed profit expressed in units of the initial
/// stop distance, so results are comparable across instruments and
/// parameter sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedTrade {
    pub entry: EntryEvent,
    pub exit_price: f64,
    pub exit_timestamp: i64,
    pub r_multiple: f64,
    pub outcome: TradeOutcome,
}

impl SimulatedTrade {
    pub fn is_win(&self) -> bool {
        self.r_multiple > 0.0
    }
}
