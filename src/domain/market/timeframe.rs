use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Candle interval of the chart window under analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    OneMin,
    FiveMin,
    FifteenMin,
    OneHour,
    FourHour,
    OneDay,
}

impl Timeframe {
    /// Minutes per bar and the chart-style label, kept in one place
    fn descriptor(self) -> (usize, &'static str) {
        match self {
            Self::OneMin => (1, "1m"),
            Self::FiveMin => (5, "5m"),
            Self::FifteenMin => (15, "15m"),
            Self::OneHour => (60, "1h"),
            Self::FourHour => (240, "4h"),
            Self::OneDay => (1440, "1d"),
        }
    }

    /// Minutes covered by one bar of this timeframe
    pub fn to_minutes(&self) -> usize {
        self.descriptor().0
    }

    /// Seconds covered by one bar, the step between candle timestamps
    pub fn to_seconds(&self) -> i64 {
        self.to_minutes() as i64 * 60
    }

    /// Short chart-style label ("1m", "4h", ...)
    pub fn label(&self) -> &'static str {
        self.descriptor().1
    }

    /// Every supported timeframe, shortest bar first
    pub fn all() -> Vec<Timeframe> {
        vec![
            Self::OneMin,
            Self::FiveMin,
            Self::FifteenMin,
            Self::OneHour,
            Self::FourHour,
            Self::OneDay,
        ]
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let needle = raw.to_lowercase();
        if let Some(tf) = Self::all().into_iter().find(|tf| needle == tf.label()) {
            return Ok(tf);
        }
        let tf = match needle.as_str() {
            "1min" | "onemin" => Self::OneMin,
            "5min" | "fivemin" => Self::FiveMin,
            "15min" | "fifteenmin" => Self::FifteenMin,
            "1hour" | "onehour" => Self::OneHour,
            "4hour" | "fourhour" => Self::FourHour,
            "1day" | "oneday" => Self::OneDay,
            _ => bail!(
                "Invalid timeframe: '{}'. Valid options: 1m, 5m, 15m, 1h, 4h, 1d",
                raw
            ),
        };
        Ok(tf)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
