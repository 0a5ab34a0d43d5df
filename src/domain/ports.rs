use anyhow::Result;

use crate::domain::market::candle::{Candle, VisibleRange};
use crate::domain::market::timeframe::Timeframe;

/// Boundary to the market-data layer.
///
/// The engine never fetches or stores data itself; it consumes validated,
/// ascending candle series through this port. Implementations live in
/// `infrastructure` (CSV files, synthetic feeds).
pub trait CandleSource: Send + Sync {
    fn fetch(&self, symbol: &str, timeframe: Timeframe, range: &VisibleRange)
    -> Result<Vec<Candle>>;
}
