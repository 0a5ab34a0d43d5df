// Market model
pub mod candle;
pub mod features;
pub mod regime;
pub mod timeframe;
