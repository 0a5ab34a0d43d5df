// Market model (candles, timeframes, regimes, features)
pub mod market;

// Indicator families and candidate search space
pub mod indicators;

// Candle-source and analyzer port traits
pub mod ports;

// Entries, simulated trades and their statistics
pub mod trading;

// Analysis error types
pub mod errors;
