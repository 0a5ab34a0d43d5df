// Analyzer result cache
pub mod cache;

// CSV candle ingestion
pub mod data;

// Synthetic sources and test doubles
pub mod mock;

pub use cache::{AnalyzerCache, CacheStats, Fingerprint};
pub use data::CsvSource;
