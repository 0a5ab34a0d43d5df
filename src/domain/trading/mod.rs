// Entry events, simulated trades and their statistics
pub mod stats;
pub mod types;
