// Background analysis scheduling
pub mod background_runner;
pub mod events;
pub mod metrics;
pub mod task;
