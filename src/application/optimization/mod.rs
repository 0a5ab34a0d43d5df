// Parameter search, entry generation and scoring modules
pub mod objective;
pub mod optimizer;
pub mod param_space;
pub mod signals;
pub mod simulator;
