// Visible-window analysis pipeline
pub mod analyzer;

// Parameter search, entry generation and scoring
pub mod optimization;

// Background analysis scheduling
pub mod runner;

// Post-hoc entry filtering
pub mod trading;

// Walk-forward validation
pub mod validation;
