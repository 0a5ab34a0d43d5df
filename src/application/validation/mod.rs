// Walk-forward validation of optimizer selections
pub mod walk_forward;
