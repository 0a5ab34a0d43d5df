// Post-hoc entry filtering
pub mod trade_filter;
