pub mod aggregated;
pub mod output;
