pub mod agent;
pub mod config;
pub mod export;
pub mod sink;
pub mod sync;
pub mod tracer;
