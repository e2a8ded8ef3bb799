//! Application layer
//!
//! The collector orchestrates planning, fetching, parsing and storage;
//! analytics and forecasting read back from the repository.

pub mod analytics;
pub mod collector;
pub mod forecasting;

pub use collector::{CollectOptions, Collector, RunReport};
