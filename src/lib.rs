//! Visa Bulletin ingestion, analytics and forecasting pipeline
//!
//! Layered like the rest of our tooling: `domain` holds the canonical
//! model and repository contract, `infrastructure` the HTTP, parsing and
//! storage machinery, `application` the collector, analytics and
//! forecasting built on top.

pub mod application;
pub mod domain;
pub mod infrastructure;
