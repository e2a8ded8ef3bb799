//! HTML parsing and extraction for State Department visa bulletins
//!
//! Turns one bulletin page into a [`crate::domain::Bulletin`] plus its
//! category entries, tolerating two decades of markup drift.

pub mod bulletin_parser;
pub mod dates;
pub mod error;

pub use bulletin_parser::{BulletinParser, ParsedBulletin};
pub use error::ParseError;
