//! Parsing error types
//!
//! Structural problems abort one bulletin only; cell-level problems are
//! reported as warnings on the parsed value instead.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no visa tables found in document ({url})")]
    NoVisaTables { url: String },

    #[error("document is not parseable HTML: {message}")]
    InvalidDocument { message: String },
}
