use thiserror::Error;

/// An extracted object that could not be classified, with or without ANSI codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unparseable event: {error} (after stripping ANSI: {retry_error})")]
pub struct ParseFailure {
    pub raw: String,
    pub error: String,
    pub retry_error: String,
}
