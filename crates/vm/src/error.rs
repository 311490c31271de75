//! Error types for the compiler.
//!
//! Hand-rolled `Display`/`std::error::Error` impls, no derive crate —
//! the workspace carries no error-derive dependency anywhere.

use std::fmt;

/// A single compile error: one error per compilation unit. Once one is
/// recorded the compiler force-terminates and returns this
/// alongside a best-effort `Function` the caller must discard.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub message: String,
    /// Two lines of context before the offending line, the offending line
    /// itself, and a caret underline beneath the error column.
    pub excerpt: String,
    pub script: String,
    pub row: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{})\n{}",
            self.message, self.script, self.row, self.excerpt
        )
    }
}

impl std::error::Error for CompileError {}
