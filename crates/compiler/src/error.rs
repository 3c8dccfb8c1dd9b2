//! Compile-time error reporting.
//!
//! Plain enums with `Display` impls, no `anyhow`/`thiserror` — matching the
//! rest of the workspace's ambient-error style.

use std::fmt;

#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub path: String,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.path, self.line, self.message)
    }
}

/// What a top-level `compile` call returns. Distinguishes an unexpected
/// end-of-input (the REPL's cue to buffer another line) from a genuine
/// error, per the embedding contract.
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    Success,
    UnexpectedEof,
    CompileError(Vec<CompileError>),
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutcome::Success)
    }
}
