//! Host-facing error/result types.
//!
//! Scripted runtime errors are carried as the per-fiber `error: Option<String>`
//! field — they never become a Rust `Err`, since the interpreter must keep
//! other suspended fibers alive and simply unwinds the one that failed.
//! `VmFault` is for the other kind: host API misuse (bad handle, wrong slot
//! index) that's a programming error in the embedder, not a scripted
//! failure.

use std::fmt;

#[derive(Debug, Clone)]
pub enum VmFault {
    InvalidHandle,
    SlotIndexOutOfRange { index: usize, count: usize },
    WrongKind { expected: &'static str, got: &'static str },
    NoCurrentFiber,
}

impl fmt::Display for VmFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmFault::InvalidHandle => write!(f, "invalid or already-released handle"),
            VmFault::SlotIndexOutOfRange { index, count } => {
                write!(f, "slot index {index} out of range (have {count} slots)")
            }
            VmFault::WrongKind { expected, got } => {
                write!(f, "expected a {expected}, found a {got}")
            }
            VmFault::NoCurrentFiber => write!(f, "no fiber is currently running"),
        }
    }
}

/// What a top-level `runString`/`runFile`/`runREPL` call returns.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Success,
    /// Only ever returned by `runREPL`'s inner compile step, to trigger
    /// another line of input before retrying.
    UnexpectedEof,
    CompileError(Vec<pocket_compiler::CompileError>),
    RuntimeError(String),
}

impl RunOutcome {
    /// `0` on success, nonzero otherwise — the CLI's `Result` cast to int,
    /// per the embedding contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::UnexpectedEof => 0,
            RunOutcome::CompileError(_) => 65,
            RunOutcome::RuntimeError(_) => 70,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}
