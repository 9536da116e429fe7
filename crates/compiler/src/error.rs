//! Compile-time diagnostics. Surfaced to the host as a list, per §7:
//! "Compilation errors ... returned as a list of diagnostics, each with
//! file, line, and message."

use crate::token::Location;
use std::fmt;

/// The Python-visible exception class a diagnostic would raise if this
/// compile were attempted from Python's own `compile()` builtin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    SyntaxError,
    IndentationError,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::SyntaxError => write!(f, "SyntaxError"),
            DiagnosticKind::IndentationError => write!(f, "IndentationError"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} at {filename}:{}:{}: {message}", location.line, location.col)]
pub struct CompileError {
    pub kind: DiagnosticKind,
    pub filename: String,
    pub location: Location,
    pub message: String,
}

impl CompileError {
    pub fn syntax(filename: &str, location: Location, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::SyntaxError,
            filename: filename.to_owned(),
            location,
            message: message.into(),
        }
    }

    pub fn indentation(filename: &str, location: Location, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::IndentationError,
            filename: filename.to_owned(),
            location,
            message: message.into(),
        }
    }
}

/// All compile errors accumulated for one `compile()` call. The lexer and
/// parser bail on the first error (this is a subset compiler, not an
/// error-recovering one), but the type stays a `Vec` to match the host
/// contract of "a list of diagnostics".
pub type CompileErrors = Vec<CompileError>;
