//! # Error Types and the Error Log
//!
//! Every user-visible failure is a [`Diagnostic`] appended to an [`ErrorLog`];
//! the lexer and parser keep going after recording one so a single run yields
//! as many diagnostics as possible. Phases downstream of the parser abort the
//! current module on error but never partially emit.
//!
//! Internal invariant violations are a separate kind ([`BuildError::Internal`])
//! so bug indicators are never mistaken for user errors.

use crate::display::{DisplayPosition, DisplayRange};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Lexical errors. Carried inside invalid lexemes so the parser can produce
/// one-shot diagnostics without aborting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("invalid character '{0}'")]
    InvalidChar(char),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unterminated code block")]
    UnterminatedCode,

    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),

    #[error("invalid type name '{0}'")]
    InvalidTypeName(String),
}

/// Parse errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),

    #[error("unknown declaration '{name}/{arity}'")]
    UnknownDeclaration { name: String, arity: usize },

    #[error("'{name}' used with {found} arguments but declared with {expected}")]
    ArityMismatch { name: String, expected: usize, found: usize },

    #[error("type mismatch for '{name}': parameter {param} is {expected}, got {found}")]
    TypeMismatch { name: String, param: usize, expected: String, found: String },

    #[error("redeclaration of '{name}/{arity}' does not match the original")]
    RedeclarationMismatch { name: String, arity: usize },

    #[error("import cycle through '{0}'")]
    ImportCycle(String),

    #[error("cannot resolve import '{0}'")]
    UnresolvedImport(String),

    #[error(transparent)]
    Lex(#[from] LexError),
}

/// Semantic errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SemaError {
    #[error("variable '{var}' is not range-restricted")]
    RangeRestriction { var: String },

    #[error("no binding pattern of '{name}' is satisfiable at this use")]
    BindingUnsatisfiable { name: String },

    #[error("negation of '{0}' occurs in a dependency cycle")]
    NegationInCycle(String),

    #[error("aggregate misuse: {0}")]
    AggregateMisuse(String),

    #[error("message '{name}' {reason}")]
    MessagePlacement { name: String, reason: String },
}

/// Lowering errors (data-flow and control-flow IR builders).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("clause for '{0}' has no evaluable permutation")]
    NoValidPermutation(String),

    /// A bug indicator, not a user error. Never silently swallowed.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Severity of a recorded diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

/// One note attached to a diagnostic, e.g. pointing at a conflicting
/// redeclaration.
#[derive(Debug, Clone)]
pub struct Note {
    pub range: DisplayRange,
    pub message: String,
}

/// A rendered-but-unstyled diagnostic: the error log owns coordinates and
/// text; the display collaborator owns carets and colors.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub position: DisplayPosition,
    pub range: DisplayRange,
    /// Optional sub-range to underline within `range`.
    pub sub_range: Option<DisplayRange>,
    pub message: String,
    pub notes: Vec<Note>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        };
        write!(f, "{}: {}: {}", self.position, tag, self.message)?;
        for note in &self.notes {
            write!(f, "\n  note: {}: {}", note.range, note.message)?;
        }
        Ok(())
    }
}

/// Builder for a diagnostic being appended to the log.
pub struct DiagnosticBuilder<'a> {
    log: &'a ErrorLog,
    diag: Diagnostic,
}

impl DiagnosticBuilder<'_> {
    pub fn with_sub_range(mut self, range: DisplayRange) -> Self {
        self.diag.sub_range = Some(range);
        self
    }

    pub fn note(mut self, range: DisplayRange, message: impl Into<String>) -> Self {
        self.diag.notes.push(Note { range, message: message.into() });
        self
    }
}

impl Drop for DiagnosticBuilder<'_> {
    fn drop(&mut self) {
        let diag = Diagnostic {
            severity: self.diag.severity,
            position: self.diag.position,
            range: self.diag.range,
            sub_range: self.diag.sub_range,
            message: std::mem::take(&mut self.diag.message),
            notes: std::mem::take(&mut self.diag.notes),
        };
        self.log.push(diag);
    }
}

/// Shared accumulator of diagnostics. Cloning shares the underlying log.
#[derive(Clone, Default)]
pub struct ErrorLog {
    diagnostics: Arc<Mutex<Vec<Diagnostic>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, diag: Diagnostic) {
        self.diagnostics.lock().push(diag);
    }

    /// Record an error at `range`; chain `.note(..)` calls on the returned
    /// builder to attach secondary locations.
    pub fn error(&self, range: DisplayRange, message: impl fmt::Display) -> DiagnosticBuilder<'_> {
        DiagnosticBuilder {
            log: self,
            diag: Diagnostic {
                severity: Severity::Error,
                position: range.from,
                range,
                sub_range: None,
                message: message.to_string(),
                notes: Vec::new(),
            },
        }
    }

    pub fn warning(&self, range: DisplayRange, message: impl fmt::Display) -> DiagnosticBuilder<'_> {
        DiagnosticBuilder {
            log: self,
            diag: Diagnostic {
                severity: Severity::Warning,
                position: range.from,
                range,
                sub_range: None,
                message: message.to_string(),
                notes: Vec::new(),
            },
        }
    }

    /// Number of error-severity diagnostics. Warnings and notes do not count
    /// toward the exit code.
    pub fn error_count(&self) -> usize {
        self.diagnostics
            .lock()
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.error_count() == 0
    }

    pub fn drain(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }
}

impl fmt::Debug for ErrorLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorLog")
            .field("errors", &self.error_count())
            .finish()
    }
}
