// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The diagnostic surface shared by decoding and validation.
//!
//! Decoding failures abort the entity being decoded and surface as
//! [`crate::decode::DecodeError`]; validation failures accumulate in an
//! [`ErrorSink`] so a single pass can report everything wrong with a
//! module. Both speak the same closed [`ErrorKind`] vocabulary.

use thiserror::Error;

use crate::types::SectionId;

/// Everything that can be wrong with a module.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ErrorKind {
    // Decoding.
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("integer representation too long")]
    LebOverflow,
    #[error("integer too large")]
    LebUnusedBits,
    #[error("invalid UTF-8 encoding")]
    InvalidUtf8,
    #[error("magic mismatch: expected 0x6d736100, got {0:#010x}")]
    BadMagic(u32),
    #[error("version mismatch: expected 1, got {0}")]
    BadVersion(u32),
    #[error("unknown section id {0}")]
    UnknownSection(u8),
    #[error("section out of order: {after:?} after {before:?}")]
    SectionOrder { before: SectionId, after: SectionId },
    #[error("length mismatch: declared {declared}, got {actual}")]
    SectionLengthMismatch { declared: u32, actual: u32 },

    // Instructions.
    #[error("unknown opcode {}{code:#04x}", .prefix.map(|p| format!("{p:#04x} ")).unwrap_or_default())]
    UnknownOpcode { prefix: Option<u8>, code: u32 },
    #[error("invalid {0}")]
    InvalidImmediate(&'static str),
    #[error("{0} not allowed (feature disabled)")]
    FeatureDisabled(&'static str),

    // Structure.
    #[error("invalid {desc} {index}, must be less than {max}")]
    IndexOutOfRange {
        desc: &'static str,
        index: u32,
        max: u32,
    },
    #[error("duplicate export name {0:?}")]
    DuplicateExport(String),
    #[error("too many tables ({count}), must be 1 or fewer")]
    TooManyTables { count: u32 },
    #[error("too many memories ({count}), must be 1 or fewer")]
    TooManyMemories { count: u32 },
    #[error("{0} cannot be shared")]
    SharedNotAllowed(&'static str),
    #[error("limits minimum {min} must be <= maximum {max}")]
    LimitsMismatch { min: u32, max: u32 },
    #[error("{desc} of {count} pages exceeds the maximum of 65536")]
    PageCountExceeded { desc: &'static str, count: u32 },

    // Types.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
    #[error("value stack underflow")]
    StackUnderflow,
    #[error("misaligned label: {0}")]
    UnalignedLabel(&'static str),
    #[error("values remaining on stack at end of block")]
    UnreachableMismatch,
    #[error("start function must have no parameters and no results, got {params} and {results}")]
    WrongFunctionSignature { params: usize, results: usize },
    #[error("a constant expression cannot contain a mutable global")]
    MutableGlobalInConstExpr,
    #[error("undeclared function reference {0}")]
    UndeclaredFunctionRef(u32),
    #[error("implementation limit exceeded: {0}")]
    InternalLimitExceeded(&'static str),
}

/// One reported problem: where, what, and the breadcrumb trail of what was
/// being validated at the time.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    /// Byte offset within the input.
    pub offset: usize,
    /// What went wrong.
    pub kind: ErrorKind,
    /// Outermost-first breadcrumbs, e.g. `["function 3", "limits"]`.
    pub context: Vec<String>,
}

impl Diagnostic {
    /// The rendered message for this diagnostic.
    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

/// Receives validation diagnostics.
///
/// The breadcrumb hooks are optional; sinks that only care about the
/// errors themselves can ignore them.
pub trait ErrorSink {
    /// Report one problem at the given input offset.
    fn report(&mut self, offset: usize, kind: ErrorKind);

    /// Enter a nested validation scope (e.g. "function 3").
    fn push_context(&mut self, offset: usize, desc: &str) {
        let _ = (offset, desc);
    }

    /// Leave the innermost validation scope.
    fn pop_context(&mut self) {}
}

/// An [`ErrorSink`] that collects every diagnostic, stamping each with the
/// breadcrumb path that was live when it was reported.
#[derive(Debug, Default)]
pub struct CollectedErrors {
    /// Everything reported so far, in report order.
    pub diagnostics: Vec<Diagnostic>,
    path: Vec<String>,
}

impl CollectedErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

impl ErrorSink for CollectedErrors {
    fn report(&mut self, offset: usize, kind: ErrorKind) {
        self.diagnostics.push(Diagnostic {
            offset,
            kind,
            context: self.path.clone(),
        });
    }

    fn push_context(&mut self, _offset: usize, desc: &str) {
        self.path.push(desc.to_string());
    }

    fn pop_context(&mut self) {
        debug_assert!(!self.path.is_empty());
        self.path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collected_errors_snapshot_the_breadcrumb_path() {
        let mut errors = CollectedErrors::new();
        errors.push_context(0, "function 3");
        errors.push_context(2, "limits");
        errors.report(4, ErrorKind::LimitsMismatch { min: 2, max: 1 });
        errors.pop_context();
        errors.pop_context();
        errors.report(8, ErrorKind::StackUnderflow);

        assert_eq!(errors.diagnostics.len(), 2);
        assert_eq!(errors.diagnostics[0].context, ["function 3", "limits"]);
        assert_eq!(errors.diagnostics[0].offset, 4);
        assert!(errors.diagnostics[1].context.is_empty());
    }

    #[test]
    fn messages_render_from_kinds() {
        let diagnostic = Diagnostic {
            offset: 0,
            kind: ErrorKind::IndexOutOfRange {
                desc: "function index",
                index: 7,
                max: 3,
            },
            context: Vec::new(),
        };
        assert_eq!(
            diagnostic.message(),
            "invalid function index 7, must be less than 3"
        );
    }
}
