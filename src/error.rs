use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::SourceLocation;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_UNRESOLVED_IDENTIFIER: &str = "SC-ERR-SCOPE-001";
pub const ERR_INVALID_BINDING: &str = "SC-ERR-BIND-001";
pub const ERR_REACTIVITY_BOUNDARY: &str = "SC-ERR-BIND-002";
pub const ERR_INVALID_EXPRESSION: &str = "SC-ERR-SYNTAX-001";
pub const ERR_INVALID_DECLARATION: &str = "SC-ERR-DECL-001";
pub const ERR_AMBIGUOUS_SLOT: &str = "SC-ERR-SLOT-001";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    UnresolvedIdentifier,
    InvalidBinding,
    ReactivityBoundary,
    InvalidExpression,
    InvalidDeclaration,
    /// Internal invariant violation in slot assignment.
    AmbiguousSlot,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::UnresolvedIdentifier => ERR_UNRESOLVED_IDENTIFIER,
            ErrorKind::InvalidBinding => ERR_INVALID_BINDING,
            ErrorKind::ReactivityBoundary => ERR_REACTIVITY_BOUNDARY,
            ErrorKind::InvalidExpression => ERR_INVALID_EXPRESSION,
            ErrorKind::InvalidDeclaration => ERR_INVALID_DECLARATION,
            ErrorKind::AmbiguousSlot => ERR_AMBIGUOUS_SLOT,
        }
    }

    fn guarantee(self) -> &'static str {
        match self {
            ErrorKind::UnresolvedIdentifier => {
                "Every identifier in markup and handlers resolves to a declaration in the component scope."
            }
            ErrorKind::InvalidBinding => {
                "Events bind to declared handlers only, and handlers are never used as values."
            }
            ErrorKind::ReactivityBoundary => {
                "Reactive state may only be read inside markup. Reactive state may only be written inside event handlers."
            }
            ErrorKind::InvalidExpression => "Every expression and handler body is valid JavaScript.",
            ErrorKind::InvalidDeclaration => {
                "Declared names are unique, valid identifiers and never shadow compiler-reserved names."
            }
            ErrorKind::AmbiguousSlot => "Each DOM node is owned by exactly one slot of exactly one fragment.",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {message} (at {}{site})", .file.as_deref().map(|f| format!("{}: ", f)).unwrap_or_default())]
pub struct CompilerError {
    pub kind: ErrorKind,
    /// Source file of the component, when the front end supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub code: String,
    pub message: String,
    pub guarantee: String,
    pub component: String,
    pub site: String,
    pub line: u32,
    pub column: u32,
    pub hints: Vec<String>,
}

impl CompilerError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        component: &str,
        site: impl Into<String>,
        location: &SourceLocation,
    ) -> Self {
        CompilerError {
            kind,
            file: None,
            code: kind.code().to_string(),
            message: message.into(),
            guarantee: kind.guarantee().to_string(),
            component: component.to_string(),
            site: site.into(),
            line: location.line,
            column: location.column,
            hints: vec![],
        }
    }

    pub fn with_hint(&mut self, hint: impl Into<String>) -> &mut Self {
        self.hints.push(hint.into());
        self
    }

    /// Attach the component's source file. An empty path leaves the error unchanged.
    pub fn in_file(mut self, file: &str) -> Self {
        if !file.is_empty() {
            self.file = Some(file.to_string());
        }
        self
    }
}

/// All fatal errors of one component. Compilation of that component produced no output.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("component `{component}` failed to compile with {} error(s)", errors.len())]
pub struct CompileFailure {
    pub component: String,
    pub errors: Vec<CompilerError>,
}

impl CompileFailure {
    pub fn new(component: &str, errors: Vec<CompilerError>) -> Self {
        CompileFailure {
            component: component.to_string(),
            errors,
        }
    }

    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}
