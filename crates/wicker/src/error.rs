// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Error types for the Wicker template engine.
//!
//! This module defines [`WickerError`], the main error enum, and helper types
//! for rich error reporting with source context.
//!
//! # Error Categories
//!
//! - **Load errors**: Template could not be located or read
//! - **Parse errors**: Invalid template syntax
//! - **Render errors**: Failures while evaluating a template
//! - **Type errors**: Incompatible operands or bad coercion
//! - **Sandbox errors**: Policy violations in sandboxed renders
//! - **Undefined errors**: Unknown variable access in strict mode
//! - **Cache errors**: Compiled-template cache failures
//!
//! # Source Context
//!
//! Parse errors include [`SourceContext`] for rich error messages
//! showing the problematic template with line numbers and a caret pointing
//! to the exact error location.

use std::fmt;
use thiserror::Error;

/// Source context for enhanced error messages.
///
/// Captures a snippet of template source around an error location,
/// enabling rich error messages with line numbers and visual indicators.
#[derive(Debug, Clone)]
pub struct SourceContext {
    /// All lines from the template source.
    pub lines: Vec<String>,
    /// The line number where the error occurred (1-indexed).
    pub error_line: usize,
    /// The column number where the error occurred (1-indexed).
    pub error_column: usize,
    /// First line number of the snippet (1-indexed).
    pub snippet_start: usize,
    /// Last line number of the snippet (1-indexed).
    pub snippet_end: usize,
}

impl SourceContext {
    /// Creates a source context from template source and error location.
    ///
    /// Captures 3 lines before and after the error line for context.
    pub fn from_source(source: &str, line: usize, column: usize) -> Self {
        let lines: Vec<String> = source.lines().map(|l| l.to_string()).collect();
        let snippet_start = line.saturating_sub(3).max(1);
        let snippet_end = (line + 3).min(lines.len());

        Self {
            lines,
            error_line: line,
            error_column: column,
            snippet_start,
            snippet_end,
        }
    }

    /// Formats the source snippet with line numbers and error indicator.
    ///
    /// Returns a string like:
    /// ```text
    ///    4 | <ul>
    ///    5 |   {{ item.name | }}
    ///      |                 ^
    ///    6 | </ul>
    /// ```
    pub fn format_snippet(&self) -> String {
        let mut result = String::new();

        for line_num in self.snippet_start..=self.snippet_end {
            if line_num > self.lines.len() {
                break;
            }

            let line = &self.lines[line_num - 1];
            let is_error_line = line_num == self.error_line;

            result.push_str(&format!("{:4} | {}\n", line_num, line));

            if is_error_line {
                result.push_str(&format!(
                    "     | {}^\n",
                    " ".repeat(self.error_column.saturating_sub(1))
                ));
            }
        }

        result
    }
}

impl fmt::Display for SourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_snippet())
    }
}

/// Helper struct for displaying optional source context.
pub struct OptSourceContextDisplay<'a>(pub &'a Option<SourceContext>);

impl<'a> fmt::Display for OptSourceContextDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ctx) => write!(f, "{}", ctx),
            None => write!(f, ""),
        }
    }
}

/// Helper trait for formatting optional source context.
pub trait AsDisplay<'a> {
    /// Wraps self for Display formatting.
    fn as_display(&'a self) -> OptSourceContextDisplay<'a>;
}

impl<'a> AsDisplay<'a> for Option<SourceContext> {
    fn as_display(&'a self) -> OptSourceContextDisplay<'a> {
        OptSourceContextDisplay(self)
    }
}

/// The category of entity blocked by the sandbox policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxTarget {
    /// A function call.
    Function,
    /// A filter application.
    Filter,
    /// A test application.
    Test,
    /// A method invocation on a host object.
    Method,
    /// An attribute access on a host object.
    Attribute,
    /// A statement tag.
    Tag,
}

impl fmt::Display for SandboxTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxTarget::Function => "function",
            SandboxTarget::Filter => "filter",
            SandboxTarget::Test => "test",
            SandboxTarget::Method => "method",
            SandboxTarget::Attribute => "attribute",
            SandboxTarget::Tag => "tag",
        };
        write!(f, "{}", s)
    }
}

/// The main error type for Wicker operations.
///
/// All Wicker functions return `Result<T, WickerError>` to provide
/// detailed error information for debugging and user feedback.
#[derive(Error, Debug)]
pub enum WickerError {
    /// Template could not be located by any loader.
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// A loader failed while reading a template.
    #[error("Load error for {name}: {message}")]
    LoadError {
        /// The template name being loaded.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// Template parsing failed due to invalid syntax.
    #[error("Parse error in {name}: {message} at line {line}, column {column}\n{}", source_context.as_display())]
    ParseError {
        /// The template name.
        name: String,
        /// Description of the parse error.
        message: String,
        /// Line number where the error occurred.
        line: usize,
        /// Column number where the error occurred.
        column: usize,
        /// Source context for rich error display.
        source_context: Option<SourceContext>,
    },

    /// Runtime error during template rendering.
    #[error("Render error in {name} at line {line}: {message}")]
    RenderError {
        /// The template where the error occurred.
        name: String,
        /// Source line of the failing node.
        line: usize,
        /// Error message.
        message: String,
        /// The originating cause, if the failure was chained.
        #[source]
        cause: Option<Box<WickerError>>,
    },

    /// Incompatible operands or bad coercion.
    #[error("Type error: {0}")]
    TypeError(String),

    /// A sandboxed render attempted to use a blocked entity.
    #[error("Sandbox violation: {target} \"{entity}\" is not allowed")]
    SandboxError {
        /// The blocked entity name.
        entity: String,
        /// The entity category.
        target: SandboxTarget,
    },

    /// Unknown variable access in strict mode.
    #[error("Undefined variable: {0}")]
    UndefinedError(String),

    /// Compiled-template cache operation failed.
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Compiled-template envelope could not be decoded.
    #[error("Codec error: {0}")]
    CodecError(String),

    /// File I/O error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WickerError {
    /// Wraps this error as a render failure at the given template location.
    ///
    /// Render and sandbox errors already carry their location and pass
    /// through unchanged so the innermost failure site wins.
    pub fn at(self, name: &str, line: usize) -> WickerError {
        match self {
            e @ WickerError::RenderError { .. } | e @ WickerError::SandboxError { .. } => e,
            cause => WickerError::RenderError {
                name: name.to_string(),
                line,
                message: cause.to_string(),
                cause: Some(Box::new(cause)),
            },
        }
    }

    /// Returns true for the not-found signal that `include ... ignore missing`
    /// and `exists()` probes recover from.
    pub fn is_not_found(&self) -> bool {
        matches!(self, WickerError::TemplateNotFound(_))
    }

    /// Returns true for undefined-variable failures, recoverable by the
    /// `default` filter and the `defined` test.
    pub fn is_undefined(&self) -> bool {
        match self {
            WickerError::UndefinedError(_) => true,
            WickerError::RenderError {
                cause: Some(cause), ..
            } => cause.is_undefined(),
            _ => false,
        }
    }
}

/// Convenience type alias for Results with [`WickerError`].
pub type Result<T> = std::result::Result<T, WickerError>;
