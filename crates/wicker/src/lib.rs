// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

// Warn on missing documentation for public items
#![warn(missing_docs)]

// Allow large error types - the WickerError enum carries rich context for
// debugging (source snippets, chained causes). This is an intentional design
// choice for better DX.
#![allow(clippy::result_large_err)]

//! # Wicker
//!
//! Twig-compatible template engine for Rust.
//!
//! Wicker parses templates that interleave literal text with expression
//! output (`{{ ... }}`) and control blocks (`{% ... %}`), and renders them
//! against dynamically typed data.
//!
//! ## Features
//!
//! - The standard Twig feature set: variables, filters (`x|upper`), tests
//!   (`x is odd`), functions (`range(1, 5)`), `if`/`for`/`set`
//! - Template inheritance (`extends`/`block`/`parent()`) and composition
//!   (`include`, `import`, `from ... import`, `embed`), macros with
//!   defaults
//! - Escape-by-default output with explicit `raw`, and a sandbox mode
//! - A precompiled binary template format for disk caching
//! - Concurrent rendering of previously loaded templates
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wicker::Engine;
//!
//! let engine = Engine::new();
//! engine.add_template("hello.html", "Hello {{ name }}!")?;
//! let html = engine.render("hello.html", serde_json::json!({ "name": "World" }))?;
//! assert_eq!(html, "Hello World!");
//! ```

/// Abstract Syntax Tree node types.
pub mod ast;
/// Compiled-template caching.
pub mod cache;
/// Compiled template codec (binary envelope).
pub mod codec;
/// Render context: scopes, autoescape stack, block chain.
pub mod context;
/// Main template engine.
pub mod engine;
/// Error types and reporting.
pub mod error;
/// Output escaping strategies.
pub mod escape;
/// Built-in filters.
pub mod filters;
/// Built-in functions.
pub mod functions;
/// Template lexer.
pub mod lexer;
/// Template source loaders.
pub mod loader;
/// Pooled render buffers.
pub mod pool;
/// Template parser.
pub mod parser;
/// Render engine.
mod render;
/// Sandbox policy.
pub mod sandbox;
/// Parsed template representation.
pub mod template;
/// Built-in `is` tests.
pub mod tests;
/// Dynamic value model and coercion.
pub mod value;

pub use cache::{FileSystemCache, MemoryCache, NoOpCache, TemplateCache};
pub use engine::Engine;
pub use error::{Result, SandboxTarget, SourceContext, WickerError};
pub use escape::EscapeStrategy;
pub use loader::{FileSystemLoader, Loader, MemoryLoader, SourceTemplate};
pub use sandbox::SandboxPolicy;
pub use template::Template;
pub use value::{to_value, value_from_json, Callable, Object, Value, ValueMap};

#[cfg(test)]
mod engine_tests;
