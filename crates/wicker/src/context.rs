// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Render context.
//!
//! The mutable state threaded through a single render call: the variable
//! scope stack, the resolved inheritance chain, the block cursor used by
//! `parent()`, the autoescape stack and the sandbox flag.
//!
//! Scopes form a stack; lookups traverse top-down and `set` writes to the
//! top frame. The inheritance chain is ordered most-derived first; block
//! resolution picks the most-derived declaration and `parent()` walks
//! towards the root ancestor. Contexts are never shared between concurrent
//! renders.

use std::sync::Arc;

use crate::engine::Engine;
use crate::escape::EscapeStrategy;
use crate::template::Template;
use crate::value::{Value, ValueMap};

/// Recursion guard shared by includes, embeds and macro calls.
pub(crate) const MAX_RENDER_DEPTH: usize = 100;

/// Per-render mutable state.
pub struct RenderContext<'e> {
    /// The owning engine, for loaders, registries and pools.
    pub(crate) engine: &'e Engine,
    /// Variable scope stack, bottom to top.
    pub(crate) scopes: Vec<ValueMap>,
    /// Inheritance chain, most-derived template first.
    pub(crate) chain: Vec<Arc<Template>>,
    /// The template whose nodes are currently being walked.
    pub(crate) template: Arc<Template>,
    /// `(block name, chain index)` stack for `parent()` resolution.
    pub(crate) block_stack: Vec<(String, usize)>,
    /// Autoescape strategy stack; the top applies to prints.
    pub(crate) autoescape: Vec<EscapeStrategy>,
    /// Set when the context is sandboxed.
    pub(crate) sandboxed: bool,
    /// Include/embed/macro nesting depth.
    pub(crate) depth: usize,
}

impl<'e> RenderContext<'e> {
    /// Creates a context for rendering `template` with the given variables.
    ///
    /// The scope stack starts with the engine globals at the bottom and the
    /// caller's data above them.
    pub(crate) fn new(engine: &'e Engine, template: Arc<Template>, data: ValueMap) -> Self {
        let initial = if engine.autoescape_enabled() {
            EscapeStrategy::Html
        } else {
            EscapeStrategy::Off
        };
        RenderContext {
            engine,
            scopes: vec![engine.globals(), data],
            chain: vec![template.clone()],
            template,
            block_stack: Vec::new(),
            autoescape: vec![initial],
            sandboxed: false,
            depth: 0,
        }
    }

    /// Creates a child context for an include/embed, carrying the autoescape
    /// stack and (possibly forced) sandbox flag but fresh chain state.
    pub(crate) fn child(
        &self,
        template: Arc<Template>,
        scopes: Vec<ValueMap>,
        sandboxed: bool,
    ) -> RenderContext<'e> {
        RenderContext {
            engine: self.engine,
            scopes,
            chain: vec![template.clone()],
            template,
            block_stack: Vec::new(),
            autoescape: self.autoescape.clone(),
            sandboxed,
            depth: self.depth + 1,
        }
    }

    /// Pushes a fresh scope frame.
    pub(crate) fn push_scope(&mut self) {
        self.scopes.push(ValueMap::new());
    }

    /// Pops the top scope frame.
    pub(crate) fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Writes a variable into the top scope frame.
    pub(crate) fn set_var(&mut self, name: impl Into<String>, value: Value) {
        if let Some(top) = self.scopes.last_mut() {
            top.insert(name.into(), value);
        }
    }

    /// Looks a variable up, innermost scope first.
    pub(crate) fn lookup(&self, name: &str) -> Option<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Some(value.clone());
            }
        }
        None
    }

    /// The escape strategy currently applied to prints.
    pub(crate) fn escape_strategy(&self) -> EscapeStrategy {
        self.autoescape.last().copied().unwrap_or(EscapeStrategy::Off)
    }

    /// Flattens the scope stack into one map, innermost values winning.
    /// Used when an include inherits the caller's variables.
    pub(crate) fn flatten_scopes(&self) -> ValueMap {
        let mut merged = ValueMap::new();
        for scope in &self.scopes {
            for (k, v) in scope {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}
