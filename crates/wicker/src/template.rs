// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Parsed template representation.
//!
//! A [`Template`] exclusively owns its AST plus the lookup tables the render
//! engine needs: the block table and the macro table local to the template,
//! and the parent name expression if the template extends another. Templates
//! are immutable after construction and shared behind `Arc` by the engine's
//! cache; parents are referenced by name and resolved lazily at render time.

use std::collections::HashMap;
use std::time::SystemTime;

use crate::ast::{Expr, MacroParam, Node};
use crate::error::{Result, SourceContext, WickerError};
use crate::parser::parse;

/// A named block body declared by a template.
#[derive(Debug, Clone)]
pub struct BlockDef {
    /// The block body statements.
    pub body: Vec<Node>,
    /// Source line of the declaration.
    pub line: usize,
}

/// A macro declared by a template.
#[derive(Debug, Clone)]
pub struct MacroDef {
    /// The macro name.
    pub name: String,
    /// Parameters with optional defaults.
    pub params: Vec<MacroParam>,
    /// The macro body statements.
    pub body: Vec<Node>,
    /// Source line of the declaration.
    pub line: usize,
}

/// A parsed template with its lookup tables.
#[derive(Debug)]
pub struct Template {
    /// The template name as known to the loaders.
    pub name: String,
    /// The original source, retained for error messages.
    pub source: String,
    /// The root statement node.
    pub root: Node,
    /// Blocks declared by this template (not by parents).
    pub blocks: HashMap<String, BlockDef>,
    /// Macros declared by this template.
    pub macros: HashMap<String, MacroDef>,
    /// The parent name expression from `{% extends %}`, if any.
    pub extends: Option<Expr>,
    /// Loader-reported modification time, used by auto-reload.
    pub modified: Option<SystemTime>,
}

impl Template {
    /// Parses source into a template and builds its lookup tables.
    pub fn compile(name: &str, source: &str, modified: Option<SystemTime>) -> Result<Template> {
        let root = parse(name, source)?;
        Template::from_root(name, source, root, modified)
    }

    /// Builds a template around an existing AST (used by the codec).
    pub fn from_root(
        name: &str,
        source: &str,
        root: Node,
        modified: Option<SystemTime>,
    ) -> Result<Template> {
        let mut template = Template {
            name: name.to_string(),
            source: source.to_string(),
            root,
            blocks: HashMap::new(),
            macros: HashMap::new(),
            extends: None,
            modified,
        };
        let root = template.root.clone();
        template.collect(&root)?;
        Ok(template)
    }

    /// Walks statements collecting block/macro declarations and the
    /// `extends` expression. Embed bodies belong to their synthetic child
    /// template and macro bodies cannot contribute blocks, so neither is
    /// descended into.
    fn collect(&mut self, node: &Node) -> Result<()> {
        match node {
            Node::Root { children } => {
                for child in children {
                    self.collect(child)?;
                }
            }
            Node::Extends { parent, .. } => {
                self.extends = Some(parent.clone());
            }
            Node::Block { name, body, line } => {
                if self.blocks.contains_key(name) {
                    return Err(WickerError::ParseError {
                        name: self.name.clone(),
                        message: format!("block \"{}\" is declared twice", name),
                        line: *line,
                        column: 1,
                        source_context: Some(SourceContext::from_source(&self.source, *line, 1)),
                    });
                }
                self.blocks.insert(
                    name.clone(),
                    BlockDef {
                        body: body.clone(),
                        line: *line,
                    },
                );
                for child in body {
                    self.collect(child)?;
                }
            }
            Node::Macro {
                name,
                params,
                body,
                line,
            } => {
                self.macros.insert(
                    name.clone(),
                    MacroDef {
                        name: name.clone(),
                        params: params.clone(),
                        body: body.clone(),
                        line: *line,
                    },
                );
            }
            Node::If {
                arms, else_body, ..
            } => {
                for (_, body) in arms {
                    for child in body {
                        self.collect(child)?;
                    }
                }
                if let Some(body) = else_body {
                    for child in body {
                        self.collect(child)?;
                    }
                }
            }
            Node::For {
                body, else_body, ..
            } => {
                for child in body {
                    self.collect(child)?;
                }
                if let Some(body) = else_body {
                    for child in body {
                        self.collect(child)?;
                    }
                }
            }
            Node::Apply { body, .. }
            | Node::Autoescape { body, .. }
            | Node::Sandbox { body, .. }
            | Node::SetCapture { body, .. } => {
                for child in body {
                    self.collect(child)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// True when the template declares the named block itself.
    pub fn has_block(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_blocks_and_macros() {
        let template = Template::compile(
            "page",
            "{% block header %}h{% endblock %}{% macro f(x) %}{{ x }}{% endmacro %}",
            None,
        )
        .unwrap();
        assert!(template.has_block("header"));
        assert!(template.macros.contains_key("f"));
        assert!(template.extends.is_none());
    }

    #[test]
    fn test_collects_nested_blocks() {
        let template = Template::compile(
            "page",
            "{% block outer %}{% block inner %}x{% endblock %}{% endblock %}",
            None,
        )
        .unwrap();
        assert!(template.has_block("outer"));
        assert!(template.has_block("inner"));
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let err = Template::compile(
            "page",
            "{% block a %}1{% endblock %}{% block a %}2{% endblock %}",
            None,
        )
        .unwrap_err();
        match err {
            WickerError::ParseError { message, .. } => {
                assert!(message.contains("declared twice"));
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_extends_recorded() {
        let template =
            Template::compile("child", "{% extends 'base.html' %}", None).unwrap();
        assert!(template.extends.is_some());
    }
}
