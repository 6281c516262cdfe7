// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Abstract Syntax Tree types for templates.
//!
//! This module defines the data structures that represent a parsed template.
//! Two parallel hierarchies are reachable from a single root: statement
//! nodes ([`Node`]) and expression nodes ([`Expr`]). The AST is produced by
//! the parser, rendered by the render engine, and serialised by the
//! compiled-template codec.
//!
//! Every node carries its 1-indexed source line for diagnostics. Nodes are
//! immutable after parsing and safe to share across concurrent renders.

use crate::value::Value;

/// A statement node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// The ordered list of top-level statements of a template.
    Root {
        /// The statements in source order.
        children: Vec<Node>,
    },
    /// Verbatim template text.
    Text {
        /// The text content, whitespace-control already applied.
        content: String,
        /// Source line.
        line: usize,
    },
    /// `{{ expr }}` output.
    Print {
        /// The expression to evaluate and write.
        expr: Expr,
        /// Source line.
        line: usize,
    },
    /// `{% if %}...{% elseif %}...{% else %}...{% endif %}`.
    If {
        /// `(condition, body)` arms in source order.
        arms: Vec<(Expr, Vec<Node>)>,
        /// Body rendered when no arm matches.
        else_body: Option<Vec<Node>>,
        /// Source line.
        line: usize,
    },
    /// `{% for target (, target) in expr (if cond) %}...{% else %}...{% endfor %}`.
    For {
        /// One target (item) or two (key, value).
        targets: Vec<String>,
        /// The iterated expression.
        source: Expr,
        /// Optional filter condition; failing iterations are skipped before
        /// loop counters are assigned.
        condition: Option<Expr>,
        /// The loop body.
        body: Vec<Node>,
        /// Rendered when the source is null or empty.
        else_body: Option<Vec<Node>>,
        /// Source line.
        line: usize,
    },
    /// One-line `{% set a, b = x, y %}` (compound assignments are desugared
    /// by the parser).
    Set {
        /// Assignment targets.
        targets: Vec<String>,
        /// One value expression per target.
        values: Vec<Expr>,
        /// Source line.
        line: usize,
    },
    /// Capturing `{% set x %}...{% endset %}`: the rendered body becomes a
    /// safe string.
    SetCapture {
        /// The assignment target.
        target: String,
        /// The captured body.
        body: Vec<Node>,
        /// Source line.
        line: usize,
    },
    /// `{% block name %}...{% endblock %}`.
    Block {
        /// The block name, unique within the declaring template.
        name: String,
        /// The block body.
        body: Vec<Node>,
        /// Source line.
        line: usize,
    },
    /// `{% extends expr %}`, first statement only.
    Extends {
        /// The parent template name expression.
        parent: Expr,
        /// Source line.
        line: usize,
    },
    /// `{% include expr [with data] [only] [ignore missing] [sandboxed] %}`.
    Include {
        /// The included template name expression.
        template: Expr,
        /// Optional extra context data.
        with: Option<Expr>,
        /// When set, the child sees only the `with` data.
        only: bool,
        /// Missing templates render nothing instead of failing.
        ignore_missing: bool,
        /// The child render is sandboxed even if the parent is not.
        sandboxed: bool,
        /// Source line.
        line: usize,
    },
    /// `{% embed expr [with data] [only] %}...{% endembed %}`: an include
    /// whose body overrides blocks of the embedded template.
    Embed {
        /// The embedded template name expression.
        template: Expr,
        /// Optional extra context data.
        with: Option<Expr>,
        /// When set, the child sees only the `with` data.
        only: bool,
        /// Block overrides, each a [`Node::Block`].
        blocks: Vec<Node>,
        /// Source line.
        line: usize,
    },
    /// `{% import expr as alias %}`.
    Import {
        /// The imported template name expression (or `_self`).
        template: Expr,
        /// The alias bound in the current scope.
        alias: String,
        /// Source line.
        line: usize,
    },
    /// `{% from expr import name [as alias](, ...) %}`.
    FromImport {
        /// The imported template name expression (or `_self`).
        template: Expr,
        /// `(macro name, optional alias)` pairs.
        names: Vec<(String, Option<String>)>,
        /// Source line.
        line: usize,
    },
    /// `{% macro name(params) %}...{% endmacro %}`.
    Macro {
        /// The macro name.
        name: String,
        /// Parameters; defaults must trail.
        params: Vec<MacroParam>,
        /// The macro body.
        body: Vec<Node>,
        /// Source line.
        line: usize,
    },
    /// `{% do expr %}`, evaluating and discarding the result.
    Do {
        /// The evaluated expression.
        expr: Expr,
        /// Source line.
        line: usize,
    },
    /// `{% apply filterchain %}...{% endapply %}`.
    Apply {
        /// The filter chain run over the rendered body.
        filters: Vec<FilterCall>,
        /// The wrapped body.
        body: Vec<Node>,
        /// Source line.
        line: usize,
    },
    /// `{% autoescape strategy|true|false %}...{% endautoescape %}`.
    Autoescape {
        /// The strategy name, or `None` to disable escaping in the body.
        strategy: Option<String>,
        /// The wrapped body.
        body: Vec<Node>,
        /// Source line.
        line: usize,
    },
    /// `{% sandbox %}...{% endsandbox %}`.
    Sandbox {
        /// The wrapped body.
        body: Vec<Node>,
        /// Source line.
        line: usize,
    },
}

impl Node {
    /// The node's source line (the root reports line 1).
    pub fn line(&self) -> usize {
        match self {
            Node::Root { .. } => 1,
            Node::Text { line, .. }
            | Node::Print { line, .. }
            | Node::If { line, .. }
            | Node::For { line, .. }
            | Node::Set { line, .. }
            | Node::SetCapture { line, .. }
            | Node::Block { line, .. }
            | Node::Extends { line, .. }
            | Node::Include { line, .. }
            | Node::Embed { line, .. }
            | Node::Import { line, .. }
            | Node::FromImport { line, .. }
            | Node::Macro { line, .. }
            | Node::Do { line, .. }
            | Node::Apply { line, .. }
            | Node::Autoescape { line, .. }
            | Node::Sandbox { line, .. } => *line,
        }
    }

    /// The tag name used by the sandbox tag deny-list.
    pub fn tag_name(&self) -> &'static str {
        match self {
            Node::Root { .. } => "root",
            Node::Text { .. } => "text",
            Node::Print { .. } => "print",
            Node::If { .. } => "if",
            Node::For { .. } => "for",
            Node::Set { .. } | Node::SetCapture { .. } => "set",
            Node::Block { .. } => "block",
            Node::Extends { .. } => "extends",
            Node::Include { .. } => "include",
            Node::Embed { .. } => "embed",
            Node::Import { .. } => "import",
            Node::FromImport { .. } => "from",
            Node::Macro { .. } => "macro",
            Node::Do { .. } => "do",
            Node::Apply { .. } => "apply",
            Node::Autoescape { .. } => "autoescape",
            Node::Sandbox { .. } => "sandbox",
        }
    }
}

/// A macro parameter with an optional default expression.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroParam {
    /// The parameter name.
    pub name: String,
    /// Default used when no argument is supplied.
    pub default: Option<Expr>,
}

/// One filter invocation inside an `{% apply %}` chain.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCall {
    /// The filter name.
    pub name: String,
    /// Extra filter arguments.
    pub args: Vec<Arg>,
    /// Source line.
    pub line: usize,
}

/// A call argument, positional or named.
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    /// The parameter name for named arguments.
    pub name: Option<String>,
    /// The argument value expression.
    pub value: Expr,
}

/// A binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `//`
    FloorDiv,
    /// `%`
    Mod,
    /// `**`
    Pow,
    /// `~`
    Concat,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `and`
    And,
    /// `or`
    Or,
    /// `in`
    In,
    /// `not in`
    NotIn,
    /// `..`
    Range,
    /// `matches`
    Matches,
    /// `starts with`
    StartsWith,
    /// `ends with`
    EndsWith,
}

/// A prefix operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-`
    Neg,
    /// `+`
    Pos,
    /// `not`
    Not,
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value.
    Literal {
        /// The literal.
        value: Value,
        /// Source line.
        line: usize,
    },
    /// A variable reference.
    Variable {
        /// The variable name.
        name: String,
        /// Source line.
        line: usize,
    },
    /// `obj.name` attribute access.
    GetAttr {
        /// The receiver.
        obj: Box<Expr>,
        /// The attribute name.
        name: String,
        /// Source line.
        line: usize,
    },
    /// `obj[index]` item access.
    GetItem {
        /// The receiver.
        obj: Box<Expr>,
        /// The index expression.
        index: Box<Expr>,
        /// Source line.
        line: usize,
    },
    /// A prefix operation.
    Unary {
        /// The operator.
        op: UnaryOp,
        /// The operand.
        operand: Box<Expr>,
        /// Source line.
        line: usize,
    },
    /// An infix operation.
    Binary {
        /// The operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
        /// Source line.
        line: usize,
    },
    /// `cond ? then : otherwise` (elvis `?:` leaves `then` empty).
    Conditional {
        /// The condition.
        cond: Box<Expr>,
        /// Value when truthy; `None` re-uses the condition value (`?:`).
        then: Option<Box<Expr>>,
        /// Value when falsy.
        otherwise: Box<Expr>,
        /// Source line.
        line: usize,
    },
    /// `[a, b, c]` array literal.
    Array {
        /// The element expressions.
        items: Vec<Expr>,
        /// Source line.
        line: usize,
    },
    /// `{k: v, ...}` hash literal; bare identifier keys become strings.
    Hash {
        /// The `(key, value)` expression pairs.
        pairs: Vec<(Expr, Expr)>,
        /// Source line.
        line: usize,
    },
    /// `expr|name(args)` filter application.
    Filter {
        /// The piped expression.
        input: Box<Expr>,
        /// The filter name.
        name: String,
        /// Extra filter arguments.
        args: Vec<Arg>,
        /// Source line.
        line: usize,
    },
    /// `expr is name(args)` test application.
    Test {
        /// The tested expression.
        input: Box<Expr>,
        /// The test name (multi-word names joined with a space).
        name: String,
        /// Extra test arguments.
        args: Vec<Expr>,
        /// Set for `is not`.
        negated: bool,
        /// Source line.
        line: usize,
    },
    /// `name(args)` function or local-macro call.
    Function {
        /// The function name.
        name: String,
        /// Call arguments.
        args: Vec<Arg>,
        /// Source line.
        line: usize,
    },
    /// `module.name(args)`: a call through an attribute, covering imported
    /// macro aliases and host-object methods.
    MethodCall {
        /// The receiver expression (import alias or host object).
        obj: Box<Expr>,
        /// The method or macro name.
        name: String,
        /// Call arguments.
        args: Vec<Arg>,
        /// Source line.
        line: usize,
    },
}

impl Expr {
    /// The expression's source line.
    pub fn line(&self) -> usize {
        match self {
            Expr::Literal { line, .. }
            | Expr::Variable { line, .. }
            | Expr::GetAttr { line, .. }
            | Expr::GetItem { line, .. }
            | Expr::Unary { line, .. }
            | Expr::Binary { line, .. }
            | Expr::Conditional { line, .. }
            | Expr::Array { line, .. }
            | Expr::Hash { line, .. }
            | Expr::Filter { line, .. }
            | Expr::Test { line, .. }
            | Expr::Function { line, .. }
            | Expr::MethodCall { line, .. } => *line,
        }
    }
}
