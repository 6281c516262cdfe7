// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Render engine.
//!
//! Walks the AST against a [`RenderContext`], writing directly into an
//! output buffer. This module owns the node render contracts, the Pratt
//! tree's expression evaluator, and the inheritance/include/import/macro
//! resolution protocol.
//!
//! Errors are wrapped with the template name and statement line at the
//! statement level; the innermost failure site wins. Rendering never
//! rewinds the output buffer, so a failed render leaves whatever was
//! already written.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use tracing::trace;

use crate::ast::{Arg, BinaryOp, Expr, FilterCall, Node, UnaryOp};
use crate::context::{RenderContext, MAX_RENDER_DEPTH};
use crate::error::{Result, WickerError};
use crate::escape::EscapeStrategy;
use crate::template::{MacroDef, Template};
use crate::value::{Callable, MacroRef, Value, ValueMap};

/// Renders the context's template: resolves the inheritance chain, runs
/// the extending templates' top-level preludes, then renders the root
/// ancestor's body with block overrides applied.
pub(crate) fn render_document(ctx: &mut RenderContext, out: &mut String) -> Result<()> {
    if ctx.depth > MAX_RENDER_DEPTH {
        return Err(WickerError::RenderError {
            name: ctx.template.name.clone(),
            line: 1,
            message: "maximum render depth exceeded".to_string(),
            cause: None,
        });
    }
    resolve_chain(ctx)?;
    trace!(template = %ctx.template.name, chain = ctx.chain.len(), "rendering");

    let chain = ctx.chain.clone();
    // Top-level set/import statements of extending templates run first,
    // most-derived first; their text outside blocks is discarded.
    for template in chain.iter().take(chain.len() - 1) {
        ctx.template = template.clone();
        if let Node::Root { children } = &template.root {
            for node in children {
                match node {
                    Node::Text { .. }
                    | Node::Block { .. }
                    | Node::Macro { .. }
                    | Node::Extends { .. } => {}
                    other => render_node(ctx, other, out)?,
                }
            }
        }
    }

    let root = chain.last().expect("chain is never empty").clone();
    ctx.template = root.clone();
    if let Node::Root { children } = &root.root {
        render_nodes(ctx, children, out)?;
    }
    Ok(())
}

/// Extends the context's chain by walking `extends` expressions until a
/// template without a parent is reached. Parents are referenced by name and
/// loaded through the engine; cycles fail the render.
fn resolve_chain(ctx: &mut RenderContext) -> Result<()> {
    let mut seen: HashSet<String> = ctx.chain.iter().map(|t| t.name.clone()).collect();
    let mut current = ctx.chain.last().expect("chain is never empty").clone();
    while let Some(expr) = current.extends.clone() {
        let wrap = |e: WickerError| e.at(&current.name, expr.line());
        let parent_name = eval(ctx, &expr)
            .and_then(|v| v.to_output_string())
            .map_err(wrap)?;
        if !seen.insert(parent_name.clone()) {
            return Err(WickerError::RenderError {
                name: current.name.clone(),
                line: expr.line(),
                message: format!("inheritance cycle through \"{}\"", parent_name),
                cause: None,
            });
        }
        let parent = ctx.engine.get_template(&parent_name).map_err(wrap)?;
        ctx.chain.push(parent.clone());
        current = parent;
    }
    Ok(())
}

pub(crate) fn render_nodes(
    ctx: &mut RenderContext,
    nodes: &[Node],
    out: &mut String,
) -> Result<()> {
    for node in nodes {
        render_node(ctx, node, out)?;
    }
    Ok(())
}

fn render_node(ctx: &mut RenderContext, node: &Node, out: &mut String) -> Result<()> {
    if ctx.sandboxed {
        match node {
            Node::Root { .. } | Node::Text { .. } | Node::Print { .. } => {}
            tag => {
                let name = ctx.template.name.clone();
                ctx.engine
                    .policy()
                    .check_tag(tag.tag_name())
                    .map_err(|e| e.at(&name, tag.line()))?;
            }
        }
    }
    let template_name = ctx.template.name.clone();
    let line = node.line();
    render_node_inner(ctx, node, out).map_err(|e| e.at(&template_name, line))
}

fn render_node_inner(ctx: &mut RenderContext, node: &Node, out: &mut String) -> Result<()> {
    match node {
        Node::Root { children } => render_nodes(ctx, children, out),
        Node::Text { content, .. } => {
            out.push_str(content);
            Ok(())
        }
        Node::Print { expr, .. } => {
            let value = eval(ctx, expr)?;
            write_value(ctx, &value, out)
        }
        Node::If {
            arms, else_body, ..
        } => {
            for (cond, body) in arms {
                if eval(ctx, cond)?.is_truthy() {
                    return render_nodes(ctx, body, out);
                }
            }
            if let Some(body) = else_body {
                render_nodes(ctx, body, out)?;
            }
            Ok(())
        }
        Node::For {
            targets,
            source,
            condition,
            body,
            else_body,
            ..
        } => render_for(ctx, targets, source, condition.as_ref(), body, else_body.as_deref(), out),
        Node::Set {
            targets, values, ..
        } => {
            let mut evaluated = Vec::with_capacity(values.len());
            for value in values {
                evaluated.push(eval(ctx, value)?);
            }
            for (target, value) in targets.iter().zip(evaluated) {
                ctx.set_var(target.clone(), value);
            }
            Ok(())
        }
        Node::SetCapture { target, body, .. } => {
            let mut buffer = ctx.engine.pool().take();
            let result = render_nodes(ctx, body, &mut buffer);
            let value = Value::safe(buffer.clone());
            ctx.engine.pool().put(buffer);
            result?;
            ctx.set_var(target.clone(), value);
            Ok(())
        }
        Node::Block { name, .. } => render_block(ctx, name, out),
        Node::Include {
            template,
            with,
            only,
            ignore_missing,
            sandboxed,
            ..
        } => {
            let name = eval(ctx, template)?.to_output_string()?;
            let loaded = match ctx.engine.get_template(&name) {
                Err(e) if e.is_not_found() && *ignore_missing => return Ok(()),
                other => other?,
            };
            let scopes = include_scopes(ctx, with.as_ref(), *only)?;
            let mut child = ctx.child(loaded, scopes, ctx.sandboxed || *sandboxed);
            render_document(&mut child, out)
        }
        Node::Embed {
            template,
            with,
            only,
            blocks,
            line,
        } => {
            let name = eval(ctx, template)?.to_output_string()?;
            let embedded = ctx.engine.get_template(&name)?;
            let overlay_name = format!("{} (embedded at line {})", ctx.template.name, line);
            let overlay = Template::from_root(
                &overlay_name,
                &ctx.template.source,
                Node::Root {
                    children: blocks.clone(),
                },
                None,
            )?;
            let scopes = include_scopes(ctx, with.as_ref(), *only)?;
            let mut child = ctx.child(Arc::new(overlay), scopes, ctx.sandboxed);
            child.chain.push(embedded);
            render_document(&mut child, out)
        }
        Node::Import {
            template, alias, ..
        } => {
            let imported = import_target(ctx, template)?;
            let map = macro_map(&imported);
            ctx.set_var(alias.clone(), map);
            Ok(())
        }
        Node::FromImport {
            template, names, ..
        } => {
            let imported = import_target(ctx, template)?;
            for (name, alias) in names {
                if !imported.macros.contains_key(name) {
                    return Err(WickerError::TypeError(format!(
                        "template \"{}\" has no macro \"{}\"",
                        imported.name, name
                    )));
                }
                let bound = alias.clone().unwrap_or_else(|| name.clone());
                ctx.set_var(
                    bound,
                    Value::Callable(Callable::Macro(MacroRef {
                        template: imported.clone(),
                        name: name.clone(),
                    })),
                );
            }
            Ok(())
        }
        Node::Macro { .. } | Node::Extends { .. } => Ok(()),
        Node::Do { expr, .. } => {
            eval(ctx, expr)?;
            Ok(())
        }
        Node::Apply { filters, body, .. } => {
            let mut buffer = ctx.engine.pool().take();
            let result = render_nodes(ctx, body, &mut buffer);
            let mut value = Value::safe(buffer.clone());
            ctx.engine.pool().put(buffer);
            result?;
            for filter in filters {
                value = apply_named_filter(ctx, filter, value)?;
            }
            // The body was escaped while it was captured; the chain result
            // is written through untouched.
            out.push_str(&value.to_output_string()?);
            Ok(())
        }
        Node::Autoescape { strategy, body, .. } => {
            let pushed = match strategy {
                Some(name) => EscapeStrategy::from_name(name)?,
                None => EscapeStrategy::Off,
            };
            ctx.autoescape.push(pushed);
            let result = render_nodes(ctx, body, out);
            ctx.autoescape.pop();
            result
        }
        Node::Sandbox { body, .. } => {
            let previous = ctx.sandboxed;
            ctx.sandboxed = true;
            let result = render_nodes(ctx, body, out);
            ctx.sandboxed = previous;
            result
        }
    }
}

/// Builds the scope stack for an include/embed child: the caller's
/// flattened variables plus the `with` data, or only the `with` data.
fn include_scopes(
    ctx: &mut RenderContext,
    with: Option<&Expr>,
    only: bool,
) -> Result<Vec<ValueMap>> {
    let with_map = match with {
        Some(expr) => match eval(ctx, expr)? {
            Value::Map(entries) => entries.as_ref().clone(),
            other => {
                return Err(WickerError::TypeError(format!(
                    "\"with\" data must be a map, got {}",
                    other.kind()
                )))
            }
        },
        None => ValueMap::new(),
    };
    if only {
        Ok(vec![with_map])
    } else {
        Ok(vec![ctx.flatten_scopes(), with_map])
    }
}

/// Resolves the target of `import`/`from import`: `_self` means the
/// template currently being walked, anything else is evaluated to a name
/// and loaded.
fn import_target(ctx: &mut RenderContext, expr: &Expr) -> Result<Arc<Template>> {
    if let Expr::Variable { name, .. } = expr {
        if name == "_self" {
            return Ok(ctx.template.clone());
        }
    }
    let name = eval(ctx, expr)?.to_output_string()?;
    ctx.engine.get_template(&name)
}

/// A map exposing each macro of a template as a callable field.
fn macro_map(template: &Arc<Template>) -> Value {
    let mut map = ValueMap::new();
    for name in template.macros.keys() {
        map.insert(
            name.clone(),
            Value::Callable(Callable::Macro(MacroRef {
                template: template.clone(),
                name: name.clone(),
            })),
        );
    }
    Value::map(map)
}

// ----------------------------------------------------------------------
// Blocks & inheritance
// ----------------------------------------------------------------------

/// Renders the most-derived declaration of the named block.
fn render_block(ctx: &mut RenderContext, name: &str, out: &mut String) -> Result<()> {
    let Some(index) = ctx.chain.iter().position(|t| t.has_block(name)) else {
        return Err(WickerError::TypeError(format!(
            "unknown block \"{}\"",
            name
        )));
    };
    render_block_at(ctx, name, index, out)
}

/// Renders the named block as declared at the given chain position, with
/// the block cursor updated so `parent()` can continue towards the root.
fn render_block_at(
    ctx: &mut RenderContext,
    name: &str,
    index: usize,
    out: &mut String,
) -> Result<()> {
    let template = ctx.chain[index].clone();
    let def = template.blocks.get(name).expect("checked by caller");
    let previous = std::mem::replace(&mut ctx.template, template.clone());
    ctx.block_stack.push((name.to_string(), index));
    let result = render_nodes(ctx, &def.body, out);
    ctx.block_stack.pop();
    ctx.template = previous;
    result
}

/// `parent()`: re-enters the next less-derived declaration of the block
/// currently being rendered; yields empty when there is none.
fn eval_parent(ctx: &mut RenderContext) -> Result<Value> {
    let Some((name, index)) = ctx.block_stack.last().cloned() else {
        return Err(WickerError::TypeError(
            "parent() may only be used inside a block".to_string(),
        ));
    };
    let next = ctx
        .chain
        .iter()
        .enumerate()
        .skip(index + 1)
        .find(|(_, t)| t.has_block(&name))
        .map(|(i, _)| i);
    let Some(next) = next else {
        return Ok(Value::safe(""));
    };
    let mut buffer = ctx.engine.pool().take();
    let result = render_block_at(ctx, &name, next, &mut buffer);
    let value = Value::safe(buffer.clone());
    ctx.engine.pool().put(buffer);
    result?;
    Ok(value)
}

// ----------------------------------------------------------------------
// For loops
// ----------------------------------------------------------------------

fn render_for(
    ctx: &mut RenderContext,
    targets: &[String],
    source: &Expr,
    condition: Option<&Expr>,
    body: &[Node],
    else_body: Option<&[Node]>,
    out: &mut String,
) -> Result<()> {
    let source_value = eval(ctx, source)?;
    let mut entries: Vec<(Value, Value)> = match &source_value {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::Int(i as i64), v.clone()))
            .collect(),
        Value::Map(map) => map
            .iter()
            .map(|(k, v)| (Value::string(k.clone()), v.clone()))
            .collect(),
        Value::Str(s) | Value::Safe(s) => s
            .chars()
            .enumerate()
            .map(|(i, c)| (Value::Int(i as i64), Value::string(c.to_string())))
            .collect(),
        other => {
            return Err(WickerError::TypeError(format!(
                "cannot iterate over {}",
                other.kind()
            )))
        }
    };

    // The filter condition runs before counters are assigned, so
    // `loop.length` reflects the filtered count.
    if let Some(cond) = condition {
        let mut kept = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            ctx.push_scope();
            bind_targets(ctx, targets, &key, &value);
            let keep = eval(ctx, cond).map(|v| v.is_truthy());
            ctx.pop_scope();
            if keep? {
                kept.push((key, value));
            }
        }
        entries = kept;
    }

    if entries.is_empty() {
        if let Some(body) = else_body {
            render_nodes(ctx, body, out)?;
        }
        return Ok(());
    }

    let length = entries.len();
    let parent_loop = ctx.lookup("loop");
    for (i, (key, value)) in entries.into_iter().enumerate() {
        let index = i + 1;
        let mut meta = ValueMap::new();
        meta.insert("index".to_string(), Value::Int(index as i64));
        meta.insert("index0".to_string(), Value::Int(i as i64));
        meta.insert("revindex".to_string(), Value::Int((length - i) as i64));
        meta.insert("revindex0".to_string(), Value::Int((length - index) as i64));
        meta.insert("first".to_string(), Value::Bool(index == 1));
        meta.insert("last".to_string(), Value::Bool(index == length));
        meta.insert("length".to_string(), Value::Int(length as i64));
        if let Some(parent) = &parent_loop {
            meta.insert("parent".to_string(), parent.clone());
        }

        ctx.push_scope();
        bind_targets(ctx, targets, &key, &value);
        ctx.set_var("loop", Value::map(meta));
        let result = render_nodes(ctx, body, out);
        ctx.pop_scope();
        result?;
    }
    Ok(())
}

fn bind_targets(ctx: &mut RenderContext, targets: &[String], key: &Value, value: &Value) {
    if targets.len() == 2 {
        ctx.set_var(targets[0].clone(), key.clone());
        ctx.set_var(targets[1].clone(), value.clone());
    } else {
        ctx.set_var(targets[0].clone(), value.clone());
    }
}

// ----------------------------------------------------------------------
// Output
// ----------------------------------------------------------------------

/// Writes a value to the output, applying the active escape strategy to
/// anything that is not already marked safe.
fn write_value(ctx: &RenderContext, value: &Value, out: &mut String) -> Result<()> {
    if let Value::Safe(s) = value {
        out.push_str(s);
        return Ok(());
    }
    let text = value.to_output_string()?;
    match ctx.escape_strategy() {
        EscapeStrategy::Off => out.push_str(&text),
        strategy => out.push_str(&strategy.apply(&text)),
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Expression evaluation
// ----------------------------------------------------------------------

pub(crate) fn eval(ctx: &mut RenderContext, expr: &Expr) -> Result<Value> {
    match expr {
        Expr::Literal { value, .. } => Ok(value.clone()),
        Expr::Variable { name, .. } => match ctx.lookup(name) {
            Some(value) => Ok(value),
            None if name == "_self" => Ok(macro_map(&ctx.template.clone())),
            None if ctx.engine.strict() => Err(WickerError::UndefinedError(name.clone())),
            None => Ok(Value::Null),
        },
        Expr::GetAttr { obj, name, .. } => {
            let receiver = eval(ctx, obj)?;
            get_attr(ctx, &receiver, name)
        }
        Expr::GetItem { obj, index, .. } => {
            let receiver = eval(ctx, obj)?;
            let index = eval(ctx, index)?;
            match receiver {
                Value::Null if !ctx.engine.strict() => Ok(Value::Null),
                Value::Null => Err(WickerError::UndefinedError("null".to_string())),
                other => other.get_item(&index),
            }
        }
        Expr::Unary { op, operand, .. } => {
            let value = eval(ctx, operand)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                UnaryOp::Neg => value.neg(),
                UnaryOp::Pos => match value {
                    v @ (Value::Int(_) | Value::Float(_)) => Ok(v),
                    other => Err(WickerError::TypeError(format!(
                        "unary \"+\" needs a number, got {}",
                        other.kind()
                    ))),
                },
            }
        }
        Expr::Binary {
            op, left, right, ..
        } => eval_binary(ctx, *op, left, right),
        Expr::Conditional {
            cond,
            then,
            otherwise,
            ..
        } => {
            let condition = eval(ctx, cond)?;
            if condition.is_truthy() {
                match then {
                    Some(expr) => eval(ctx, expr),
                    None => Ok(condition),
                }
            } else {
                eval(ctx, otherwise)
            }
        }
        Expr::Array { items, .. } => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(ctx, item)?);
            }
            Ok(Value::array(values))
        }
        Expr::Hash { pairs, .. } => {
            let mut map = ValueMap::new();
            for (key, value) in pairs {
                let key = eval(ctx, key)?.to_output_string()?;
                map.insert(key, eval(ctx, value)?);
            }
            Ok(Value::map(map))
        }
        Expr::Filter {
            input, name, args, ..
        } => eval_filter(ctx, input, name, args),
        Expr::Test {
            input,
            name,
            args,
            negated,
            ..
        } => {
            if ctx.sandboxed {
                ctx.engine.policy().check_test(name)?;
            }
            let outcome = if name == "defined" {
                eval_defined(ctx, input)?
            } else {
                let test = ctx.engine.test(name).ok_or_else(|| {
                    WickerError::TypeError(format!("unknown test \"{}\"", name))
                })?;
                let value = eval(ctx, input)?;
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(eval(ctx, arg)?);
                }
                test(&value, &evaluated)?
            };
            Ok(Value::Bool(outcome ^ negated))
        }
        Expr::Function { name, args, .. } => eval_function(ctx, name, args),
        Expr::MethodCall {
            obj, name, args, ..
        } => {
            let receiver = eval(ctx, obj)?;
            match receiver {
                Value::Map(entries) => match entries.get(name) {
                    Some(Value::Callable(callable)) => {
                        let callable = callable.clone();
                        call_callable(ctx, &callable, args)
                    }
                    Some(other) => Err(WickerError::TypeError(format!(
                        "\"{}\" is {}, not callable",
                        name,
                        other.kind()
                    ))),
                    None => Err(WickerError::TypeError(format!(
                        "no callable \"{}\" on this value",
                        name
                    ))),
                },
                Value::Object(object) => {
                    if ctx.sandboxed {
                        ctx.engine.policy().check_method(name)?;
                    }
                    let mut evaluated = Vec::with_capacity(args.len());
                    for arg in args {
                        evaluated.push(eval(ctx, &arg.value)?);
                    }
                    object.call_method(name, &evaluated)
                }
                other => Err(WickerError::TypeError(format!(
                    "cannot call \"{}\" on {}",
                    name,
                    other.kind()
                ))),
            }
        }
    }
}

/// Attribute resolution order: map key, host-object field, host-object
/// zero-argument method, synthesized `first`/`last`/`length` on sequences.
fn get_attr(ctx: &mut RenderContext, receiver: &Value, name: &str) -> Result<Value> {
    match receiver {
        Value::Map(entries) => match entries.get(name) {
            Some(value) => Ok(value.clone()),
            None if ctx.engine.strict() => Err(WickerError::UndefinedError(name.to_string())),
            None => Ok(Value::Null),
        },
        Value::Object(object) => {
            if ctx.sandboxed {
                ctx.engine.policy().check_attribute(name)?;
            }
            if let Some(value) = object.get_field(name) {
                return Ok(value);
            }
            if object.has_method(name) {
                if ctx.sandboxed {
                    ctx.engine.policy().check_method(name)?;
                }
                return object.call_method(name, &[]);
            }
            if ctx.engine.strict() {
                Err(WickerError::UndefinedError(name.to_string()))
            } else {
                Ok(Value::Null)
            }
        }
        Value::Array(items) => match name {
            "first" => Ok(items.first().cloned().unwrap_or(Value::Null)),
            "last" => Ok(items.last().cloned().unwrap_or(Value::Null)),
            "length" => Ok(Value::Int(items.len() as i64)),
            _ if ctx.engine.strict() => Err(WickerError::UndefinedError(name.to_string())),
            _ => Ok(Value::Null),
        },
        Value::Str(s) | Value::Safe(s) => match name {
            "first" => Ok(s
                .chars()
                .next()
                .map(|c| Value::string(c.to_string()))
                .unwrap_or(Value::Null)),
            "last" => Ok(s
                .chars()
                .next_back()
                .map(|c| Value::string(c.to_string()))
                .unwrap_or(Value::Null)),
            "length" => Ok(Value::Int(s.chars().count() as i64)),
            _ if ctx.engine.strict() => Err(WickerError::UndefinedError(name.to_string())),
            _ => Ok(Value::Null),
        },
        Value::Null if !ctx.engine.strict() => Ok(Value::Null),
        Value::Null => Err(WickerError::UndefinedError(name.to_string())),
        other => {
            if ctx.engine.strict() {
                Err(WickerError::TypeError(format!(
                    "cannot access \"{}\" on {}",
                    name,
                    other.kind()
                )))
            } else {
                Ok(Value::Null)
            }
        }
    }
}

fn eval_binary(ctx: &mut RenderContext, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value> {
    // Short-circuit forms first.
    match op {
        BinaryOp::And => {
            let lhs = eval(ctx, left)?;
            if !lhs.is_truthy() {
                return Ok(Value::Bool(false));
            }
            let rhs = eval(ctx, right)?;
            return Ok(Value::Bool(rhs.is_truthy()));
        }
        BinaryOp::Or => {
            let lhs = eval(ctx, left)?;
            if lhs.is_truthy() {
                return Ok(Value::Bool(true));
            }
            let rhs = eval(ctx, right)?;
            return Ok(Value::Bool(rhs.is_truthy()));
        }
        _ => {}
    }

    let lhs = eval(ctx, left)?;
    let rhs = eval(ctx, right)?;
    match op {
        BinaryOp::Add => lhs.add(&rhs),
        BinaryOp::Sub => lhs.sub(&rhs),
        BinaryOp::Mul => lhs.mul(&rhs),
        BinaryOp::Div => lhs.div(&rhs),
        BinaryOp::FloorDiv => lhs.floordiv(&rhs),
        BinaryOp::Mod => lhs.rem(&rhs),
        BinaryOp::Pow => lhs.pow(&rhs),
        BinaryOp::Concat => lhs.concat(&rhs),
        BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinaryOp::Ne => Ok(Value::Bool(lhs != rhs)),
        BinaryOp::Lt => Ok(Value::Bool(lhs.compare(&rhs)? == std::cmp::Ordering::Less)),
        BinaryOp::Le => Ok(Value::Bool(lhs.compare(&rhs)? != std::cmp::Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(lhs.compare(&rhs)? == std::cmp::Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::Bool(lhs.compare(&rhs)? != std::cmp::Ordering::Less)),
        BinaryOp::In => Ok(Value::Bool(rhs.contains(&lhs)?)),
        BinaryOp::NotIn => Ok(Value::Bool(!rhs.contains(&lhs)?)),
        BinaryOp::Range => lhs.range(&rhs),
        BinaryOp::Matches => {
            let subject = lhs.to_output_string()?;
            let pattern = rhs.as_str().ok_or_else(|| {
                WickerError::TypeError(format!(
                    "\"matches\" needs a string pattern, got {}",
                    rhs.kind()
                ))
            })?;
            let regex = Regex::new(pattern).map_err(|e| {
                WickerError::TypeError(format!("invalid pattern \"{}\": {}", pattern, e))
            })?;
            Ok(Value::Bool(regex.is_match(&subject)))
        }
        BinaryOp::StartsWith => {
            let subject = lhs.to_output_string()?;
            let prefix = rhs.to_output_string()?;
            Ok(Value::Bool(subject.starts_with(&prefix)))
        }
        BinaryOp::EndsWith => {
            let subject = lhs.to_output_string()?;
            let suffix = rhs.to_output_string()?;
            Ok(Value::Bool(subject.ends_with(&suffix)))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn eval_args(ctx: &mut RenderContext, args: &[Arg]) -> Result<(Vec<Value>, Vec<(String, Value)>)> {
    let mut positional = Vec::new();
    let mut named = Vec::new();
    for arg in args {
        let value = eval(ctx, &arg.value)?;
        match &arg.name {
            Some(name) => named.push((name.clone(), value)),
            None => positional.push(value),
        }
    }
    Ok((positional, named))
}

fn eval_filter(ctx: &mut RenderContext, input: &Expr, name: &str, args: &[Arg]) -> Result<Value> {
    if ctx.sandboxed {
        ctx.engine.policy().check_filter(name)?;
    }
    // `default` recovers undefined input before it becomes an error, and
    // substitutes on falsy values.
    if name == "default" {
        let value = match eval(ctx, input) {
            Ok(value) => value,
            Err(e) if e.is_undefined() => Value::Null,
            Err(e) => return Err(e),
        };
        if value.is_truthy() {
            return Ok(value);
        }
        return match args.first() {
            Some(arg) => eval(ctx, &arg.value),
            None => Ok(Value::string("")),
        };
    }
    let filter = ctx
        .engine
        .filter(name)
        .ok_or_else(|| WickerError::TypeError(format!("unknown filter \"{}\"", name)))?;
    let value = eval(ctx, input)?;
    let (mut positional, named) = eval_args(ctx, args)?;
    positional.extend(named.into_iter().map(|(_, v)| v));
    filter(&value, &positional)
}

fn apply_named_filter(
    ctx: &mut RenderContext,
    call: &FilterCall,
    value: Value,
) -> Result<Value> {
    if ctx.sandboxed {
        ctx.engine.policy().check_filter(&call.name)?;
    }
    if call.name == "default" {
        if value.is_truthy() {
            return Ok(value);
        }
        return match call.args.first() {
            Some(arg) => eval(ctx, &arg.value),
            None => Ok(Value::string("")),
        };
    }
    let filter = ctx
        .engine
        .filter(&call.name)
        .ok_or_else(|| WickerError::TypeError(format!("unknown filter \"{}\"", call.name)))?;
    let (mut positional, named) = eval_args(ctx, &call.args)?;
    positional.extend(named.into_iter().map(|(_, v)| v));
    filter(&value, &positional)
}

/// The `defined` test: structural, so it can answer without tripping the
/// strict-mode undefined error the probe would otherwise raise.
fn eval_defined(ctx: &mut RenderContext, expr: &Expr) -> Result<bool> {
    match expr {
        Expr::Variable { name, .. } => Ok(ctx.lookup(name).is_some() || name == "_self"),
        Expr::GetAttr { obj, name, .. } => {
            if !eval_defined(ctx, obj)? {
                return Ok(false);
            }
            let receiver = match eval(ctx, obj) {
                Ok(value) => value,
                Err(e) if e.is_undefined() => return Ok(false),
                Err(e) => return Err(e),
            };
            Ok(match receiver {
                Value::Map(entries) => entries.contains_key(name),
                Value::Object(object) => {
                    object.get_field(name).is_some() || object.has_method(name)
                }
                Value::Array(_) | Value::Str(_) | Value::Safe(_) => {
                    matches!(name.as_str(), "first" | "last" | "length")
                }
                _ => false,
            })
        }
        Expr::GetItem { obj, index, .. } => {
            if !eval_defined(ctx, obj)? {
                return Ok(false);
            }
            let receiver = match eval(ctx, obj) {
                Ok(value) => value,
                Err(e) if e.is_undefined() => return Ok(false),
                Err(e) => return Err(e),
            };
            let index = eval(ctx, index)?;
            Ok(match receiver {
                Value::Array(items) => index
                    .as_int()
                    .map(|i| {
                        let len = items.len() as i64;
                        let resolved = if i < 0 { i + len } else { i };
                        (0..len).contains(&resolved)
                    })
                    .unwrap_or(false),
                Value::Map(entries) => index
                    .to_output_string()
                    .map(|k| entries.contains_key(&k))
                    .unwrap_or(false),
                _ => false,
            })
        }
        other => match eval(ctx, other) {
            Ok(_) => Ok(true),
            Err(e) if e.is_undefined() => Ok(false),
            Err(e) => Err(e),
        },
    }
}

fn eval_function(ctx: &mut RenderContext, name: &str, args: &[Arg]) -> Result<Value> {
    if ctx.sandboxed {
        ctx.engine.policy().check_function(name)?;
    }

    // Imported macros bound in scope shadow everything else.
    if let Some(Value::Callable(callable)) = ctx.lookup(name) {
        return call_callable(ctx, &callable, args);
    }

    // Macros declared by the template currently being walked.
    if ctx.template.macros.contains_key(name) {
        let template = ctx.template.clone();
        return call_macro(ctx, template, name, args);
    }

    // Render-engine intrinsics.
    match name {
        "parent" => return eval_parent(ctx),
        "block" => {
            let (positional, _) = eval_args(ctx, args)?;
            let block_name = positional
                .first()
                .ok_or_else(|| {
                    WickerError::TypeError("block() needs a block name".to_string())
                })?
                .to_output_string()?;
            let mut buffer = ctx.engine.pool().take();
            let result = render_block(ctx, &block_name, &mut buffer);
            let value = Value::safe(buffer.clone());
            ctx.engine.pool().put(buffer);
            result?;
            return Ok(value);
        }
        "include" => {
            let (positional, _) = eval_args(ctx, args)?;
            let template_name = positional
                .first()
                .ok_or_else(|| {
                    WickerError::TypeError("include() needs a template name".to_string())
                })?
                .to_output_string()?;
            let with_map = match positional.get(1) {
                Some(Value::Map(entries)) => Some(entries.as_ref().clone()),
                Some(other) => {
                    return Err(WickerError::TypeError(format!(
                        "include() data must be a map, got {}",
                        other.kind()
                    )))
                }
                None => None,
            };
            let loaded = ctx.engine.get_template(&template_name)?;
            let mut scopes = vec![ctx.flatten_scopes()];
            if let Some(with_map) = with_map {
                scopes.push(with_map);
            }
            let mut child = ctx.child(loaded, scopes, ctx.sandboxed);
            let mut buffer = ctx.engine.pool().take();
            let result = render_document(&mut child, &mut buffer);
            let value = Value::safe(buffer.clone());
            ctx.engine.pool().put(buffer);
            result?;
            return Ok(value);
        }
        "source" => {
            let (positional, _) = eval_args(ctx, args)?;
            let template_name = positional
                .first()
                .ok_or_else(|| {
                    WickerError::TypeError("source() needs a template name".to_string())
                })?
                .to_output_string()?;
            return Ok(Value::string(ctx.engine.load_source(&template_name)?));
        }
        "attribute" => {
            let (positional, _) = eval_args(ctx, args)?;
            if positional.len() < 2 {
                return Err(WickerError::TypeError(
                    "attribute() needs a value and an attribute name".to_string(),
                ));
            }
            let attr = positional[1].to_output_string()?;
            if let Some(Value::Array(call_args)) = positional.get(2) {
                if let Value::Object(object) = &positional[0] {
                    if ctx.sandboxed {
                        ctx.engine.policy().check_method(&attr)?;
                    }
                    return object.call_method(&attr, call_args);
                }
                return Err(WickerError::TypeError(format!(
                    "attribute() can only call methods on objects, got {}",
                    positional[0].kind()
                )));
            }
            return get_attr(ctx, &positional[0].clone(), &attr);
        }
        "template_from_string" => {
            let (positional, _) = eval_args(ctx, args)?;
            let source = positional
                .first()
                .ok_or_else(|| {
                    WickerError::TypeError(
                        "template_from_string() needs template source".to_string(),
                    )
                })?
                .to_output_string()?;
            let anonymous = ctx.engine.template_from_string(&source)?;
            return Ok(Value::string(anonymous.name.clone()));
        }
        _ => {}
    }

    let function = ctx
        .engine
        .function(name)
        .ok_or_else(|| WickerError::TypeError(format!("unknown function \"{}\"", name)))?;
    let (mut positional, named) = eval_args(ctx, args)?;
    positional.extend(named.into_iter().map(|(_, v)| v));
    function(&positional)
}

// ----------------------------------------------------------------------
// Macro calls
// ----------------------------------------------------------------------

fn call_callable(ctx: &mut RenderContext, callable: &Callable, args: &[Arg]) -> Result<Value> {
    match callable {
        Callable::Macro(macro_ref) => {
            call_macro(ctx, macro_ref.template.clone(), &macro_ref.name, args)
        }
        Callable::Function(function) => {
            let (mut positional, named) = eval_args(ctx, args)?;
            positional.extend(named.into_iter().map(|(_, v)| v));
            function(&positional)
        }
    }
}

/// Invokes a macro: a fresh evaluation scope containing only the macro's
/// parameters (defaults substituted for absent arguments) and a `_self`
/// reference; the caller's scopes are not inherited. The body renders to a
/// pooled buffer that becomes the call's safe-string result.
fn call_macro(
    ctx: &mut RenderContext,
    template: Arc<Template>,
    name: &str,
    args: &[Arg],
) -> Result<Value> {
    if ctx.depth > MAX_RENDER_DEPTH {
        return Err(WickerError::TypeError(
            "maximum render depth exceeded".to_string(),
        ));
    }
    let def: MacroDef = template
        .macros
        .get(name)
        .ok_or_else(|| {
            WickerError::TypeError(format!(
                "template \"{}\" has no macro \"{}\"",
                template.name, name
            ))
        })?
        .clone();

    let (positional, named) = eval_args(ctx, args)?;

    let mut macro_ctx = RenderContext {
        engine: ctx.engine,
        scopes: vec![ValueMap::new()],
        chain: vec![template.clone()],
        template: template.clone(),
        block_stack: Vec::new(),
        autoescape: ctx.autoescape.clone(),
        sandboxed: ctx.sandboxed,
        depth: ctx.depth + 1,
    };

    for (i, param) in def.params.iter().enumerate() {
        let supplied = named
            .iter()
            .find(|(n, _)| n == &param.name)
            .map(|(_, v)| v.clone())
            .or_else(|| positional.get(i).cloned());
        let value = match supplied {
            Some(value) => value,
            None => match &param.default {
                Some(default) => eval(&mut macro_ctx, default)?,
                None => Value::Null,
            },
        };
        macro_ctx.set_var(param.name.clone(), value);
    }
    macro_ctx.set_var("_self", macro_map(&template));

    let mut buffer = ctx.engine.pool().take();
    let result = render_nodes(&mut macro_ctx, &def.body, &mut buffer)
        .map_err(|e| e.at(&template.name, def.line));
    let value = Value::safe(buffer.clone());
    ctx.engine.pool().put(buffer);
    result?;
    Ok(value)
}
