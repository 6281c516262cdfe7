// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Compiled template codec.
//!
//! Serialises a parsed template into a versioned binary envelope for the
//! on-disk cache:
//!
//! ```text
//! 4-byte magic | 2-byte version | 2-byte flags | 8-byte content length |
//! 32-byte SHA-256 content hash | content
//! ```
//!
//! The content is the length-prefixed template name, the length-prefixed
//! source (retained for error messages), and the AST with one tag byte per
//! node. Integers are little-endian; strings are length-prefixed UTF-8;
//! integer literals use the smallest containing width. Unknown versions,
//! unknown node tags, truncation and hash mismatches all fail loading.
//!
//! Round-trip guarantee: a decoded template renders byte-identical output
//! to the template it was encoded from, for any data.

use sha2::{Digest, Sha256};

use crate::ast::{Arg, BinaryOp, Expr, FilterCall, MacroParam, Node, UnaryOp};
use crate::error::{Result, WickerError};
use crate::template::Template;
use crate::value::Value;

const MAGIC: [u8; 4] = *b"WKR1";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 2 + 8 + 32;

// Statement node tags.
const N_ROOT: u8 = 1;
const N_TEXT: u8 = 2;
const N_PRINT: u8 = 3;
const N_IF: u8 = 4;
const N_FOR: u8 = 5;
const N_SET: u8 = 6;
const N_SET_CAPTURE: u8 = 7;
const N_BLOCK: u8 = 8;
const N_EXTENDS: u8 = 9;
const N_INCLUDE: u8 = 10;
const N_EMBED: u8 = 11;
const N_IMPORT: u8 = 12;
const N_FROM_IMPORT: u8 = 13;
const N_MACRO: u8 = 14;
const N_DO: u8 = 15;
const N_APPLY: u8 = 16;
const N_AUTOESCAPE: u8 = 17;
const N_SANDBOX: u8 = 18;

// Expression node tags.
const E_LITERAL: u8 = 1;
const E_VARIABLE: u8 = 2;
const E_GET_ATTR: u8 = 3;
const E_GET_ITEM: u8 = 4;
const E_UNARY: u8 = 5;
const E_BINARY: u8 = 6;
const E_CONDITIONAL: u8 = 7;
const E_ARRAY: u8 = 8;
const E_HASH: u8 = 9;
const E_FILTER: u8 = 10;
const E_TEST: u8 = 11;
const E_FUNCTION: u8 = 12;
const E_METHOD_CALL: u8 = 13;

// Literal value tags.
const V_NULL: u8 = 0;
const V_BOOL: u8 = 1;
const V_INT: u8 = 2;
const V_FLOAT: u8 = 3;
const V_STR: u8 = 4;
const V_SAFE: u8 = 5;

/// Serialises a template into an envelope.
pub fn encode(template: &Template) -> Result<Vec<u8>> {
    let mut content = Writer::default();
    content.str(&template.name);
    content.str(&template.source);
    content.node(&template.root)?;
    let content = content.buf;

    let mut out = Vec::with_capacity(HEADER_LEN + content.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(content.len() as u64).to_le_bytes());
    out.extend_from_slice(&Sha256::digest(&content));
    out.extend_from_slice(&content);
    Ok(out)
}

/// Deserialises an envelope back into a template.
pub fn decode(bytes: &[u8]) -> Result<Template> {
    if bytes.len() < HEADER_LEN {
        return Err(WickerError::CodecError("truncated envelope".to_string()));
    }
    if bytes[0..4] != MAGIC {
        return Err(WickerError::CodecError("bad magic".to_string()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(WickerError::CodecError(format!(
            "unsupported version {}",
            version
        )));
    }
    let content_len = u64::from_le_bytes(bytes[8..16].try_into().unwrap()) as usize;
    let content = &bytes[HEADER_LEN..];
    if content.len() != content_len {
        return Err(WickerError::CodecError(format!(
            "content length mismatch: header says {}, found {}",
            content_len,
            content.len()
        )));
    }
    let expected: [u8; 32] = bytes[16..48].try_into().unwrap();
    let actual: [u8; 32] = Sha256::digest(content).into();
    if expected != actual {
        return Err(WickerError::CodecError("content hash mismatch".to_string()));
    }

    let mut reader = Reader {
        data: content,
        pos: 0,
    };
    let name = reader.str()?;
    let source = reader.str()?;
    let root = reader.node()?;
    if reader.pos != reader.data.len() {
        return Err(WickerError::CodecError("trailing bytes".to_string()));
    }
    Template::from_root(&name, &source, root, None)
}

fn binary_op_code(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Add => 1,
        BinaryOp::Sub => 2,
        BinaryOp::Mul => 3,
        BinaryOp::Div => 4,
        BinaryOp::FloorDiv => 5,
        BinaryOp::Mod => 6,
        BinaryOp::Pow => 7,
        BinaryOp::Concat => 8,
        BinaryOp::Eq => 9,
        BinaryOp::Ne => 10,
        BinaryOp::Lt => 11,
        BinaryOp::Le => 12,
        BinaryOp::Gt => 13,
        BinaryOp::Ge => 14,
        BinaryOp::And => 15,
        BinaryOp::Or => 16,
        BinaryOp::In => 17,
        BinaryOp::NotIn => 18,
        BinaryOp::Range => 19,
        BinaryOp::Matches => 20,
        BinaryOp::StartsWith => 21,
        BinaryOp::EndsWith => 22,
    }
}

fn binary_op_from(code: u8) -> Result<BinaryOp> {
    Ok(match code {
        1 => BinaryOp::Add,
        2 => BinaryOp::Sub,
        3 => BinaryOp::Mul,
        4 => BinaryOp::Div,
        5 => BinaryOp::FloorDiv,
        6 => BinaryOp::Mod,
        7 => BinaryOp::Pow,
        8 => BinaryOp::Concat,
        9 => BinaryOp::Eq,
        10 => BinaryOp::Ne,
        11 => BinaryOp::Lt,
        12 => BinaryOp::Le,
        13 => BinaryOp::Gt,
        14 => BinaryOp::Ge,
        15 => BinaryOp::And,
        16 => BinaryOp::Or,
        17 => BinaryOp::In,
        18 => BinaryOp::NotIn,
        19 => BinaryOp::Range,
        20 => BinaryOp::Matches,
        21 => BinaryOp::StartsWith,
        22 => BinaryOp::EndsWith,
        other => {
            return Err(WickerError::CodecError(format!(
                "unknown binary operator code {}",
                other
            )))
        }
    })
}

fn unary_op_code(op: UnaryOp) -> u8 {
    match op {
        UnaryOp::Neg => 1,
        UnaryOp::Pos => 2,
        UnaryOp::Not => 3,
    }
}

fn unary_op_from(code: u8) -> Result<UnaryOp> {
    Ok(match code {
        1 => UnaryOp::Neg,
        2 => UnaryOp::Pos,
        3 => UnaryOp::Not,
        other => {
            return Err(WickerError::CodecError(format!(
                "unknown unary operator code {}",
                other
            )))
        }
    })
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    fn line(&mut self, line: usize) {
        self.u32(line as u32);
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Integers use the smallest containing two's-complement width.
    fn int(&mut self, v: i64) {
        if let Ok(n) = i8::try_from(v) {
            self.u8(1);
            self.buf.extend_from_slice(&n.to_le_bytes());
        } else if let Ok(n) = i16::try_from(v) {
            self.u8(2);
            self.buf.extend_from_slice(&n.to_le_bytes());
        } else if let Ok(n) = i32::try_from(v) {
            self.u8(4);
            self.buf.extend_from_slice(&n.to_le_bytes());
        } else {
            self.u8(8);
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.u8(V_NULL),
            Value::Bool(b) => {
                self.u8(V_BOOL);
                self.bool(*b);
            }
            Value::Int(n) => {
                self.u8(V_INT);
                self.int(*n);
            }
            Value::Float(f) => {
                self.u8(V_FLOAT);
                self.f64(*f);
            }
            Value::Str(s) => {
                self.u8(V_STR);
                self.str(s);
            }
            Value::Safe(s) => {
                self.u8(V_SAFE);
                self.str(s);
            }
            other => {
                return Err(WickerError::CodecError(format!(
                    "{} literals cannot be serialised",
                    other.kind()
                )))
            }
        }
        Ok(())
    }

    fn nodes(&mut self, nodes: &[Node]) -> Result<()> {
        self.u32(nodes.len() as u32);
        for node in nodes {
            self.node(node)?;
        }
        Ok(())
    }

    fn opt_expr(&mut self, expr: &Option<Expr>) -> Result<()> {
        match expr {
            Some(e) => {
                self.u8(1);
                self.expr(e)
            }
            None => {
                self.u8(0);
                Ok(())
            }
        }
    }

    fn opt_nodes(&mut self, nodes: &Option<Vec<Node>>) -> Result<()> {
        match nodes {
            Some(body) => {
                self.u8(1);
                self.nodes(body)
            }
            None => {
                self.u8(0);
                Ok(())
            }
        }
    }

    fn opt_str(&mut self, s: &Option<String>) {
        match s {
            Some(s) => {
                self.u8(1);
                self.str(s);
            }
            None => self.u8(0),
        }
    }

    fn strs(&mut self, items: &[String]) {
        self.u32(items.len() as u32);
        for item in items {
            self.str(item);
        }
    }

    fn args(&mut self, args: &[Arg]) -> Result<()> {
        self.u32(args.len() as u32);
        for arg in args {
            self.opt_str(&arg.name);
            self.expr(&arg.value)?;
        }
        Ok(())
    }

    fn node(&mut self, node: &Node) -> Result<()> {
        match node {
            Node::Root { children } => {
                self.u8(N_ROOT);
                self.nodes(children)?;
            }
            Node::Text { content, line } => {
                self.u8(N_TEXT);
                self.str(content);
                self.line(*line);
            }
            Node::Print { expr, line } => {
                self.u8(N_PRINT);
                self.expr(expr)?;
                self.line(*line);
            }
            Node::If {
                arms,
                else_body,
                line,
            } => {
                self.u8(N_IF);
                self.u32(arms.len() as u32);
                for (cond, body) in arms {
                    self.expr(cond)?;
                    self.nodes(body)?;
                }
                self.opt_nodes(else_body)?;
                self.line(*line);
            }
            Node::For {
                targets,
                source,
                condition,
                body,
                else_body,
                line,
            } => {
                self.u8(N_FOR);
                self.strs(targets);
                self.expr(source)?;
                self.opt_expr(condition)?;
                self.nodes(body)?;
                self.opt_nodes(else_body)?;
                self.line(*line);
            }
            Node::Set {
                targets,
                values,
                line,
            } => {
                self.u8(N_SET);
                self.strs(targets);
                self.u32(values.len() as u32);
                for value in values {
                    self.expr(value)?;
                }
                self.line(*line);
            }
            Node::SetCapture { target, body, line } => {
                self.u8(N_SET_CAPTURE);
                self.str(target);
                self.nodes(body)?;
                self.line(*line);
            }
            Node::Block { name, body, line } => {
                self.u8(N_BLOCK);
                self.str(name);
                self.nodes(body)?;
                self.line(*line);
            }
            Node::Extends { parent, line } => {
                self.u8(N_EXTENDS);
                self.expr(parent)?;
                self.line(*line);
            }
            Node::Include {
                template,
                with,
                only,
                ignore_missing,
                sandboxed,
                line,
            } => {
                self.u8(N_INCLUDE);
                self.expr(template)?;
                self.opt_expr(with)?;
                self.bool(*only);
                self.bool(*ignore_missing);
                self.bool(*sandboxed);
                self.line(*line);
            }
            Node::Embed {
                template,
                with,
                only,
                blocks,
                line,
            } => {
                self.u8(N_EMBED);
                self.expr(template)?;
                self.opt_expr(with)?;
                self.bool(*only);
                self.nodes(blocks)?;
                self.line(*line);
            }
            Node::Import {
                template,
                alias,
                line,
            } => {
                self.u8(N_IMPORT);
                self.expr(template)?;
                self.str(alias);
                self.line(*line);
            }
            Node::FromImport {
                template,
                names,
                line,
            } => {
                self.u8(N_FROM_IMPORT);
                self.expr(template)?;
                self.u32(names.len() as u32);
                for (name, alias) in names {
                    self.str(name);
                    self.opt_str(alias);
                }
                self.line(*line);
            }
            Node::Macro {
                name,
                params,
                body,
                line,
            } => {
                self.u8(N_MACRO);
                self.str(name);
                self.u32(params.len() as u32);
                for param in params {
                    self.str(&param.name);
                    self.opt_expr(&param.default)?;
                }
                self.nodes(body)?;
                self.line(*line);
            }
            Node::Do { expr, line } => {
                self.u8(N_DO);
                self.expr(expr)?;
                self.line(*line);
            }
            Node::Apply {
                filters,
                body,
                line,
            } => {
                self.u8(N_APPLY);
                self.u32(filters.len() as u32);
                for filter in filters {
                    self.str(&filter.name);
                    self.args(&filter.args)?;
                    self.line(filter.line);
                }
                self.nodes(body)?;
                self.line(*line);
            }
            Node::Autoescape {
                strategy,
                body,
                line,
            } => {
                self.u8(N_AUTOESCAPE);
                self.opt_str(strategy);
                self.nodes(body)?;
                self.line(*line);
            }
            Node::Sandbox { body, line } => {
                self.u8(N_SANDBOX);
                self.nodes(body)?;
                self.line(*line);
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Literal { value, line } => {
                self.u8(E_LITERAL);
                self.value(value)?;
                self.line(*line);
            }
            Expr::Variable { name, line } => {
                self.u8(E_VARIABLE);
                self.str(name);
                self.line(*line);
            }
            Expr::GetAttr { obj, name, line } => {
                self.u8(E_GET_ATTR);
                self.expr(obj)?;
                self.str(name);
                self.line(*line);
            }
            Expr::GetItem { obj, index, line } => {
                self.u8(E_GET_ITEM);
                self.expr(obj)?;
                self.expr(index)?;
                self.line(*line);
            }
            Expr::Unary { op, operand, line } => {
                self.u8(E_UNARY);
                self.u8(unary_op_code(*op));
                self.expr(operand)?;
                self.line(*line);
            }
            Expr::Binary {
                op,
                left,
                right,
                line,
            } => {
                self.u8(E_BINARY);
                self.u8(binary_op_code(*op));
                self.expr(left)?;
                self.expr(right)?;
                self.line(*line);
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
                line,
            } => {
                self.u8(E_CONDITIONAL);
                self.expr(cond)?;
                match then {
                    Some(e) => {
                        self.u8(1);
                        self.expr(e)?;
                    }
                    None => self.u8(0),
                }
                self.expr(otherwise)?;
                self.line(*line);
            }
            Expr::Array { items, line } => {
                self.u8(E_ARRAY);
                self.u32(items.len() as u32);
                for item in items {
                    self.expr(item)?;
                }
                self.line(*line);
            }
            Expr::Hash { pairs, line } => {
                self.u8(E_HASH);
                self.u32(pairs.len() as u32);
                for (key, value) in pairs {
                    self.expr(key)?;
                    self.expr(value)?;
                }
                self.line(*line);
            }
            Expr::Filter {
                input,
                name,
                args,
                line,
            } => {
                self.u8(E_FILTER);
                self.expr(input)?;
                self.str(name);
                self.args(args)?;
                self.line(*line);
            }
            Expr::Test {
                input,
                name,
                args,
                negated,
                line,
            } => {
                self.u8(E_TEST);
                self.expr(input)?;
                self.str(name);
                self.u32(args.len() as u32);
                for arg in args {
                    self.expr(arg)?;
                }
                self.bool(*negated);
                self.line(*line);
            }
            Expr::Function { name, args, line } => {
                self.u8(E_FUNCTION);
                self.str(name);
                self.args(args)?;
                self.line(*line);
            }
            Expr::MethodCall {
                obj,
                name,
                args,
                line,
            } => {
                self.u8(E_METHOD_CALL);
                self.expr(obj)?;
                self.str(name);
                self.args(args)?;
                self.line(*line);
            }
        }
        Ok(())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(WickerError::CodecError("truncated content".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn line(&mut self) -> Result<usize> {
        Ok(self.u32()? as usize)
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WickerError::CodecError("invalid UTF-8 string".to_string()))
    }

    fn int(&mut self) -> Result<i64> {
        let width = self.u8()?;
        Ok(match width {
            1 => i8::from_le_bytes(self.take(1)?.try_into().unwrap()) as i64,
            2 => i16::from_le_bytes(self.take(2)?.try_into().unwrap()) as i64,
            4 => i32::from_le_bytes(self.take(4)?.try_into().unwrap()) as i64,
            8 => i64::from_le_bytes(self.take(8)?.try_into().unwrap()),
            other => {
                return Err(WickerError::CodecError(format!(
                    "unknown integer width {}",
                    other
                )))
            }
        })
    }

    fn value(&mut self) -> Result<Value> {
        Ok(match self.u8()? {
            V_NULL => Value::Null,
            V_BOOL => Value::Bool(self.bool()?),
            V_INT => Value::Int(self.int()?),
            V_FLOAT => Value::Float(self.f64()?),
            V_STR => Value::string(self.str()?),
            V_SAFE => Value::safe(self.str()?),
            other => {
                return Err(WickerError::CodecError(format!(
                    "unknown value tag {}",
                    other
                )))
            }
        })
    }

    fn nodes(&mut self) -> Result<Vec<Node>> {
        let count = self.u32()? as usize;
        let mut nodes = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            nodes.push(self.node()?);
        }
        Ok(nodes)
    }

    fn opt_expr(&mut self) -> Result<Option<Expr>> {
        Ok(if self.u8()? != 0 {
            Some(self.expr()?)
        } else {
            None
        })
    }

    fn opt_nodes(&mut self) -> Result<Option<Vec<Node>>> {
        Ok(if self.u8()? != 0 {
            Some(self.nodes()?)
        } else {
            None
        })
    }

    fn opt_str(&mut self) -> Result<Option<String>> {
        Ok(if self.u8()? != 0 {
            Some(self.str()?)
        } else {
            None
        })
    }

    fn strs(&mut self) -> Result<Vec<String>> {
        let count = self.u32()? as usize;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(self.str()?);
        }
        Ok(items)
    }

    fn args(&mut self) -> Result<Vec<Arg>> {
        let count = self.u32()? as usize;
        let mut args = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let name = self.opt_str()?;
            let value = self.expr()?;
            args.push(Arg { name, value });
        }
        Ok(args)
    }

    fn node(&mut self) -> Result<Node> {
        Ok(match self.u8()? {
            N_ROOT => Node::Root {
                children: self.nodes()?,
            },
            N_TEXT => Node::Text {
                content: self.str()?,
                line: self.line()?,
            },
            N_PRINT => Node::Print {
                expr: self.expr()?,
                line: self.line()?,
            },
            N_IF => {
                let arm_count = self.u32()? as usize;
                let mut arms = Vec::with_capacity(arm_count.min(4096));
                for _ in 0..arm_count {
                    let cond = self.expr()?;
                    let body = self.nodes()?;
                    arms.push((cond, body));
                }
                Node::If {
                    arms,
                    else_body: self.opt_nodes()?,
                    line: self.line()?,
                }
            }
            N_FOR => Node::For {
                targets: self.strs()?,
                source: self.expr()?,
                condition: self.opt_expr()?,
                body: self.nodes()?,
                else_body: self.opt_nodes()?,
                line: self.line()?,
            },
            N_SET => {
                let targets = self.strs()?;
                let value_count = self.u32()? as usize;
                let mut values = Vec::with_capacity(value_count.min(4096));
                for _ in 0..value_count {
                    values.push(self.expr()?);
                }
                Node::Set {
                    targets,
                    values,
                    line: self.line()?,
                }
            }
            N_SET_CAPTURE => Node::SetCapture {
                target: self.str()?,
                body: self.nodes()?,
                line: self.line()?,
            },
            N_BLOCK => Node::Block {
                name: self.str()?,
                body: self.nodes()?,
                line: self.line()?,
            },
            N_EXTENDS => Node::Extends {
                parent: self.expr()?,
                line: self.line()?,
            },
            N_INCLUDE => Node::Include {
                template: self.expr()?,
                with: self.opt_expr()?,
                only: self.bool()?,
                ignore_missing: self.bool()?,
                sandboxed: self.bool()?,
                line: self.line()?,
            },
            N_EMBED => Node::Embed {
                template: self.expr()?,
                with: self.opt_expr()?,
                only: self.bool()?,
                blocks: self.nodes()?,
                line: self.line()?,
            },
            N_IMPORT => Node::Import {
                template: self.expr()?,
                alias: self.str()?,
                line: self.line()?,
            },
            N_FROM_IMPORT => {
                let template = self.expr()?;
                let count = self.u32()? as usize;
                let mut names = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let name = self.str()?;
                    let alias = self.opt_str()?;
                    names.push((name, alias));
                }
                Node::FromImport {
                    template,
                    names,
                    line: self.line()?,
                }
            }
            N_MACRO => {
                let name = self.str()?;
                let param_count = self.u32()? as usize;
                let mut params = Vec::with_capacity(param_count.min(4096));
                for _ in 0..param_count {
                    let param_name = self.str()?;
                    let default = self.opt_expr()?;
                    params.push(MacroParam {
                        name: param_name,
                        default,
                    });
                }
                Node::Macro {
                    name,
                    params,
                    body: self.nodes()?,
                    line: self.line()?,
                }
            }
            N_DO => Node::Do {
                expr: self.expr()?,
                line: self.line()?,
            },
            N_APPLY => {
                let filter_count = self.u32()? as usize;
                let mut filters = Vec::with_capacity(filter_count.min(4096));
                for _ in 0..filter_count {
                    let name = self.str()?;
                    let args = self.args()?;
                    let line = self.line()?;
                    filters.push(FilterCall { name, args, line });
                }
                Node::Apply {
                    filters,
                    body: self.nodes()?,
                    line: self.line()?,
                }
            }
            N_AUTOESCAPE => Node::Autoescape {
                strategy: self.opt_str()?,
                body: self.nodes()?,
                line: self.line()?,
            },
            N_SANDBOX => Node::Sandbox {
                body: self.nodes()?,
                line: self.line()?,
            },
            other => {
                return Err(WickerError::CodecError(format!(
                    "unknown node tag {}",
                    other
                )))
            }
        })
    }

    fn expr(&mut self) -> Result<Expr> {
        Ok(match self.u8()? {
            E_LITERAL => Expr::Literal {
                value: self.value()?,
                line: self.line()?,
            },
            E_VARIABLE => Expr::Variable {
                name: self.str()?,
                line: self.line()?,
            },
            E_GET_ATTR => Expr::GetAttr {
                obj: Box::new(self.expr()?),
                name: self.str()?,
                line: self.line()?,
            },
            E_GET_ITEM => Expr::GetItem {
                obj: Box::new(self.expr()?),
                index: Box::new(self.expr()?),
                line: self.line()?,
            },
            E_UNARY => {
                let op = unary_op_from(self.u8()?)?;
                Expr::Unary {
                    op,
                    operand: Box::new(self.expr()?),
                    line: self.line()?,
                }
            }
            E_BINARY => {
                let op = binary_op_from(self.u8()?)?;
                Expr::Binary {
                    op,
                    left: Box::new(self.expr()?),
                    right: Box::new(self.expr()?),
                    line: self.line()?,
                }
            }
            E_CONDITIONAL => {
                let cond = Box::new(self.expr()?);
                let then = if self.u8()? != 0 {
                    Some(Box::new(self.expr()?))
                } else {
                    None
                };
                Expr::Conditional {
                    cond,
                    then,
                    otherwise: Box::new(self.expr()?),
                    line: self.line()?,
                }
            }
            E_ARRAY => {
                let count = self.u32()? as usize;
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(self.expr()?);
                }
                Expr::Array {
                    items,
                    line: self.line()?,
                }
            }
            E_HASH => {
                let count = self.u32()? as usize;
                let mut pairs = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let key = self.expr()?;
                    let value = self.expr()?;
                    pairs.push((key, value));
                }
                Expr::Hash {
                    pairs,
                    line: self.line()?,
                }
            }
            E_FILTER => Expr::Filter {
                input: Box::new(self.expr()?),
                name: self.str()?,
                args: self.args()?,
                line: self.line()?,
            },
            E_TEST => {
                let input = Box::new(self.expr()?);
                let name = self.str()?;
                let count = self.u32()? as usize;
                let mut args = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    args.push(self.expr()?);
                }
                Expr::Test {
                    input,
                    name,
                    args,
                    negated: self.bool()?,
                    line: self.line()?,
                }
            }
            E_FUNCTION => Expr::Function {
                name: self.str()?,
                args: self.args()?,
                line: self.line()?,
            },
            E_METHOD_CALL => Expr::MethodCall {
                obj: Box::new(self.expr()?),
                name: self.str()?,
                args: self.args()?,
                line: self.line()?,
            },
            other => {
                return Err(WickerError::CodecError(format!(
                    "unknown expression tag {}",
                    other
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(source: &str) -> Template {
        let template = Template::compile("codec.html", source, None).unwrap();
        let bytes = encode(&template).unwrap();
        decode(&bytes).unwrap()
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let source = "{% extends base ~ '.html' %}\
{% block body %}{% for k, v in items if v > 0 %}{{ k }}={{ v|round(2) }}{% else %}none{% endfor %}{% endblock %}";
        let original = Template::compile("codec.html", source, None).unwrap();
        let decoded = round_trip(source);
        assert_eq!(decoded.name, original.name);
        assert_eq!(decoded.source, original.source);
        assert_eq!(decoded.root, original.root);
        assert_eq!(decoded.extends, original.extends);
        assert!(decoded.has_block("body"));
    }

    #[test]
    fn test_round_trip_all_statement_kinds() {
        let source = "text {{ 1.5 + n }}\
{% if a %}1{% elseif b %}2{% else %}3{% endif %}\
{% set x, y = 1, 'two' %}{% set z %}cap{% endset %}\
{% include 'p' with {a: 1} only ignore missing %}\
{% import 'm' as forms %}{% from 'm' import input as field %}\
{% macro f(a, b=2) %}{{ a }}{% endmacro %}\
{% do 1 ? 2 : 3 %}{% apply upper|trim %}x{% endapply %}\
{% autoescape 'js' %}{{ v }}{% endautoescape %}\
{% sandbox %}s{% endsandbox %}\
{% embed 'card' %}{% block t %}T{% endblock %}{% endembed %}\
{{ x is not divisible by(3) }}{{ not -x ** 2 }}{{ m.fn(1, k=2) }}{{ [1,2][0] }}";
        let original = Template::compile("codec.html", source, None).unwrap();
        let decoded = round_trip(source);
        assert_eq!(decoded.root, original.root);
        assert_eq!(decoded.macros.len(), original.macros.len());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let template = Template::compile("t", "x", None).unwrap();
        let mut bytes = encode(&template).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            decode(&bytes),
            Err(WickerError::CodecError(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let template = Template::compile("t", "x", None).unwrap();
        let mut bytes = encode(&template).unwrap();
        bytes[4] = 0xFF;
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_rejects_corruption() {
        let template = Template::compile("t", "hello {{ name }}", None).unwrap();
        let mut bytes = encode(&template).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("hash"));
    }

    #[test]
    fn test_rejects_truncation() {
        let template = Template::compile("t", "hello", None).unwrap();
        let bytes = encode(&template).unwrap();
        assert!(decode(&bytes[..bytes.len() - 2]).is_err());
        assert!(decode(&bytes[..10]).is_err());
    }

    #[test]
    fn test_integer_width_selection() {
        let mut w = Writer::default();
        w.int(5);
        assert_eq!(w.buf.len(), 2);
        let mut w = Writer::default();
        w.int(40_000);
        assert_eq!(w.buf.len(), 5);
        let mut w = Writer::default();
        w.int(i64::MIN);
        assert_eq!(w.buf.len(), 9);

        let mut r = Reader {
            data: &{
                let mut w = Writer::default();
                w.int(-77);
                w.int(123_456_789_000);
                w.buf
            },
            pos: 0,
        };
        assert_eq!(r.int().unwrap(), -77);
        assert_eq!(r.int().unwrap(), 123_456_789_000);
    }
}
