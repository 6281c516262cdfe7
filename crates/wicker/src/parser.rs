// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Template parser.
//!
//! Two sub-parsers share one token cursor: the **statement parser** reads
//! text verbatim, `{{ ... }}` prints and `{% ... %}` tags dispatched on
//! their first keyword; the **expression parser** is a Pratt parser driven
//! by binding powers, with the postfix chain (attribute, index, call,
//! filter) binding tightest.
//!
//! The parser reports the first syntax error with line and column and
//! halts; it does not attempt multi-error recovery.
//!
//! `{% extends %}` handling follows a two-state machine: before an
//! `extends` every statement is accepted; after it only `block`, `macro`,
//! `import`, `from`, `set` and whitespace-only text may appear at the top
//! level.

use crate::ast::{Arg, BinaryOp, Expr, FilterCall, MacroParam, Node, UnaryOp};
use crate::escape::EscapeStrategy;
use crate::error::{Result, SourceContext, WickerError};
use crate::lexer::{tokenize, Token, TokenKind};
use crate::value::Value;

// Binding powers, lowest to highest. Left-associative operators re-enter
// with power + 1; `**` re-enters with its own power (right-associative).
const BP_TERNARY: u8 = 2;
const BP_OR: u8 = 4;
const BP_AND: u8 = 6;
const BP_NOT: u8 = 8;
const BP_CMP: u8 = 10;
const BP_RANGE: u8 = 12;
const BP_ADD: u8 = 14;
const BP_MUL: u8 = 16;
const BP_POW: u8 = 18;
const BP_UNARY: u8 = 20;
const BP_POSTFIX: u8 = 30;

/// Parses template source into a root statement node.
pub fn parse(name: &str, source: &str) -> Result<Node> {
    let tokens = tokenize(name, source)?;
    let mut parser = Parser {
        name,
        source,
        tokens,
        pos: 0,
    };
    parser.parse_root()
}

struct Parser<'a> {
    name: &'a str,
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error_at(&self, message: impl Into<String>, line: usize, column: usize) -> WickerError {
        WickerError::ParseError {
            name: self.name.to_string(),
            message: message.into(),
            line,
            column,
            source_context: Some(SourceContext::from_source(self.source, line, column)),
        }
    }

    fn error(&self, message: impl Into<String>) -> WickerError {
        let token = self.peek();
        self.error_at(message, token.line, token.column)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn at_lexeme(&self, kind: TokenKind, lexeme: &str) -> bool {
        let token = self.peek();
        token.kind == kind && token.lexeme == lexeme
    }

    fn eat(&mut self, kind: TokenKind, lexeme: &str) -> bool {
        if self.at_lexeme(kind, lexeme) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        self.eat(TokenKind::Keyword, word)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        self.eat(TokenKind::Punct, p)
    }

    fn eat_operator(&mut self, op: &str) -> bool {
        self.eat(TokenKind::Operator, op)
    }

    fn expect_punct(&mut self, p: &str) -> Result<Token> {
        if self.at_lexeme(TokenKind::Punct, p) {
            Ok(self.advance())
        } else {
            Err(self.error(format!(
                "expected \"{}\", found \"{}\"",
                p,
                self.peek().lexeme
            )))
        }
    }

    fn expect_ident(&mut self) -> Result<Token> {
        if self.at(TokenKind::Ident) {
            Ok(self.advance())
        } else {
            Err(self.error(format!(
                "expected identifier, found \"{}\"",
                self.peek().lexeme
            )))
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<()> {
        if self.eat_keyword(word) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected \"{}\", found \"{}\"",
                word,
                self.peek().lexeme
            )))
        }
    }

    fn expect_block_close(&mut self) -> Result<()> {
        if self.at(TokenKind::BlockClose) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!(
                "expected \"%}}\", found \"{}\"",
                self.peek().lexeme
            )))
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_root(&mut self) -> Result<Node> {
        let mut children = Vec::new();
        let mut extends_seen = false;
        let mut content_seen = false;

        while !self.at(TokenKind::Eof) {
            let node = self.parse_statement()?;
            let is_ws_text = matches!(
                &node,
                Node::Text { content, .. } if content.trim().is_empty()
            );
            match &node {
                Node::Extends { line, .. } => {
                    if extends_seen {
                        return Err(self.error_at(
                            "a template may only extend one other template",
                            *line,
                            1,
                        ));
                    }
                    if content_seen {
                        return Err(self.error_at(
                            "\"extends\" must be the first statement of the template",
                            *line,
                            1,
                        ));
                    }
                    extends_seen = true;
                }
                _ if extends_seen => {
                    let allowed = matches!(
                        node,
                        Node::Block { .. }
                            | Node::Macro { .. }
                            | Node::Import { .. }
                            | Node::FromImport { .. }
                            | Node::Set { .. }
                            | Node::SetCapture { .. }
                    ) || is_ws_text;
                    if !allowed {
                        return Err(self.error_at(
                            format!(
                                "\"{}\" is not allowed at the top level of an extending template",
                                node.tag_name()
                            ),
                            node.line(),
                            1,
                        ));
                    }
                }
                _ => {}
            }
            if !is_ws_text {
                content_seen = true;
            }
            children.push(node);
        }
        Ok(Node::Root { children })
    }

    /// Parses statements until one of the given closing tags opens,
    /// consuming the `{%` and the tag word. Returns the body and the tag
    /// word that ended it; the caller finishes the closing directive.
    fn parse_body(&mut self, terminators: &[&str]) -> Result<(Vec<Node>, String)> {
        let mut nodes = Vec::new();
        loop {
            if self.at(TokenKind::Eof) {
                return Err(self.error(format!(
                    "unexpected end of template, expected {}",
                    terminators.join(" or ")
                )));
            }
            if self.at(TokenKind::BlockOpen) {
                let next = self.peek_at(1);
                if (next.kind == TokenKind::Keyword || next.kind == TokenKind::Ident)
                    && terminators.contains(&next.lexeme.as_str())
                {
                    self.advance();
                    let word = self.advance().lexeme;
                    return Ok((nodes, word));
                }
            }
            nodes.push(self.parse_statement()?);
        }
    }

    fn parse_statement(&mut self) -> Result<Node> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Text => {
                self.advance();
                Ok(Node::Text {
                    content: token.lexeme,
                    line: token.line,
                })
            }
            TokenKind::VarOpen => {
                self.advance();
                let expr = self.parse_expression(0)?;
                if !self.at(TokenKind::VarClose) {
                    return Err(self.error(format!(
                        "expected \"}}}}\", found \"{}\"",
                        self.peek().lexeme
                    )));
                }
                self.advance();
                Ok(Node::Print {
                    expr,
                    line: token.line,
                })
            }
            TokenKind::BlockOpen => {
                self.advance();
                self.parse_tag()
            }
            _ => Err(self.error(format!("unexpected token \"{}\"", token.lexeme))),
        }
    }

    fn parse_tag(&mut self) -> Result<Node> {
        let token = self.advance();
        let line = token.line;
        let word = token.lexeme.as_str();
        if token.kind != TokenKind::Keyword && token.kind != TokenKind::Ident {
            return Err(self.error_at(
                format!("expected tag name, found \"{}\"", token.lexeme),
                token.line,
                token.column,
            ));
        }
        match word {
            "if" => self.parse_if(line),
            "for" => self.parse_for(line),
            "set" => self.parse_set(line),
            "block" => self.parse_block(line),
            "extends" => {
                let parent = self.parse_expression(0)?;
                self.expect_block_close()?;
                Ok(Node::Extends { parent, line })
            }
            "include" => self.parse_include(line),
            "embed" => self.parse_embed(line),
            "import" => {
                let template = self.parse_expression(0)?;
                self.expect_keyword("as")?;
                let alias = self.expect_ident()?.lexeme;
                self.expect_block_close()?;
                Ok(Node::Import {
                    template,
                    alias,
                    line,
                })
            }
            "from" => self.parse_from_import(line),
            "macro" => self.parse_macro(line),
            "do" => {
                let expr = self.parse_expression(0)?;
                self.expect_block_close()?;
                Ok(Node::Do { expr, line })
            }
            "apply" => self.parse_apply(line),
            "autoescape" => self.parse_autoescape(line),
            "sandbox" => {
                self.expect_block_close()?;
                let (body, _) = self.parse_body(&["endsandbox"])?;
                self.expect_block_close()?;
                Ok(Node::Sandbox { body, line })
            }
            other => Err(self.error_at(
                format!("unknown tag \"{}\"", other),
                token.line,
                token.column,
            )),
        }
    }

    fn parse_if(&mut self, line: usize) -> Result<Node> {
        let mut arms = Vec::new();
        let mut else_body = None;
        let mut cond = self.parse_expression(0)?;
        self.expect_block_close()?;
        loop {
            let (body, word) = self.parse_body(&["elseif", "else", "endif"])?;
            arms.push((cond, body));
            match word.as_str() {
                "elseif" => {
                    cond = self.parse_expression(0)?;
                    self.expect_block_close()?;
                }
                "else" => {
                    self.expect_block_close()?;
                    let (body, _) = self.parse_body(&["endif"])?;
                    else_body = Some(body);
                    self.expect_block_close()?;
                    break;
                }
                _ => {
                    self.expect_block_close()?;
                    break;
                }
            }
        }
        Ok(Node::If {
            arms,
            else_body,
            line,
        })
    }

    fn parse_for(&mut self, line: usize) -> Result<Node> {
        let mut targets = vec![self.expect_ident()?.lexeme];
        if self.eat_punct(",") {
            targets.push(self.expect_ident()?.lexeme);
        }
        self.expect_keyword("in")?;
        let source = self.parse_expression(0)?;
        let condition = if self.eat_keyword("if") {
            Some(self.parse_expression(0)?)
        } else {
            None
        };
        self.expect_block_close()?;
        let (body, word) = self.parse_body(&["else", "endfor"])?;
        let else_body = if word == "else" {
            self.expect_block_close()?;
            let (nodes, _) = self.parse_body(&["endfor"])?;
            self.expect_block_close()?;
            Some(nodes)
        } else {
            self.expect_block_close()?;
            None
        };
        Ok(Node::For {
            targets,
            source,
            condition,
            body,
            else_body,
            line,
        })
    }

    fn parse_set(&mut self, line: usize) -> Result<Node> {
        let mut targets = vec![self.expect_ident()?.lexeme];
        while self.eat_punct(",") {
            targets.push(self.expect_ident()?.lexeme);
        }

        if self.at(TokenKind::BlockClose) {
            if targets.len() != 1 {
                return Err(self.error("a capturing \"set\" takes exactly one target"));
            }
            self.advance();
            let (body, _) = self.parse_body(&["endset"])?;
            self.expect_block_close()?;
            return Ok(Node::SetCapture {
                target: targets.remove(0),
                body,
                line,
            });
        }

        let compound = [
            ("+=", BinaryOp::Add),
            ("-=", BinaryOp::Sub),
            ("*=", BinaryOp::Mul),
            ("/=", BinaryOp::Div),
            ("//=", BinaryOp::FloorDiv),
            ("%=", BinaryOp::Mod),
            ("~=", BinaryOp::Concat),
        ]
        .into_iter()
        .find(|(op, _)| self.at_lexeme(TokenKind::Operator, op));

        if let Some((op_lexeme, op)) = compound {
            if targets.len() != 1 {
                return Err(self.error(format!(
                    "\"{}\" assignment takes exactly one target",
                    op_lexeme
                )));
            }
            self.advance();
            let rhs = self.parse_expression(0)?;
            self.expect_block_close()?;
            let target = targets.remove(0);
            let value = Expr::Binary {
                op,
                left: Box::new(Expr::Variable {
                    name: target.clone(),
                    line,
                }),
                right: Box::new(rhs),
                line,
            };
            return Ok(Node::Set {
                targets: vec![target],
                values: vec![value],
                line,
            });
        }

        if !self.eat_operator("=") {
            return Err(self.error(format!(
                "expected \"=\" in \"set\", found \"{}\"",
                self.peek().lexeme
            )));
        }
        let mut values = vec![self.parse_expression(0)?];
        while self.eat_punct(",") {
            values.push(self.parse_expression(0)?);
        }
        if values.len() != targets.len() {
            return Err(self.error(format!(
                "\"set\" has {} target(s) but {} value(s)",
                targets.len(),
                values.len()
            )));
        }
        self.expect_block_close()?;
        Ok(Node::Set {
            targets,
            values,
            line,
        })
    }

    fn parse_block(&mut self, line: usize) -> Result<Node> {
        let name = self.expect_ident()?.lexeme;
        self.expect_block_close()?;
        let (body, _) = self.parse_body(&["endblock"])?;
        if self.at(TokenKind::Ident) {
            let trailer = self.advance();
            if trailer.lexeme != name {
                return Err(self.error_at(
                    format!(
                        "mismatched block name: expected \"{}\", found \"{}\"",
                        name, trailer.lexeme
                    ),
                    trailer.line,
                    trailer.column,
                ));
            }
        }
        self.expect_block_close()?;
        Ok(Node::Block { name, body, line })
    }

    fn parse_include_options(&mut self) -> Result<(Option<Expr>, bool, bool, bool)> {
        let mut with = None;
        let mut only = false;
        let mut ignore_missing = false;
        let mut sandboxed = false;
        loop {
            if self.eat_keyword("ignore") {
                self.expect_keyword("missing")?;
                ignore_missing = true;
            } else if self.eat_keyword("with") {
                with = Some(self.parse_expression(0)?);
            } else if self.eat_keyword("only") {
                only = true;
            } else if self.eat(TokenKind::Ident, "sandboxed") {
                sandboxed = true;
            } else {
                break;
            }
        }
        Ok((with, only, ignore_missing, sandboxed))
    }

    fn parse_include(&mut self, line: usize) -> Result<Node> {
        let template = self.parse_expression(0)?;
        let (with, only, ignore_missing, sandboxed) = self.parse_include_options()?;
        self.expect_block_close()?;
        Ok(Node::Include {
            template,
            with,
            only,
            ignore_missing,
            sandboxed,
            line,
        })
    }

    fn parse_embed(&mut self, line: usize) -> Result<Node> {
        let template = self.parse_expression(0)?;
        let (with, only, _, _) = self.parse_include_options()?;
        self.expect_block_close()?;
        let (body, _) = self.parse_body(&["endembed"])?;
        self.expect_block_close()?;
        let mut blocks = Vec::new();
        for node in body {
            match node {
                b @ Node::Block { .. } => blocks.push(b),
                Node::Text { ref content, .. } if content.trim().is_empty() => {}
                other => {
                    return Err(self.error_at(
                        format!(
                            "only \"block\" definitions are allowed inside \"embed\", found \"{}\"",
                            other.tag_name()
                        ),
                        other.line(),
                        1,
                    ))
                }
            }
        }
        Ok(Node::Embed {
            template,
            with,
            only,
            blocks,
            line,
        })
    }

    fn parse_from_import(&mut self, line: usize) -> Result<Node> {
        let template = self.parse_expression(0)?;
        self.expect_keyword("import")?;
        let mut names = Vec::new();
        loop {
            let name = self.expect_ident()?.lexeme;
            let alias = if self.eat_keyword("as") {
                Some(self.expect_ident()?.lexeme)
            } else {
                None
            };
            names.push((name, alias));
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_block_close()?;
        Ok(Node::FromImport {
            template,
            names,
            line,
        })
    }

    fn parse_macro(&mut self, line: usize) -> Result<Node> {
        let name = self.expect_ident()?.lexeme;
        self.expect_punct("(")?;
        let mut params = Vec::new();
        let mut defaults_started = false;
        if !self.at_lexeme(TokenKind::Punct, ")") {
            loop {
                let param = self.expect_ident()?.lexeme;
                let default = if self.eat_operator("=") {
                    Some(self.parse_expression(0)?)
                } else {
                    None
                };
                if default.is_some() {
                    defaults_started = true;
                } else if defaults_started {
                    return Err(self.error(format!(
                        "macro parameter \"{}\" without default follows a defaulted parameter",
                        param
                    )));
                }
                params.push(MacroParam {
                    name: param,
                    default,
                });
                if !self.eat_punct(",") {
                    break;
                }
            }
        }
        self.expect_punct(")")?;
        self.expect_block_close()?;
        let (body, _) = self.parse_body(&["endmacro"])?;
        if self.at(TokenKind::Ident) {
            let trailer = self.advance();
            if trailer.lexeme != name {
                return Err(self.error_at(
                    format!(
                        "mismatched macro name: expected \"{}\", found \"{}\"",
                        name, trailer.lexeme
                    ),
                    trailer.line,
                    trailer.column,
                ));
            }
        }
        self.expect_block_close()?;
        Ok(Node::Macro {
            name,
            params,
            body,
            line,
        })
    }

    fn parse_apply(&mut self, line: usize) -> Result<Node> {
        let mut filters = Vec::new();
        loop {
            let name_token = self.expect_ident()?;
            let args = if self.at_lexeme(TokenKind::Punct, "(") {
                self.parse_call_args()?
            } else {
                Vec::new()
            };
            filters.push(FilterCall {
                name: name_token.lexeme,
                args,
                line: name_token.line,
            });
            if !self.eat_operator("|") {
                break;
            }
        }
        self.expect_block_close()?;
        let (body, _) = self.parse_body(&["endapply"])?;
        self.expect_block_close()?;
        Ok(Node::Apply {
            filters,
            body,
            line,
        })
    }

    fn parse_autoescape(&mut self, line: usize) -> Result<Node> {
        let strategy = if self.at(TokenKind::BlockClose) {
            Some("html".to_string())
        } else if self.eat_keyword("true") {
            Some("html".to_string())
        } else if self.eat_keyword("false") {
            None
        } else if self.at(TokenKind::Str) {
            let token = self.advance();
            // Validate early so the error points at the template line.
            EscapeStrategy::from_name(&token.lexeme).map_err(|_| {
                self.error_at(
                    format!("unknown escape strategy \"{}\"", token.lexeme),
                    token.line,
                    token.column,
                )
            })?;
            if token.lexeme == "off" || token.lexeme == "false" {
                None
            } else {
                Some(token.lexeme)
            }
        } else {
            return Err(self.error(format!(
                "expected escape strategy, found \"{}\"",
                self.peek().lexeme
            )));
        };
        self.expect_block_close()?;
        let (body, _) = self.parse_body(&["endautoescape"])?;
        self.expect_block_close()?;
        Ok(Node::Autoescape {
            strategy,
            body,
            line,
        })
    }

    // ------------------------------------------------------------------
    // Expressions (Pratt)
    // ------------------------------------------------------------------

    fn parse_expression(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.parse_prefix()?;
        loop {
            match self.parse_infix(lhs, min_bp)? {
                Ok(expr) => lhs = expr,
                Err(expr) => return Ok(expr),
            }
        }
    }

    fn parse_prefix(&mut self) -> Result<Expr> {
        let token = self.peek().clone();
        let line = token.line;
        match token.kind {
            TokenKind::Number => {
                self.advance();
                let value = if token.lexeme.contains('.') {
                    Value::Float(token.lexeme.parse::<f64>().map_err(|_| {
                        self.error_at("invalid number literal", token.line, token.column)
                    })?)
                } else {
                    match token.lexeme.parse::<i64>() {
                        Ok(n) => Value::Int(n),
                        // Out of integer range: keep it as a float.
                        Err(_) => Value::Float(token.lexeme.parse::<f64>().map_err(|_| {
                            self.error_at("invalid number literal", token.line, token.column)
                        })?),
                    }
                };
                Ok(Expr::Literal { value, line })
            }
            TokenKind::Str => {
                self.advance();
                Ok(Expr::Literal {
                    value: Value::string(token.lexeme),
                    line,
                })
            }
            TokenKind::Keyword => match token.lexeme.as_str() {
                "true" => {
                    self.advance();
                    Ok(Expr::Literal {
                        value: Value::Bool(true),
                        line,
                    })
                }
                "false" => {
                    self.advance();
                    Ok(Expr::Literal {
                        value: Value::Bool(false),
                        line,
                    })
                }
                "null" | "none" => {
                    self.advance();
                    Ok(Expr::Literal {
                        value: Value::Null,
                        line,
                    })
                }
                "not" => {
                    self.advance();
                    let operand = self.parse_expression(BP_NOT)?;
                    Ok(Expr::Unary {
                        op: UnaryOp::Not,
                        operand: Box::new(operand),
                        line,
                    })
                }
                other => Err(self.error(format!("unexpected keyword \"{}\"", other))),
            },
            TokenKind::Ident => {
                self.advance();
                if self.at_lexeme(TokenKind::Punct, "(") {
                    let args = self.parse_call_args()?;
                    Ok(Expr::Function {
                        name: token.lexeme,
                        args,
                        line,
                    })
                } else {
                    Ok(Expr::Variable {
                        name: token.lexeme,
                        line,
                    })
                }
            }
            TokenKind::Operator => match token.lexeme.as_str() {
                "-" => {
                    self.advance();
                    let operand = self.parse_expression(BP_UNARY)?;
                    Ok(Expr::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(operand),
                        line,
                    })
                }
                "+" => {
                    self.advance();
                    let operand = self.parse_expression(BP_UNARY)?;
                    Ok(Expr::Unary {
                        op: UnaryOp::Pos,
                        operand: Box::new(operand),
                        line,
                    })
                }
                other => Err(self.error(format!("unexpected operator \"{}\"", other))),
            },
            TokenKind::Punct => match token.lexeme.as_str() {
                "(" => {
                    self.advance();
                    let inner = self.parse_expression(0)?;
                    self.expect_punct(")")?;
                    Ok(inner)
                }
                "[" => {
                    self.advance();
                    let mut items = Vec::new();
                    if !self.at_lexeme(TokenKind::Punct, "]") {
                        loop {
                            items.push(self.parse_expression(0)?);
                            if !self.eat_punct(",") {
                                break;
                            }
                            if self.at_lexeme(TokenKind::Punct, "]") {
                                break;
                            }
                        }
                    }
                    self.expect_punct("]")?;
                    Ok(Expr::Array { items, line })
                }
                "{" => {
                    self.advance();
                    let mut pairs = Vec::new();
                    if !self.at_lexeme(TokenKind::Punct, "}") {
                        loop {
                            let key = self.parse_hash_key()?;
                            self.expect_punct(":")?;
                            let value = self.parse_expression(0)?;
                            pairs.push((key, value));
                            if !self.eat_punct(",") {
                                break;
                            }
                            if self.at_lexeme(TokenKind::Punct, "}") {
                                break;
                            }
                        }
                    }
                    self.expect_punct("}")?;
                    Ok(Expr::Hash { pairs, line })
                }
                other => Err(self.error(format!("unexpected \"{}\"", other))),
            },
            _ => Err(self.error(format!(
                "unexpected token \"{}\" in expression",
                token.lexeme
            ))),
        }
    }

    /// Hash keys: string or number literals, bare identifiers (taken as
    /// strings when unambiguous), or a parenthesised expression.
    fn parse_hash_key(&mut self) -> Result<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Ident | TokenKind::Keyword
                if self.peek_at(1).lexeme == ":" && self.peek_at(1).kind == TokenKind::Punct =>
            {
                self.advance();
                Ok(Expr::Literal {
                    value: Value::string(token.lexeme),
                    line: token.line,
                })
            }
            _ => self.parse_expression(BP_POSTFIX),
        }
    }

    /// One infix/postfix step. Returns `Ok(expr)` to continue the loop with
    /// the grown expression, or `Err(expr)` when nothing at or above
    /// `min_bp` applies.
    #[allow(clippy::result_large_err)]
    fn parse_infix(&mut self, lhs: Expr, min_bp: u8) -> Result<std::result::Result<Expr, Expr>> {
        let token = self.peek().clone();
        let line = token.line;

        // Postfix chain: attribute, index, filter.
        if BP_POSTFIX >= min_bp {
            if token.kind == TokenKind::Punct && token.lexeme == "." {
                self.advance();
                let name_token = self.advance();
                if name_token.kind != TokenKind::Ident && name_token.kind != TokenKind::Keyword {
                    return Err(self.error_at(
                        format!("expected attribute name, found \"{}\"", name_token.lexeme),
                        name_token.line,
                        name_token.column,
                    ));
                }
                if self.at_lexeme(TokenKind::Punct, "(") {
                    let args = self.parse_call_args()?;
                    return Ok(Ok(Expr::MethodCall {
                        obj: Box::new(lhs),
                        name: name_token.lexeme,
                        args,
                        line,
                    }));
                }
                return Ok(Ok(Expr::GetAttr {
                    obj: Box::new(lhs),
                    name: name_token.lexeme,
                    line,
                }));
            }
            if token.kind == TokenKind::Punct && token.lexeme == "[" {
                self.advance();
                let index = self.parse_expression(0)?;
                self.expect_punct("]")?;
                return Ok(Ok(Expr::GetItem {
                    obj: Box::new(lhs),
                    index: Box::new(index),
                    line,
                }));
            }
            if token.kind == TokenKind::Operator && token.lexeme == "|" {
                self.advance();
                let name = self.expect_ident()?.lexeme;
                let args = if self.at_lexeme(TokenKind::Punct, "(") {
                    self.parse_call_args()?
                } else {
                    Vec::new()
                };
                return Ok(Ok(Expr::Filter {
                    input: Box::new(lhs),
                    name,
                    args,
                    line,
                }));
            }
        }

        // `is` / `is not` tests at comparison level.
        if BP_CMP >= min_bp && token.kind == TokenKind::Keyword && token.lexeme == "is" {
            self.advance();
            let negated = self.eat_keyword("not");
            let expr = self.parse_test(lhs, negated, line)?;
            return Ok(Ok(expr));
        }

        // `not in` at comparison level.
        if BP_CMP >= min_bp
            && token.kind == TokenKind::Keyword
            && token.lexeme == "not"
            && self.peek_at(1).lexeme == "in"
        {
            self.advance();
            self.advance();
            let rhs = self.parse_expression(BP_CMP + 1)?;
            return Ok(Ok(Expr::Binary {
                op: BinaryOp::NotIn,
                left: Box::new(lhs),
                right: Box::new(rhs),
                line,
            }));
        }

        // Two-word text operators at comparison level.
        if BP_CMP >= min_bp && token.kind == TokenKind::Ident {
            let op = match token.lexeme.as_str() {
                "matches" => Some(BinaryOp::Matches),
                "starts" if self.peek_at(1).lexeme == "with" => Some(BinaryOp::StartsWith),
                "ends" if self.peek_at(1).lexeme == "with" => Some(BinaryOp::EndsWith),
                _ => None,
            };
            if let Some(op) = op {
                self.advance();
                if op != BinaryOp::Matches {
                    self.advance();
                }
                let rhs = self.parse_expression(BP_CMP + 1)?;
                return Ok(Ok(Expr::Binary {
                    op,
                    left: Box::new(lhs),
                    right: Box::new(rhs),
                    line,
                }));
            }
        }

        // Ternary and elvis.
        if BP_TERNARY >= min_bp && token.kind == TokenKind::Operator {
            if token.lexeme == "?" {
                self.advance();
                let then = self.parse_expression(0)?;
                self.expect_punct(":")?;
                let otherwise = self.parse_expression(BP_TERNARY)?;
                return Ok(Ok(Expr::Conditional {
                    cond: Box::new(lhs),
                    then: Some(Box::new(then)),
                    otherwise: Box::new(otherwise),
                    line,
                }));
            }
            if token.lexeme == "?:" {
                self.advance();
                let otherwise = self.parse_expression(BP_TERNARY)?;
                return Ok(Ok(Expr::Conditional {
                    cond: Box::new(lhs),
                    then: None,
                    otherwise: Box::new(otherwise),
                    line,
                }));
            }
        }

        // Plain binary operators.
        let (op, bp, right_assoc) = match (&token.kind, token.lexeme.as_str()) {
            (TokenKind::Keyword, "or") => (BinaryOp::Or, BP_OR, false),
            (TokenKind::Operator, "||") => (BinaryOp::Or, BP_OR, false),
            (TokenKind::Keyword, "and") => (BinaryOp::And, BP_AND, false),
            (TokenKind::Operator, "&&") => (BinaryOp::And, BP_AND, false),
            (TokenKind::Operator, "==") => (BinaryOp::Eq, BP_CMP, false),
            (TokenKind::Operator, "!=") => (BinaryOp::Ne, BP_CMP, false),
            (TokenKind::Operator, "<") => (BinaryOp::Lt, BP_CMP, false),
            (TokenKind::Operator, "<=") => (BinaryOp::Le, BP_CMP, false),
            (TokenKind::Operator, ">") => (BinaryOp::Gt, BP_CMP, false),
            (TokenKind::Operator, ">=") => (BinaryOp::Ge, BP_CMP, false),
            (TokenKind::Keyword, "in") => (BinaryOp::In, BP_CMP, false),
            (TokenKind::Operator, "..") => (BinaryOp::Range, BP_RANGE, false),
            (TokenKind::Operator, "+") => (BinaryOp::Add, BP_ADD, false),
            (TokenKind::Operator, "-") => (BinaryOp::Sub, BP_ADD, false),
            (TokenKind::Operator, "~") => (BinaryOp::Concat, BP_ADD, false),
            (TokenKind::Operator, "*") => (BinaryOp::Mul, BP_MUL, false),
            (TokenKind::Operator, "/") => (BinaryOp::Div, BP_MUL, false),
            (TokenKind::Operator, "//") => (BinaryOp::FloorDiv, BP_MUL, false),
            (TokenKind::Operator, "%") => (BinaryOp::Mod, BP_MUL, false),
            (TokenKind::Operator, "**") => (BinaryOp::Pow, BP_POW, true),
            _ => return Ok(Err(lhs)),
        };
        if bp < min_bp {
            return Ok(Err(lhs));
        }
        self.advance();
        let next_bp = if right_assoc { bp } else { bp + 1 };
        let rhs = self.parse_expression(next_bp)?;
        Ok(Ok(Expr::Binary {
            op,
            left: Box::new(lhs),
            right: Box::new(rhs),
            line,
        }))
    }

    fn parse_test(&mut self, input: Expr, negated: bool, line: usize) -> Result<Expr> {
        let token = self.advance();
        let mut name = match token.kind {
            TokenKind::Ident => token.lexeme,
            TokenKind::Keyword if token.lexeme == "null" || token.lexeme == "none" => token.lexeme,
            TokenKind::Keyword if token.lexeme == "in" => {
                // `x is in [..]` reads as containment.
                let rhs = self.parse_expression(BP_CMP + 1)?;
                let op = if negated {
                    BinaryOp::NotIn
                } else {
                    BinaryOp::In
                };
                return Ok(Expr::Binary {
                    op,
                    left: Box::new(input),
                    right: Box::new(rhs),
                    line,
                });
            }
            _ => {
                return Err(self.error_at(
                    format!("expected test name, found \"{}\"", token.lexeme),
                    token.line,
                    token.column,
                ))
            }
        };
        // Two-word test names.
        if name == "divisible" && self.at_lexeme(TokenKind::Ident, "by") {
            self.advance();
            name = "divisible by".to_string();
        } else if name == "same" && self.at_lexeme(TokenKind::Keyword, "as") {
            self.advance();
            name = "same as".to_string();
        }
        let mut args = Vec::new();
        if self.eat_punct("(") {
            if !self.at_lexeme(TokenKind::Punct, ")") {
                loop {
                    args.push(self.parse_expression(0)?);
                    if !self.eat_punct(",") {
                        break;
                    }
                }
            }
            self.expect_punct(")")?;
        }
        Ok(Expr::Test {
            input: Box::new(input),
            name,
            args,
            negated,
            line,
        })
    }

    /// Parses `( ... )` call arguments, positional and named.
    fn parse_call_args(&mut self) -> Result<Vec<Arg>> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        if !self.at_lexeme(TokenKind::Punct, ")") {
            loop {
                let named = self.at(TokenKind::Ident)
                    && self.peek_at(1).kind == TokenKind::Operator
                    && self.peek_at(1).lexeme == "=";
                if named {
                    let name = self.advance().lexeme;
                    self.advance();
                    let value = self.parse_expression(0)?;
                    args.push(Arg {
                        name: Some(name),
                        value,
                    });
                } else {
                    let value = self.parse_expression(0)?;
                    args.push(Arg { name: None, value });
                }
                if !self.eat_punct(",") {
                    break;
                }
            }
        }
        self.expect_punct(")")?;
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Node {
        parse("test", source).unwrap()
    }

    fn first_expr(source: &str) -> Expr {
        match parse_ok(source) {
            Node::Root { children } => match children.into_iter().next().unwrap() {
                Node::Print { expr, .. } => expr,
                other => panic!("expected print node, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let expr = first_expr("{{ 1 + 2 * 3 }}");
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                right,
                ..
            } => match *right {
                Expr::Binary {
                    op: BinaryOp::Mul, ..
                } => {}
                other => panic!("expected mul on the right, got {:?}", other),
            },
            other => panic!("expected add at the top, got {:?}", other),
        }
    }

    #[test]
    fn test_pow_right_associative() {
        let expr = first_expr("{{ 2 ** 3 ** 2 }}");
        match expr {
            Expr::Binary {
                op: BinaryOp::Pow,
                right,
                ..
            } => match *right {
                Expr::Binary {
                    op: BinaryOp::Pow, ..
                } => {}
                other => panic!("expected pow on the right, got {:?}", other),
            },
            other => panic!("expected pow at the top, got {:?}", other),
        }
    }

    #[test]
    fn test_filter_binds_tighter_than_binary() {
        // `a ~ b|upper` concatenates a with the filtered b.
        let expr = first_expr("{{ a ~ b|upper }}");
        match expr {
            Expr::Binary {
                op: BinaryOp::Concat,
                right,
                ..
            } => match *right {
                Expr::Filter { ref name, .. } => assert_eq!(name, "upper"),
                other => panic!("expected filter on the right, got {:?}", other),
            },
            other => panic!("expected concat at the top, got {:?}", other),
        }
    }

    #[test]
    fn test_not_binds_looser_than_comparison() {
        let expr = first_expr("{{ not a == b }}");
        match expr {
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
                ..
            } => match *operand {
                Expr::Binary {
                    op: BinaryOp::Eq, ..
                } => {}
                other => panic!("expected comparison under not, got {:?}", other),
            },
            other => panic!("expected not at the top, got {:?}", other),
        }
    }

    #[test]
    fn test_test_parsing() {
        let expr = first_expr("{{ n is divisible by(3) }}");
        match expr {
            Expr::Test {
                name,
                args,
                negated,
                ..
            } => {
                assert_eq!(name, "divisible by");
                assert_eq!(args.len(), 1);
                assert!(!negated);
            }
            other => panic!("expected test, got {:?}", other),
        }
        let expr = first_expr("{{ x is not defined }}");
        match expr {
            Expr::Test { name, negated, .. } => {
                assert_eq!(name, "defined");
                assert!(negated);
            }
            other => panic!("expected test, got {:?}", other),
        }
    }

    #[test]
    fn test_ternary_and_elvis() {
        match first_expr("{{ a ? b : c }}") {
            Expr::Conditional { then, .. } => assert!(then.is_some()),
            other => panic!("expected conditional, got {:?}", other),
        }
        match first_expr("{{ a ?: c }}") {
            Expr::Conditional { then, .. } => assert!(then.is_none()),
            other => panic!("expected conditional, got {:?}", other),
        }
    }

    #[test]
    fn test_hash_literal_bare_keys() {
        match first_expr("{{ {a: 1, 'b': 2} }}") {
            Expr::Hash { pairs, .. } => {
                assert_eq!(pairs.len(), 2);
                match &pairs[0].0 {
                    Expr::Literal { value, .. } => assert_eq!(value.as_str(), Some("a")),
                    other => panic!("expected literal key, got {:?}", other),
                }
            }
            other => panic!("expected hash, got {:?}", other),
        }
    }

    #[test]
    fn test_if_elseif_else() {
        match parse_ok("{% if a %}1{% elseif b %}2{% else %}3{% endif %}") {
            Node::Root { children } => match &children[0] {
                Node::If {
                    arms, else_body, ..
                } => {
                    assert_eq!(arms.len(), 2);
                    assert!(else_body.is_some());
                }
                other => panic!("expected if, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_for_with_condition_and_else() {
        match parse_ok("{% for k, v in items if v %}x{% else %}none{% endfor %}") {
            Node::Root { children } => match &children[0] {
                Node::For {
                    targets,
                    condition,
                    else_body,
                    ..
                } => {
                    assert_eq!(targets, &["k".to_string(), "v".to_string()]);
                    assert!(condition.is_some());
                    assert!(else_body.is_some());
                }
                other => panic!("expected for, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_set_forms() {
        match parse_ok("{% set a, b = 1, 2 %}") {
            Node::Root { children } => match &children[0] {
                Node::Set {
                    targets, values, ..
                } => {
                    assert_eq!(targets.len(), 2);
                    assert_eq!(values.len(), 2);
                }
                other => panic!("expected set, got {:?}", other),
            },
            _ => unreachable!(),
        }
        match parse_ok("{% set x %}body{% endset %}") {
            Node::Root { children } => {
                assert!(matches!(&children[0], Node::SetCapture { .. }));
            }
            _ => unreachable!(),
        }
        // Compound assignment desugars to a binary expression.
        match parse_ok("{% set n += 1 %}") {
            Node::Root { children } => match &children[0] {
                Node::Set { values, .. } => {
                    assert!(matches!(
                        values[0],
                        Expr::Binary {
                            op: BinaryOp::Add,
                            ..
                        }
                    ));
                }
                other => panic!("expected set, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_extends_must_be_first() {
        assert!(parse("test", "hello {% extends 'base' %}").is_err());
        assert!(parse("test", "  {% extends 'base' %}").is_ok());
        assert!(parse("test", "{% extends 'a' %}{% extends 'b' %}").is_err());
    }

    #[test]
    fn test_after_extends_restrictions() {
        assert!(parse("test", "{% extends 'b' %}{% block c %}x{% endblock %}").is_ok());
        assert!(parse("test", "{% extends 'b' %}{% set x = 1 %}").is_ok());
        assert!(parse("test", "{% extends 'b' %}loose text").is_err());
        assert!(parse("test", "{% extends 'b' %}{% if x %}{% endif %}").is_err());
    }

    #[test]
    fn test_block_name_mismatch() {
        assert!(parse("test", "{% block a %}x{% endblock a %}").is_ok());
        assert!(parse("test", "{% block a %}x{% endblock b %}").is_err());
    }

    #[test]
    fn test_include_options() {
        match parse_ok("{% include 'p' ignore missing with {a: 1} only %}") {
            Node::Root { children } => match &children[0] {
                Node::Include {
                    with,
                    only,
                    ignore_missing,
                    sandboxed,
                    ..
                } => {
                    assert!(with.is_some());
                    assert!(*only);
                    assert!(*ignore_missing);
                    assert!(!*sandboxed);
                }
                other => panic!("expected include, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_embed_allows_only_blocks() {
        assert!(parse(
            "test",
            "{% embed 'card' %}{% block title %}T{% endblock %}{% endembed %}"
        )
        .is_ok());
        assert!(parse("test", "{% embed 'card' %}loose{% endembed %}").is_err());
    }

    #[test]
    fn test_macro_default_ordering() {
        assert!(parse("test", "{% macro f(a, b='x') %}{% endmacro %}").is_ok());
        assert!(parse("test", "{% macro f(a='x', b) %}{% endmacro %}").is_err());
    }

    #[test]
    fn test_named_call_args() {
        match first_expr("{{ f(1, sep='; ') }}") {
            Expr::Function { args, .. } => {
                assert_eq!(args.len(), 2);
                assert!(args[0].name.is_none());
                assert_eq!(args[1].name.as_deref(), Some("sep"));
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_method_call_on_alias() {
        match first_expr("{{ forms.input('name') }}") {
            Expr::MethodCall { name, .. } => assert_eq!(name, "input"),
            other => panic!("expected method call, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_errors() {
        let err = parse("test", "{% verbatim %}").unwrap_err();
        match err {
            WickerError::ParseError { message, .. } => assert!(message.contains("unknown tag")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
