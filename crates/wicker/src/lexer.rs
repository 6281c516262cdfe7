// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Template lexer.
//!
//! Splits template source into a token stream, distinguishing literal text
//! from directive content. The lexer operates in two modes: *text mode*
//! collects everything up to the next `{{`, `{%` or `{#` opener into a
//! single [`TokenKind::Text`] token; *expression mode* runs from an opener
//! to its matching closer and emits identifier, number, string, operator,
//! punctuation and keyword tokens. `{# ... #}` comments are consumed and
//! never emitted.
//!
//! Whitespace-control markers (`{{-`, `-}}`, `{%-`, `-%}`, `{#-`, `-#}`)
//! trim the whitespace on the adjacent side of the neighbouring text token.
//!
//! Every token carries a 1-indexed `(line, column)` pair for diagnostics.

use std::collections::HashSet;

use lazy_static::lazy_static;

use crate::error::{Result, SourceContext, WickerError};

/// The kind of a lexed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Literal template text between directives.
    Text,
    /// `{{` (or `{{-`).
    VarOpen,
    /// `}}` (or `-}}`).
    VarClose,
    /// `{%` (or `{%-`).
    BlockOpen,
    /// `%}` (or `-%}`).
    BlockClose,
    /// An identifier.
    Ident,
    /// An integer or float literal.
    Number,
    /// A quoted string literal, lexeme holds the unescaped contents.
    Str,
    /// A multi-character or single-character operator.
    Operator,
    /// Punctuation: `( ) [ ] { } , . : ;`.
    Punct,
    /// A reserved word.
    Keyword,
    /// End of input.
    Eof,
}

/// A lexed token with its raw lexeme and source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// The token kind.
    pub kind: TokenKind,
    /// The raw lexeme (unescaped contents for string literals).
    pub lexeme: String,
    /// 1-indexed source line.
    pub line: usize,
    /// 1-indexed source column.
    pub column: usize,
}

lazy_static! {
    /// Reserved words tagged as [`TokenKind::Keyword`].
    static ref KEYWORDS: HashSet<&'static str> = [
        "and", "or", "not", "in", "is", "if", "else", "elseif", "endif", "for",
        "endfor", "do", "set", "endset", "block", "endblock", "extends",
        "include", "embed", "with", "only", "ignore", "missing", "import",
        "from", "as", "macro", "endmacro", "apply", "endapply", "autoescape",
        "endautoescape", "sandbox", "endsandbox", "true", "false", "null",
        "none",
    ]
    .into_iter()
    .collect();
}

/// Multi-character operators, longest match first.
const OPERATORS: &[&str] = &[
    "<=>", "//=", "==", "!=", "<=", ">=", "**", "//", "..", "?:", "+=", "-=",
    "*=", "/=", "%=", "~=", "&&", "||",
];

const SINGLE_OPERATORS: &str = "+-*/%=<>!&|~?";

const PUNCT: &str = "()[]{},.:;";

/// Tokenizes template source into a stream terminated by [`TokenKind::Eof`].
pub fn tokenize(name: &str, source: &str) -> Result<Vec<Token>> {
    Lexer::new(name, source).run()
}

struct Lexer<'a> {
    name: &'a str,
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
    /// Set when the previous closer carried a `-`: the next text token is
    /// left-trimmed.
    trim_next_text: bool,
}

impl<'a> Lexer<'a> {
    fn new(name: &'a str, source: &'a str) -> Self {
        Self {
            name,
            source,
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            trim_next_text: false,
        }
    }

    fn error(&self, message: impl Into<String>, line: usize, column: usize) -> WickerError {
        WickerError::ParseError {
            name: self.name.to_string(),
            message: message.into(),
            line,
            column,
            source_context: Some(SourceContext::from_source(self.source, line, column)),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek(i) == Some(c))
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn bump_n(&mut self, n: usize) {
        for _ in 0..n {
            self.bump();
        }
    }

    fn push(&mut self, kind: TokenKind, lexeme: impl Into<String>, line: usize, column: usize) {
        self.tokens.push(Token {
            kind,
            lexeme: lexeme.into(),
            line,
            column,
        });
    }

    fn run(mut self) -> Result<Vec<Token>> {
        while self.pos < self.chars.len() {
            self.lex_text()?;
        }
        // A pending left-trim with no following text is a no-op.
        let (line, column) = (self.line, self.column);
        self.push(TokenKind::Eof, "", line, column);
        Ok(self.tokens)
    }

    /// Text mode: collect literal text up to the next opener, then hand off
    /// to the directive lexer.
    fn lex_text(&mut self) -> Result<()> {
        let start_line = self.line;
        let start_column = self.column;
        let mut text = String::new();

        while self.pos < self.chars.len() {
            if self.starts_with("{{") || self.starts_with("{%") || self.starts_with("{#") {
                break;
            }
            text.push(self.bump().unwrap());
        }

        // Opener with a `-` suffix trims the preceding side of this token.
        let trim_end = self.pos < self.chars.len() && self.peek(2) == Some('-');
        self.emit_text(text, trim_end, start_line, start_column);

        if self.pos >= self.chars.len() {
            return Ok(());
        }

        if self.starts_with("{#") {
            self.lex_comment()
        } else {
            self.lex_directive()
        }
    }

    fn emit_text(&mut self, mut text: String, trim_end: bool, line: usize, column: usize) {
        if self.trim_next_text {
            let trimmed = text.trim_start();
            text = trimmed.to_string();
            self.trim_next_text = false;
        }
        if trim_end {
            text.truncate(text.trim_end().len());
        }
        if !text.is_empty() {
            self.push(TokenKind::Text, text, line, column);
        }
    }

    fn lex_comment(&mut self) -> Result<()> {
        let (line, column) = (self.line, self.column);
        self.bump_n(2);
        if self.peek(0) == Some('-') {
            self.bump();
        }
        loop {
            if self.pos >= self.chars.len() {
                return Err(self.error("unterminated comment", line, column));
            }
            if self.starts_with("-#}") {
                self.bump_n(3);
                self.trim_next_text = true;
                return Ok(());
            }
            if self.starts_with("#}") {
                self.bump_n(2);
                return Ok(());
            }
            self.bump();
        }
    }

    /// Expression mode: from `{{`/`{%` to the matching closer.
    fn lex_directive(&mut self) -> Result<()> {
        let (open_line, open_column) = (self.line, self.column);
        let is_var = self.peek(1) == Some('{');
        let (open_kind, open_lexeme) = if is_var {
            (TokenKind::VarOpen, "{{")
        } else {
            (TokenKind::BlockOpen, "{%")
        };
        self.bump_n(2);
        if self.peek(0) == Some('-') {
            self.bump();
        }
        self.push(open_kind, open_lexeme, open_line, open_column);

        let closer = if is_var { "}}" } else { "%}" };
        let close_kind = if is_var {
            TokenKind::VarClose
        } else {
            TokenKind::BlockClose
        };
        // Brace/bracket/paren depth: a closer only counts at depth zero, so
        // hash literals like `{'a': 1}` lex cleanly inside `{{ ... }}`.
        let mut depth: usize = 0;

        loop {
            while matches!(self.peek(0), Some(c) if c.is_whitespace()) {
                self.bump();
            }
            let (line, column) = (self.line, self.column);
            let Some(c) = self.peek(0) else {
                return Err(self.error(
                    format!("unterminated directive, expected \"{}\"", closer),
                    open_line,
                    open_column,
                ));
            };

            if depth == 0 {
                if self.starts_with(closer) {
                    self.bump_n(2);
                    self.push(close_kind, closer, line, column);
                    return Ok(());
                }
                if c == '-' && {
                    let mut probe = String::from("-");
                    probe.push_str(closer);
                    self.starts_with(&probe)
                } {
                    self.bump_n(3);
                    self.push(close_kind, closer, line, column);
                    self.trim_next_text = true;
                    return Ok(());
                }
            }

            if c == '\'' || c == '"' {
                self.lex_string(c)?;
                continue;
            }
            if c.is_ascii_digit() {
                self.lex_number();
                continue;
            }
            if c == '_' || c.is_ascii_alphabetic() {
                self.lex_ident();
                continue;
            }
            if let Some(op) = OPERATORS.iter().find(|op| self.starts_with(op)) {
                self.bump_n(op.chars().count());
                self.push(TokenKind::Operator, *op, line, column);
                continue;
            }
            if PUNCT.contains(c) {
                match c {
                    '(' | '[' | '{' => depth += 1,
                    ')' | ']' | '}' => depth = depth.saturating_sub(1),
                    _ => {}
                }
                self.bump();
                self.push(TokenKind::Punct, c, line, column);
                continue;
            }
            if SINGLE_OPERATORS.contains(c) {
                self.bump();
                self.push(TokenKind::Operator, c, line, column);
                continue;
            }
            return Err(self.error(
                format!("unexpected character \"{}\" in expression", c),
                line,
                column,
            ));
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<()> {
        let (line, column) = (self.line, self.column);
        self.bump();
        let mut value = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated string", line, column));
            };
            if c == quote {
                break;
            }
            if c == '\\' {
                let Some(escaped) = self.bump() else {
                    return Err(self.error("unterminated string", line, column));
                };
                match escaped {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    other => value.push(other),
                }
            } else {
                value.push(c);
            }
        }
        self.push(TokenKind::Str, value, line, column);
        Ok(())
    }

    fn lex_number(&mut self) {
        let (line, column) = (self.line, self.column);
        let mut lexeme = String::new();
        while matches!(self.peek(0), Some(c) if c.is_ascii_digit()) {
            lexeme.push(self.bump().unwrap());
        }
        // A fraction needs a digit after the dot; `1..5` keeps the range
        // operator intact.
        if self.peek(0) == Some('.') && matches!(self.peek(1), Some(c) if c.is_ascii_digit()) {
            lexeme.push(self.bump().unwrap());
            while matches!(self.peek(0), Some(c) if c.is_ascii_digit()) {
                lexeme.push(self.bump().unwrap());
            }
        }
        self.push(TokenKind::Number, lexeme, line, column);
    }

    fn lex_ident(&mut self) {
        let (line, column) = (self.line, self.column);
        let mut lexeme = String::new();
        while matches!(self.peek(0), Some(c) if c == '_' || c.is_ascii_alphanumeric()) {
            lexeme.push(self.bump().unwrap());
        }
        let kind = if KEYWORDS.contains(lexeme.as_str()) {
            TokenKind::Keyword
        } else {
            TokenKind::Ident
        };
        self.push(kind, lexeme, line, column);
    }
}
