// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Output escaping strategies.
//!
//! Autoescaping applies one of these strategies to every printed value that
//! does not carry the already-escaped flag. The default strategy is
//! [`EscapeStrategy::Html`]; `{% autoescape %}` blocks and the `escape`
//! filter select others.

use std::fmt::Write;

use crate::error::{Result, WickerError};

/// An output escaping strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeStrategy {
    /// Escaping disabled.
    Off,
    /// HTML body text: `& < > " '` become entities.
    Html,
    /// HTML attribute values: stricter than `Html`, every non-alphanumeric
    /// ASCII character is entity-encoded.
    HtmlAttr,
    /// JavaScript string contents: `\uXXXX` for everything outside the
    /// alphanumeric ASCII range.
    Js,
    /// URL components: RFC 3986 percent-encoding of everything outside the
    /// unreserved set.
    Url,
    /// CSS identifiers: `\HEX ` form for everything outside the
    /// alphanumeric ASCII range.
    Css,
}

impl EscapeStrategy {
    /// Parses a strategy name as used by `{% autoescape %}` and `escape`.
    pub fn from_name(name: &str) -> Result<EscapeStrategy> {
        match name {
            "html" => Ok(EscapeStrategy::Html),
            "html_attr" => Ok(EscapeStrategy::HtmlAttr),
            "js" => Ok(EscapeStrategy::Js),
            "url" => Ok(EscapeStrategy::Url),
            "css" => Ok(EscapeStrategy::Css),
            "off" | "false" => Ok(EscapeStrategy::Off),
            other => Err(WickerError::TypeError(format!(
                "unknown escape strategy \"{}\"",
                other
            ))),
        }
    }

    /// Escapes `input` per this strategy.
    pub fn apply(&self, input: &str) -> String {
        match self {
            EscapeStrategy::Off => input.to_string(),
            EscapeStrategy::Html => escape_html(input),
            EscapeStrategy::HtmlAttr => escape_html_attr(input),
            EscapeStrategy::Js => escape_js(input),
            EscapeStrategy::Url => escape_url(input),
            EscapeStrategy::Css => escape_css(input),
        }
    }
}

/// Escapes `& < > " '` for HTML body text.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn escape_html_attr(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                other => {
                    let _ = write!(out, "&#x{:X};", other as u32);
                }
            }
        }
    }
    out
}

fn escape_js(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            let code = c as u32;
            if code <= 0xFFFF {
                let _ = write!(out, "\\u{:04X}", code);
            } else {
                // Astral plane: surrogate pair.
                let adjusted = code - 0x10000;
                let high = 0xD800 + (adjusted >> 10);
                let low = 0xDC00 + (adjusted & 0x3FF);
                let _ = write!(out, "\\u{:04X}\\u{:04X}", high, low);
            }
        }
    }
    out
}

/// RFC 3986 unreserved characters pass through; everything else is
/// percent-encoded byte by byte.
pub fn escape_url(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => {
                let _ = write!(out, "%{:02X}", other);
            }
        }
    }
    out
}

fn escape_css(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            let _ = write!(out, "\\{:X} ", c as u32);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_escape() {
        assert_eq!(
            escape_html("<b>\"x\" & 'y'</b>"),
            "&lt;b&gt;&quot;x&quot; &amp; &#39;y&#39;&lt;/b&gt;"
        );
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn test_js_escape() {
        assert_eq!(EscapeStrategy::Js.apply("ab"), "ab");
        assert_eq!(EscapeStrategy::Js.apply("a<b"), "a\\u003Cb");
        assert_eq!(EscapeStrategy::Js.apply("\n"), "\\u000A");
    }

    #[test]
    fn test_url_escape() {
        assert_eq!(escape_url("a b/c~d"), "a%20b%2Fc~d");
        assert_eq!(escape_url("AZaz09-._~"), "AZaz09-._~");
        // Multi-byte characters are encoded per UTF-8 byte.
        assert_eq!(escape_url("é"), "%C3%A9");
    }

    #[test]
    fn test_css_escape() {
        assert_eq!(EscapeStrategy::Css.apply("a#b"), "a\\23 b");
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(
            EscapeStrategy::from_name("html").unwrap(),
            EscapeStrategy::Html
        );
        assert_eq!(
            EscapeStrategy::from_name("off").unwrap(),
            EscapeStrategy::Off
        );
        assert!(EscapeStrategy::from_name("latin9").is_err());
    }
}
