// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Built-in filters.
//!
//! Each filter is a function from the piped value plus its declared
//! arguments to a new value. Registration is name-exact and case-sensitive;
//! extensions registered on the engine override these defaults for the same
//! name.
//!
//! Safety notes: string transformations drop the already-escaped flag, so a
//! safe string that goes through `upper` comes out as a plain string again.
//! Only `raw`, `escape`/`e` and `nl2br` produce safe strings.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Result, WickerError};
use crate::escape::{escape_html, escape_url, EscapeStrategy};
use crate::value::{parse_number, value_to_json, Value, ValueMap};

/// A registered filter.
pub type FilterRef = Arc<dyn Fn(&Value, &[Value]) -> Result<Value> + Send + Sync>;

lazy_static! {
    static ref TAG_RE: Regex = Regex::new(r"(?s)<[^>]*>").unwrap();
}

/// Builds the default filter registry.
pub fn defaults() -> HashMap<String, FilterRef> {
    let mut registry: HashMap<String, FilterRef> = HashMap::new();

    fn insert(
        registry: &mut HashMap<String, FilterRef>,
        name: &str,
        f: impl Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    ) {
        registry.insert(name.to_string(), Arc::new(f));
    }

    insert(&mut registry, "abs", filter_abs);
    insert(&mut registry, "batch", filter_batch);
    insert(&mut registry, "capitalize", filter_capitalize);
    insert(&mut registry, "column", filter_column);
    insert(&mut registry, "escape", filter_escape);
    insert(&mut registry, "e", filter_escape);
    insert(&mut registry, "first", filter_first);
    insert(&mut registry, "format", filter_format);
    insert(&mut registry, "join", filter_join);
    insert(&mut registry, "json_encode", filter_json_encode);
    insert(&mut registry, "keys", filter_keys);
    insert(&mut registry, "last", filter_last);
    insert(&mut registry, "length", filter_length);
    insert(&mut registry, "lower", filter_lower);
    insert(&mut registry, "merge", filter_merge);
    insert(&mut registry, "nl2br", filter_nl2br);
    insert(&mut registry, "number_format", filter_number_format);
    insert(&mut registry, "raw", filter_raw);
    insert(&mut registry, "replace", filter_replace);
    insert(&mut registry, "reverse", filter_reverse);
    insert(&mut registry, "round", filter_round);
    insert(&mut registry, "slice", filter_slice);
    insert(&mut registry, "sort", filter_sort);
    insert(&mut registry, "split", filter_split);
    insert(&mut registry, "striptags", filter_striptags);
    insert(&mut registry, "title", filter_title);
    insert(&mut registry, "trim", filter_trim);
    insert(&mut registry, "upper", filter_upper);
    insert(&mut registry, "url_encode", filter_url_encode);

    registry
}

fn text_of(value: &Value) -> Result<String> {
    value.to_output_string()
}

fn str_arg(args: &[Value], index: usize, default: &str) -> Result<String> {
    match args.get(index) {
        Some(v) => v.to_output_string(),
        None => Ok(default.to_string()),
    }
}

fn int_arg(args: &[Value], index: usize, default: i64) -> Result<i64> {
    match args.get(index) {
        Some(v) => v.as_int().ok_or_else(|| {
            WickerError::TypeError(format!("expected an integer argument, got {}", v.kind()))
        }),
        None => Ok(default),
    }
}

fn number_of(value: &Value) -> Result<f64> {
    if let Some(f) = value.as_float() {
        return Ok(f);
    }
    if let Some(s) = value.as_str() {
        if let Some(n) = parse_number(s) {
            return Ok(n.as_float().unwrap());
        }
    }
    Err(WickerError::TypeError(format!(
        "expected a number, got {}",
        value.kind()
    )))
}

fn filter_abs(value: &Value, _args: &[Value]) -> Result<Value> {
    match value {
        Value::Int(n) => Ok(match n.checked_abs() {
            Some(m) => Value::Int(m),
            None => Value::Float((*n as f64).abs()),
        }),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(WickerError::TypeError(format!(
            "\"abs\" expects a number, got {}",
            other.kind()
        ))),
    }
}

fn filter_batch(value: &Value, args: &[Value]) -> Result<Value> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(WickerError::TypeError(format!(
                "\"batch\" expects an array, got {}",
                other.kind()
            )))
        }
    };
    let size = int_arg(args, 0, 1)?;
    if size < 1 {
        return Err(WickerError::TypeError(
            "\"batch\" needs a positive chunk size".to_string(),
        ));
    }
    let fill = args.get(1);
    let mut batches = Vec::new();
    for chunk in items.chunks(size as usize) {
        let mut batch: Vec<Value> = chunk.to_vec();
        if let Some(fill) = fill {
            while batch.len() < size as usize {
                batch.push(fill.clone());
            }
        }
        batches.push(Value::array(batch));
    }
    Ok(Value::array(batches))
}

fn filter_capitalize(value: &Value, _args: &[Value]) -> Result<Value> {
    let text = text_of(value)?;
    let mut chars = text.chars();
    let capped = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    };
    Ok(Value::string(capped))
}

fn filter_column(value: &Value, args: &[Value]) -> Result<Value> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(WickerError::TypeError(format!(
                "\"column\" expects an array, got {}",
                other.kind()
            )))
        }
    };
    let key = args.first().ok_or_else(|| {
        WickerError::TypeError("\"column\" needs a key argument".to_string())
    })?;
    let mut out = Vec::with_capacity(items.len());
    for item in items.iter() {
        out.push(item.get_item(key)?);
    }
    Ok(Value::array(out))
}

fn filter_escape(value: &Value, args: &[Value]) -> Result<Value> {
    if value.is_safe() {
        return Ok(value.clone());
    }
    let strategy = EscapeStrategy::from_name(&str_arg(args, 0, "html")?)?;
    Ok(Value::safe(strategy.apply(&text_of(value)?)))
}

fn filter_first(value: &Value, _args: &[Value]) -> Result<Value> {
    match value {
        Value::Str(s) | Value::Safe(s) => Ok(s
            .chars()
            .next()
            .map(|c| Value::string(c.to_string()))
            .unwrap_or(Value::Null)),
        Value::Array(items) => Ok(items.first().cloned().unwrap_or(Value::Null)),
        Value::Map(entries) => Ok(entries
            .values()
            .next()
            .cloned()
            .unwrap_or(Value::Null)),
        other => Err(WickerError::TypeError(format!(
            "\"first\" expects a string, array or map, got {}",
            other.kind()
        ))),
    }
}

fn filter_last(value: &Value, _args: &[Value]) -> Result<Value> {
    match value {
        Value::Str(s) | Value::Safe(s) => Ok(s
            .chars()
            .next_back()
            .map(|c| Value::string(c.to_string()))
            .unwrap_or(Value::Null)),
        Value::Array(items) => Ok(items.last().cloned().unwrap_or(Value::Null)),
        Value::Map(entries) => Ok(entries
            .values()
            .next_back()
            .cloned()
            .unwrap_or(Value::Null)),
        other => Err(WickerError::TypeError(format!(
            "\"last\" expects a string, array or map, got {}",
            other.kind()
        ))),
    }
}

/// `printf`-style formatting supporting `%s`, `%d`, `%x`, `%f` with an
/// optional precision, and `%%`.
fn filter_format(value: &Value, args: &[Value]) -> Result<Value> {
    let fmt = text_of(value)?;
    let mut out = String::with_capacity(fmt.len());
    let mut arg_iter = args.iter();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut precision: Option<usize> = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut digits = String::new();
            while matches!(chars.peek(), Some(d) if d.is_ascii_digit()) {
                digits.push(chars.next().unwrap());
            }
            precision = digits.parse().ok();
        }
        let Some(spec) = chars.next() else {
            return Err(WickerError::TypeError(
                "\"format\" has a dangling % directive".to_string(),
            ));
        };
        if spec == '%' {
            out.push('%');
            continue;
        }
        let arg = arg_iter.next().ok_or_else(|| {
            WickerError::TypeError("\"format\" has more directives than arguments".to_string())
        })?;
        match spec {
            's' => out.push_str(&arg.to_output_string()?),
            'd' => {
                let n = number_of(arg)?;
                out.push_str(&(n.trunc() as i64).to_string());
            }
            'x' => {
                let n = number_of(arg)?;
                out.push_str(&format!("{:x}", n.trunc() as i64));
            }
            'f' => {
                let n = number_of(arg)?;
                match precision {
                    Some(p) => out.push_str(&format!("{:.*}", p, n)),
                    None => out.push_str(&format!("{:.6}", n)),
                }
            }
            other => {
                return Err(WickerError::TypeError(format!(
                    "\"format\" does not support %{}",
                    other
                )))
            }
        }
    }
    Ok(Value::string(out))
}

fn filter_join(value: &Value, args: &[Value]) -> Result<Value> {
    let items = match value {
        Value::Array(items) => items.as_ref().clone(),
        Value::Map(entries) => entries.values().cloned().collect(),
        Value::Null => Vec::new(),
        other => {
            return Err(WickerError::TypeError(format!(
                "\"join\" expects an array or map, got {}",
                other.kind()
            )))
        }
    };
    let glue = str_arg(args, 0, "")?;
    let last_glue = match args.get(1) {
        Some(v) => Some(v.to_output_string()?),
        None => None,
    };
    let rendered: Vec<String> = items
        .iter()
        .map(|v| v.to_output_string())
        .collect::<Result<_>>()?;
    let joined = match (last_glue, rendered.len()) {
        (Some(and), n) if n > 1 => {
            format!("{}{}{}", rendered[..n - 1].join(&glue), and, rendered[n - 1])
        }
        _ => rendered.join(&glue),
    };
    Ok(Value::string(joined))
}

fn filter_json_encode(value: &Value, _args: &[Value]) -> Result<Value> {
    let json = value_to_json(value)?;
    let encoded = serde_json::to_string(&json)
        .map_err(|e| WickerError::TypeError(format!("JSON encoding failed: {}", e)))?;
    Ok(Value::string(encoded))
}

fn filter_keys(value: &Value, _args: &[Value]) -> Result<Value> {
    match value {
        Value::Array(items) => Ok(Value::array(
            (0..items.len() as i64).map(Value::Int).collect(),
        )),
        Value::Map(entries) => Ok(Value::array(
            entries.keys().map(|k| Value::string(k.clone())).collect(),
        )),
        other => Err(WickerError::TypeError(format!(
            "\"keys\" expects an array or map, got {}",
            other.kind()
        ))),
    }
}

fn filter_length(value: &Value, _args: &[Value]) -> Result<Value> {
    match value.length() {
        Some(n) => Ok(Value::Int(n as i64)),
        None => Ok(Value::Int(
            value.to_output_string()?.chars().count() as i64
        )),
    }
}

fn filter_lower(value: &Value, _args: &[Value]) -> Result<Value> {
    Ok(Value::string(text_of(value)?.to_lowercase()))
}

fn filter_upper(value: &Value, _args: &[Value]) -> Result<Value> {
    Ok(Value::string(text_of(value)?.to_uppercase()))
}

fn filter_merge(value: &Value, args: &[Value]) -> Result<Value> {
    let other = args.first().ok_or_else(|| {
        WickerError::TypeError("\"merge\" needs an argument".to_string())
    })?;
    match (value, other) {
        (Value::Array(a), Value::Array(b)) => {
            let mut merged = a.as_ref().clone();
            merged.extend(b.iter().cloned());
            Ok(Value::array(merged))
        }
        (Value::Map(a), Value::Map(b)) => {
            let mut merged = a.as_ref().clone();
            for (k, v) in b.iter() {
                merged.insert(k.clone(), v.clone());
            }
            Ok(Value::map(merged))
        }
        (a, b) => Err(WickerError::TypeError(format!(
            "\"merge\" expects two arrays or two maps, got {} and {}",
            a.kind(),
            b.kind()
        ))),
    }
}

fn filter_nl2br(value: &Value, _args: &[Value]) -> Result<Value> {
    // Escapes unsafe input first so the inserted markup survives printing.
    let text = if value.is_safe() {
        value.to_output_string()?
    } else {
        escape_html(&value.to_output_string()?)
    };
    Ok(Value::safe(text.replace('\n', "<br />\n")))
}

fn filter_number_format(value: &Value, args: &[Value]) -> Result<Value> {
    let n = number_of(value)?;
    let decimals = int_arg(args, 0, 0)?.max(0) as usize;
    let dec_point = str_arg(args, 1, ".")?;
    let thousands_sep = str_arg(args, 2, ",")?;

    let formatted = format!("{:.*}", decimals, n.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (formatted, None),
    };

    let mut grouped = String::new();
    let digits: Vec<char> = int_part.chars().collect();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push_str(&thousands_sep);
        }
        grouped.push(*c);
    }

    let mut out = String::new();
    if n < 0.0 {
        out.push('-');
    }
    out.push_str(&grouped);
    if let Some(frac) = frac_part {
        out.push_str(&dec_point);
        out.push_str(&frac);
    }
    Ok(Value::string(out))
}

fn filter_raw(value: &Value, _args: &[Value]) -> Result<Value> {
    if value.is_safe() {
        Ok(value.clone())
    } else {
        Ok(Value::safe(value.to_output_string()?))
    }
}

fn filter_replace(value: &Value, args: &[Value]) -> Result<Value> {
    let pairs = match args.first() {
        Some(Value::Map(entries)) => entries,
        Some(other) => {
            return Err(WickerError::TypeError(format!(
                "\"replace\" expects a map of replacements, got {}",
                other.kind()
            )))
        }
        None => {
            return Err(WickerError::TypeError(
                "\"replace\" needs a map of replacements".to_string(),
            ))
        }
    };
    let mut text = text_of(value)?;
    for (from, to) in pairs.iter() {
        text = text.replace(from.as_str(), &to.to_output_string()?);
    }
    Ok(Value::string(text))
}

fn filter_reverse(value: &Value, _args: &[Value]) -> Result<Value> {
    match value {
        Value::Str(s) | Value::Safe(s) => {
            Ok(Value::string(s.chars().rev().collect::<String>()))
        }
        Value::Array(items) => {
            Ok(Value::array(items.iter().rev().cloned().collect()))
        }
        Value::Map(entries) => {
            let reversed: ValueMap = entries
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(Value::map(reversed))
        }
        other => Err(WickerError::TypeError(format!(
            "\"reverse\" expects a string, array or map, got {}",
            other.kind()
        ))),
    }
}

fn filter_round(value: &Value, args: &[Value]) -> Result<Value> {
    let n = number_of(value)?;
    let precision = int_arg(args, 0, 0)?;
    let method = str_arg(args, 1, "common")?;
    let factor = 10f64.powi(precision as i32);
    let scaled = n * factor;
    let rounded = match method.as_str() {
        "common" => scaled.round(),
        "ceil" => scaled.ceil(),
        "floor" => scaled.floor(),
        other => {
            return Err(WickerError::TypeError(format!(
                "\"round\" does not know method \"{}\"",
                other
            )))
        }
    } / factor;
    if precision <= 0 && rounded.abs() <= i64::MAX as f64 {
        Ok(Value::Int(rounded as i64))
    } else {
        Ok(Value::Float(rounded))
    }
}

fn resolve_slice(len: i64, start: i64, length: Option<i64>) -> (usize, usize) {
    let begin = if start < 0 {
        (len + start).max(0)
    } else {
        start.min(len)
    };
    let end = match length {
        None => len,
        Some(l) if l < 0 => (len + l).max(begin),
        Some(l) => (begin + l).min(len),
    };
    (begin as usize, end.max(begin) as usize)
}

fn filter_slice(value: &Value, args: &[Value]) -> Result<Value> {
    let start = int_arg(args, 0, 0)?;
    let length = match args.get(1) {
        Some(Value::Null) | None => None,
        Some(v) => Some(v.as_int().ok_or_else(|| {
            WickerError::TypeError(format!(
                "\"slice\" length must be an integer, got {}",
                v.kind()
            ))
        })?),
    };
    match value {
        Value::Str(s) | Value::Safe(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (begin, end) = resolve_slice(chars.len() as i64, start, length);
            Ok(Value::string(chars[begin..end].iter().collect::<String>()))
        }
        Value::Array(items) => {
            let (begin, end) = resolve_slice(items.len() as i64, start, length);
            Ok(Value::array(items[begin..end].to_vec()))
        }
        other => Err(WickerError::TypeError(format!(
            "\"slice\" expects a string or array, got {}",
            other.kind()
        ))),
    }
}

fn filter_sort(value: &Value, _args: &[Value]) -> Result<Value> {
    match value {
        Value::Array(items) => {
            let mut sorted = items.as_ref().clone();
            let mut failure = None;
            sorted.sort_by(|a, b| match a.compare(b) {
                Ok(ord) => ord,
                Err(e) => {
                    failure.get_or_insert(e);
                    std::cmp::Ordering::Equal
                }
            });
            match failure {
                Some(e) => Err(e),
                None => Ok(Value::array(sorted)),
            }
        }
        Value::Map(entries) => {
            let mut pairs: Vec<(String, Value)> = entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let mut failure = None;
            pairs.sort_by(|a, b| match a.1.compare(&b.1) {
                Ok(ord) => ord,
                Err(e) => {
                    failure.get_or_insert(e);
                    std::cmp::Ordering::Equal
                }
            });
            match failure {
                Some(e) => Err(e),
                None => Ok(Value::map(pairs.into_iter().collect())),
            }
        }
        other => Err(WickerError::TypeError(format!(
            "\"sort\" expects an array or map, got {}",
            other.kind()
        ))),
    }
}

fn filter_split(value: &Value, args: &[Value]) -> Result<Value> {
    let text = text_of(value)?;
    let delim = str_arg(args, 0, "")?;
    let limit = match args.get(1) {
        Some(v) => Some(v.as_int().ok_or_else(|| {
            WickerError::TypeError("\"split\" limit must be an integer".to_string())
        })?),
        None => None,
    };
    let parts: Vec<Value> = if delim.is_empty() {
        // No delimiter: chunks of `limit` characters (single characters by
        // default).
        let size = limit.unwrap_or(1).max(1) as usize;
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(size)
            .map(|chunk| Value::string(chunk.iter().collect::<String>()))
            .collect()
    } else {
        match limit {
            Some(n) if n > 0 => text
                .splitn(n as usize, delim.as_str())
                .map(Value::string)
                .collect(),
            _ => text.split(delim.as_str()).map(Value::string).collect(),
        }
    };
    Ok(Value::array(parts))
}

fn filter_striptags(value: &Value, _args: &[Value]) -> Result<Value> {
    let text = text_of(value)?;
    Ok(Value::string(TAG_RE.replace_all(&text, "").into_owned()))
}

fn filter_title(value: &Value, _args: &[Value]) -> Result<Value> {
    let text = text_of(value)?;
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for c in text.chars() {
        if c.is_whitespace() {
            at_word_start = true;
            out.push(c);
        } else if at_word_start {
            out.extend(c.to_uppercase());
            at_word_start = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    Ok(Value::string(out))
}

fn filter_trim(value: &Value, args: &[Value]) -> Result<Value> {
    let text = text_of(value)?;
    let side = str_arg(args, 1, "both")?;
    let trimmed = match args.first() {
        Some(chars_value) => {
            let set: Vec<char> = chars_value.to_output_string()?.chars().collect();
            let matcher = |c: char| set.contains(&c);
            match side.as_str() {
                "left" => text.trim_start_matches(matcher).to_string(),
                "right" => text.trim_end_matches(matcher).to_string(),
                "both" => text
                    .trim_start_matches(matcher)
                    .trim_end_matches(matcher)
                    .to_string(),
                other => {
                    return Err(WickerError::TypeError(format!(
                        "\"trim\" side must be left, right or both, got \"{}\"",
                        other
                    )))
                }
            }
        }
        None => match side.as_str() {
            "left" => text.trim_start().to_string(),
            "right" => text.trim_end().to_string(),
            "both" => text.trim().to_string(),
            other => {
                return Err(WickerError::TypeError(format!(
                    "\"trim\" side must be left, right or both, got \"{}\"",
                    other
                )))
            }
        },
    };
    Ok(Value::string(trimmed))
}

fn filter_url_encode(value: &Value, _args: &[Value]) -> Result<Value> {
    match value {
        Value::Map(entries) => {
            let mut pairs = Vec::with_capacity(entries.len());
            for (k, v) in entries.iter() {
                pairs.push(format!(
                    "{}={}",
                    escape_url(k),
                    escape_url(&v.to_output_string()?)
                ));
            }
            Ok(Value::string(pairs.join("&")))
        }
        other => Ok(Value::string(escape_url(&other.to_output_string()?))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, value: Value, args: &[Value]) -> Result<Value> {
        let registry = defaults();
        registry.get(name).expect("filter registered")(&value, args)
    }

    #[test]
    fn test_case_filters() {
        assert_eq!(
            call("upper", Value::string("héllo"), &[]).unwrap(),
            Value::string("HÉLLO")
        );
        assert_eq!(
            call("capitalize", Value::string("wORLD"), &[]).unwrap(),
            Value::string("World")
        );
        assert_eq!(
            call("title", Value::string("war and peace"), &[]).unwrap(),
            Value::string("War And Peace")
        );
    }

    #[test]
    fn test_escape_and_raw_safety() {
        let escaped = call("escape", Value::string("<b>"), &[]).unwrap();
        assert!(escaped.is_safe());
        assert_eq!(escaped.as_str(), Some("&lt;b&gt;"));

        // Escaping an already safe string is a no-op.
        let twice = call("escape", escaped.clone(), &[]).unwrap();
        assert_eq!(twice, escaped);

        let raw = call("raw", Value::string("<b>"), &[]).unwrap();
        assert!(raw.is_safe());
        assert_eq!(raw.as_str(), Some("<b>"));
    }

    #[test]
    fn test_upper_drops_safety() {
        let safe = Value::safe("<b>");
        let upper = call("upper", safe, &[]).unwrap();
        assert!(!upper.is_safe());
    }

    #[test]
    fn test_join() {
        let items = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(
            call("join", items.clone(), &[Value::string(", ")]).unwrap(),
            Value::string("1, 2, 3")
        );
        assert_eq!(
            call(
                "join",
                items,
                &[Value::string(", "), Value::string(" and ")]
            )
            .unwrap(),
            Value::string("1, 2 and 3")
        );
    }

    #[test]
    fn test_slice() {
        let s = Value::string("abcdef");
        assert_eq!(
            call("slice", s.clone(), &[Value::Int(1), Value::Int(2)]).unwrap(),
            Value::string("bc")
        );
        assert_eq!(
            call("slice", s.clone(), &[Value::Int(-2)]).unwrap(),
            Value::string("ef")
        );
        assert_eq!(
            call("slice", s, &[Value::Int(0), Value::Int(-2)]).unwrap(),
            Value::string("abcd")
        );
    }

    #[test]
    fn test_batch_with_fill() {
        let items = Value::array((1..=5).map(Value::Int).collect());
        let batched = call(
            "batch",
            items,
            &[Value::Int(2), Value::string("-")],
        )
        .unwrap();
        match batched {
            Value::Array(rows) => {
                assert_eq!(rows.len(), 3);
                assert_eq!(
                    rows[2],
                    Value::array(vec![Value::Int(5), Value::string("-")])
                );
            }
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn test_number_format() {
        assert_eq!(
            call("number_format", Value::Float(1234567.891), &[Value::Int(2)]).unwrap(),
            Value::string("1,234,567.89")
        );
        assert_eq!(
            call(
                "number_format",
                Value::Int(-1234),
                &[Value::Int(0), Value::string(","), Value::string(".")]
            )
            .unwrap(),
            Value::string("-1.234")
        );
    }

    #[test]
    fn test_round_methods() {
        assert_eq!(
            call("round", Value::Float(2.5), &[]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            call("round", Value::Float(2.34), &[Value::Int(1)]).unwrap(),
            Value::Float(2.3)
        );
        assert_eq!(
            call(
                "round",
                Value::Float(2.1),
                &[Value::Int(0), Value::string("ceil")]
            )
            .unwrap(),
            Value::Int(3)
        );
    }

    #[test]
    fn test_merge() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(2)]);
        assert_eq!(
            call("merge", a, &[b]).unwrap(),
            Value::array(vec![Value::Int(1), Value::Int(2)])
        );

        let mut m1 = ValueMap::new();
        m1.insert("a".into(), Value::Int(1));
        m1.insert("b".into(), Value::Int(2));
        let mut m2 = ValueMap::new();
        m2.insert("b".into(), Value::Int(9));
        let merged = call("merge", Value::map(m1), &[Value::map(m2)]).unwrap();
        assert_eq!(merged.get_item(&Value::string("b")).unwrap(), Value::Int(9));
    }

    #[test]
    fn test_split_forms() {
        assert_eq!(
            call("split", Value::string("a,b,c"), &[Value::string(",")]).unwrap(),
            Value::array(vec![
                Value::string("a"),
                Value::string("b"),
                Value::string("c")
            ])
        );
        assert_eq!(
            call("split", Value::string("abc"), &[Value::string("")]).unwrap(),
            Value::array(vec![
                Value::string("a"),
                Value::string("b"),
                Value::string("c")
            ])
        );
    }

    #[test]
    fn test_striptags() {
        assert_eq!(
            call("striptags", Value::string("<p>Hi <b>you</b></p>"), &[]).unwrap(),
            Value::string("Hi you")
        );
    }

    #[test]
    fn test_nl2br_escapes_unsafe_input() {
        let out = call("nl2br", Value::string("<a>\nb"), &[]).unwrap();
        assert!(out.is_safe());
        assert_eq!(out.as_str(), Some("&lt;a&gt;<br />\nb"));
    }

    #[test]
    fn test_format() {
        assert_eq!(
            call(
                "format",
                Value::string("%s has %d items (%.1f%%)"),
                &[Value::string("cart"), Value::Int(3), Value::Float(12.34)]
            )
            .unwrap(),
            Value::string("cart has 3 items (12.3%)")
        );
    }

    #[test]
    fn test_sort_rejects_mixed() {
        let mixed = Value::array(vec![Value::Int(1), Value::Bool(true)]);
        assert!(call("sort", mixed, &[]).is_err());
        let items = Value::array(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        assert_eq!(
            call("sort", items, &[]).unwrap(),
            Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_url_encode_map() {
        let mut m = ValueMap::new();
        m.insert("q".into(), Value::string("a b"));
        m.insert("page".into(), Value::Int(2));
        assert_eq!(
            call("url_encode", Value::map(m), &[]).unwrap(),
            Value::string("q=a%20b&page=2")
        );
    }

    #[test]
    fn test_keys_and_column() {
        let mut row = ValueMap::new();
        row.insert("id".into(), Value::Int(7));
        let rows = Value::array(vec![Value::map(row)]);
        assert_eq!(
            call("column", rows, &[Value::string("id")]).unwrap(),
            Value::array(vec![Value::Int(7)])
        );
    }
}
