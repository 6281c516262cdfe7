// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Dynamic value model and coercion rules.
//!
//! This module defines [`Value`], the tagged sum over everything a template
//! expression can evaluate to, together with the coercion rules shared by
//! the whole engine: truthiness, equality, ordering, numeric promotion and
//! string rendering.
//!
//! # Representation
//!
//! Small values (`Null`, `Bool`, `Int`, `Float`) are stored inline; strings,
//! arrays and maps are reference counted so cloning a value never deep-copies
//! template data. Maps preserve insertion order. [`Value::Safe`] is a string
//! carrying an "already escaped" flag that the autoescape machinery honours.
//!
//! # Host data
//!
//! Host applications hand data to the engine as [`serde_json::Value`] (or
//! anything [`serde::Serialize`] via [`to_value`]); richer records implement
//! the [`Object`] trait to expose named fields and invocable methods.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{Result, WickerError};
use crate::template::Template;

/// Insertion-ordered map type used for hash values.
pub type ValueMap = IndexMap<String, Value>;

/// An opaque host record whose fields are discoverable by name and whose
/// methods are invocable by name.
///
/// Implement this trait to expose application types to templates without
/// converting them to maps up front. Attribute lookup consults
/// [`get_field`](Object::get_field) first; a call expression on an attribute
/// falls through to [`call_method`](Object::call_method).
pub trait Object: fmt::Debug + Send + Sync {
    /// Looks up a named field. `None` means the field does not exist.
    fn get_field(&self, name: &str) -> Option<Value>;

    /// True when the object exposes the named method.
    ///
    /// Attribute lookup falls back to invoking a zero-argument method of the
    /// same name when this returns true.
    fn has_method(&self, _name: &str) -> bool {
        false
    }

    /// Invokes a named method with the given arguments.
    ///
    /// The default implementation knows no methods.
    fn call_method(&self, name: &str, _args: &[Value]) -> Result<Value> {
        Err(WickerError::TypeError(format!(
            "object has no method \"{}\"",
            name
        )))
    }
}

/// A macro bound to the template that declares it.
///
/// Calling a macro constructs a fresh evaluation scope containing only its
/// parameters, so the reference carries the owning template rather than any
/// captured environment.
#[derive(Clone)]
pub struct MacroRef {
    /// The template whose macro table declares the macro.
    pub template: Arc<Template>,
    /// The macro name inside that table.
    pub name: String,
}

/// A callable value: a macro reference or a registered host function.
#[derive(Clone)]
pub enum Callable {
    /// A macro declared by some template.
    Macro(MacroRef),
    /// A host function registered with the engine.
    Function(Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>),
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Macro(m) => write!(f, "macro {}() from {}", m.name, m.template.name),
            Callable::Function(_) => write!(f, "function"),
        }
    }
}

/// A dynamically typed template value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// The absent value. Renders as the empty string.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit IEEE float.
    Float(f64),
    /// An immutable UTF-8 string.
    Str(Arc<str>),
    /// A string carrying the "already escaped" flag.
    Safe(Arc<str>),
    /// An ordered sequence of values.
    Array(Arc<Vec<Value>>),
    /// An insertion-ordered mapping from string keys to values.
    Map(Arc<ValueMap>),
    /// An opaque host record.
    Object(Arc<dyn Object>),
    /// A macro closure or registered function.
    Callable(Callable),
}

impl Value {
    /// Creates a plain string value.
    pub fn string(s: impl Into<String>) -> Value {
        Value::Str(Arc::from(s.into().as_str()))
    }

    /// Creates a safe (already escaped) string value.
    pub fn safe(s: impl Into<String>) -> Value {
        Value::Safe(Arc::from(s.into().as_str()))
    }

    /// Creates an array value.
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(items))
    }

    /// Creates a map value.
    pub fn map(entries: ValueMap) -> Value {
        Value::Map(Arc::new(entries))
    }

    /// Creates an opaque object value.
    pub fn object(obj: impl Object + 'static) -> Value {
        Value::Object(Arc::new(obj))
    }

    /// The value's type name, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) | Value::Safe(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Callable(_) => "callable",
        }
    }

    /// Truthiness: `null`, `false`, `0`, `0.0` and empty strings, arrays and
    /// maps are false; everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) | Value::Safe(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            Value::Object(_) | Value::Callable(_) => true,
        }
    }

    /// True for the empty-ish values the `empty` test recognises.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Str(s) | Value::Safe(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Map(entries) => entries.is_empty(),
            _ => !self.is_truthy(),
        }
    }

    /// Returns the string content if this is a (safe or plain) string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Safe(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, coercing floats with integral value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Returns the numeric content as a float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// True if the value is numeric.
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// True if the value carries the already-escaped flag.
    pub fn is_safe(&self) -> bool {
        matches!(self, Value::Safe(_))
    }

    /// Renders the value as output text.
    ///
    /// Null renders empty, booleans as `1`/empty, numbers in canonical
    /// decimal form with trimmed trailing zeros. Aggregates and callables
    /// have no string form and fail.
    pub fn to_output_string(&self) -> Result<String> {
        match self {
            Value::Null => Ok(String::new()),
            Value::Bool(true) => Ok("1".to_string()),
            Value::Bool(false) => Ok(String::new()),
            Value::Int(n) => Ok(n.to_string()),
            Value::Float(f) => Ok(format_float(*f)),
            Value::Str(s) | Value::Safe(s) => Ok(s.to_string()),
            other => Err(WickerError::TypeError(format!(
                "cannot convert {} to string",
                other.kind()
            ))),
        }
    }

    /// Debug representation used by `dump()`.
    pub fn repr(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => format!("\"{}\"", s),
            Value::Safe(s) => format!("safe(\"{}\")", s),
            Value::Array(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.repr()).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Map(entries) => {
                let inner: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("\"{}\": {}", k, v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Object(obj) => format!("{:?}", obj),
            Value::Callable(c) => format!("{:?}", c),
        }
    }

    /// Element count for strings (characters), arrays and maps.
    pub fn length(&self) -> Option<usize> {
        match self {
            Value::Str(s) | Value::Safe(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            Value::Map(entries) => Some(entries.len()),
            _ => None,
        }
    }

    /// Item lookup: integer indexing on arrays (negative counts from the
    /// end, out of bounds yields null) and key lookup on maps.
    pub fn get_item(&self, index: &Value) -> Result<Value> {
        match self {
            Value::Array(items) => {
                let idx = index.as_int().ok_or_else(|| {
                    WickerError::TypeError(format!(
                        "array index must be an integer, got {}",
                        index.kind()
                    ))
                })?;
                let len = items.len() as i64;
                let resolved = if idx < 0 { idx + len } else { idx };
                if resolved < 0 || resolved >= len {
                    return Ok(Value::Null);
                }
                Ok(items[resolved as usize].clone())
            }
            Value::Map(entries) => {
                let key = index.to_output_string()?;
                Ok(entries.get(&key).cloned().unwrap_or(Value::Null))
            }
            other => Err(WickerError::TypeError(format!(
                "cannot index into {}",
                other.kind()
            ))),
        }
    }

    /// Total order where one exists: numeric between numbers, byte order
    /// between strings, and the number/string mixes of the coercion rules.
    /// All other pairings fail.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (a, b) if a.is_number() && b.is_number() => {
                let (x, y) = (a.as_float().unwrap(), b.as_float().unwrap());
                x.partial_cmp(&y).ok_or_else(|| {
                    WickerError::TypeError("cannot order NaN".to_string())
                })
            }
            (Value::Str(a), Value::Str(b))
            | (Value::Str(a), Value::Safe(b))
            | (Value::Safe(a), Value::Str(b))
            | (Value::Safe(a), Value::Safe(b)) => Ok(a.as_bytes().cmp(b.as_bytes())),
            // Number vs string: parse the string numerically when it is a
            // valid number literal, else fall back to string order with the
            // number in canonical form.
            (a, b) if a.is_number() && b.as_str().is_some() => {
                let s = b.as_str().unwrap();
                match parse_number(s) {
                    Some(n) => a.compare(&n),
                    None => Ok(a.to_output_string()?.as_bytes().cmp(s.as_bytes())),
                }
            }
            (a, b) if a.as_str().is_some() && b.is_number() => {
                Ok(b.compare(a)?.reverse())
            }
            (a, b) => Err(WickerError::TypeError(format!(
                "cannot compare {} with {}",
                a.kind(),
                b.kind()
            ))),
        }
    }

    /// Containment: substring on strings, membership by equality on arrays,
    /// key membership on maps.
    pub fn contains(&self, needle: &Value) -> Result<bool> {
        match self {
            Value::Str(s) | Value::Safe(s) => {
                let n = needle.to_output_string()?;
                Ok(s.contains(&n))
            }
            Value::Array(items) => Ok(items.iter().any(|v| v == needle)),
            Value::Map(entries) => {
                let key = needle.to_output_string()?;
                Ok(entries.contains_key(&key))
            }
            other => Err(WickerError::TypeError(format!(
                "\"in\" needs a string, array or map on the right, got {}",
                other.kind()
            ))),
        }
    }

    fn numeric_pair(&self, other: &Value, op: &str) -> Result<(Value, Value)> {
        if self.is_number() && other.is_number() {
            Ok((self.clone(), other.clone()))
        } else {
            Err(WickerError::TypeError(format!(
                "\"{}\" needs numeric operands, got {} and {}",
                op,
                self.kind(),
                other.kind()
            )))
        }
    }

    /// Addition. Int overflow promotes to Float.
    pub fn add(&self, other: &Value) -> Result<Value> {
        match self.numeric_pair(other, "+")? {
            (Value::Int(a), Value::Int(b)) => Ok(match a.checked_add(b) {
                Some(n) => Value::Int(n),
                None => Value::Float(a as f64 + b as f64),
            }),
            (a, b) => Ok(Value::Float(a.as_float().unwrap() + b.as_float().unwrap())),
        }
    }

    /// Subtraction. Int overflow promotes to Float.
    pub fn sub(&self, other: &Value) -> Result<Value> {
        match self.numeric_pair(other, "-")? {
            (Value::Int(a), Value::Int(b)) => Ok(match a.checked_sub(b) {
                Some(n) => Value::Int(n),
                None => Value::Float(a as f64 - b as f64),
            }),
            (a, b) => Ok(Value::Float(a.as_float().unwrap() - b.as_float().unwrap())),
        }
    }

    /// Multiplication. Int overflow promotes to Float.
    pub fn mul(&self, other: &Value) -> Result<Value> {
        match self.numeric_pair(other, "*")? {
            (Value::Int(a), Value::Int(b)) => Ok(match a.checked_mul(b) {
                Some(n) => Value::Int(n),
                None => Value::Float(a as f64 * b as f64),
            }),
            (a, b) => Ok(Value::Float(a.as_float().unwrap() * b.as_float().unwrap())),
        }
    }

    /// True division, always yielding a float. Division by zero fails.
    pub fn div(&self, other: &Value) -> Result<Value> {
        let (a, b) = self.numeric_pair(other, "/")?;
        let divisor = b.as_float().unwrap();
        if divisor == 0.0 {
            return Err(WickerError::TypeError("division by zero".to_string()));
        }
        Ok(Value::Float(a.as_float().unwrap() / divisor))
    }

    /// Floor division, yielding an integer. Division by zero fails;
    /// overflow promotes to Float.
    pub fn floordiv(&self, other: &Value) -> Result<Value> {
        let (a, b) = self.numeric_pair(other, "//")?;
        match (a, b) {
            (_, Value::Int(0)) => Err(WickerError::TypeError("division by zero".to_string())),
            (Value::Int(x), Value::Int(y)) => Ok(match floored_div(x, y) {
                Some(n) => Value::Int(n),
                None => Value::Float((x as f64 / y as f64).floor()),
            }),
            (x, y) => {
                let divisor = y.as_float().unwrap();
                if divisor == 0.0 {
                    return Err(WickerError::TypeError("division by zero".to_string()));
                }
                Ok(Value::Int((x.as_float().unwrap() / divisor).floor() as i64))
            }
        }
    }

    /// Remainder: integer for two integers, float otherwise. Modulo by
    /// zero fails; overflow promotes to Float.
    pub fn rem(&self, other: &Value) -> Result<Value> {
        let (a, b) = self.numeric_pair(other, "%")?;
        match (a, b) {
            (_, Value::Int(0)) => Err(WickerError::TypeError("modulo by zero".to_string())),
            (Value::Int(x), Value::Int(y)) => Ok(match x.checked_rem(y) {
                Some(n) => Value::Int(n),
                None => Value::Float(x as f64 % y as f64),
            }),
            (x, y) => {
                let divisor = y.as_float().unwrap();
                if divisor == 0.0 {
                    return Err(WickerError::TypeError("modulo by zero".to_string()));
                }
                Ok(Value::Float(x.as_float().unwrap() % divisor))
            }
        }
    }

    /// Exponentiation. Integer for non-negative integer exponents that fit;
    /// float otherwise.
    pub fn pow(&self, other: &Value) -> Result<Value> {
        match self.numeric_pair(other, "**")? {
            (Value::Int(a), Value::Int(b)) if b >= 0 => {
                match u32::try_from(b).ok().and_then(|e| a.checked_pow(e)) {
                    Some(n) => Ok(Value::Int(n)),
                    None => Ok(Value::Float((a as f64).powf(b as f64))),
                }
            }
            (a, b) => Ok(Value::Float(
                a.as_float().unwrap().powf(b.as_float().unwrap()),
            )),
        }
    }

    /// Unary negation on numbers.
    pub fn neg(&self) -> Result<Value> {
        match self {
            Value::Int(n) => Ok(match n.checked_neg() {
                Some(m) => Value::Int(m),
                None => Value::Float(-(*n as f64)),
            }),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(WickerError::TypeError(format!(
                "cannot negate {}",
                other.kind()
            ))),
        }
    }

    /// String concatenation, coercing both operands via the output rules.
    pub fn concat(&self, other: &Value) -> Result<Value> {
        let mut s = self.to_output_string()?;
        s.push_str(&other.to_output_string()?);
        Ok(Value::string(s))
    }

    /// Inclusive integer range, ascending or descending.
    pub fn range(&self, other: &Value) -> Result<Value> {
        let (a, b) = match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(WickerError::TypeError(format!(
                    "\"..\" needs integer bounds, got {} and {}",
                    self.kind(),
                    other.kind()
                )))
            }
        };
        let items: Vec<Value> = if a <= b {
            (a..=b).map(Value::Int).collect()
        } else {
            (b..=a).rev().map(Value::Int).collect()
        };
        Ok(Value::array(items))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (a, b) if a.is_number() && b.is_number() => {
                a.as_float().unwrap() == b.as_float().unwrap()
            }
            (Value::Str(a), Value::Str(b))
            | (Value::Str(a), Value::Safe(b))
            | (Value::Safe(a), Value::Str(b))
            | (Value::Safe(a), Value::Safe(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Integer division rounded towards negative infinity, matching the float
/// branch of `//`. `None` on overflow (`i64::MIN // -1`).
fn floored_div(x: i64, y: i64) -> Option<i64> {
    let quotient = x.checked_div(y)?;
    if x % y != 0 && (x < 0) != (y < 0) {
        quotient.checked_sub(1)
    } else {
        Some(quotient)
    }
}

/// Formats a float in canonical decimal form with trimmed trailing zeros.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        format!("{}", f)
    }
}

/// Parses a string as a number literal, preferring integers.
pub fn parse_number(s: &str) -> Option<Value> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(n) = t.parse::<i64>() {
        return Some(Value::Int(n));
    }
    t.parse::<f64>().ok().filter(|f| f.is_finite()).map(Value::Float)
}

/// Converts host JSON data into a template value, preserving object order.
pub fn value_from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::string(s),
        serde_json::Value::Array(items) => {
            Value::array(items.into_iter().map(value_from_json).collect())
        }
        serde_json::Value::Object(entries) => {
            let map: ValueMap = entries
                .into_iter()
                .map(|(k, v)| (k, value_from_json(v)))
                .collect();
            Value::map(map)
        }
    }
}

/// Converts any serializable host value into a template value.
pub fn to_value<T: serde::Serialize>(data: T) -> Result<Value> {
    let json = serde_json::to_value(data)
        .map_err(|e| WickerError::TypeError(format!("unserializable context data: {}", e)))?;
    Ok(value_from_json(json))
}

/// Converts a template value back into JSON, for `json_encode`.
pub fn value_to_json(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Str(s) | Value::Safe(s) => serde_json::Value::String(s.to_string()),
        Value::Array(items) => serde_json::Value::Array(
            items.iter().map(value_to_json).collect::<Result<_>>()?,
        ),
        Value::Map(entries) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in entries.iter() {
                obj.insert(k.clone(), value_to_json(v)?);
            }
            serde_json::Value::Object(obj)
        }
        other => {
            return Err(WickerError::TypeError(format!(
                "cannot encode {} as JSON",
                other.kind()
            )))
        }
    })
}
