// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Built-in `is` tests.
//!
//! A test is a predicate over the tested value plus its declared arguments.
//! The `defined` test is an intrinsic of the expression evaluator (it has
//! to observe undefined-variable failures before they become errors) and is
//! not registered here; `in`, `starts with`, `ends with` and `matches` are
//! operators rather than tests.

use std::collections::HashMap;
use std::mem::discriminant;
use std::sync::Arc;

use crate::error::{Result, WickerError};
use crate::value::Value;

/// A registered test predicate.
pub type TestRef = Arc<dyn Fn(&Value, &[Value]) -> Result<bool> + Send + Sync>;

/// Builds the default test registry.
pub fn defaults() -> HashMap<String, TestRef> {
    let mut registry: HashMap<String, TestRef> = HashMap::new();

    fn insert(
        registry: &mut HashMap<String, TestRef>,
        name: &str,
        f: impl Fn(&Value, &[Value]) -> Result<bool> + Send + Sync + 'static,
    ) {
        registry.insert(name.to_string(), Arc::new(f));
    }

    insert(&mut registry, "empty", |value, _| Ok(value.is_empty()));
    insert(&mut registry, "null", |value, _| {
        Ok(matches!(value, Value::Null))
    });
    insert(&mut registry, "none", |value, _| {
        Ok(matches!(value, Value::Null))
    });
    insert(&mut registry, "even", |value, _| {
        Ok(int_of(value, "even")? % 2 == 0)
    });
    insert(&mut registry, "odd", |value, _| {
        Ok(int_of(value, "odd")? % 2 != 0)
    });
    insert(&mut registry, "iterable", |value, _| {
        Ok(matches!(value, Value::Array(_) | Value::Map(_)))
    });
    insert(&mut registry, "divisible by", |value, args| {
        let n = int_of(value, "divisible by")?;
        let by = args
            .first()
            .and_then(|v| v.as_int())
            .ok_or_else(|| {
                WickerError::TypeError(
                    "\"divisible by\" needs an integer argument".to_string(),
                )
            })?;
        if by == 0 {
            return Err(WickerError::TypeError(
                "\"divisible by\" zero".to_string(),
            ));
        }
        Ok(n % by == 0)
    });
    insert(&mut registry, "same as", test_same_as);
    insert(&mut registry, "sameas", test_same_as);

    registry
}

fn int_of(value: &Value, test: &str) -> Result<i64> {
    value.as_int().ok_or_else(|| {
        WickerError::TypeError(format!(
            "\"{}\" expects an integer, got {}",
            test,
            value.kind()
        ))
    })
}

/// Strict identity: equal and of the same tag, so `2 is same as(2.0)` is
/// false even though `2 == 2.0` holds.
fn test_same_as(value: &Value, args: &[Value]) -> Result<bool> {
    let other = args.first().ok_or_else(|| {
        WickerError::TypeError("\"same as\" needs an argument".to_string())
    })?;
    Ok(discriminant(value) == discriminant(other) && value == other)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, value: Value, args: &[Value]) -> bool {
        let registry = defaults();
        registry.get(name).expect("test registered")(&value, args).unwrap()
    }

    #[test]
    fn test_parity() {
        assert!(check("even", Value::Int(4), &[]));
        assert!(check("odd", Value::Int(-3), &[]));
        assert!(!check("even", Value::Int(5), &[]));
    }

    #[test]
    fn test_empty_and_null() {
        assert!(check("empty", Value::string(""), &[]));
        assert!(check("empty", Value::array(vec![]), &[]));
        assert!(!check("empty", Value::string("x"), &[]));
        assert!(check("null", Value::Null, &[]));
        assert!(check("none", Value::Null, &[]));
        assert!(!check("null", Value::Bool(false), &[]));
    }

    #[test]
    fn test_divisible_by() {
        assert!(check("divisible by", Value::Int(9), &[Value::Int(3)]));
        assert!(!check("divisible by", Value::Int(10), &[Value::Int(3)]));
        let registry = defaults();
        assert!(registry.get("divisible by").unwrap()(&Value::Int(1), &[Value::Int(0)]).is_err());
    }

    #[test]
    fn test_same_as_is_strict() {
        assert!(check("same as", Value::Int(2), &[Value::Int(2)]));
        assert!(!check("same as", Value::Int(2), &[Value::Float(2.0)]));
        assert!(check("sameas", Value::Null, &[Value::Null]));
    }

    #[test]
    fn test_iterable() {
        assert!(check("iterable", Value::array(vec![]), &[]));
        assert!(!check("iterable", Value::string("abc"), &[]));
    }
}
