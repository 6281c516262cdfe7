// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Built-in functions.
//!
//! Registered functions receive their evaluated arguments and return a
//! value; they are context-free. Functions that need the render context
//! (`include`, `source`, `block`, `parent`, `attribute`,
//! `template_from_string`) are intrinsics of the render engine and do not
//! appear in this registry, though the sandbox function allow-list still
//! governs them.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Result, WickerError};
use crate::value::Value;

/// A registered function.
pub type FunctionRef = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Builds the default function registry.
pub fn defaults() -> HashMap<String, FunctionRef> {
    let mut registry: HashMap<String, FunctionRef> = HashMap::new();

    fn insert(
        registry: &mut HashMap<String, FunctionRef>,
        name: &str,
        f: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) {
        registry.insert(name.to_string(), Arc::new(f));
    }

    insert(&mut registry, "range", function_range);
    insert(&mut registry, "cycle", function_cycle);
    insert(&mut registry, "random", function_random);
    insert(&mut registry, "max", function_max);
    insert(&mut registry, "min", function_min);
    insert(&mut registry, "dump", function_dump);

    registry
}

fn int_of(value: &Value, what: &str) -> Result<i64> {
    value.as_int().ok_or_else(|| {
        WickerError::TypeError(format!("{} must be an integer, got {}", what, value.kind()))
    })
}

fn function_range(args: &[Value]) -> Result<Value> {
    let low = int_of(
        args.first().ok_or_else(|| {
            WickerError::TypeError("range() needs at least two arguments".to_string())
        })?,
        "range() start",
    )?;
    let high = int_of(
        args.get(1).ok_or_else(|| {
            WickerError::TypeError("range() needs at least two arguments".to_string())
        })?,
        "range() end",
    )?;
    let step = match args.get(2) {
        Some(v) => int_of(v, "range() step")?,
        None => 1,
    };
    if step == 0 {
        return Err(WickerError::TypeError(
            "range() step cannot be zero".to_string(),
        ));
    }
    let mut items = Vec::new();
    if step > 0 {
        let mut n = low;
        while n <= high {
            items.push(Value::Int(n));
            n += step;
        }
    } else {
        let mut n = low;
        while n >= high {
            items.push(Value::Int(n));
            n += step;
        }
    }
    Ok(Value::array(items))
}

fn function_cycle(args: &[Value]) -> Result<Value> {
    let values = match args.first() {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(other) => {
            return Err(WickerError::TypeError(format!(
                "cycle() needs a non-empty array, got {}",
                other.kind()
            )))
        }
        None => {
            return Err(WickerError::TypeError(
                "cycle() needs an array and a position".to_string(),
            ))
        }
    };
    let position = int_of(
        args.get(1).ok_or_else(|| {
            WickerError::TypeError("cycle() needs a position argument".to_string())
        })?,
        "cycle() position",
    )?;
    let index = position.rem_euclid(values.len() as i64) as usize;
    Ok(values[index].clone())
}

fn function_random(args: &[Value]) -> Result<Value> {
    let mut rng = rand::thread_rng();
    match args.first() {
        Some(Value::Array(items)) => items
            .choose(&mut rng)
            .cloned()
            .ok_or_else(|| WickerError::TypeError("random() on an empty array".to_string())),
        Some(Value::Int(n)) if *n >= 0 => Ok(Value::Int(rng.gen_range(0..=*n))),
        Some(v) if v.as_str().is_some() => {
            let chars: Vec<char> = v.as_str().unwrap().chars().collect();
            chars
                .choose(&mut rng)
                .map(|c| Value::string(c.to_string()))
                .ok_or_else(|| {
                    WickerError::TypeError("random() on an empty string".to_string())
                })
        }
        Some(other) => Err(WickerError::TypeError(format!(
            "random() cannot pick from {}",
            other.kind()
        ))),
        None => Ok(Value::Int(rng.gen_range(0..=i32::MAX as i64))),
    }
}

fn spread_args(args: &[Value]) -> Vec<Value> {
    if args.len() == 1 {
        if let Value::Array(items) = &args[0] {
            return items.as_ref().clone();
        }
    }
    args.to_vec()
}

fn function_max(args: &[Value]) -> Result<Value> {
    let items = spread_args(args);
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            None => item,
            Some(current) => {
                if item.compare(&current)? == std::cmp::Ordering::Greater {
                    item
                } else {
                    current
                }
            }
        });
    }
    best.ok_or_else(|| WickerError::TypeError("max() needs at least one value".to_string()))
}

fn function_min(args: &[Value]) -> Result<Value> {
    let items = spread_args(args);
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            None => item,
            Some(current) => {
                if item.compare(&current)? == std::cmp::Ordering::Less {
                    item
                } else {
                    current
                }
            }
        });
    }
    best.ok_or_else(|| WickerError::TypeError("min() needs at least one value".to_string()))
}

fn function_dump(args: &[Value]) -> Result<Value> {
    let parts: Vec<String> = args.iter().map(|v| v.repr()).collect();
    Ok(Value::string(parts.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Result<Value> {
        let registry = defaults();
        registry.get(name).expect("function registered")(args)
    }

    #[test]
    fn test_range() {
        assert_eq!(
            call("range", &[Value::Int(1), Value::Int(3)]).unwrap(),
            Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            call("range", &[Value::Int(6), Value::Int(0), Value::Int(-2)]).unwrap(),
            Value::array(vec![
                Value::Int(6),
                Value::Int(4),
                Value::Int(2),
                Value::Int(0)
            ])
        );
        assert!(call("range", &[Value::Int(1), Value::Int(3), Value::Int(0)]).is_err());
    }

    #[test]
    fn test_cycle() {
        let values = Value::array(vec![
            Value::string("odd"),
            Value::string("even"),
        ]);
        assert_eq!(
            call("cycle", &[values.clone(), Value::Int(0)]).unwrap(),
            Value::string("odd")
        );
        assert_eq!(
            call("cycle", &[values, Value::Int(3)]).unwrap(),
            Value::string("even")
        );
    }

    #[test]
    fn test_max_min() {
        assert_eq!(
            call("max", &[Value::Int(2), Value::Int(9), Value::Int(4)]).unwrap(),
            Value::Int(9)
        );
        let arr = Value::array(vec![Value::Int(2), Value::Int(1)]);
        assert_eq!(call("min", &[arr]).unwrap(), Value::Int(1));
        assert!(call("max", &[]).is_err());
    }

    #[test]
    fn test_random_in_bounds() {
        for _ in 0..20 {
            let n = call("random", &[Value::Int(3)]).unwrap();
            let n = n.as_int().unwrap();
            assert!((0..=3).contains(&n));
        }
        let choice = call(
            "random",
            &[Value::array(vec![Value::Int(7)])],
        )
        .unwrap();
        assert_eq!(choice, Value::Int(7));
    }

    #[test]
    fn test_dump() {
        let out = call("dump", &[Value::Int(1), Value::string("x")]).unwrap();
        assert_eq!(out.as_str(), Some("1\n\"x\""));
    }
}
