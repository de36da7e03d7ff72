use serde_json::{Map, Value};
use thiserror::Error;

/// A node parameter that is missing, of the wrong type, or out of range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("Parameter '{0}' is required")]
    Missing(&'static str),

    #[error("Parameter '{name}' must be {expected}, got {found}")]
    InvalidType {
        name: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("Parameter '{name}' is out of range: {value} ({reason})")]
    OutOfRange {
        name: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Parameter count of {op} does not fit in 64 bits")]
    CountOverflow { op: &'static str },
}

/// Read-only view over the free-form parameter map of one node.
///
/// Integers are read leniently: integral floats, numeric strings and
/// single-element lists are accepted.
#[derive(Clone, Copy)]
pub struct Params<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> Params<'a> {
    pub fn new(map: &'a Map<String, Value>) -> Self {
        Self { map }
    }

    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.map.get(name).filter(|v| !v.is_null())
    }

    /// The first of `names` that is present.
    pub fn get_any(&self, names: &[&str]) -> Option<&'a Value> {
        names.iter().find_map(|name| self.get(name))
    }

    pub fn usize(&self, name: &'static str) -> Result<Option<usize>, ParamError> {
        self.get(name).map(|v| to_usize(name, v)).transpose()
    }

    pub fn usize_or(&self, name: &'static str, default: usize) -> Result<usize, ParamError> {
        Ok(self.usize(name)?.unwrap_or(default))
    }

    pub fn required_usize(&self, name: &'static str) -> Result<usize, ParamError> {
        self.usize(name)?.ok_or(ParamError::Missing(name))
    }

    /// Like `usize_or` but rejects zero.
    pub fn positive_or(&self, name: &'static str, default: usize) -> Result<usize, ParamError> {
        positive(name, self.usize_or(name, default)?)
    }

    pub fn required_positive(&self, name: &'static str) -> Result<usize, ParamError> {
        positive(name, self.required_usize(name)?)
    }

    pub fn optional_positive(&self, name: &'static str) -> Result<Option<usize>, ParamError> {
        self.usize(name)?.map(|v| positive(name, v)).transpose()
    }

    pub fn i64_or(&self, name: &'static str, default: i64) -> Result<i64, ParamError> {
        let Some(value) = self.get(name) else {
            return Ok(default);
        };
        to_i64(value).ok_or_else(|| invalid_type(name, "an integer", value))
    }

    pub fn f64_or(&self, name: &'static str, default: f64) -> Result<f64, ParamError> {
        let Some(value) = self.get(name) else {
            return Ok(default);
        };
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| invalid_type(name, "a number", value))
    }

    pub fn bool_or(&self, name: &'static str, default: bool) -> Result<bool, ParamError> {
        match self.get(name) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(true),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(false),
            Some(value) => Err(invalid_type(name, "a boolean", value)),
        }
    }

    /// A list of non-negative integers. A scalar is read as a one-element list.
    pub fn usize_list(&self, name: &'static str) -> Result<Option<Vec<usize>>, ParamError> {
        let Some(value) = self.get(name) else {
            return Ok(None);
        };
        match value {
            Value::Array(items) => items
                .iter()
                .map(|v| to_usize(name, v))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            v => to_usize(name, v).map(|d| Some(vec![d])),
        }
    }
}

fn positive(name: &'static str, value: usize) -> Result<usize, ParamError> {
    if value == 0 {
        return Err(ParamError::OutOfRange {
            name,
            value: value.to_string(),
            reason: "must be positive",
        });
    }
    Ok(value)
}

fn to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(items) if !items.is_empty() => to_i64(&items[0]),
        _ => None,
    }
}

fn to_usize(name: &'static str, value: &Value) -> Result<usize, ParamError> {
    let int = to_i64(value).ok_or_else(|| invalid_type(name, "an integer", value))?;
    usize::try_from(int).map_err(|_| ParamError::OutOfRange {
        name,
        value: int.to_string(),
        reason: "must not be negative",
    })
}

fn invalid_type(name: &'static str, expected: &'static str, found: &Value) -> ParamError {
    ParamError::InvalidType {
        name,
        expected,
        found: found.to_string(),
    }
}

#[cfg(test)]
fn params(json: Value) -> Map<String, Value> {
    json.as_object().cloned().unwrap()
}

#[test]
fn lenient_integers() {
    let map = params(serde_json::json!({
        "a": 128, "b": 128.0, "c": " 64 ", "d": [5, 5], "e": null,
    }));
    let p = Params::new(&map);
    assert_eq!(p.usize("a"), Ok(Some(128)));
    assert_eq!(p.usize("b"), Ok(Some(128)));
    assert_eq!(p.usize("c"), Ok(Some(64)));
    assert_eq!(p.usize("d"), Ok(Some(5)));
    assert_eq!(p.usize("e"), Ok(None));
    assert_eq!(p.usize_or("missing", 3), Ok(3));
}

#[test]
fn rejects_bad_integers() {
    let map = params(serde_json::json!({ "a": 1.5, "b": -3, "c": "wide", "z": 0 }));
    let p = Params::new(&map);
    assert!(matches!(p.usize("a"), Err(ParamError::InvalidType { name: "a", .. })));
    assert!(matches!(p.usize("b"), Err(ParamError::OutOfRange { name: "b", .. })));
    assert!(matches!(p.usize("c"), Err(ParamError::InvalidType { name: "c", .. })));
    assert!(matches!(p.required_positive("z"), Err(ParamError::OutOfRange { name: "z", .. })));
    assert_eq!(p.required_usize("nope"), Err(ParamError::Missing("nope")));
}

#[test]
fn other_types() {
    let map = params(serde_json::json!({
        "p": 0.25, "bias": false, "size": [7, 5], "n": 3,
    }));
    let p = Params::new(&map);
    assert_eq!(p.f64_or("p", 0.5), Ok(0.25));
    assert_eq!(p.bool_or("bias", true), Ok(false));
    assert_eq!(p.usize_list("size"), Ok(Some(vec![7, 5])));
    assert_eq!(p.usize_list("n"), Ok(Some(vec![3])));
}
