//! Parameter axes and the vectors enumerated from them.
//!
//! A task kind declares an ordered list of axes. Its instances are the
//! cartesian product of the axis values, enumerated first-axis-slowest so that
//! the order is stable across runs.

use crate::error::ConfigError;
use crate::blog_warn;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// One value an axis may take.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Numeric view of the value, used when evaluating check expressions.
    /// Booleans count as 1 and 0; non-finite numbers have no numeric view.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            ParamValue::Int(i) => *i as f64,
            ParamValue::Float(f) => *f,
            ParamValue::Bool(b) => f64::from(u8::from(*b)),
            ParamValue::Str(s) => s.trim().parse().ok()?,
        };
        value.is_finite().then_some(value)
    }
}

// Floats compare by bit pattern so that the value can take part in instance
// identity.
impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Bool(a), ParamValue::Bool(b)) => a == b,
            (ParamValue::Int(a), ParamValue::Int(b)) => a == b,
            (ParamValue::Float(a), ParamValue::Float(b)) => a.to_bits() == b.to_bits(),
            (ParamValue::Str(a), ParamValue::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ParamValue {}

impl Hash for ParamValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ParamValue::Bool(b) => b.hash(state),
            ParamValue::Int(i) => i.hash(state),
            ParamValue::Float(f) => f.to_bits().hash(state),
            ParamValue::Str(s) => s.hash(state),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

/// A named, enumerable parameter dimension of a task kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterAxis {
    pub name: String,
    pub values: Vec<ParamValue>,
}

impl ParameterAxis {
    pub fn new<V: Into<ParamValue>>(name: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            name: name.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Values with repeats removed, first occurrence wins.
    fn distinct_values(&self) -> Vec<&ParamValue> {
        let mut seen = Vec::with_capacity(self.values.len());
        for value in &self.values {
            if !seen.contains(&value) {
                seen.push(value);
            }
        }
        seen
    }
}

/// The concrete axis assignment of one task instance, in axis order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ParameterVector(Vec<(String, ParamValue)>);

impl ParameterVector {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, axis: &str, value: impl Into<ParamValue>) -> Self {
        self.0.push((axis.to_string(), value.into()));
        self
    }

    pub fn get(&self, axis: &str) -> Option<&ParamValue> {
        self.0.iter().find(|(name, _)| name == axis).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(name, v)| (name.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if every axis named in `predicate` carries the predicate's value.
    /// Axes the predicate does not mention are unconstrained.
    pub fn satisfies(&self, predicate: &BTreeMap<String, ParamValue>) -> bool {
        predicate
            .iter()
            .all(|(axis, want)| self.get(axis) == Some(want))
    }
}

impl std::fmt::Display for ParameterVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl Serialize for ParameterVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Enumerate every parameter vector of a kind.
///
/// The first declared axis varies slowest. An axis without values is rejected
/// because it would silently empty the product and hide every dependent.
pub fn enumerate(kind: &str, axes: &[ParameterAxis]) -> Result<Vec<ParameterVector>, ConfigError> {
    let mut columns = Vec::with_capacity(axes.len());
    for axis in axes {
        if axis.values.is_empty() {
            return Err(ConfigError::EmptyAxis {
                kind: kind.to_string(),
                axis: axis.name.clone(),
            });
        }
        let distinct = axis.distinct_values();
        if distinct.len() != axis.values.len() {
            blog_warn!(
                "Kind '{}': axis '{}' lists repeated values, keeping {} of {}",
                kind,
                axis.name,
                distinct.len(),
                axis.values.len()
            );
        }
        columns.push((axis.name.as_str(), distinct));
    }

    let total: usize = columns.iter().map(|(_, vals)| vals.len()).product();
    let mut vectors = Vec::with_capacity(total);
    let mut cursor = vec![0usize; columns.len()];

    for _ in 0..total {
        let vector = ParameterVector(
            columns
                .iter()
                .zip(&cursor)
                .map(|((name, vals), &i)| (name.to_string(), vals[i].clone()))
                .collect(),
        );
        vectors.push(vector);

        // Odometer step: the last axis turns fastest.
        for pos in (0..columns.len()).rev() {
            cursor[pos] += 1;
            if cursor[pos] < columns[pos].1.len() {
                break;
            }
            cursor[pos] = 0;
        }
    }

    Ok(vectors)
}
