//! Query key canonicalization.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CacheError;

/// An application-supplied identity for a cacheable value.
///
/// A key may be a scalar, an ordered sequence, or a nested mapping of string
/// member names to values. Two keys are equivalent iff their
/// [`CanonicalKey`]s are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Value);

impl QueryKey {
    /// Build a key from any serializable value.
    pub fn from_serialize<K: Serialize + ?Sized>(key: &K) -> Result<Self, CacheError> {
        Ok(Self(serde_json::to_value(key)?))
    }

    /// Get the structured value behind this key.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Compute the canonical string form of this key.
    pub fn canonical(&self) -> CanonicalKey {
        canonicalize(&self.0)
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self(Value::from(value))
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        Self(Value::from(value))
    }
}

impl From<i64> for QueryKey {
    fn from(value: i64) -> Self {
        Self(Value::from(value))
    }
}

impl From<u64> for QueryKey {
    fn from(value: u64) -> Self {
        Self(Value::from(value))
    }
}

impl From<bool> for QueryKey {
    fn from(value: bool) -> Self {
        Self(Value::from(value))
    }
}

impl<K: Into<QueryKey>> From<Vec<K>> for QueryKey {
    fn from(parts: Vec<K>) -> Self {
        Self(Value::Array(parts.into_iter().map(|p| p.into().0).collect()))
    }
}

/// Build a [`QueryKey`] from JSON-like syntax.
///
/// ```ignore
/// let key = query_key!(["products", { "page": 2, "sort": "price" }]);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($json:tt)+) => {
        $crate::QueryKey::from($crate::__private::json!($($json)+))
    };
}

/// The deterministic string form of a [`QueryKey`], used for storage and lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Get the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonicalize a structured key.
///
/// Sequences keep their element order. Mapping members are sorted by name at
/// every depth, independent of how the underlying map orders them.
pub fn canonicalize(value: &Value) -> CanonicalKey {
    CanonicalKey(Canonical(value).to_string())
}

struct Canonical<'a>(&'a Value);

impl fmt::Display for Canonical<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Array(items) => {
                f.write_char('[')?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_char(',')?;
                    }
                    write!(f, "{}", Canonical(item))?;
                }
                f.write_char(']')
            }
            Value::Object(members) => {
                let mut members: Vec<_> = members.iter().collect();
                members.sort_unstable_by(|a, b| a.0.cmp(b.0));

                f.write_char('{')?;
                for (i, (name, value)) in members.into_iter().enumerate() {
                    if i > 0 {
                        f.write_char(',')?;
                    }
                    let name = serde_json::to_string(name).map_err(|_| fmt::Error)?;
                    write!(f, "{}:{}", name, Canonical(value))?;
                }
                f.write_char('}')
            }
            scalar => write!(f, "{}", scalar),
        }
    }
}
