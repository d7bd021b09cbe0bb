//! Key/value attributes attached to providers and configuration records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known property keys.
pub mod keys {
    /// Interfaces a provider is registered under.
    pub const OBJECT_CLASS: &str = "objectClass";
    /// Registry-assigned provider id (registration order).
    pub const SERVICE_ID: &str = "service.id";
    /// Provider priority; higher ranks first.
    pub const SERVICE_RANKING: &str = "service.ranking";
    /// Configuration pid a provider or component was configured from.
    pub const SERVICE_PID: &str = "service.pid";
    /// Factory pid of a factory configuration record.
    pub const FACTORY_PID: &str = "service.factoryPid";
    /// Name of the component that registered a provider.
    pub const COMPONENT_NAME: &str = "component.name";
    /// Sequence id of the component configuration that registered a provider.
    pub const COMPONENT_ID: &str = "component.id";
    /// Suffix of the per-record reference target override (`<reference>.target`).
    pub const TARGET_SUFFIX: &str = ".target";
}

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Text.
    String(String),
    /// Multi-valued property; filters match if any element matches.
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Borrow the value as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read the value as an integer, if it is one.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Read the value as a boolean, if it is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            },
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// An ordered string-keyed property map.
///
/// Keys starting with `.` are private: they are visible to the component
/// they configure but are not exposed on registered providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, PropertyValue>);

impl Properties {
    /// Create an empty property map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Option<PropertyValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.0.remove(key)
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    /// Look up a string value.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(PropertyValue::as_str)
    }

    /// Look up an integer value.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(PropertyValue::as_i64)
    }

    /// Whether the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A copy of `self` overlaid with `other`; values in `other` win.
    #[must_use]
    pub fn merged(&self, other: &Properties) -> Properties {
        let mut out = self.clone();
        for (k, v) in &other.0 {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }

    /// A copy without private (`.`-prefixed) keys.
    #[must_use]
    pub fn public(&self) -> Properties {
        Properties(
            self.0
                .iter()
                .filter(|(k, _)| !k.starts_with('.'))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_prefers_overlay() {
        let base = Properties::new().with("a", 1).with("b", "base");
        let overlay = Properties::new().with("b", "overlay").with("c", true);

        let merged = base.merged(&overlay);
        assert_eq!(merged.get_i64("a"), Some(1));
        assert_eq!(merged.get_str("b"), Some("overlay"));
        assert_eq!(merged.get("c").and_then(PropertyValue::as_bool), Some(true));
    }

    #[test]
    fn test_public_drops_private_keys() {
        let props = Properties::new().with(".secret", "x").with("visible", "y");
        let public = props.public();
        assert!(!public.contains_key(".secret"));
        assert_eq!(public.get_str("visible"), Some("y"));
    }

    #[test]
    fn test_deserialize_untagged_values() {
        let props: Properties =
            serde_json::from_str(r#"{"n": 3, "s": "x", "b": false, "l": ["a", "b"]}"#).unwrap();
        assert_eq!(props.get_i64("n"), Some(3));
        assert_eq!(props.get_str("s"), Some("x"));
        assert_eq!(
            props.get("l"),
            Some(&PropertyValue::List(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn test_display_list() {
        let value = PropertyValue::from(vec![1_i64, 2]);
        assert_eq!(value.to_string(), "[1, 2]");
    }
}
