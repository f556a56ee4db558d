//! Location parameter types and the query-string codec
//!
//! A location is a flat key -> value mapping. Lists travel as comma-joined
//! strings and numeric/boolean-looking strings come back typed on decode.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single location parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// Parse a raw query-string value back into its typed form
    pub fn parse(raw: &str) -> Self {
        if raw.contains(',') {
            return ParamValue::List(raw.split(',').map(Self::parse_scalar).collect());
        }
        Self::parse_scalar(raw)
    }

    fn parse_scalar(raw: &str) -> Self {
        match raw {
            "true" => return ParamValue::Bool(true),
            "false" => return ParamValue::Bool(false),
            _ => {}
        }
        // Only canonical numbers come back typed, so "02134" stays text
        if let Ok(n) = raw.parse::<i64>()
            && n.to_string() == raw
        {
            return ParamValue::Int(n);
        }
        if let Ok(f) = raw.parse::<f64>()
            && f.is_finite()
            && raw.contains('.')
            && f.to_string() == raw
        {
            return ParamValue::Float(f);
        }
        ParamValue::Text(raw.to_string())
    }

    /// Encode this value the way it appears in the serialized location
    pub fn encode(&self) -> String {
        match self {
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::Int(n) => n.to_string(),
            ParamValue::Float(f) => f.to_string(),
            ParamValue::Text(s) => s.clone(),
            ParamValue::List(items) => items.iter().map(ParamValue::encode).collect::<Vec<_>>().join(","),
        }
    }

    /// True for values that must never reach the location (`key=`)
    pub fn is_empty(&self) -> bool {
        match self {
            ParamValue::Text(s) => s.is_empty(),
            ParamValue::List(items) => items.is_empty(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(n) => Some(*n),
            ParamValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(n) => Some(*n as f64),
            ParamValue::Float(f) => Some(*f),
            ParamValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// View the value as a list of strings; a scalar is a one-element list
    pub fn to_string_list(&self) -> Vec<String> {
        match self {
            ParamValue::List(items) => items.iter().map(ParamValue::encode).collect(),
            other => vec![other.encode()],
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        ParamValue::Int(n)
    }
}

impl From<u32> for ParamValue {
    fn from(n: u32) -> Self {
        ParamValue::Int(i64::from(n))
    }
}

impl From<f64> for ParamValue {
    fn from(f: f64) -> Self {
        ParamValue::Float(f)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(items: Vec<String>) -> Self {
        ParamValue::List(items.into_iter().map(ParamValue::Text).collect())
    }
}

/// The full addressable state of a view
///
/// Absent key means not present in the serialized location. Keys are kept
/// sorted so two logically identical sets compare and serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationParams(BTreeMap<String, ParamValue>);

impl LocationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.0.get(key).map(ParamValue::encode)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(ParamValue::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(ParamValue::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(ParamValue::as_bool)
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.0.get(key).map(ParamValue::to_string_list).unwrap_or_default()
    }

    /// Drop empty values so a filter reset to nothing vanishes from the location
    pub fn strip_empty(mut self) -> Self {
        self.0.retain(|_, v| !v.is_empty());
        self
    }

    /// Split off every key that starts with `prefix`, returning them without it
    pub fn split_prefixed(&self, prefix: &str) -> (LocationParams, LocationParams) {
        let mut rest = LocationParams::new();
        let mut prefixed = LocationParams::new();
        for (key, value) in &self.0 {
            match key.strip_prefix(prefix) {
                Some(stripped) if !stripped.is_empty() => prefixed.insert(stripped, value.clone()),
                _ => rest.insert(key.clone(), value.clone()),
            }
        }
        (rest, prefixed)
    }

    /// Decode a query string (leading `?` optional)
    pub fn from_query_string(query: &str) -> Self {
        debug!(%query, "LocationParams::from_query_string: called");
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut params = LocationParams::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key.is_empty() || value.is_empty() {
                continue;
            }
            params.insert(key.into_owned(), ParamValue::parse(&value));
        }
        params
    }

    /// Encode as a query string without the leading `?`
    pub fn to_query_string(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.0 {
            if value.is_empty() {
                continue;
            }
            serializer.append_pair(key, &value.encode());
        }
        serializer.finish()
    }
}

impl FromIterator<(String, ParamValue)> for LocationParams {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for LocationParams {
    type Item = (String, ParamValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, ParamValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for LocationParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.to_query_string())
    }
}

/// A partial update to a location
///
/// `None` means "remove this key", never "set to empty".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamPatch(BTreeMap<String, Option<ParamValue>>);

impl ParamPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.insert(key.into(), Some(value.into()));
        self
    }

    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.0.insert(key.into(), None);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<ParamValue>) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<ParamValue>)> {
        self.0.iter()
    }

    /// Union of `current` and this patch; removals and empty values drop the key
    pub fn apply_to(&self, current: &LocationParams) -> LocationParams {
        let mut next = current.clone();
        for (key, value) in &self.0 {
            match value {
                Some(v) if !v.is_empty() => next.insert(key.clone(), v.clone()),
                _ => {
                    next.remove(key);
                }
            }
        }
        next
    }

    /// Patch that turns `current` into `target`
    ///
    /// Only keys whose value differs are set; keys only present in `current`
    /// are explicitly removed. Identical sets yield an empty patch.
    pub fn diff(current: &LocationParams, target: &LocationParams) -> Self {
        let mut patch = ParamPatch::new();
        for key in current.keys() {
            if !target.contains_key(key) {
                patch.insert(key.clone(), None);
            }
        }
        for (key, value) in target.iter() {
            if current.get(key) != Some(value) {
                patch.insert(key.clone(), Some(value.clone()));
            }
        }
        patch
    }
}

impl FromIterator<(String, Option<ParamValue>)> for ParamPatch {
    fn from_iter<I: IntoIterator<Item = (String, Option<ParamValue>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
