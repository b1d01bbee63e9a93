// OpConfig — free-form operator settings
//
// Each node in a graph description carries a `config` map that only its
// operator interprets: `{"factor": 2.0}` for Scale, `{"num_output": 10,
// "weight_filler": {"type": "xavier"}}` for InnerProduct, and so on. The map
// is kept untyped so new operators can be registered without touching the
// graph description types; each constructor pulls what it needs with the
// typed getters below and fails with Error::Config on a wrong type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use marmot_core::{Error, Result};

/// A single configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(x) => Some(*x),
            ConfigValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Int(_) => "integer",
            ConfigValue::Float(_) => "float",
            ConfigValue::Str(_) => "string",
            ConfigValue::List(_) => "list",
            ConfigValue::Map(_) => "map",
        }
    }
}

impl From<f64> for ConfigValue {
    fn from(x: f64) -> Self {
        ConfigValue::Float(x)
    }
}

impl From<f32> for ConfigValue {
    fn from(x: f32) -> Self {
        ConfigValue::Float(x as f64)
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Int(i)
    }
}

impl From<usize> for ConfigValue {
    fn from(i: usize) -> Self {
        ConfigValue::Int(i as i64)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Str(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::Str(s)
    }
}

impl From<OpConfig> for ConfigValue {
    fn from(c: OpConfig) -> Self {
        ConfigValue::Map(c.0)
    }
}

/// Settings for one operator instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpConfig(BTreeMap<String, ConfigValue>);

impl OpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn f32_or(&self, key: &str, default: f32) -> Result<f32> {
        match self.0.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_f64()
                .map(|x| x as f32)
                .ok_or_else(|| wrong_type(key, "number", v)),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.0.get(key) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| wrong_type(key, "bool", v)),
        }
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str> {
        match self.0.get(key) {
            None => Ok(default),
            Some(v) => v.as_str().ok_or_else(|| wrong_type(key, "string", v)),
        }
    }

    pub fn usize_or(&self, key: &str, default: usize) -> Result<usize> {
        match self.0.get(key) {
            None => Ok(default),
            Some(_) => self.require_usize(key),
        }
    }

    /// A mandatory non-negative integer.
    pub fn require_usize(&self, key: &str) -> Result<usize> {
        let v = self
            .0
            .get(key)
            .ok_or_else(|| Error::config(format!("missing required setting '{key}'")))?;
        v.as_i64()
            .and_then(|i| usize::try_from(i).ok())
            .ok_or_else(|| wrong_type(key, "non-negative integer", v))
    }

    /// A nested settings map (e.g. a filler description).
    pub fn section(&self, key: &str) -> Result<Option<OpConfig>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(ConfigValue::Map(m)) => Ok(Some(OpConfig(m.clone()))),
            Some(v) => Err(wrong_type(key, "map", v)),
        }
    }
}

fn wrong_type(key: &str, expected: &str, got: &ConfigValue) -> Error {
    Error::config(format!(
        "setting '{key}' must be a {expected}, got a {}",
        got.type_name()
    ))
}
