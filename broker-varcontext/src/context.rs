use crate::cast::to_plain_string;
use serde_json::{Map, Value};

/// Immutable result of a [`crate::ContextBuilder`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarContext {
    values: Map<String, Value>,
}

impl VarContext {
    pub(crate) fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// The value rendered as a string, as it would appear in a template.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).map(to_plain_string)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_map(&self) -> Map<String, Value> {
        self.values.clone()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}
