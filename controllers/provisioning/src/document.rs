//! Tagged document model for template parameters and rendered resources.
//!
//! Request parameters, template defaults and the rendered ClusterInstance are
//! free-form trees. They are held as [`Document`] values and read through
//! accessors that return a `Result`, so a malformed tree surfaces as an input
//! error naming the offending field.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Map node of a document
pub type DocumentMap = BTreeMap<String, Document>;

/// Errors raised when a document does not have the expected shape
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DocumentError {
    /// Value present with the wrong type
    #[error("{what} is not a valid {expected} (found {found})")]
    TypeMismatch {
        what: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Required key absent
    #[error("{0} not found")]
    Missing(String),

    /// Text could not be parsed as YAML or JSON
    #[error("failed to parse document: {0}")]
    Parse(String),
}

/// A JSON/YAML value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Document {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Document>),
    Map(DocumentMap),
}

impl Document {
    /// Empty map document
    pub fn map() -> Self {
        Self::Map(DocumentMap::new())
    }

    /// Parses YAML (and therefore JSON) text
    pub fn from_yaml(text: &str) -> Result<Self, DocumentError> {
        serde_yaml::from_str::<serde_json::Value>(text)
            .map(Self::from)
            .map_err(|e| DocumentError::Parse(e.to_string()))
    }

    /// Name of the variant, used in type mismatch messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// True when both values carry the same variant
    pub fn same_type(&self, other: &Document) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Null, or an empty string, list or map
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.is_empty(),
            Self::List(l) => l.is_empty(),
            Self::Map(m) => m.is_empty(),
            Self::Bool(_) | Self::Int(_) | Self::Float(_) => false,
        }
    }

    pub fn as_map(&self) -> Option<&DocumentMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut DocumentMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Document]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Document>> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn expect_map_mut(&mut self, what: &str) -> Result<&mut DocumentMap, DocumentError> {
        let found = self.type_name();
        self.as_map_mut().ok_or_else(|| DocumentError::TypeMismatch {
            what: what.to_string(),
            expected: "map",
            found,
        })
    }

    pub fn expect_list(&self, what: &str) -> Result<&[Document], DocumentError> {
        self.as_list().ok_or_else(|| self.mismatch(what, "list"))
    }

    fn mismatch(&self, what: &str, expected: &'static str) -> DocumentError {
        DocumentError::TypeMismatch {
            what: what.to_string(),
            expected,
            found: self.type_name(),
        }
    }

    /// Child of a map. `None` for absent keys and for non-map documents.
    pub fn get(&self, key: &str) -> Option<&Document> {
        self.as_map().and_then(|m| m.get(key))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Document> {
        self.as_map_mut().and_then(|m| m.get_mut(key))
    }

    /// Child of a map that must be present
    pub fn require(&self, key: &str) -> Result<&Document, DocumentError> {
        self.get(key).ok_or_else(|| DocumentError::Missing(key.to_string()))
    }

    /// Descends through nested maps
    pub fn path(&self, path: &[&str]) -> Option<&Document> {
        path.iter().try_fold(self, |doc, key| doc.get(key))
    }

    /// String at a nested path, when present and a string
    pub fn str_at(&self, path: &[&str]) -> Option<&str> {
        self.path(path).and_then(Document::as_str)
    }

    /// Inserts into a map. A null document becomes an empty map first.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Document>) -> Result<(), DocumentError> {
        if matches!(self, Self::Null) {
            *self = Self::map();
        }
        self.expect_map_mut("document")?.insert(key.into(), value.into());
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Document> {
        self.as_map_mut().and_then(|m| m.remove(key))
    }

    /// Nested map at `key`, created when absent
    pub fn map_entry(&mut self, key: &str) -> Result<&mut Document, DocumentError> {
        if matches!(self, Self::Null) {
            *self = Self::map();
        }
        let map = self.expect_map_mut("document")?;
        let child = map.entry(key.to_string()).or_insert_with(Document::map);
        if matches!(child, Self::Null) {
            *child = Document::map();
        }
        if child.as_map().is_none() {
            return Err(child.mismatch(key, "map"));
        }
        Ok(child)
    }

    /// Converts into a JSON value
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::from(self.clone())
    }
}

impl From<serde_json::Value> for Document {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map_or(Self::Null, Self::Float),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<Document> for serde_json::Value {
    fn from(doc: Document) -> Self {
        match doc {
            Document::Null => Self::Null,
            Document::Bool(b) => Self::Bool(b),
            Document::Int(i) => Self::from(i),
            Document::Float(f) => serde_json::Number::from_f64(f).map_or(Self::Null, Self::Number),
            Document::String(s) => Self::String(s),
            Document::List(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Document::Map(map) => Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

impl From<&str> for Document {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Document {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Document {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<DocumentMap> for Document {
    fn from(m: DocumentMap) -> Self {
        Self::Map(m)
    }
}

impl From<Vec<Document>> for Document {
    fn from(l: Vec<Document>) -> Self {
        Self::List(l)
    }
}
