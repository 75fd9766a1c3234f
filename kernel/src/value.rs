use serde::{Deserialize, Serialize};

use crate::model::DataType;

/// Value of a single property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Blob(Vec<u8>),
    /// Milliseconds since the epoch.
    TimeStamp(i64),
    Enumerated(String),
}

impl PropertyValue {
    pub fn conforms_to(&self, data_type: &DataType) -> bool {
        match (self, data_type) {
            (Self::String(_), DataType::String)
            | (Self::Integer(_), DataType::Integer)
            | (Self::Float(_), DataType::Float)
            | (Self::Boolean(_), DataType::Boolean)
            | (Self::Blob(_), DataType::Blob)
            | (Self::TimeStamp(_), DataType::TimeStamp) => true,
            (Self::Enumerated(v), DataType::Enumerated(domain)) => domain.contains(v),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Enumerated(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) | Self::TimeStamp(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conformance() {
        assert!(PropertyValue::from("x").conforms_to(&DataType::String));
        assert!(!PropertyValue::from(3).conforms_to(&DataType::String));
        let colors = DataType::Enumerated(vec!["red".into(), "blue".into()]);
        assert!(PropertyValue::Enumerated("red".into()).conforms_to(&colors));
        assert!(!PropertyValue::Enumerated("green".into()).conforms_to(&colors));
    }
}
