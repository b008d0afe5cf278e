//! Semantic types and runtime values.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// The type of a selected expression, a column or a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SemanticType {
    /// Read from boolean or integer columns. On SQLite, declare the column
    /// `integer`: the `Any` driver rejects the declared `BOOLEAN` type.
    Boolean,
    Integer,
    Double,
    String,
    Timestamp,
    /// A mapped entity, by entity name.
    Entity(String),
    /// A multi-column value type, by component name.
    Component(String),
}

impl SemanticType {
    /// Parse a mapping type name (`integer`, `string`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "integer" | "int" | "long" | "bigint" => Some(Self::Integer),
            "double" | "float" | "decimal" | "real" => Some(Self::Double),
            "string" | "text" | "varchar" => Some(Self::String),
            "boolean" | "bool" => Some(Self::Boolean),
            "timestamp" | "datetime" => Some(Self::Timestamp),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Double)
    }

    /// Whether a bound value can be sent for a placeholder of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Integer, Value::Int(_)) => true,
            (Self::Double, Value::Int(_) | Value::Float(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Timestamp, Value::Timestamp(_) | Value::String(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemanticType::Boolean => write!(f, "boolean"),
            SemanticType::Integer => write!(f, "integer"),
            SemanticType::Double => write!(f, "double"),
            SemanticType::String => write!(f, "string"),
            SemanticType::Timestamp => write!(f, "timestamp"),
            SemanticType::Entity(name) => write!(f, "entity({})", name),
            SemanticType::Component(name) => write!(f, "component({})", name),
        }
    }
}

/// A scalar value, either bound as a parameter or read from a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Short name of the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "double",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A value supplied for a query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Single(Value),
    /// Expanded to one placeholder per element; only valid in `in (...)`.
    List(Vec<Value>),
}

impl ParamValue {
    pub fn values(&self) -> &[Value] {
        match self {
            ParamValue::Single(v) => std::slice::from_ref(v),
            ParamValue::List(vs) => vs,
        }
    }
}

macro_rules! single_param_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ParamValue {
                fn from(v: $ty) -> Self {
                    ParamValue::Single(v.into())
                }
            }
        )*
    };
}

single_param_from!(Value, bool, i32, i64, f64, &str, String, NaiveDateTime);

impl<T: Into<Value>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        ParamValue::List(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_from() {
        assert_eq!(Value::from(42i32), Value::Int(42));
        assert_eq!(Value::from("x"), Value::String("x".into()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(ParamValue::from(3.5), ParamValue::Single(Value::Float(3.5)));
        assert_eq!(
            ParamValue::from(vec![1i64, 2]),
            ParamValue::List(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_type_names() {
        assert_eq!(SemanticType::from_name("Long"), Some(SemanticType::Integer));
        assert_eq!(SemanticType::from_name("text"), Some(SemanticType::String));
        assert_eq!(SemanticType::from_name("blob"), None);
    }

    #[test]
    fn test_accepts() {
        assert!(SemanticType::Double.accepts(&Value::Int(1)));
        assert!(!SemanticType::Integer.accepts(&Value::String("1".into())));
        assert!(SemanticType::Boolean.accepts(&Value::Null));
    }
}
