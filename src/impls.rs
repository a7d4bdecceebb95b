use std::fmt;

use chrono::NaiveDateTime;

use crate::error::ProtocolError;
use crate::types::{Binary, DateTime};
use crate::value::{Map, Value};
use crate::{Event, Fault};

impl Event {
    pub fn open<S: Into<String>>(name: S) -> Self {
        Self::Open(name.into())
    }

    pub fn close<S: Into<String>>(name: S) -> Self {
        Self::Close(name.into())
    }

    pub fn text<S: Into<String>>(chars: S) -> Self {
        Self::Text(chars.into())
    }

    /// Text consisting only of whitespace, which carries no meaning between
    /// elements.
    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Text(t) if t.trim().is_empty())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(name) => write!(f, "open({name:?})"),
            Self::Close(name) => write!(f, "close({name:?})"),
            Self::Text(chars) => write!(f, "text({chars:?})"),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for Fault {}

impl From<Fault> for Value {
    fn from(fault: Fault) -> Self {
        let mut members = Map::new();
        members.insert("faultCode".to_string(), Value::Int(fault.code));
        members.insert("faultString".to_string(), Value::String(fault.message));
        Value::Struct(members)
    }
}

impl TryFrom<&Value> for Fault {
    type Error = ProtocolError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let map = value
            .as_struct()
            .ok_or_else(|| ProtocolError::InvalidFault(format!("expected struct, found {}", value.kind())))?;

        let code = map
            .get("faultCode")
            .ok_or_else(|| ProtocolError::InvalidFault("missing faultCode".into()))?
            .as_i64()
            .ok_or_else(|| ProtocolError::InvalidFault("faultCode is not an integer".into()))?;

        let message = map
            .get("faultString")
            .ok_or_else(|| ProtocolError::InvalidFault("missing faultString".into()))?
            .as_str()
            .ok_or_else(|| ProtocolError::InvalidFault("faultString is not a string".into()))?
            .to_string();

        Ok(Self { code, message })
    }
}

impl TryFrom<Value> for Fault {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::try_from(&value)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::DateTime(dt)
    }
}

impl From<DateTime> for Value {
    fn from(dt: DateTime) -> Self {
        Value::DateTime(dt.0)
    }
}

impl From<Binary> for Value {
    fn from(b: Binary) -> Self {
        Value::Binary(b.0)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Map> for Value {
    fn from(members: Map) -> Self {
        Value::Struct(members)
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Value::Array(iter.into_iter().collect())
    }
}

impl FromIterator<(String, Value)> for Value {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Value::Struct(iter.into_iter().collect())
    }
}

#[cfg(feature = "json")]
mod json {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    use crate::types::DATETIME_FORMAT;
    use crate::value::Value;

    impl From<serde_json::Value> for Value {
        fn from(value: serde_json::Value) -> Self {
            match value {
                serde_json::Value::Null => Value::Nil,
                serde_json::Value::Bool(b) => Value::Bool(b),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => Value::Int(i),
                    None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
                },
                serde_json::Value::String(s) => Value::String(s),
                serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from).collect()),
                serde_json::Value::Object(o) => {
                    Value::Struct(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
                }
            }
        }
    }

    /// Lossy where JSON has no counterpart: binary becomes base64 text,
    /// timestamps become iso8601 text and non-finite doubles become null.
    impl From<Value> for serde_json::Value {
        fn from(value: Value) -> Self {
            match value {
                Value::Nil => serde_json::Value::Null,
                Value::Bool(b) => serde_json::Value::Bool(b),
                Value::Int(n) => serde_json::Value::Number(n.into()),
                Value::Double(d) => serde_json::Number::from_f64(d)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
                Value::String(s) => serde_json::Value::String(s),
                Value::Binary(b) => serde_json::Value::String(STANDARD.encode(b)),
                Value::DateTime(dt) => {
                    serde_json::Value::String(dt.format(DATETIME_FORMAT).to_string())
                }
                Value::Array(a) => {
                    serde_json::Value::Array(a.into_iter().map(serde_json::Value::from).collect())
                }
                Value::Struct(m) => serde_json::Value::Object(
                    m.into_iter()
                        .map(|(k, v)| (k, serde_json::Value::from(v)))
                        .collect(),
                ),
            }
        }
    }

}
