use serde::{Deserialize, Serialize};
use std::fmt;

/// Attribute name (e.g. "Power", "Input")
pub type Attribute = String;

/// Connection epoch, incremented on every successful connect
pub type Epoch = u64;

/// Correlation token carried by protocols that tag their responses
pub type Token = u32;

/// Value of a controllable attribute
///
/// Booleans are switch states and display as `On` / `Off`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(true) => f.write_str("On"),
            Value::Bool(false) => f.write_str("Off"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Externally visible state of an attribute, derived from desired and raw
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Composite {
    /// Device reports what was asked for (or nothing was asked for)
    Settled(Value),
    /// Device has not (yet) reached the desired value
    Partially(Value),
}

impl Composite {
    /// The value carried, regardless of whether it is settled
    pub fn value(&self) -> &Value {
        match self {
            Composite::Settled(v) | Composite::Partially(v) => v,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Composite::Settled(_))
    }
}

impl fmt::Display for Composite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Composite::Settled(v) => write!(f, "{}", v),
            Composite::Partially(v) => write!(f, "Partially {}", v),
        }
    }
}

/// A single attribute value reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub attribute: Attribute,
    pub value: Value,
}

impl Observation {
    pub fn new(attribute: impl Into<Attribute>, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }
}

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    TimedOut,
}

/// Operator-facing severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StatusLevel {
    Ok = 0,
    Warning = 1,
    Critical = 2,
}

impl From<StatusLevel> for u8 {
    fn from(level: StatusLevel) -> Self {
        level as u8
    }
}

impl TryFrom<u8> for StatusLevel {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0 => Ok(StatusLevel::Ok),
            1 => Ok(StatusLevel::Warning),
            2 => Ok(StatusLevel::Critical),
            other => Err(format!("invalid status level {}", other)),
        }
    }
}

/// Device status as shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub level: StatusLevel,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            level: StatusLevel::Ok,
            message: "OK".to_string(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Warning,
            message: message.into(),
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Critical,
            message: message.into(),
        }
    }
}
