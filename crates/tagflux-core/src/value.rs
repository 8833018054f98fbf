use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw value read from a device, before any classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagValue {
    Float(f64),
    Integer(i64),
    Bool(bool),
    Text(String),
}

impl TagValue {
    /// Numeric view of the value. Booleans map to 0/1, text is parsed.
    /// `None` means the value cannot participate in alarm or outlier math.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Float(v) if v.is_finite() => Some(*v),
            TagValue::Float(_) => None,
            TagValue::Integer(v) => Some(*v as f64),
            TagValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            TagValue::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Float(v) => write!(f, "{}", v),
            TagValue::Integer(v) => write!(f, "{}", v),
            TagValue::Bool(b) => write!(f, "{}", b),
            TagValue::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Good,
    Bad,
}

/// One acquired sample for one tag. Produced per read or per change
/// notification, consumed by the analytics engine, then forwarded to
/// event consumers. Transient; the latest values live in `TagRuntime`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquiredValue {
    pub tag: String,
    pub value: Option<TagValue>,
    pub timestamp_us: u64,
    pub quality: Quality,
    pub error: Option<String>,
}

impl AcquiredValue {
    pub fn good(tag: impl Into<String>, value: TagValue, timestamp_us: u64) -> Self {
        Self {
            tag: tag.into(),
            value: Some(value),
            timestamp_us,
            quality: Quality::Good,
            error: None,
        }
    }

    pub fn bad(tag: impl Into<String>, timestamp_us: u64, error: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            value: None,
            timestamp_us,
            quality: Quality::Bad,
            error: Some(error.into()),
        }
    }
}
