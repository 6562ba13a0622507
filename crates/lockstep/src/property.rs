//! Typed property access into the opaque runtime.
//!
//! Properties are addressed as `//<location>/<property>`. The runtime
//! resolves the location and performs the actual get/set; this module
//! only adds the typed value enum, bounded retry on transient
//! rejections (a location may refuse a write while an update cycle
//! holds its lock), and lenient numeric coercion matching how
//! control-system clients read scalars regardless of the stored
//! width.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How often a transient read/write rejection is retried before the
/// error is surfaced.
pub const ACCESS_RETRY_LIMIT: usize = 1000;

/// A property value as stored by a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum PropertyValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Text(String),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    /// Measurement trace; always single-precision.
    Spectrum(Vec<f32>),
    /// Four-integer record (status words, trigger configuration).
    Quad([i32; 4]),
}

impl PropertyValue {
    /// Human-readable type name for error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Text(_) => "text",
            Self::IntArray(_) => "int array",
            Self::LongArray(_) => "long array",
            Self::FloatArray(_) => "float array",
            Self::DoubleArray(_) => "double array",
            Self::Spectrum(_) => "spectrum",
            Self::Quad(_) => "quad",
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Int(v) => Some(i64::from(v)),
            Self::Long(v) => Some(v),
            Self::Float(v) => Some(v as i64),
            Self::Double(v) => Some(v as i64),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Int(v) => Some(f64::from(v)),
            Self::Long(v) => Some(v as f64),
            Self::Float(v) => Some(f64::from(v)),
            Self::Double(v) => Some(v),
            _ => None,
        }
    }

    fn numeric_elements(&self) -> Option<Vec<f64>> {
        match self {
            Self::IntArray(v) => Some(v.iter().map(|&x| f64::from(x)).collect()),
            Self::LongArray(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Self::FloatArray(v) | Self::Spectrum(v) => {
                Some(v.iter().map(|&x| f64::from(x)).collect())
            }
            Self::DoubleArray(v) => Some(v.clone()),
            Self::Quad(v) => Some(v.iter().map(|&x| f64::from(x)).collect()),
            _ => None,
        }
    }
}

/// Property access failure; the property name is embedded in every
/// message so a failing test points straight at the culprit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertyError {
    #[error("malformed property address `{name}` (expected //<location>/<property>)")]
    InvalidAddress { name: String },

    #[error("could not get location for property `{name}`")]
    LocationNotFound { name: String },

    #[error("error reading property `{name}`: {reason}")]
    ReadFailed { name: String, reason: String },

    #[error("error writing property `{name}`: {reason}")]
    WriteRejected { name: String, reason: String },

    #[error("property `{name}` holds {actual}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Raw by-name property access provided by the runtime.
pub trait PropertyAccess: Send + Sync {
    fn read_property(&self, name: &str) -> Result<PropertyValue, PropertyError>;
    fn write_property(&self, name: &str, value: PropertyValue) -> Result<(), PropertyError>;
}

/// Split a `//<location>/<property>` address.
pub fn parse_address(name: &str) -> Result<(&str, &str), PropertyError> {
    let invalid = || PropertyError::InvalidAddress {
        name: name.to_string(),
    };
    let rest = name.strip_prefix("//").ok_or_else(invalid)?;
    let (location, property) = rest.split_once('/').ok_or_else(invalid)?;
    if location.is_empty() || property.is_empty() {
        return Err(invalid());
    }
    Ok((location, property))
}

/// Typed accessor wrapper with bounded retry.
pub struct Properties<'a> {
    access: &'a dyn PropertyAccess,
}

impl<'a> Properties<'a> {
    #[must_use]
    pub fn new(access: &'a dyn PropertyAccess) -> Self {
        Self { access }
    }

    /// Read a raw value, retrying transient read failures.
    pub fn get(&self, name: &str) -> Result<PropertyValue, PropertyError> {
        parse_address(name)?;
        let mut last = None;
        for _ in 0..ACCESS_RETRY_LIMIT {
            match self.access.read_property(name) {
                Ok(value) => return Ok(value),
                Err(err @ PropertyError::ReadFailed { .. }) => last = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| PropertyError::ReadFailed {
            name: name.to_string(),
            reason: "retry limit exhausted".to_string(),
        }))
    }

    /// Write a value, retrying transient write rejections.
    pub fn set(&self, name: &str, value: PropertyValue) -> Result<(), PropertyError> {
        parse_address(name)?;
        let mut last = None;
        for _ in 0..ACCESS_RETRY_LIMIT {
            match self.access.write_property(name, value.clone()) {
                Ok(()) => return Ok(()),
                Err(err @ PropertyError::WriteRejected { .. }) => last = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| PropertyError::WriteRejected {
            name: name.to_string(),
            reason: "retry limit exhausted".to_string(),
        }))
    }

    pub fn get_i32(&self, name: &str) -> Result<i32, PropertyError> {
        self.scalar_i64(name).map(|v| v as i32)
    }

    pub fn get_i64(&self, name: &str) -> Result<i64, PropertyError> {
        self.scalar_i64(name)
    }

    pub fn get_f32(&self, name: &str) -> Result<f32, PropertyError> {
        self.scalar_f64(name).map(|v| v as f32)
    }

    pub fn get_f64(&self, name: &str) -> Result<f64, PropertyError> {
        self.scalar_f64(name)
    }

    pub fn get_string(&self, name: &str) -> Result<String, PropertyError> {
        let value = self.get(name)?;
        match value {
            PropertyValue::Text(s) => Ok(s),
            other => Err(type_mismatch(name, "text", &other)),
        }
    }

    pub fn get_i32_array(&self, name: &str) -> Result<Vec<i32>, PropertyError> {
        self.array_f64(name)
            .map(|v| v.into_iter().map(|x| x as i32).collect())
    }

    pub fn get_i64_array(&self, name: &str) -> Result<Vec<i64>, PropertyError> {
        self.array_f64(name)
            .map(|v| v.into_iter().map(|x| x as i64).collect())
    }

    pub fn get_f32_array(&self, name: &str) -> Result<Vec<f32>, PropertyError> {
        self.array_f64(name)
            .map(|v| v.into_iter().map(|x| x as f32).collect())
    }

    pub fn get_f64_array(&self, name: &str) -> Result<Vec<f64>, PropertyError> {
        self.array_f64(name)
    }

    fn scalar_i64(&self, name: &str) -> Result<i64, PropertyError> {
        let value = self.get(name)?;
        value
            .as_i64()
            .ok_or_else(|| type_mismatch(name, "numeric scalar", &value))
    }

    fn scalar_f64(&self, name: &str) -> Result<f64, PropertyError> {
        let value = self.get(name)?;
        value
            .as_f64()
            .ok_or_else(|| type_mismatch(name, "numeric scalar", &value))
    }

    fn array_f64(&self, name: &str) -> Result<Vec<f64>, PropertyError> {
        let value = self.get(name)?;
        value
            .numeric_elements()
            .ok_or_else(|| type_mismatch(name, "numeric array", &value))
    }
}

fn type_mismatch(name: &str, expected: &'static str, actual: &PropertyValue) -> PropertyError {
    PropertyError::TypeMismatch {
        name: name.to_string(),
        expected,
        actual: actual.type_name(),
    }
}
