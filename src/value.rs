// SPDX-License-Identifier: MIT

//! The dynamic value model shared by every [Codec](crate::codec::Codec).
//!
//! Packing consumes a [Value], parsing produces one. Structured codecs
//! produce [Value::Map] (ordered, keyed by field name) or [Value::List]
//! (positional).

use std::fmt;

/// A decoded (or to-be-encoded) value.
///
/// Integers use [Value::Integer], the host's exact integer type. Unsigned
/// 64-bit quantities above [i64::MAX] can only be represented with
/// [Value::Wide], see [Codec::wide_uint](crate::codec::Codec::wide_uint).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Wide(u64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    /// Named fields in declaration order.
    Map(Vec<(String, Value)>),
    List(Vec<Value>),
}

impl Value {
    /// An empty [Value::Map].
    pub fn map() -> Value {
        Value::Map(Vec::new())
    }

    /// Builder-style insertion for [Value::Map]. Replaces an existing
    /// entry of the same name. Has no effect on other variants.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Value {
        if let Value::Map(entries) = &mut self {
            let name = name.into();
            let value = value.into();
            match entries.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 = value,
                None => entries.push((name, value)),
            }
        }
        self
    }

    /// Look up a named field of a [Value::Map].
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Look up a positional element of a [Value::List].
    pub fn index(&self, index: usize) -> Option<&Value> {
        match self {
            Value::List(items) => items.get(index),
            _ => None,
        }
    }

    /// The value as an exact integer. Floats qualify only if they have
    /// no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Wide(v) => i64::try_from(*v).ok(),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => {
                if *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Wide(v) => Some(*v),
            other => other.as_i64().and_then(|v| u64::try_from(v).ok()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(v) => Some(*v as f64),
            Value::Wide(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn entries(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn items(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Wide(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bytes(b) => write!(f, "{b:02x?}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (name, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                write!(f, "}}")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, value) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "]")
            }
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Value {
                    Value::Integer(i64::from(v))
                }
            }
        )*
    };
}

impl_from_int!(u8, u16, u32, i8, i16, i32, i64);

impl From<u64> for Value {
    fn from(v: u64) -> Value {
        match i64::try_from(v) {
            Ok(v) => Value::Integer(v),
            Err(_) => Value::Wide(v),
        }
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Value {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Value {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Value {
        Value::List(items)
    }
}
