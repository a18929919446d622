//! Scalar value types and their wire representation
//!
//! Every numeric endpoint declares one of the [`ValueType`]s. Values travel
//! little-endian with the exact width of their type; [`EndpointValue`] keeps
//! them in a fixed 8-byte buffer tagged with the type so that consumers can
//! compare, display and re-encode them without knowing the type statically.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest encoded width of any scalar type
pub const MAX_VALUE_WIDTH: usize = 8;

/// Scalar types an endpoint can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Bool,
    Float,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int32,
}

impl ValueType {
    /// All supported scalar types
    pub const ALL: [ValueType; 7] = [
        ValueType::Bool,
        ValueType::Float,
        ValueType::Uint8,
        ValueType::Uint16,
        ValueType::Uint32,
        ValueType::Uint64,
        ValueType::Int32,
    ];

    /// Encoded width in bytes
    pub fn size(self) -> usize {
        match self {
            ValueType::Bool | ValueType::Uint8 => 1,
            ValueType::Uint16 => 2,
            ValueType::Float | ValueType::Uint32 | ValueType::Int32 => 4,
            ValueType::Uint64 => 8,
        }
    }

    /// Name used by the device JSON schema
    pub fn type_name(self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Float => "float",
            ValueType::Uint8 => "uint8",
            ValueType::Uint16 => "uint16",
            ValueType::Uint32 => "uint32",
            ValueType::Uint64 => "uint64",
            ValueType::Int32 => "int32",
        }
    }

    /// Look up a schema type name
    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.type_name() == name)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl FromStr for ValueType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_type_name(s)
            .ok_or_else(|| ProtocolError::MalformedSchema(format!("unsupported type '{}'", s)))
    }
}

/// Rust types that map one-to-one onto a [`ValueType`]
///
/// Decoding is width-checked: a buffer whose length differs from
/// `VALUE_TYPE.size()` is rejected rather than truncated or padded.
pub trait Scalar: Copy + Sized + fmt::Debug {
    /// Declared schema type this Rust type corresponds to
    const VALUE_TYPE: ValueType;

    /// Little-endian encoding, exactly `VALUE_TYPE.size()` bytes long
    fn to_le_vec(self) -> Vec<u8>;

    /// Width-checked little-endian decoding
    fn from_le_slice(bytes: &[u8]) -> Result<Self>;
}

fn check_width(value_type: ValueType, bytes: &[u8]) -> Result<()> {
    if bytes.len() != value_type.size() {
        return Err(ProtocolError::InvalidWidth {
            value_type,
            expected: value_type.size(),
            actual: bytes.len(),
        });
    }
    Ok(())
}

macro_rules! impl_scalar {
    ($ty:ty, $variant:ident) => {
        impl Scalar for $ty {
            const VALUE_TYPE: ValueType = ValueType::$variant;

            fn to_le_vec(self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }

            fn from_le_slice(bytes: &[u8]) -> Result<Self> {
                check_width(Self::VALUE_TYPE, bytes)?;
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(raw))
            }
        }
    };
}

impl_scalar!(f32, Float);
impl_scalar!(u8, Uint8);
impl_scalar!(u16, Uint16);
impl_scalar!(u32, Uint32);
impl_scalar!(u64, Uint64);
impl_scalar!(i32, Int32);

impl Scalar for bool {
    const VALUE_TYPE: ValueType = ValueType::Bool;

    fn to_le_vec(self) -> Vec<u8> {
        vec![u8::from(self)]
    }

    fn from_le_slice(bytes: &[u8]) -> Result<Self> {
        check_width(Self::VALUE_TYPE, bytes)?;
        Ok(bytes[0] != 0)
    }
}

/// Type-tagged endpoint value
///
/// A value without a tag is *invalid*: it stands for "could not be read" and
/// carries no meaningful bytes. Unused trailing bytes of the buffer are always
/// zero, so equality on tag and buffer is equality on the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointValue {
    value_type: Option<ValueType>,
    raw: [u8; MAX_VALUE_WIDTH],
}

impl Default for EndpointValue {
    fn default() -> Self {
        Self::invalid()
    }
}

impl EndpointValue {
    /// The unreadable value
    pub const fn invalid() -> Self {
        Self {
            value_type: None,
            raw: [0; MAX_VALUE_WIDTH],
        }
    }

    /// Wrap a typed scalar
    pub fn new<T: Scalar>(value: T) -> Self {
        let bytes = value.to_le_vec();
        let mut raw = [0u8; MAX_VALUE_WIDTH];
        raw[..bytes.len()].copy_from_slice(&bytes);
        Self {
            value_type: Some(T::VALUE_TYPE),
            raw,
        }
    }

    /// Zero value of the given type
    pub fn zero(value_type: ValueType) -> Self {
        Self {
            value_type: Some(value_type),
            raw: [0; MAX_VALUE_WIDTH],
        }
    }

    /// Decode little-endian wire bytes; the length must match the type width
    pub fn from_bytes(value_type: ValueType, bytes: &[u8]) -> Result<Self> {
        check_width(value_type, bytes)?;
        let mut raw = [0u8; MAX_VALUE_WIDTH];
        raw[..bytes.len()].copy_from_slice(bytes);
        if value_type == ValueType::Bool {
            raw[0] = u8::from(raw[0] != 0);
        }
        Ok(Self {
            value_type: Some(value_type),
            raw,
        })
    }

    /// Parse human input as a value of `value_type`
    ///
    /// Integers accept decimal or `0x`-prefixed hex. Booleans accept
    /// `true`/`false` and `1`/`0`.
    pub fn from_string(value_type: ValueType, text: &str) -> Result<Self> {
        let text = text.trim();
        let parse_error = || ProtocolError::ParseValue {
            value_type,
            text: text.to_string(),
        };

        let value = match value_type {
            ValueType::Bool => match text.to_ascii_lowercase().as_str() {
                "true" | "1" => Self::new(true),
                "false" | "0" => Self::new(false),
                _ => return Err(parse_error()),
            },
            ValueType::Float => Self::new(text.parse::<f32>().map_err(|_| parse_error())?),
            ValueType::Uint8 => Self::new(parse_narrow::<u8>(text).ok_or_else(parse_error)?),
            ValueType::Uint16 => Self::new(parse_narrow::<u16>(text).ok_or_else(parse_error)?),
            ValueType::Uint32 => Self::new(parse_narrow::<u32>(text).ok_or_else(parse_error)?),
            ValueType::Uint64 => Self::new(parse_unsigned(text).ok_or_else(parse_error)?),
            ValueType::Int32 => Self::new(parse_signed(text).ok_or_else(parse_error)?),
        };
        Ok(value)
    }

    /// Declared type, `None` for invalid values
    pub fn value_type(&self) -> Option<ValueType> {
        self.value_type
    }

    /// Whether the value holds readable content
    pub fn is_valid(&self) -> bool {
        self.value_type.is_some()
    }

    /// Wire bytes of the value; empty for invalid values
    pub fn to_bytes(&self) -> &[u8] {
        match self.value_type {
            Some(value_type) => &self.raw[..value_type.size()],
            None => &[],
        }
    }

    /// Typed access; the requested type must match the tag exactly
    pub fn get<T: Scalar>(&self) -> Result<T> {
        match self.value_type {
            Some(value_type) if value_type == T::VALUE_TYPE => T::from_le_slice(self.to_bytes()),
            Some(value_type) => Err(ProtocolError::TypeMismatch {
                expected: T::VALUE_TYPE,
                found: value_type.to_string(),
            }),
            None => Err(ProtocolError::TypeMismatch {
                expected: T::VALUE_TYPE,
                found: "invalid".to_string(),
            }),
        }
    }

    /// Integer view of the value, used for error bitfields and enum lookups
    ///
    /// Floats are truncated toward zero; invalid values yield `None`.
    pub fn as_i64(&self) -> Option<i64> {
        let value_type = self.value_type?;
        let bytes = self.to_bytes();
        let value = match value_type {
            ValueType::Bool => i64::from(bytes[0]),
            ValueType::Float => f32::from_le_slice(bytes).ok()? as i64,
            ValueType::Uint8 => i64::from(bytes[0]),
            ValueType::Uint16 => i64::from(u16::from_le_slice(bytes).ok()?),
            ValueType::Uint32 => i64::from(u32::from_le_slice(bytes).ok()?),
            ValueType::Uint64 => u64::from_le_slice(bytes).ok()? as i64,
            ValueType::Int32 => i64::from(i32::from_le_slice(bytes).ok()?),
        };
        Some(value)
    }
}

impl fmt::Display for EndpointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(value_type) = self.value_type else {
            return f.write_str("<invalid>");
        };
        let bytes = self.to_bytes();
        let result = match value_type {
            ValueType::Bool => bool::from_le_slice(bytes).map(|v| v.to_string()),
            ValueType::Float => f32::from_le_slice(bytes).map(|v| v.to_string()),
            ValueType::Uint8 => u8::from_le_slice(bytes).map(|v| v.to_string()),
            ValueType::Uint16 => u16::from_le_slice(bytes).map(|v| v.to_string()),
            ValueType::Uint32 => u32::from_le_slice(bytes).map(|v| v.to_string()),
            ValueType::Uint64 => u64::from_le_slice(bytes).map(|v| v.to_string()),
            ValueType::Int32 => i32::from_le_slice(bytes).map(|v| v.to_string()),
        };
        match result {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("<invalid>"),
        }
    }
}

fn parse_unsigned(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_narrow<T: TryFrom<u64>>(text: &str) -> Option<T> {
    T::try_from(parse_unsigned(text)?).ok()
}

fn parse_signed(text: &str) -> Option<i32> {
    let (negative, magnitude) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = i64::try_from(parse_unsigned(magnitude)?).ok()?;
    i32::try_from(if negative { -value } else { value }).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_sizes() {
        assert_eq!(ValueType::Bool.size(), 1);
        assert_eq!(ValueType::Uint16.size(), 2);
        assert_eq!(ValueType::Float.size(), 4);
        assert_eq!(ValueType::Int32.size(), 4);
        assert_eq!(ValueType::Uint64.size(), 8);
    }

    #[test]
    fn test_type_names() {
        for value_type in ValueType::ALL {
            assert_eq!(ValueType::from_type_name(value_type.type_name()), Some(value_type));
        }
        assert_eq!(ValueType::from_type_name("int64"), None);
        assert!("function".parse::<ValueType>().is_err());
    }

    #[test]
    fn test_float_decodes_ieee754() {
        let value = EndpointValue::from_bytes(ValueType::Float, &24.0f32.to_le_bytes()).unwrap();
        assert_eq!(value.get::<f32>().unwrap(), 24.0);
        assert_eq!(value.to_bytes(), &[0x00, 0x00, 0xc0, 0x41]);
    }

    #[test]
    fn test_width_is_checked() {
        let err = EndpointValue::from_bytes(ValueType::Uint32, &[1, 2]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidWidth {
                expected: 4,
                actual: 2,
                ..
            }
        ));
        assert!(u16::from_le_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_get_rejects_other_types() {
        let value = EndpointValue::new(7u8);
        assert_eq!(value.get::<u8>().unwrap(), 7);
        assert!(matches!(
            value.get::<u32>(),
            Err(ProtocolError::TypeMismatch { .. })
        ));
        assert!(EndpointValue::invalid().get::<u8>().is_err());
    }

    #[test]
    fn test_invalid_value() {
        let value = EndpointValue::invalid();
        assert!(!value.is_valid());
        assert!(value.to_bytes().is_empty());
        assert_eq!(value.to_string(), "<invalid>");
        assert_eq!(value.as_i64(), None);
        assert_eq!(EndpointValue::default(), value);
    }

    #[test]
    fn test_equality_compares_tag_and_bytes() {
        assert_eq!(EndpointValue::new(1u8), EndpointValue::new(1u8));
        assert_ne!(EndpointValue::new(1u8), EndpointValue::new(1u16));
        assert_ne!(EndpointValue::new(true), EndpointValue::new(1u8));
        assert_ne!(EndpointValue::zero(ValueType::Int32), EndpointValue::invalid());
    }

    #[test]
    fn test_from_string() {
        assert_eq!(
            EndpointValue::from_string(ValueType::Uint8, "8").unwrap(),
            EndpointValue::new(8u8)
        );
        assert_eq!(
            EndpointValue::from_string(ValueType::Uint32, "0x800").unwrap(),
            EndpointValue::new(0x800u32)
        );
        assert_eq!(
            EndpointValue::from_string(ValueType::Int32, "-12").unwrap(),
            EndpointValue::new(-12i32)
        );
        assert_eq!(
            EndpointValue::from_string(ValueType::Bool, "TRUE").unwrap(),
            EndpointValue::new(true)
        );
        assert!(EndpointValue::from_string(ValueType::Uint8, "256").is_err());
        assert!(EndpointValue::from_string(ValueType::Float, "volts").is_err());
        assert!(EndpointValue::from_string(ValueType::Int32, "-0x80000001").is_err());
    }

    #[test]
    fn test_bool_normalizes_nonzero_bytes() {
        let value = EndpointValue::from_bytes(ValueType::Bool, &[0x05]).unwrap();
        assert_eq!(value, EndpointValue::new(true));
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(EndpointValue::new(-3i32).as_i64(), Some(-3));
        assert_eq!(EndpointValue::new(0x1000u32).as_i64(), Some(0x1000));
        assert_eq!(EndpointValue::new(2.9f32).as_i64(), Some(2));
        assert_eq!(EndpointValue::new(true).as_i64(), Some(1));
    }
}
