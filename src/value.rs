// src/value.rs - Tag value and native data type system
use crate::error::{PlcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value held by a tag
///
/// Integer types (including BOOL, normalized to 0/1) land in `Int`; REAL lands
/// in `Float`, already rounded to four fractional digits.
///
/// # Examples
///
/// ```rust
/// use vesta::Value;
///
/// assert_eq!(Value::Int(3).as_float(), 3.0);
/// assert_eq!(Value::Float(2.5).to_string(), "2.5");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Integer value (BOOL, SINT, INT, DINT)
    Int(i64),
    /// Floating-point value (REAL)
    Float(f64),
}

impl Value {
    /// Numeric view used for comparisons against configured expectations
    pub fn as_float(&self) -> f64 {
        match self {
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
        }
    }

    /// Integer view, truncating floats
    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(i) => *i,
            Value::Float(f) => *f as i64,
        }
    }

    /// Single bit of the integer view, as 0/1
    pub fn bit(&self, bit: u8) -> Value {
        let shift = u32::from(bit).min(63);
        Value::Int((self.as_int() >> shift) & 1)
    }

    /// Compare against a configured expectation
    pub fn matches(&self, expected: f64) -> bool {
        self.as_float() == expected
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Round a decoded REAL to exactly four fractional digits
pub fn round_real(raw: f64) -> f64 {
    (raw * 10_000.0).round() / 10_000.0
}

/// Native controller data types supported by the tester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Bool,
    Sint,
    Int,
    Dint,
    Real,
}

impl DataType {
    /// CIP elementary type code
    pub fn code(&self) -> u16 {
        match self {
            DataType::Bool => 0xC1,
            DataType::Sint => 0xC2,
            DataType::Int => 0xC3,
            DataType::Dint => 0xC4,
            DataType::Real => 0xCA,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0xC1 => Some(DataType::Bool),
            0xC2 => Some(DataType::Sint),
            0xC3 => Some(DataType::Int),
            0xC4 => Some(DataType::Dint),
            0xCA => Some(DataType::Real),
            _ => None,
        }
    }

    /// Size on the wire in bytes
    pub fn size(&self) -> usize {
        match self {
            DataType::Bool | DataType::Sint => 1,
            DataType::Int => 2,
            DataType::Dint | DataType::Real => 4,
        }
    }

    /// Number of addressable bits
    pub fn bits(&self) -> u32 {
        match self {
            DataType::Bool => 1,
            DataType::Sint => 8,
            DataType::Int => 16,
            DataType::Dint | DataType::Real => 32,
        }
    }

    /// Validate a requested bit position.
    ///
    /// Only positions strictly greater than the width are rejected, so a
    /// position equal to the width passes.
    pub fn check_bit(&self, bit: u8) -> Result<()> {
        if u32::from(bit) > self.bits() {
            return Err(PlcError::Validation(format!(
                "Requested bit {} is out of range for {} type",
                bit, self
            )));
        }
        Ok(())
    }

    /// Turn a configured number into a value of this type
    pub fn coerce(&self, raw: f64) -> Value {
        match self {
            DataType::Real => Value::Float(raw),
            DataType::Bool => Value::Int(i64::from(raw != 0.0)),
            DataType::Sint => Value::Int(raw as i8 as i64),
            DataType::Int => Value::Int(raw as i16 as i64),
            DataType::Dint => Value::Int(raw as i32 as i64),
        }
    }

    /// Little-endian payload for an atomic write
    pub fn encode(&self, value: &Value) -> Vec<u8> {
        match self {
            DataType::Bool => vec![if value.as_int() != 0 { 0xFF } else { 0x00 }],
            DataType::Sint => (value.as_int() as i8).to_le_bytes().to_vec(),
            DataType::Int => (value.as_int() as i16).to_le_bytes().to_vec(),
            DataType::Dint => (value.as_int() as i32).to_le_bytes().to_vec(),
            DataType::Real => (value.as_float() as f32).to_le_bytes().to_vec(),
        }
    }

    /// Decode a little-endian payload read from the controller
    pub fn decode(&self, data: &[u8]) -> Result<Value> {
        if data.len() < self.size() {
            return Err(PlcError::Validation(format!(
                "{} payload needs {} bytes, got {}",
                self,
                self.size(),
                data.len()
            )));
        }
        let value = match self {
            DataType::Bool => Value::Int(i64::from(data[0] != 0)),
            DataType::Sint => Value::Int(i64::from(data[0] as i8)),
            DataType::Int => Value::Int(i64::from(i16::from_le_bytes([data[0], data[1]]))),
            DataType::Dint => Value::Int(i64::from(i32::from_le_bytes([
                data[0], data[1], data[2], data[3],
            ]))),
            DataType::Real => {
                let raw = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                Value::Float(round_real(f64::from(raw)))
            }
        };
        Ok(value)
    }

    /// OR/AND mask pair for a masked write of one bit, sized to the type width
    pub fn bit_masks(&self, bit: u8, set: bool) -> (Vec<u8>, Vec<u8>) {
        let size = self.size();
        let flag: u64 = 1u64.checked_shl(u32::from(bit)).unwrap_or(0);
        let (or_mask, and_mask) = if set { (flag, u64::MAX) } else { (0, !flag) };
        (
            or_mask.to_le_bytes()[..size].to_vec(),
            and_mask.to_le_bytes()[..size].to_vec(),
        )
    }

    /// Apply a bit write to a whole value locally, mirroring what the
    /// controller does with the mask pair.
    pub fn apply_bit(&self, whole: &Value, bit: u8, set: bool) -> Value {
        let flag: i64 = 1i64.checked_shl(u32::from(bit)).unwrap_or(0);
        let raw = if set {
            whole.as_int() | flag
        } else {
            whole.as_int() & !flag
        };
        self.coerce(raw as f64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "BOOL",
            DataType::Sint => "SINT",
            DataType::Int => "INT",
            DataType::Dint => "DINT",
            DataType::Real => "REAL",
        };
        f.write_str(name)
    }
}
