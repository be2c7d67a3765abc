//! Typed key/value dictionary used for KDF parameters and public custom data.

use passvault_common::{Error, Result};

use crate::cursor::ByteCursor;

/// Dictionary format version written by this codec.
pub const DICTIONARY_VERSION: u16 = 0x0100;

const CRITICAL_MASK: u16 = 0xFF00;

const TYPE_END: u8 = 0x00;
const TYPE_U32: u8 = 0x04;
const TYPE_U64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_I32: u8 = 0x0C;
const TYPE_I64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTES: u8 = 0x42;

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantValue {
    U32(u32),
    U64(u64),
    Bool(bool),
    I32(i32),
    I64(i64),
    String(String),
    Bytes(Vec<u8>),
}

/// Ordered dictionary of typed values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantDictionary {
    items: Vec<(String, VariantValue)>,
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedHeader(msg.into())
}

impl VariantDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value, keeping first-insertion order.
    pub fn set(&mut self, name: &str, value: VariantValue) {
        match self.items.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.items.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&VariantValue> {
        self.items.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        match self.get(name)? {
            VariantValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            VariantValue::U64(v) => Some(*v),
            VariantValue::U32(v) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        match self.get(name)? {
            VariantValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Parse a serialized dictionary.
    ///
    /// # Errors
    /// - `MalformedHeader` on truncation, negative lengths, bad value widths,
    ///   unknown value types or a newer major dictionary version
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(data);
        let truncated = || malformed("Truncated variant dictionary");

        let version = cursor.u16().ok_or_else(truncated)?;
        if version & CRITICAL_MASK > DICTIONARY_VERSION & CRITICAL_MASK {
            return Err(malformed(format!(
                "Unsupported variant dictionary version {:#06x}",
                version
            )));
        }

        let mut dict = Self::new();
        loop {
            let kind = cursor.u8().ok_or_else(truncated)?;
            if kind == TYPE_END {
                break;
            }

            let name_len = read_len(&mut cursor)?;
            let name = cursor.take(name_len).ok_or_else(truncated)?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| malformed("Variant dictionary key is not UTF-8"))?;
            let value_len = read_len(&mut cursor)?;
            let raw = cursor.take(value_len).ok_or_else(truncated)?;

            let value = match kind {
                TYPE_U32 => VariantValue::U32(u32::from_le_bytes(fixed(raw, &name)?)),
                TYPE_U64 => VariantValue::U64(u64::from_le_bytes(fixed(raw, &name)?)),
                TYPE_BOOL => VariantValue::Bool(fixed::<1>(raw, &name)?[0] != 0),
                TYPE_I32 => VariantValue::I32(i32::from_le_bytes(fixed(raw, &name)?)),
                TYPE_I64 => VariantValue::I64(i64::from_le_bytes(fixed(raw, &name)?)),
                TYPE_STRING => VariantValue::String(
                    String::from_utf8(raw.to_vec())
                        .map_err(|_| malformed(format!("Value of '{}' is not UTF-8", name)))?,
                ),
                TYPE_BYTES => VariantValue::Bytes(raw.to_vec()),
                other => {
                    return Err(malformed(format!(
                        "Unknown variant type {:#04x} for '{}'",
                        other, name
                    )))
                }
            };
            dict.items.push((name, value));
        }
        Ok(dict)
    }

    /// Serialize, terminator included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&DICTIONARY_VERSION.to_le_bytes());
        for (name, value) in &self.items {
            let (kind, raw) = match value {
                VariantValue::U32(v) => (TYPE_U32, v.to_le_bytes().to_vec()),
                VariantValue::U64(v) => (TYPE_U64, v.to_le_bytes().to_vec()),
                VariantValue::Bool(v) => (TYPE_BOOL, vec![*v as u8]),
                VariantValue::I32(v) => (TYPE_I32, v.to_le_bytes().to_vec()),
                VariantValue::I64(v) => (TYPE_I64, v.to_le_bytes().to_vec()),
                VariantValue::String(v) => (TYPE_STRING, v.as_bytes().to_vec()),
                VariantValue::Bytes(v) => (TYPE_BYTES, v.clone()),
            };
            out.push(kind);
            out.extend_from_slice(&(name.len() as i32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(raw.len() as i32).to_le_bytes());
            out.extend_from_slice(&raw);
        }
        out.push(TYPE_END);
        out
    }
}

fn read_len(cursor: &mut ByteCursor<'_>) -> Result<usize> {
    let len = cursor
        .i32()
        .ok_or_else(|| malformed("Truncated variant dictionary"))?;
    usize::try_from(len).map_err(|_| malformed("Negative length in variant dictionary"))
}

fn fixed<const N: usize>(raw: &[u8], name: &str) -> Result<[u8; N]> {
    raw.try_into()
        .map_err(|_| malformed(format!("Value of '{}' has wrong width {}", name, raw.len())))
}
