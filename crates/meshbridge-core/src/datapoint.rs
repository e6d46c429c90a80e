//! Datapoint codec for the proprietary compact protocol.
//!
//! Wire layout of a single datapoint:
//!
//! ```text
//! [id: u8][type tag: u8][len: u16 BE][payload: len bytes]
//! ```
//!
//! | Tag | Type   | Payload                          |
//! |-----|--------|----------------------------------|
//! | 0   | raw    | opaque bytes, preserved verbatim |
//! | 1   | bool   | 1 byte, 0 or 1                   |
//! | 2   | value  | i32, big-endian                  |
//! | 3   | string | UTF-8                            |
//! | 4   | enum   | 1 byte index                     |
//! | 5   | bitmap | 1, 2 or 4 bytes, big-endian      |
//!
//! Decoding never rejects an unknown tag or a payload whose size does not
//! fit its tag; those come back as [`Decoded::Unrecognized`] with the
//! original bytes so they can still be logged, learned from and forwarded.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::AttributeValue;

/// Size of the per-datapoint header.
pub const HEADER_LEN: usize = 4;

/// Largest payload the `u16` length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Datapoint type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DatapointType {
    Raw = 0,
    Bool = 1,
    Value = 2,
    String = 3,
    Enum = 4,
    Bitmap = 5,
}

impl DatapointType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Raw),
            1 => Some(Self::Bool),
            2 => Some(Self::Value),
            3 => Some(Self::String),
            4 => Some(Self::Enum),
            5 => Some(Self::Bitmap),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Bool => "bool",
            Self::Value => "value",
            Self::String => "string",
            Self::Enum => "enum",
            Self::Bitmap => "bitmap",
        }
    }
}

impl fmt::Display for DatapointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed datapoint value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum DatapointValue {
    Raw(Vec<u8>),
    Bool(bool),
    Value(i32),
    String(String),
    Enum(u8),
    Bitmap(u32),
}

impl DatapointValue {
    pub fn data_type(&self) -> DatapointType {
        match self {
            Self::Raw(_) => DatapointType::Raw,
            Self::Bool(_) => DatapointType::Bool,
            Self::Value(_) => DatapointType::Value,
            Self::String(_) => DatapointType::String,
            Self::Enum(_) => DatapointType::Enum,
            Self::Bitmap(_) => DatapointType::Bitmap,
        }
    }

    /// Numeric view used by heuristics; raw and string payloads have none.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Bool(v) => Some(i64::from(*v)),
            Self::Value(v) => Some(i64::from(*v)),
            Self::Enum(v) => Some(i64::from(*v)),
            Self::Bitmap(v) => Some(i64::from(*v)),
            Self::Raw(_) | Self::String(_) => None,
        }
    }

    pub fn to_attribute_value(&self) -> AttributeValue {
        match self {
            Self::Raw(bytes) => AttributeValue::Binary(bytes.clone()),
            Self::Bool(v) => AttributeValue::Boolean(*v),
            Self::Value(v) => AttributeValue::Integer(i64::from(*v)),
            Self::String(v) => AttributeValue::String(v.clone()),
            Self::Enum(v) => AttributeValue::Integer(i64::from(*v)),
            Self::Bitmap(v) => AttributeValue::Integer(i64::from(*v)),
        }
    }

    fn payload(&self) -> Result<Vec<u8>, EncodingError> {
        let bytes = match self {
            Self::Raw(bytes) => {
                if bytes.len() > MAX_PAYLOAD_LEN {
                    return Err(EncodingError::PayloadTooLong { len: bytes.len() });
                }
                bytes.clone()
            }
            Self::Bool(v) => vec![u8::from(*v)],
            Self::Value(v) => v.to_be_bytes().to_vec(),
            Self::String(s) => {
                if s.len() > MAX_PAYLOAD_LEN {
                    return Err(EncodingError::StringTooLong { len: s.len() });
                }
                s.as_bytes().to_vec()
            }
            Self::Enum(v) => vec![*v],
            Self::Bitmap(v) => {
                if *v <= u32::from(u8::MAX) {
                    vec![*v as u8]
                } else if *v <= u32::from(u16::MAX) {
                    (*v as u16).to_be_bytes().to_vec()
                } else {
                    v.to_be_bytes().to_vec()
                }
            }
        };
        Ok(bytes)
    }
}

/// A recognized datapoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datapoint {
    pub id: u8,
    pub value: DatapointValue,
}

impl Datapoint {
    pub fn new(id: u8, value: DatapointValue) -> Self {
        Self { id, value }
    }

    pub fn data_type(&self) -> DatapointType {
        self.value.data_type()
    }

    /// Build a datapoint from a loosely typed value and a declared tag.
    ///
    /// This is where values coming from outside the codec (capability
    /// writes, configuration, the CLI) are checked against the tag.
    pub fn from_json(
        id: u8,
        data_type: DatapointType,
        value: &serde_json::Value,
    ) -> Result<Self, EncodingError> {
        use serde_json::Value;

        if let Value::Array(items) = value {
            if data_type != DatapointType::Raw {
                return Err(EncodingError::Arity {
                    data_type,
                    expected: 1,
                    found: items.len(),
                });
            }
        }

        let mismatch = || EncodingError::TypeMismatch {
            data_type,
            found: json_kind(value),
        };

        let typed = match data_type {
            DatapointType::Raw => match value {
                Value::Array(items) => {
                    let mut bytes = Vec::with_capacity(items.len());
                    for item in items {
                        let n = item.as_i64().ok_or_else(mismatch)?;
                        let byte = u8::try_from(n).map_err(|_| EncodingError::OutOfRange {
                            data_type,
                            value: n,
                        })?;
                        bytes.push(byte);
                    }
                    DatapointValue::Raw(bytes)
                }
                _ => return Err(mismatch()),
            },
            DatapointType::Bool => match value {
                Value::Bool(b) => DatapointValue::Bool(*b),
                Value::Number(_) => match value.as_i64() {
                    Some(0) => DatapointValue::Bool(false),
                    Some(1) => DatapointValue::Bool(true),
                    Some(n) => return Err(EncodingError::OutOfRange { data_type, value: n }),
                    None => return Err(mismatch()),
                },
                _ => return Err(mismatch()),
            },
            DatapointType::Value => {
                let n = integer(value).ok_or_else(mismatch)?;
                let v = i32::try_from(n)
                    .map_err(|_| EncodingError::OutOfRange { data_type, value: n })?;
                DatapointValue::Value(v)
            }
            DatapointType::String => match value {
                Value::String(s) => DatapointValue::String(s.clone()),
                _ => return Err(mismatch()),
            },
            DatapointType::Enum => {
                let n = integer(value).ok_or_else(mismatch)?;
                let v = u8::try_from(n)
                    .map_err(|_| EncodingError::OutOfRange { data_type, value: n })?;
                DatapointValue::Enum(v)
            }
            DatapointType::Bitmap => {
                let n = integer(value).ok_or_else(mismatch)?;
                let v = u32::try_from(n)
                    .map_err(|_| EncodingError::OutOfRange { data_type, value: n })?;
                DatapointValue::Bitmap(v)
            }
        };

        // Length limits are checked here too so callers fail early
        typed.payload()?;
        Ok(Self::new(id, typed))
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let payload = self.value.payload()?;
        write_datapoint(buf, self.id, self.data_type().tag(), &payload);
        Ok(())
    }
}

fn integer(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn write_datapoint(buf: &mut Vec<u8>, id: u8, tag: u8, payload: &[u8]) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.push(id);
    buf.push(tag);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
}

/// A datapoint whose tag or payload shape was not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnrecognizedDatapoint {
    pub id: u8,
    pub tag: u8,
    pub raw: Vec<u8>,
}

impl UnrecognizedDatapoint {
    /// Re-encode exactly as received.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_datapoint(&mut buf, self.id, self.tag, &self.raw);
        buf
    }
}

/// Result of decoding one datapoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Decoded {
    Recognized(Datapoint),
    Unrecognized(UnrecognizedDatapoint),
}

impl Decoded {
    pub fn id(&self) -> u8 {
        match self {
            Self::Recognized(dp) => dp.id,
            Self::Unrecognized(dp) => dp.id,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::Recognized(dp) => dp.data_type().tag(),
            Self::Unrecognized(dp) => dp.tag,
        }
    }

    pub fn recognized(&self) -> Option<&Datapoint> {
        match self {
            Self::Recognized(dp) => Some(dp),
            Self::Unrecognized(_) => None,
        }
    }

    /// Re-encode; unrecognized payloads come back byte-for-byte.
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        match self {
            Self::Recognized(dp) => dp.encode(),
            Self::Unrecognized(dp) => Ok(dp.encode()),
        }
    }
}

/// Errors raised when a value does not fit its declared type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("unknown datapoint type tag {0}")]
    UnknownTag(u8),

    #[error("{data_type} datapoint cannot hold a {found} value")]
    TypeMismatch {
        data_type: DatapointType,
        found: &'static str,
    },

    #[error("{data_type} datapoint expects {expected} value(s), got {found}")]
    Arity {
        data_type: DatapointType,
        expected: usize,
        found: usize,
    },

    #[error("value {value} out of range for {data_type} datapoint")]
    OutOfRange { data_type: DatapointType, value: i64 },

    #[error("string of {len} bytes exceeds the 65535 byte limit")]
    StringTooLong { len: usize },

    #[error("payload of {len} bytes exceeds the 65535 byte limit")]
    PayloadTooLong { len: usize },
}

/// Errors raised when a frame is cut short.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated frame at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

/// Build a datapoint from a numeric tag and a loose value, rejecting unknown tags.
pub fn encode_value(
    id: u8,
    tag: u8,
    value: &serde_json::Value,
) -> Result<Vec<u8>, EncodingError> {
    let data_type = DatapointType::from_tag(tag).ok_or(EncodingError::UnknownTag(tag))?;
    Datapoint::from_json(id, data_type, value)?.encode()
}

fn interpret(id: u8, tag: u8, payload: &[u8]) -> Decoded {
    let value = match (DatapointType::from_tag(tag), payload) {
        (Some(DatapointType::Raw), bytes) => Some(DatapointValue::Raw(bytes.to_vec())),
        (Some(DatapointType::Bool), [b @ (0 | 1)]) => Some(DatapointValue::Bool(*b == 1)),
        (Some(DatapointType::Value), [a, b, c, d]) => {
            Some(DatapointValue::Value(i32::from_be_bytes([*a, *b, *c, *d])))
        }
        (Some(DatapointType::String), bytes) => std::str::from_utf8(bytes)
            .ok()
            .map(|s| DatapointValue::String(s.to_string())),
        (Some(DatapointType::Enum), [v]) => Some(DatapointValue::Enum(*v)),
        (Some(DatapointType::Bitmap), [v]) => Some(DatapointValue::Bitmap(u32::from(*v))),
        (Some(DatapointType::Bitmap), [a, b]) => {
            Some(DatapointValue::Bitmap(u32::from(u16::from_be_bytes([*a, *b]))))
        }
        (Some(DatapointType::Bitmap), [a, b, c, d]) => {
            Some(DatapointValue::Bitmap(u32::from_be_bytes([*a, *b, *c, *d])))
        }
        _ => None,
    };

    match value {
        Some(value) => Decoded::Recognized(Datapoint::new(id, value)),
        None => Decoded::Unrecognized(UnrecognizedDatapoint {
            id,
            tag,
            raw: payload.to_vec(),
        }),
    }
}

/// Decode a single datapoint at the start of `bytes`.
///
/// Returns the decoded datapoint and the number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(Decoded, usize), DecodeError> {
    decode_at(bytes, 0)
}

fn decode_at(bytes: &[u8], offset: usize) -> Result<(Decoded, usize), DecodeError> {
    let rest = &bytes[offset.min(bytes.len())..];
    if rest.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            offset,
            needed: HEADER_LEN,
            available: rest.len(),
        });
    }
    let id = rest[0];
    let tag = rest[1];
    let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
    let body = &rest[HEADER_LEN..];
    if body.len() < len {
        return Err(DecodeError::Truncated {
            offset: offset + HEADER_LEN,
            needed: len,
            available: body.len(),
        });
    }
    Ok((interpret(id, tag, &body[..len]), HEADER_LEN + len))
}

/// Decode every datapoint in a buffer.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Decoded>, DecodeError> {
    let mut offset = 0;
    let mut out = Vec::new();
    while offset < bytes.len() {
        let (dp, used) = decode_at(bytes, offset)?;
        out.push(dp);
        offset += used;
    }
    Ok(out)
}

/// Command payload of the datapoint tunnel: a sequence number followed by datapoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapointFrame {
    pub seq: u16,
    pub datapoints: Vec<Decoded>,
}

impl DatapointFrame {
    pub fn new(seq: u16) -> Self {
        Self {
            seq,
            datapoints: Vec::new(),
        }
    }

    pub fn with_datapoint(mut self, dp: Datapoint) -> Self {
        self.datapoints.push(Decoded::Recognized(dp));
        self
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 2 {
            return Err(DecodeError::Truncated {
                offset: 0,
                needed: 2,
                available: bytes.len(),
            });
        }
        let seq = u16::from_be_bytes([bytes[0], bytes[1]]);
        let mut datapoints = Vec::new();
        let mut offset = 2;
        while offset < bytes.len() {
            let (dp, used) = decode_at(bytes, offset)?;
            datapoints.push(dp);
            offset += used;
        }
        Ok(Self { seq, datapoints })
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = self.seq.to_be_bytes().to_vec();
        for dp in &self.datapoints {
            buf.extend(dp.encode()?);
        }
        Ok(buf)
    }
}
