use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::frame::{malformed, FrameError};

/// Maximum encoded length of a string, in bytes.
pub const MAX_STRING_LEN: usize = 65_533;

/// Maximum length of a byte sequence.
pub const MAX_BYTES_LEN: usize = 65_533;

/// Maximum number of entries in a sequence or mapping.
const MAX_COLLECTION_LEN: usize = u16::MAX as usize;

/// Maximum nesting depth accepted when encoding or decoding a value.
const MAX_DEPTH: usize = 32;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_MAP: u8 = 0x07;

/// A payload in the closed wire grammar.
///
/// Anything outside this grammar cannot travel: offering an over-long
/// string or byte sequence (or a collection nested past the depth cap)
/// for encoding is reported as a typed failure, never silently dropped.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(entries)
    }
}

pub(crate) fn encode_value(value: &Value, dst: &mut BytesMut) -> Result<(), FrameError> {
    encode_at(value, dst, 0)
}

pub(crate) fn encode_str(value: &str, dst: &mut BytesMut) -> Result<(), FrameError> {
    dst.put_u8(TAG_STR);
    put_len_prefixed(dst, value.as_bytes(), MAX_STRING_LEN, "string")
}

pub(crate) fn encode_int(value: i64, dst: &mut BytesMut) {
    dst.put_u8(TAG_INT);
    dst.put_i64(value);
}

pub(crate) fn encode_list(items: &[Value], dst: &mut BytesMut) -> Result<(), FrameError> {
    encode_list_at(items, dst, 0)
}

pub(crate) fn encode_map(
    entries: &BTreeMap<String, Value>,
    dst: &mut BytesMut,
) -> Result<(), FrameError> {
    encode_map_at(entries, dst, 0)
}

fn encode_at(value: &Value, dst: &mut BytesMut, depth: usize) -> Result<(), FrameError> {
    if depth > MAX_DEPTH {
        return Err(FrameError::Unserializable(format!(
            "value nested deeper than {MAX_DEPTH} levels"
        )));
    }

    match value {
        Value::Null => dst.put_u8(TAG_NULL),
        Value::Bool(value) => {
            dst.put_u8(TAG_BOOL);
            dst.put_u8(*value as u8);
        }
        Value::Int(value) => encode_int(*value, dst),
        Value::Float(value) => {
            dst.put_u8(TAG_FLOAT);
            dst.put_f64(*value);
        }
        Value::Str(value) => encode_str(value, dst)?,
        Value::Bytes(value) => {
            dst.put_u8(TAG_BYTES);
            put_len_prefixed(dst, value, MAX_BYTES_LEN, "byte sequence")?;
        }
        Value::List(items) => encode_list_at(items, dst, depth)?,
        Value::Map(entries) => encode_map_at(entries, dst, depth)?,
    }

    Ok(())
}

fn encode_list_at(items: &[Value], dst: &mut BytesMut, depth: usize) -> Result<(), FrameError> {
    if items.len() > MAX_COLLECTION_LEN {
        return Err(FrameError::Unserializable(format!(
            "sequence of {} entries exceeds the {MAX_COLLECTION_LEN} entry limit",
            items.len()
        )));
    }

    dst.put_u8(TAG_LIST);
    dst.put_u16(items.len() as u16);
    for item in items {
        encode_at(item, dst, depth + 1)?;
    }

    Ok(())
}

fn encode_map_at(
    entries: &BTreeMap<String, Value>,
    dst: &mut BytesMut,
    depth: usize,
) -> Result<(), FrameError> {
    if entries.len() > MAX_COLLECTION_LEN {
        return Err(FrameError::Unserializable(format!(
            "mapping of {} entries exceeds the {MAX_COLLECTION_LEN} entry limit",
            entries.len()
        )));
    }

    dst.put_u8(TAG_MAP);
    dst.put_u16(entries.len() as u16);
    for (key, value) in entries {
        put_len_prefixed(dst, key.as_bytes(), MAX_STRING_LEN, "mapping key")?;
        encode_at(value, dst, depth + 1)?;
    }

    Ok(())
}

fn put_len_prefixed(
    dst: &mut BytesMut,
    payload: &[u8],
    max_len: usize,
    what: &str,
) -> Result<(), FrameError> {
    if payload.len() > max_len {
        return Err(FrameError::Unserializable(format!(
            "{what} of {} bytes exceeds the {max_len} byte limit",
            payload.len()
        )));
    }

    dst.put_u16(payload.len() as u16);
    dst.put_slice(payload);

    Ok(())
}

pub(crate) fn decode_value(src: &mut Bytes) -> Result<Value, FrameError> {
    decode_at(src, 0)
}

fn decode_at(src: &mut Bytes, depth: usize) -> Result<Value, FrameError> {
    if depth > MAX_DEPTH {
        return Err(malformed(format!(
            "value nested deeper than {MAX_DEPTH} levels"
        )));
    }

    match take_u8(src)? {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => match take_u8(src)? {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            other => Err(malformed(format!("invalid boolean byte {other:#04x}"))),
        },
        TAG_INT => {
            if src.remaining() < 8 {
                return Err(malformed("truncated integer"));
            }
            Ok(Value::Int(src.get_i64()))
        }
        TAG_FLOAT => {
            if src.remaining() < 8 {
                return Err(malformed("truncated float"));
            }
            Ok(Value::Float(src.get_f64()))
        }
        TAG_STR => Ok(Value::Str(take_string(src)?)),
        TAG_BYTES => {
            let payload = take_len_prefixed(src)?;
            Ok(Value::Bytes(payload.to_vec()))
        }
        TAG_LIST => {
            let count = take_u16(src)? as usize;
            let mut items = Vec::with_capacity(count.min(src.remaining()));
            for _ in 0..count {
                items.push(decode_at(src, depth + 1)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let count = take_u16(src)? as usize;
            let mut entries = BTreeMap::new();
            for _ in 0..count {
                let key = take_string(src)?;
                let value = decode_at(src, depth + 1)?;
                if entries.insert(key.clone(), value).is_some() {
                    return Err(malformed(format!("duplicate mapping key '{key}'")));
                }
            }
            Ok(Value::Map(entries))
        }
        other => Err(malformed(format!("unknown type tag {other:#04x}"))),
    }
}

fn take_u8(src: &mut Bytes) -> Result<u8, FrameError> {
    if !src.has_remaining() {
        return Err(malformed("truncated value"));
    }
    Ok(src.get_u8())
}

fn take_u16(src: &mut Bytes) -> Result<u16, FrameError> {
    if src.remaining() < 2 {
        return Err(malformed("truncated length prefix"));
    }
    Ok(src.get_u16())
}

fn take_len_prefixed(src: &mut Bytes) -> Result<Bytes, FrameError> {
    let len = take_u16(src)? as usize;
    if src.remaining() < len {
        return Err(malformed(format!(
            "length prefix of {len} bytes overruns the frame body"
        )));
    }
    Ok(src.copy_to_bytes(len))
}

pub(crate) fn take_string(src: &mut Bytes) -> Result<String, FrameError> {
    let payload = take_len_prefixed(src)?;
    String::from_utf8(payload.to_vec()).map_err(|_| malformed("string is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn round_trip(value: Value) -> Value {
        let mut dst = BytesMut::new();
        encode_value(&value, &mut dst).unwrap();
        let mut src = dst.freeze();
        let decoded = decode_value(&mut src).unwrap();
        assert!(!src.has_remaining(), "decoder left trailing bytes");
        decoded
    }

    #[test]
    fn round_trip_scalars() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Float(0.19),
            Value::Str("Words are cool".into()),
            Value::Str(String::new()),
            Value::Bytes(vec![0x00, 0xff, 0x7f]),
        ] {
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn round_trip_nested() {
        let value = Value::Map(BTreeMap::from([
            ("word".to_owned(), Value::Str("Landscape".into())),
            ("times".to_owned(), Value::Int(2)),
            (
                "inner".to_owned(),
                Value::List(vec![Value::Null, Value::Bool(true), Value::Float(1.5)]),
            ),
        ]));

        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn oversize_string_is_rejected() {
        let value = Value::Str("x".repeat(MAX_STRING_LEN + 1));
        let mut dst = BytesMut::new();
        let err = encode_value(&value, &mut dst).unwrap_err();
        assert!(matches!(err, FrameError::Unserializable(_)));
    }

    #[test]
    fn oversize_byte_sequence_is_rejected() {
        let value = Value::Bytes(vec![0u8; MAX_BYTES_LEN + 1]);
        let mut dst = BytesMut::new();
        let err = encode_value(&value, &mut dst).unwrap_err();
        assert!(matches!(err, FrameError::Unserializable(_)));
    }

    #[test]
    fn excessive_nesting_is_rejected() {
        let mut value = Value::Null;
        for _ in 0..MAX_DEPTH + 1 {
            value = Value::List(vec![value]);
        }

        let mut dst = BytesMut::new();
        let err = encode_value(&value, &mut dst).unwrap_err();
        assert!(matches!(err, FrameError::Unserializable(_)));
    }

    #[test]
    fn unknown_tag_fails_decoding() {
        let mut src = Bytes::from_static(&[0x7f]);
        let err = decode_value(&mut src).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame(_)));
    }

    #[test]
    fn truncated_payload_fails_decoding() {
        // String claiming four bytes with only two present.
        let mut src = Bytes::from_static(&[TAG_STR, 0x00, 0x04, b'h', b'i']);
        let err = decode_value(&mut src).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame(_)));
    }

    #[test]
    fn invalid_boolean_byte_fails_decoding() {
        let mut src = Bytes::from_static(&[TAG_BOOL, 0x02]);
        let err = decode_value(&mut src).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame(_)));
    }

    #[test]
    fn duplicate_mapping_key_fails_decoding() {
        let mut dst = BytesMut::new();
        dst.put_u8(TAG_MAP);
        dst.put_u16(2);
        for _ in 0..2 {
            dst.put_u16(3);
            dst.put_slice(b"key");
            dst.put_u8(TAG_NULL);
        }

        let mut src = dst.freeze();
        let err = decode_value(&mut src).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame(_)));
    }
}
