use std::collections::BTreeMap;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::value::{self, Value};
use crate::MethodCallError;

/// Maximum size of a frame body, bounded by the u16 length prefix.
pub const MAX_FRAME_SIZE: usize = 65_535;

/// Literal carried in the `_command` key of every request frame.
pub const COMMAND_TAG: &str = "method_call";

const LENGTH_PREFIX_SIZE: usize = 2;

const KEY_COMMAND: &str = "_command";
const KEY_ASK: &str = "_ask";
const KEY_METHOD: &str = "method";
const KEY_ARGS: &str = "args";
const KEY_KWARGS: &str = "kwargs";
const KEY_ANSWER: &str = "_answer";
const KEY_RESULT: &str = "result";
const KEY_DEFERRED: &str = "deferred";
const KEY_ERROR: &str = "_error";
const KEY_RESULT_AVAILABLE: &str = "_result_available";
const KEY_CODE: &str = "code";
const KEY_DESCRIPTION: &str = "description";

/// Enumeration of errors that can occur while framing.
///
/// `FrameTooLarge` and `MalformedFrame` mean the wire itself is
/// inconsistent; the peer that observes them drops the connection.
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("frame body of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("{0}")]
    Unserializable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub(crate) fn malformed(description: impl Into<String>) -> FrameError {
    FrameError::MalformedFrame(description.into())
}

/// One wire frame: a method-call request, its answer, or the later
/// resolution of a pending ticket.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Request {
        seq: u32,
        method: String,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    },
    Response {
        seq: u32,
        reply: Reply,
    },
    ResultAvailable {
        ticket: String,
        outcome: Result<Value, MethodCallError>,
    },
}

/// Payload of an `_answer` frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// An immediate result, or a pending ticket when the result can only
    /// be determined later.
    Value {
        result: Value,
        deferred: Option<String>,
    },
    Error(MethodCallError),
}

impl Frame {
    /// Encodes the frame, length prefix included.
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut dst = BytesMut::new();
        self.encode_into(&mut dst)?;
        Ok(dst.freeze())
    }

    pub(crate) fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let mut body = BytesMut::new();

        match self {
            Frame::Request {
                seq,
                method,
                args,
                kwargs,
            } => {
                put_key(&mut body, KEY_COMMAND);
                value::encode_str(COMMAND_TAG, &mut body)?;
                put_key(&mut body, KEY_ASK);
                value::encode_int(*seq as i64, &mut body);
                put_key(&mut body, KEY_METHOD);
                value::encode_str(method, &mut body)?;
                put_key(&mut body, KEY_ARGS);
                value::encode_list(args, &mut body)?;
                put_key(&mut body, KEY_KWARGS);
                value::encode_map(kwargs, &mut body)?;
            }
            Frame::Response { seq, reply } => {
                put_key(&mut body, KEY_ANSWER);
                value::encode_int(*seq as i64, &mut body);
                match reply {
                    Reply::Value { result, deferred } => {
                        put_key(&mut body, KEY_RESULT);
                        value::encode_value(result, &mut body)?;
                        put_key(&mut body, KEY_DEFERRED);
                        match deferred {
                            Some(ticket) => value::encode_str(ticket, &mut body)?,
                            None => value::encode_value(&Value::Null, &mut body)?,
                        }
                    }
                    Reply::Error(error) => put_error(error, &mut body)?,
                }
            }
            Frame::ResultAvailable { ticket, outcome } => {
                put_key(&mut body, KEY_RESULT_AVAILABLE);
                value::encode_str(ticket, &mut body)?;
                match outcome {
                    Ok(result) => {
                        put_key(&mut body, KEY_RESULT);
                        value::encode_value(result, &mut body)?;
                    }
                    Err(error) => put_error(error, &mut body)?,
                }
            }
        }

        if body.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(body.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u16(body.len() as u16);
        dst.extend_from_slice(&body);

        Ok(())
    }

    pub(crate) fn decode(mut body: Bytes) -> Result<Frame, FrameError> {
        let mut record = decode_record(&mut body)?;

        if record.contains_key(KEY_COMMAND) {
            request_from_record(record)
        } else if record.contains_key(KEY_ANSWER) {
            answer_from_record(record)
        } else if record.contains_key(KEY_RESULT_AVAILABLE) {
            resolution_from_record(record)
        } else {
            let keys: Vec<&str> = record.keys().map(String::as_str).collect();
            Err(malformed(format!("unrecognised frame with keys {keys:?}")))
        }
    }
}

fn put_key(dst: &mut BytesMut, key: &str) {
    dst.put_u16(key.len() as u16);
    dst.put_slice(key.as_bytes());
}

fn put_error(error: &MethodCallError, dst: &mut BytesMut) -> Result<(), FrameError> {
    let entries = BTreeMap::from([
        (
            KEY_CODE.to_owned(),
            Value::Str(error.code().as_str().to_owned()),
        ),
        (
            KEY_DESCRIPTION.to_owned(),
            Value::Str(error.description().to_owned()),
        ),
    ]);

    put_key(dst, KEY_ERROR);
    value::encode_map(&entries, dst)
}

fn decode_record(body: &mut Bytes) -> Result<BTreeMap<String, Value>, FrameError> {
    let mut record = BTreeMap::new();

    while body.has_remaining() {
        let key = value::take_string(body)?;
        if !key.is_ascii() {
            return Err(malformed(format!("non-ASCII record key '{key}'")));
        }
        let value = value::decode_value(body)?;
        if record.insert(key.clone(), value).is_some() {
            return Err(malformed(format!("duplicate record key '{key}'")));
        }
    }

    Ok(record)
}

fn request_from_record(mut record: BTreeMap<String, Value>) -> Result<Frame, FrameError> {
    match record.remove(KEY_COMMAND) {
        Some(Value::Str(tag)) if tag == COMMAND_TAG => {}
        Some(Value::Str(tag)) => return Err(malformed(format!("unknown command tag '{tag}'"))),
        _ => return Err(malformed("command tag must be a string")),
    }

    let seq = take_seq(&mut record, KEY_ASK)?;

    let method = match record.remove(KEY_METHOD) {
        Some(Value::Str(method)) => method,
        _ => return Err(malformed("request is missing its method name")),
    };

    let args = match record.remove(KEY_ARGS) {
        Some(Value::List(items)) => items,
        None => Vec::new(),
        Some(other) => {
            return Err(malformed(format!(
                "request args must be a sequence, got {}",
                other.type_name()
            )))
        }
    };

    let kwargs = match record.remove(KEY_KWARGS) {
        Some(Value::Map(entries)) => entries,
        None => BTreeMap::new(),
        Some(other) => {
            return Err(malformed(format!(
                "request kwargs must be a mapping, got {}",
                other.type_name()
            )))
        }
    };

    Ok(Frame::Request {
        seq,
        method,
        args,
        kwargs,
    })
}

fn answer_from_record(mut record: BTreeMap<String, Value>) -> Result<Frame, FrameError> {
    let seq = take_seq(&mut record, KEY_ANSWER)?;

    let reply = if let Some(error) = record.remove(KEY_ERROR) {
        Reply::Error(error_from_value(error)?)
    } else {
        let result = record.remove(KEY_RESULT).unwrap_or(Value::Null);
        let deferred = match record.remove(KEY_DEFERRED) {
            None | Some(Value::Null) => None,
            Some(Value::Str(ticket)) => Some(ticket),
            Some(other) => {
                return Err(malformed(format!(
                    "deferred ticket must be a string, got {}",
                    other.type_name()
                )))
            }
        };
        Reply::Value { result, deferred }
    };

    Ok(Frame::Response { seq, reply })
}

fn resolution_from_record(mut record: BTreeMap<String, Value>) -> Result<Frame, FrameError> {
    let ticket = match record.remove(KEY_RESULT_AVAILABLE) {
        Some(Value::Str(ticket)) => ticket,
        _ => return Err(malformed("resolution ticket must be a string")),
    };

    let outcome = if let Some(error) = record.remove(KEY_ERROR) {
        Err(error_from_value(error)?)
    } else {
        Ok(record.remove(KEY_RESULT).unwrap_or(Value::Null))
    };

    Ok(Frame::ResultAvailable { ticket, outcome })
}

fn take_seq(record: &mut BTreeMap<String, Value>, key: &str) -> Result<u32, FrameError> {
    match record.remove(key) {
        Some(Value::Int(seq)) if (0..=u32::MAX as i64).contains(&seq) => Ok(seq as u32),
        Some(Value::Int(seq)) => Err(malformed(format!("sequence number {seq} out of range"))),
        _ => Err(malformed(format!("missing sequence number '{key}'"))),
    }
}

fn error_from_value(value: Value) -> Result<MethodCallError, FrameError> {
    let mut entries = match value {
        Value::Map(entries) => entries,
        other => {
            return Err(malformed(format!(
                "error payload must be a mapping, got {}",
                other.type_name()
            )))
        }
    };

    let code = match entries.remove(KEY_CODE) {
        Some(Value::Str(code)) => code,
        _ => return Err(malformed("error payload is missing its code")),
    };

    let description = match entries.remove(KEY_DESCRIPTION) {
        Some(Value::Str(description)) => description,
        _ => return Err(malformed("error payload is missing its description")),
    };

    Ok(MethodCallError::from_wire(&code, description))
}

/// A [`Decoder`]/[`Encoder`] implementation that splits the stream into
/// length-prefixed frames and parses them into [`Frame`]s.
///
/// A declared body length above the configured cap is a framing error;
/// the connection that observes one is expected to shut down, so the
/// codec makes no attempt to resynchronise afterwards.
#[derive(Clone, Debug)]
pub struct MethodCallCodec {
    max_frame_len: usize,
}

impl MethodCallCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: MAX_FRAME_SIZE,
        }
    }

    /// Lowers the inbound frame size cap, chiefly for tests.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(MAX_FRAME_SIZE),
        }
    }
}

impl Default for MethodCallCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MethodCallCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len > self.max_frame_len {
            return Err(FrameError::FrameTooLarge(len));
        }

        if src.len() < LENGTH_PREFIX_SIZE + len {
            src.reserve(LENGTH_PREFIX_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(len).freeze();

        Frame::decode(body).map(Some)
    }
}

impl Encoder<Frame> for MethodCallCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        item.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn round_trip(frame: Frame) -> Frame {
        let mut codec = MethodCallCodec::new();
        let mut buffer = BytesMut::new();
        codec.encode(frame, &mut buffer).unwrap();
        codec.decode(&mut buffer).unwrap().unwrap()
    }

    #[test]
    fn request_round_trip() {
        let frame = Frame::Request {
            seq: 7,
            method: "capitalize".to_owned(),
            args: vec![Value::Str("john".into())],
            kwargs: BTreeMap::from([("index".to_owned(), Value::Int(2))]),
        };

        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn response_round_trip() {
        let frame = Frame::Response {
            seq: 7,
            reply: Reply::Value {
                result: Value::Str("John".into()),
                deferred: None,
            },
        };

        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn deferred_response_round_trip() {
        let frame = Frame::Response {
            seq: 3,
            reply: Reply::Value {
                result: Value::Null,
                deferred: Some("pending-1".to_owned()),
            },
        };

        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn error_response_round_trip() {
        let frame = Frame::Response {
            seq: 9,
            reply: Reply::Error(MethodCallError::forbidden("secret")),
        };

        let decoded = round_trip(frame.clone());
        assert_eq!(decoded, frame);

        match decoded {
            Frame::Response {
                reply: Reply::Error(error),
                ..
            } => assert_eq!(error.to_string(), "Forbidden method 'secret'"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn timeout_error_round_trip() {
        let frame = Frame::Response {
            seq: 11,
            reply: Reply::Error(MethodCallError::timed_out()),
        };

        let decoded = round_trip(frame.clone());
        assert_eq!(decoded, frame);

        match decoded {
            Frame::Response {
                reply: Reply::Error(error),
                ..
            } => {
                assert_eq!(error.code(), crate::ErrorCode::CallTimedOut);
                assert_eq!(error.to_string(), "timeout");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn remaining_error_codes_round_trip() {
        for error in [
            MethodCallError::connection_lost(),
            MethodCallError::backoff_exhausted(3),
            MethodCallError::unserializable_value("too big"),
            MethodCallError::unserializable_result("too big"),
        ] {
            let frame = Frame::Response {
                seq: 12,
                reply: Reply::Error(error),
            };

            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn resolution_round_trip() {
        let frame = Frame::ResultAvailable {
            ticket: "pending-4".to_owned(),
            outcome: Ok(Value::Str("Cool!".into())),
        };

        assert_eq!(round_trip(frame.clone()), frame);

        let frame = Frame::ResultAvailable {
            ticket: "pending-5".to_owned(),
            outcome: Err(MethodCallError::method_failed("bad")),
        };

        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn partial_frame_decodes_to_none() {
        let frame = Frame::Request {
            seq: 0,
            method: "empty".to_owned(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        };

        let mut codec = MethodCallCodec::new();
        let mut buffer = BytesMut::new();
        codec.encode(frame.clone(), &mut buffer).unwrap();

        let mut partial = BytesMut::from(&buffer[..buffer.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.put_u8(buffer[buffer.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(frame));
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let frame = Frame::Request {
            seq: 0,
            method: "motd".to_owned(),
            args: vec![Value::Str("x".repeat(64))],
            kwargs: BTreeMap::new(),
        };

        let mut codec = MethodCallCodec::with_max_frame_len(16);
        let mut buffer = BytesMut::new();
        codec.encode(frame, &mut buffer).unwrap();

        let err = codec.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge(_)));
    }

    #[test]
    fn unrecognised_record_is_rejected() {
        let mut body = BytesMut::new();
        put_key(&mut body, "greeting");
        value::encode_str("hello", &mut body).unwrap();

        let mut buffer = BytesMut::new();
        buffer.put_u16(body.len() as u16);
        buffer.extend_from_slice(&body);

        let err = MethodCallCodec::new().decode(&mut buffer).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame(_)));
    }

    #[test]
    fn request_with_wrong_args_type_is_rejected() {
        let mut body = BytesMut::new();
        put_key(&mut body, KEY_COMMAND);
        value::encode_str(COMMAND_TAG, &mut body).unwrap();
        put_key(&mut body, KEY_ASK);
        value::encode_int(1, &mut body);
        put_key(&mut body, KEY_METHOD);
        value::encode_str("empty", &mut body).unwrap();
        put_key(&mut body, KEY_ARGS);
        value::encode_str("not a sequence", &mut body).unwrap();

        let mut buffer = BytesMut::new();
        buffer.put_u16(body.len() as u16);
        buffer.extend_from_slice(&body);

        let err = MethodCallCodec::new().decode(&mut buffer).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame(_)));
    }
}
