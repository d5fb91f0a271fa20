//! Decoding of IPROTO response frames: header, body fields and the two
//! server error formats (legacy ERROR_24 string, extended MP_ERROR stack).

use std::collections::HashMap;
use std::io::Cursor;

use rmpv::Value;
use serde::de::DeserializeOwned;

use crate::error::{Error, ErrorDetail, ProtocolError, Result, ServerError};
use crate::protocol::codec::{from_value, read_value, value_as_u64};
use crate::protocol::consts::{error_keys, keys, response_codes};

/// Decoded frame header.
#[derive(Debug, Clone)]
pub struct Header {
    /// Raw value of the type/code field.
    pub code: u64,
    pub sync: u64,
    pub schema_version: Option<u64>,
    pub stream_id: Option<u64>,
}

impl Header {
    pub fn is_ok(&self) -> bool {
        self.code == response_codes::OK
    }

    /// Server error code when the header carries one.
    pub fn error_code(&self) -> Option<u32> {
        if (response_codes::ERROR_RANGE_START..=response_codes::ERROR_RANGE_END)
            .contains(&self.code)
        {
            Some((self.code - response_codes::ERROR_RANGE_START) as u32)
        } else {
            None
        }
    }
}

/// Read the header map off the front of a frame payload; the cursor is left
/// at the first body byte.
pub fn decode_header(cur: &mut Cursor<&[u8]>) -> Result<Header> {
    let raw = read_value(cur)?;
    let entries = match raw {
        Value::Map(entries) => entries,
        other => {
            return Err(Error::Protocol(ProtocolError::Malformed(format!(
                "frame header is not a map: {other}"
            ))))
        }
    };

    let mut header = Header {
        code: 0,
        sync: 0,
        schema_version: None,
        stream_id: None,
    };
    for (key, value) in entries {
        match value_as_u64(&key)? {
            k if k == u64::from(keys::REQUEST_TYPE) => header.code = value_as_u64(&value)?,
            k if k == u64::from(keys::SYNC) => header.sync = value_as_u64(&value)?,
            k if k == u64::from(keys::SCHEMA_VERSION) => {
                header.schema_version = Some(value_as_u64(&value)?)
            }
            k if k == u64::from(keys::STREAM_ID) => {
                header.stream_id = Some(value_as_u64(&value)?)
            }
            _ => {}
        }
    }
    Ok(header)
}

/// Read the body map; unknown keys are preserved for callers that understand
/// them (e.g. the ID handshake reads VERSION/FEATURES out of here).
pub fn decode_body(cur: &mut Cursor<&[u8]>) -> Result<HashMap<u64, Value>> {
    let remaining = cur.get_ref().len() as u64 - cur.position();
    if remaining == 0 {
        return Ok(HashMap::new());
    }
    let raw = read_value(cur)?;
    let entries = match raw {
        Value::Map(entries) => entries,
        other => {
            return Err(Error::Protocol(ProtocolError::Malformed(format!(
                "frame body is not a map: {other}"
            ))))
        }
    };
    let mut fields = HashMap::with_capacity(entries.len());
    for (key, value) in entries {
        fields.insert(value_as_u64(&key)?, value);
    }
    Ok(fields)
}

/// A complete decoded response delivered to a waiter.
#[derive(Debug, Clone)]
pub struct Response {
    pub header: Header,
    pub fields: HashMap<u64, Value>,
    /// DATA payloads of preceding IPROTO_CHUNK frames for the same sync.
    pub chunks: Vec<Value>,
}

impl Response {
    /// Placeholder acknowledgment for fire-and-forget submissions, which the
    /// server never answers.
    pub(crate) fn empty() -> Self {
        Self {
            header: Header {
                code: 0,
                sync: 0,
                schema_version: None,
                stream_id: None,
            },
            fields: HashMap::new(),
            chunks: Vec::new(),
        }
    }

    pub fn field(&self, key: u8) -> Option<&Value> {
        self.fields.get(&u64::from(key))
    }

    /// The DATA body field, if present.
    pub fn data(&self) -> Option<&Value> {
        self.field(keys::DATA)
    }

    /// Decode the DATA field into a typed value.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self
            .data()
            .cloned()
            .ok_or_else(|| Error::Decode("response has no data field".to_string()))?;
        from_value(data)
    }

    /// Decode the first element of the DATA array; CALL and EVAL results
    /// usually arrive as a one-element tuple.
    pub fn decode_first<T: DeserializeOwned>(&self) -> Result<T> {
        let first = self
            .data()
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .cloned()
            .ok_or_else(|| Error::Decode("response data has no first element".to_string()))?;
        from_value(first)
    }

    /// Pagination position returned when the request asked for it.
    pub fn position(&self) -> Option<&[u8]> {
        match self.field(keys::POSITION) {
            Some(Value::Binary(b)) => Some(b),
            Some(Value::String(s)) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// Build the error for an error-coded response.
///
/// Which of the two formats applies is decided by the MessagePack family of
/// the field that is present: a map under ERROR is the extended stack, a
/// string under ERROR_24 the legacy single message.
pub fn server_error(code: u32, fields: &HashMap<u64, Value>) -> ServerError {
    let legacy = fields
        .get(&u64::from(keys::ERROR_24))
        .and_then(Value::as_str)
        .map(str::to_string);

    let stack = match fields.get(&u64::from(keys::ERROR)) {
        Some(Value::Map(entries)) => decode_error_stack(entries),
        _ => Vec::new(),
    };

    let message = legacy
        .or_else(|| stack.first().map(|d| d.message.clone()))
        .unwrap_or_else(|| "unknown server error".to_string());

    ServerError {
        code,
        message,
        stack,
    }
}

fn decode_error_stack(entries: &[(Value, Value)]) -> Vec<ErrorDetail> {
    let stack = entries
        .iter()
        .find(|(k, _)| k.as_u64() == Some(u64::from(error_keys::STACK)))
        .and_then(|(_, v)| v.as_array());
    let stack = match stack {
        Some(stack) => stack,
        None => return Vec::new(),
    };

    let mut details = Vec::with_capacity(stack.len());
    for frame in stack {
        let frame = match frame.as_map() {
            Some(frame) => frame,
            None => continue,
        };
        let get = |key: u8| {
            frame
                .iter()
                .find(|(k, _)| k.as_u64() == Some(u64::from(key)))
                .map(|(_, v)| v)
        };
        details.push(ErrorDetail {
            kind: get(error_keys::TYPE)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            message: get(error_keys::MESSAGE)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            code: get(error_keys::CODE)
                .and_then(Value::as_u64)
                .unwrap_or_default() as u32,
            file: get(error_keys::FILE)
                .and_then(Value::as_str)
                .map(str::to_string),
            line: get(error_keys::LINE).and_then(Value::as_u64),
            errno: get(error_keys::ERRNO).and_then(Value::as_u64),
            fields: get(error_keys::FIELDS).cloned(),
        });
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{
        write_key, write_map_len, write_str, write_uint, write_value,
    };

    fn frame(header: &[(u8, u64)], body: Option<&Value>) -> Vec<u8> {
        let mut buf = Vec::new();
        write_map_len(&mut buf, header.len() as u32).unwrap();
        for (k, v) in header {
            write_key(&mut buf, *k).unwrap();
            write_uint(&mut buf, *v).unwrap();
        }
        if let Some(body) = body {
            write_value(&mut buf, body).unwrap();
        }
        buf
    }

    #[test]
    fn test_decode_ok_header_and_data() {
        let body = Value::Map(vec![(
            Value::from(u64::from(keys::DATA)),
            Value::Array(vec![Value::Array(vec![Value::from(1), Value::from("a")])]),
        )]);
        let buf = frame(
            &[
                (keys::RESPONSE_CODE, 0),
                (keys::SYNC, 7),
                (keys::SCHEMA_VERSION, 80),
            ],
            Some(&body),
        );

        let mut cur = Cursor::new(&buf[..]);
        let header = decode_header(&mut cur).unwrap();
        assert!(header.is_ok());
        assert_eq!(header.sync, 7);
        assert_eq!(header.schema_version, Some(80));
        assert_eq!(header.error_code(), None);

        let fields = decode_body(&mut cur).unwrap();
        let response = Response {
            header,
            fields,
            chunks: Vec::new(),
        };
        let rows: Vec<(u32, String)> = response.decode_data().unwrap();
        assert_eq!(rows, vec![(1, "a".to_string())]);
    }

    #[test]
    fn test_decode_empty_body() {
        let buf = frame(&[(keys::RESPONSE_CODE, 0), (keys::SYNC, 1)], None);
        let mut cur = Cursor::new(&buf[..]);
        let _ = decode_header(&mut cur).unwrap();
        assert!(decode_body(&mut cur).unwrap().is_empty());
    }

    #[test]
    fn test_error_code_extraction() {
        let buf = frame(&[(keys::RESPONSE_CODE, 0x8000 + 36), (keys::SYNC, 2)], None);
        let mut cur = Cursor::new(&buf[..]);
        let header = decode_header(&mut cur).unwrap();
        assert!(!header.is_ok());
        assert_eq!(header.error_code(), Some(36));
    }

    #[test]
    fn test_legacy_error_24() {
        let mut fields = HashMap::new();
        fields.insert(
            u64::from(keys::ERROR_24),
            Value::from("Space 'test' does not exist"),
        );
        let err = server_error(36, &fields);
        assert_eq!(err.code, 36);
        assert_eq!(err.message, "Space 'test' does not exist");
        assert!(err.stack.is_empty());
    }

    #[test]
    fn test_extended_error_stack() {
        let stack_frame = Value::Map(vec![
            (
                Value::from(u64::from(error_keys::TYPE)),
                Value::from("ClientError"),
            ),
            (
                Value::from(u64::from(error_keys::MESSAGE)),
                Value::from("Duplicate key exists"),
            ),
            (Value::from(u64::from(error_keys::CODE)), Value::from(3)),
            (
                Value::from(u64::from(error_keys::LINE)),
                Value::from(120),
            ),
        ]);
        let mut fields = HashMap::new();
        fields.insert(
            u64::from(keys::ERROR),
            Value::Map(vec![(
                Value::from(u64::from(error_keys::STACK)),
                Value::Array(vec![stack_frame]),
            )]),
        );

        let err = server_error(3, &fields);
        assert_eq!(err.message, "Duplicate key exists");
        assert_eq!(err.stack.len(), 1);
        assert_eq!(err.stack[0].kind, "ClientError");
        assert_eq!(err.stack[0].code, 3);
        assert_eq!(err.stack[0].line, Some(120));
    }

    #[test]
    fn test_decode_first() {
        let mut fields = HashMap::new();
        fields.insert(
            u64::from(keys::DATA),
            Value::Array(vec![Value::from(42)]),
        );
        let response = Response {
            header: Header {
                code: 0,
                sync: 1,
                schema_version: None,
                stream_id: None,
            },
            fields,
            chunks: Vec::new(),
        };
        let n: u64 = response.decode_first().unwrap();
        assert_eq!(n, 42);
    }

    #[test]
    fn test_garbage_header_is_malformed() {
        let buf = [0x01u8]; // positive fixint, not a map
        let mut cur = Cursor::new(&buf[..]);
        let err = decode_header(&mut cur).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Malformed(_))));

        let mut str_frame = Vec::new();
        write_str(&mut str_frame, "nope").unwrap();
        let mut cur = Cursor::new(&str_frame[..]);
        let err = decode_header(&mut cur).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Malformed(_))));
    }
}
