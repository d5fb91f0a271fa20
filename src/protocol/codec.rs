//! MessagePack encoding helpers shared by the request and response paths.
//!
//! IPROTO header and body maps are keyed by small integers; the helpers here
//! write them through `rmp` primitives. Caller-supplied tuples, keys and call
//! arguments go through serde into [`rmpv::Value`] trees.

use std::fmt::Display;
use std::io::Cursor;

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, ProtocolError, Result};

/// MessagePack extension type carrying a UUID payload.
pub const EXT_UUID: i8 = 2;

/// MessagePack extension type carrying a Tarantool decimal.
pub const EXT_DECIMAL: i8 = 1;

/// MessagePack extension type carrying a Tarantool datetime.
pub const EXT_DATETIME: i8 = 4;

pub(crate) fn enc_err(e: impl Display) -> Error {
    Error::Encode(e.to_string())
}

/// Convert any serde-serializable value into a MessagePack value tree.
///
/// Serialization goes through `rmp_serde`, so structs encode positionally
/// as arrays, which is how the server models tuples.
pub fn to_value<T: Serialize>(v: &T) -> Result<Value> {
    let bytes = rmp_serde::to_vec(v).map_err(enc_err)?;
    rmpv::decode::read_value(&mut &bytes[..]).map_err(|e| Error::Encode(e.to_string()))
}

/// Convert a caller-supplied tuple, key or argument list into a value that
/// is guaranteed to be a MessagePack array.
///
/// `()` and other unit-like inputs serialize to nil; the server expects an
/// array there, so nil is normalized to an empty one.
pub fn to_tuple_value<T: Serialize>(v: &T) -> Result<Value> {
    match to_value(v)? {
        Value::Nil => Ok(Value::Array(Vec::new())),
        Value::Array(items) => Ok(Value::Array(items)),
        other => Ok(Value::Array(vec![other])),
    }
}

/// Decode a MessagePack value tree into a typed value. Arrays decode into
/// tuples, tuple structs and `Vec`s alike.
pub fn from_value<T: DeserializeOwned>(v: Value) -> Result<T> {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &v).map_err(|e| Error::Decode(e.to_string()))?;
    rmp_serde::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))
}

/// Read one MessagePack value from a buffer cursor.
pub fn read_value(cur: &mut Cursor<&[u8]>) -> Result<Value> {
    rmpv::decode::read_value(cur).map_err(Into::into)
}

pub(crate) fn write_map_len(buf: &mut Vec<u8>, len: u32) -> Result<()> {
    rmp::encode::write_map_len(buf, len).map_err(enc_err)?;
    Ok(())
}

pub(crate) fn write_array_len(buf: &mut Vec<u8>, len: u32) -> Result<()> {
    rmp::encode::write_array_len(buf, len).map_err(enc_err)?;
    Ok(())
}

/// Write an IPROTO map key. All keys used by the protocol fit a positive
/// fixint.
pub(crate) fn write_key(buf: &mut Vec<u8>, key: u8) -> Result<()> {
    rmp::encode::write_pfix(buf, key).map_err(enc_err)
}

pub(crate) fn write_uint(buf: &mut Vec<u8>, v: u64) -> Result<()> {
    rmp::encode::write_uint(buf, v).map_err(enc_err)?;
    Ok(())
}

pub(crate) fn write_bool(buf: &mut Vec<u8>, v: bool) -> Result<()> {
    rmp::encode::write_bool(buf, v).map_err(enc_err)
}

pub(crate) fn write_f64(buf: &mut Vec<u8>, v: f64) -> Result<()> {
    rmp::encode::write_f64(buf, v).map_err(enc_err)?;
    Ok(())
}

pub(crate) fn write_str(buf: &mut Vec<u8>, v: &str) -> Result<()> {
    rmp::encode::write_str(buf, v).map_err(enc_err)?;
    Ok(())
}

/// Write raw bytes with a MessagePack string header. The auth scramble is
/// binary but travels as MP_STR.
pub(crate) fn write_str_bytes(buf: &mut Vec<u8>, v: &[u8]) -> Result<()> {
    rmp::encode::write_str_len(buf, v.len() as u32).map_err(enc_err)?;
    buf.extend_from_slice(v);
    Ok(())
}

pub(crate) fn write_bin(buf: &mut Vec<u8>, v: &[u8]) -> Result<()> {
    rmp::encode::write_bin(buf, v).map_err(enc_err)?;
    Ok(())
}

pub(crate) fn write_value(buf: &mut Vec<u8>, v: &Value) -> Result<()> {
    rmpv::encode::write_value(buf, v).map_err(enc_err)
}

/// Wrap a UUID into its MessagePack extension value.
pub fn uuid_value(u: &Uuid) -> Value {
    Value::Ext(EXT_UUID, u.as_bytes().to_vec())
}

/// Unwrap a MessagePack UUID extension value.
pub fn value_to_uuid(v: &Value) -> Option<Uuid> {
    match v {
        Value::Ext(EXT_UUID, data) => Uuid::from_slice(data).ok(),
        _ => None,
    }
}

/// Interpret a MessagePack value as an unsigned integer.
pub(crate) fn value_as_u64(v: &Value) -> Result<u64> {
    v.as_u64().ok_or_else(|| {
        Error::Protocol(ProtocolError::Malformed(format!(
            "expected unsigned integer, got {v}"
        )))
    })
}
