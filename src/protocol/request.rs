//! The request contract and the concrete IPROTO request builders.
//!
//! A request knows its opcode, whether the server replies at all, and how to
//! encode its body given a [`SchemaResolver`]. Body maps are written with
//! integer keys in ascending order, which is the canonical order the server
//! expects.

use std::time::Duration;

use rmpv::Value;
use serde::Serialize;

use crate::error::Result;
use crate::protocol::auth::CHAP_SHA1;
use crate::protocol::codec::{
    to_tuple_value, to_value, write_array_len, write_bin, write_bool, write_f64, write_key,
    write_map_len, write_str, write_str_bytes, write_uint, write_value,
};
use crate::protocol::consts::{keys, Feature, IsolationLevel, IteratorType, RequestType};
use crate::schema::{IndexRef, SchemaResolver, SpaceRef};

/// A logical message submitted to the connection engine.
///
/// Stream association is not part of the message itself; it is applied at
/// submission time by the stream handle the request was sent through.
pub trait Request: Send + Sync + 'static {
    fn request_type(&self) -> RequestType;

    /// The server sends no reply; no waiter is allocated for the request.
    fn is_async(&self) -> bool {
        false
    }

    /// Whether the body references any space or index by name. Used to
    /// refresh the schema cache before encoding when the peer cannot take
    /// names on the wire.
    fn uses_names(&self) -> bool {
        false
    }

    fn encode_body(&self, resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()>;
}

/// A space reference resolved against the peer's capabilities: either a
/// numeric id or a name passed through on the wire.
enum SpaceTarget {
    Id(u32),
    Name(String),
}

enum IndexTarget {
    Id(u32),
    Name(String),
}

fn space_target(resolver: &dyn SchemaResolver, space: &SpaceRef) -> Result<SpaceTarget> {
    match space {
        SpaceRef::Id(id) => Ok(SpaceTarget::Id(*id)),
        SpaceRef::Name(name) => {
            if resolver.names_supported() {
                Ok(SpaceTarget::Name(name.clone()))
            } else {
                Ok(SpaceTarget::Id(resolver.space_id(name)?))
            }
        }
    }
}

fn index_target(
    resolver: &dyn SchemaResolver,
    index: &IndexRef,
    space: &SpaceTarget,
) -> Result<IndexTarget> {
    match index {
        IndexRef::Id(id) => Ok(IndexTarget::Id(*id)),
        IndexRef::Name(name) => {
            if resolver.names_supported() {
                Ok(IndexTarget::Name(name.clone()))
            } else {
                // Names are off the table, so the space necessarily resolved
                // to a numeric id above.
                let space_id = match space {
                    SpaceTarget::Id(id) => *id,
                    SpaceTarget::Name(_) => unreachable!("space name with names unsupported"),
                };
                Ok(IndexTarget::Id(resolver.index_id(space_id, name)?))
            }
        }
    }
}

fn write_space(buf: &mut Vec<u8>, space: &SpaceTarget) -> Result<()> {
    if let SpaceTarget::Id(id) = space {
        write_key(buf, keys::SPACE_ID)?;
        write_uint(buf, u64::from(*id))?;
    }
    Ok(())
}

fn write_index(buf: &mut Vec<u8>, index: &IndexTarget) -> Result<()> {
    if let IndexTarget::Id(id) = index {
        write_key(buf, keys::INDEX_ID)?;
        write_uint(buf, u64::from(*id))?;
    }
    Ok(())
}

/// Name keys sort above every numeric body key, so they close the map.
fn write_space_name(buf: &mut Vec<u8>, space: &SpaceTarget) -> Result<()> {
    if let SpaceTarget::Name(name) = space {
        write_key(buf, keys::SPACE_NAME)?;
        write_str(buf, name)?;
    }
    Ok(())
}

fn write_index_name(buf: &mut Vec<u8>, index: &IndexTarget) -> Result<()> {
    if let IndexTarget::Name(name) = index {
        write_key(buf, keys::INDEX_NAME)?;
        write_str(buf, name)?;
    }
    Ok(())
}

// ==================== Data requests ====================

/// SELECT from a space.
#[derive(Debug, Clone)]
pub struct Select {
    space: SpaceRef,
    index: IndexRef,
    limit: u32,
    offset: u32,
    iterator: IteratorType,
    key: Value,
    fetch_position: bool,
    after_position: Option<Vec<u8>>,
    after_tuple: Option<Value>,
}

impl Select {
    pub fn new(space: impl Into<SpaceRef>) -> Self {
        Self {
            space: space.into(),
            index: IndexRef::Id(0),
            limit: u32::MAX,
            offset: 0,
            iterator: IteratorType::default(),
            key: Value::Array(Vec::new()),
            fetch_position: false,
            after_position: None,
            after_tuple: None,
        }
    }

    pub fn index(mut self, index: impl Into<IndexRef>) -> Self {
        self.index = index.into();
        self
    }

    pub fn iterator(mut self, iterator: IteratorType) -> Self {
        self.iterator = iterator;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Ask the server to return the position of the last selected tuple for
    /// pagination.
    pub fn fetch_position(mut self, fetch: bool) -> Self {
        self.fetch_position = fetch;
        self
    }

    /// Continue after an opaque position returned by a previous select.
    pub fn after_position(mut self, position: Vec<u8>) -> Self {
        self.after_position = Some(position);
        self
    }

    /// Continue after the given tuple.
    pub fn after_tuple<T: Serialize>(mut self, tuple: &T) -> Result<Self> {
        self.after_tuple = Some(to_tuple_value(tuple)?);
        Ok(self)
    }

    pub fn key<T: Serialize>(mut self, key: &T) -> Result<Self> {
        self.key = to_tuple_value(key)?;
        Ok(self)
    }
}

impl Request for Select {
    fn request_type(&self) -> RequestType {
        RequestType::Select
    }

    fn uses_names(&self) -> bool {
        self.space.is_name() || self.index.is_name()
    }

    fn encode_body(&self, resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        let space = space_target(resolver, &self.space)?;
        let index = index_target(resolver, &self.index, &space)?;

        let mut len = 6;
        if self.fetch_position {
            len += 1;
        }
        if self.after_position.is_some() {
            len += 1;
        }
        if self.after_tuple.is_some() {
            len += 1;
        }
        write_map_len(buf, len)?;
        write_space(buf, &space)?;
        write_index(buf, &index)?;
        write_key(buf, keys::LIMIT)?;
        write_uint(buf, u64::from(self.limit))?;
        write_key(buf, keys::OFFSET)?;
        write_uint(buf, u64::from(self.offset))?;
        write_key(buf, keys::ITERATOR)?;
        write_uint(buf, self.iterator as u64)?;
        if self.fetch_position {
            write_key(buf, keys::FETCH_POSITION)?;
            write_bool(buf, true)?;
        }
        write_key(buf, keys::KEY)?;
        write_value(buf, &self.key)?;
        if let Some(position) = &self.after_position {
            write_key(buf, keys::AFTER_POSITION)?;
            write_bin(buf, position)?;
        }
        if let Some(tuple) = &self.after_tuple {
            write_key(buf, keys::AFTER_TUPLE)?;
            write_value(buf, tuple)?;
        }
        write_space_name(buf, &space)?;
        write_index_name(buf, &index)?;
        Ok(())
    }
}

/// INSERT a tuple.
#[derive(Debug, Clone)]
pub struct Insert {
    space: SpaceRef,
    tuple: Value,
}

impl Insert {
    pub fn new<T: Serialize>(space: impl Into<SpaceRef>, tuple: &T) -> Result<Self> {
        Ok(Self {
            space: space.into(),
            tuple: to_tuple_value(tuple)?,
        })
    }
}

impl Request for Insert {
    fn request_type(&self) -> RequestType {
        RequestType::Insert
    }

    fn uses_names(&self) -> bool {
        self.space.is_name()
    }

    fn encode_body(&self, resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        let space = space_target(resolver, &self.space)?;
        write_map_len(buf, 2)?;
        write_space(buf, &space)?;
        write_key(buf, keys::TUPLE)?;
        write_value(buf, &self.tuple)?;
        write_space_name(buf, &space)?;
        Ok(())
    }
}

/// REPLACE a tuple (insert-or-overwrite).
#[derive(Debug, Clone)]
pub struct Replace {
    space: SpaceRef,
    tuple: Value,
}

impl Replace {
    pub fn new<T: Serialize>(space: impl Into<SpaceRef>, tuple: &T) -> Result<Self> {
        Ok(Self {
            space: space.into(),
            tuple: to_tuple_value(tuple)?,
        })
    }
}

impl Request for Replace {
    fn request_type(&self) -> RequestType {
        RequestType::Replace
    }

    fn uses_names(&self) -> bool {
        self.space.is_name()
    }

    fn encode_body(&self, resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        let space = space_target(resolver, &self.space)?;
        write_map_len(buf, 2)?;
        write_space(buf, &space)?;
        write_key(buf, keys::TUPLE)?;
        write_value(buf, &self.tuple)?;
        write_space_name(buf, &space)?;
        Ok(())
    }
}

/// UPDATE tuples matched by a key.
#[derive(Debug, Clone)]
pub struct Update {
    space: SpaceRef,
    index: IndexRef,
    key: Value,
    ops: UpdateOps,
}

impl Update {
    pub fn new(space: impl Into<SpaceRef>, ops: UpdateOps) -> Self {
        Self {
            space: space.into(),
            index: IndexRef::Id(0),
            key: Value::Array(Vec::new()),
            ops,
        }
    }

    pub fn index(mut self, index: impl Into<IndexRef>) -> Self {
        self.index = index.into();
        self
    }

    pub fn key<T: Serialize>(mut self, key: &T) -> Result<Self> {
        self.key = to_tuple_value(key)?;
        Ok(self)
    }
}

impl Request for Update {
    fn request_type(&self) -> RequestType {
        RequestType::Update
    }

    fn uses_names(&self) -> bool {
        self.space.is_name() || self.index.is_name()
    }

    fn encode_body(&self, resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        let space = space_target(resolver, &self.space)?;
        let index = index_target(resolver, &self.index, &space)?;
        write_map_len(buf, 4)?;
        write_space(buf, &space)?;
        write_index(buf, &index)?;
        write_key(buf, keys::KEY)?;
        write_value(buf, &self.key)?;
        // The operation list travels under the TUPLE key for UPDATE.
        write_key(buf, keys::TUPLE)?;
        write_value(buf, &self.ops.to_value())?;
        write_space_name(buf, &space)?;
        write_index_name(buf, &index)?;
        Ok(())
    }
}

/// UPSERT: insert the tuple, or apply the operations if it already exists.
#[derive(Debug, Clone)]
pub struct Upsert {
    space: SpaceRef,
    tuple: Value,
    ops: UpdateOps,
}

impl Upsert {
    pub fn new<T: Serialize>(
        space: impl Into<SpaceRef>,
        tuple: &T,
        ops: UpdateOps,
    ) -> Result<Self> {
        Ok(Self {
            space: space.into(),
            tuple: to_tuple_value(tuple)?,
            ops,
        })
    }
}

impl Request for Upsert {
    fn request_type(&self) -> RequestType {
        RequestType::Upsert
    }

    fn uses_names(&self) -> bool {
        self.space.is_name()
    }

    fn encode_body(&self, resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        let space = space_target(resolver, &self.space)?;
        write_map_len(buf, 3)?;
        write_space(buf, &space)?;
        write_key(buf, keys::TUPLE)?;
        write_value(buf, &self.tuple)?;
        write_key(buf, keys::OPS)?;
        write_value(buf, &self.ops.to_value())?;
        write_space_name(buf, &space)?;
        Ok(())
    }
}

/// DELETE tuples matched by a key.
#[derive(Debug, Clone)]
pub struct Delete {
    space: SpaceRef,
    index: IndexRef,
    key: Value,
}

impl Delete {
    pub fn new(space: impl Into<SpaceRef>) -> Self {
        Self {
            space: space.into(),
            index: IndexRef::Id(0),
            key: Value::Array(Vec::new()),
        }
    }

    pub fn index(mut self, index: impl Into<IndexRef>) -> Self {
        self.index = index.into();
        self
    }

    pub fn key<T: Serialize>(mut self, key: &T) -> Result<Self> {
        self.key = to_tuple_value(key)?;
        Ok(self)
    }
}

impl Request for Delete {
    fn request_type(&self) -> RequestType {
        RequestType::Delete
    }

    fn uses_names(&self) -> bool {
        self.space.is_name() || self.index.is_name()
    }

    fn encode_body(&self, resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        let space = space_target(resolver, &self.space)?;
        let index = index_target(resolver, &self.index, &space)?;
        write_map_len(buf, 3)?;
        write_space(buf, &space)?;
        write_index(buf, &index)?;
        write_key(buf, keys::KEY)?;
        write_value(buf, &self.key)?;
        write_space_name(buf, &space)?;
        write_index_name(buf, &index)?;
        Ok(())
    }
}

// ==================== Call / Eval ====================

/// Call a stored function, returning arbitrary MessagePack.
#[derive(Debug, Clone)]
pub struct Call {
    function: String,
    args: Value,
    legacy: bool,
}

impl Call {
    pub fn new<T: Serialize>(function: impl Into<String>, args: &T) -> Result<Self> {
        Ok(Self {
            function: function.into(),
            args: to_tuple_value(args)?,
            legacy: false,
        })
    }

    /// Legacy CALL_16 variant wrapping every result into a tuple list.
    pub fn new_16<T: Serialize>(function: impl Into<String>, args: &T) -> Result<Self> {
        Ok(Self {
            function: function.into(),
            args: to_tuple_value(args)?,
            legacy: true,
        })
    }
}

impl Request for Call {
    fn request_type(&self) -> RequestType {
        if self.legacy {
            RequestType::Call16
        } else {
            RequestType::Call
        }
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        write_map_len(buf, 2)?;
        write_key(buf, keys::TUPLE)?;
        write_value(buf, &self.args)?;
        write_key(buf, keys::FUNCTION_NAME)?;
        write_str(buf, &self.function)?;
        Ok(())
    }
}

/// Evaluate a Lua expression on the server.
#[derive(Debug, Clone)]
pub struct Eval {
    expr: String,
    args: Value,
}

impl Eval {
    pub fn new<T: Serialize>(expr: impl Into<String>, args: &T) -> Result<Self> {
        Ok(Self {
            expr: expr.into(),
            args: to_tuple_value(args)?,
        })
    }
}

impl Request for Eval {
    fn request_type(&self) -> RequestType {
        RequestType::Eval
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        write_map_len(buf, 2)?;
        write_key(buf, keys::TUPLE)?;
        write_value(buf, &self.args)?;
        write_key(buf, keys::EXPR)?;
        write_str(buf, &self.expr)?;
        Ok(())
    }
}

// ==================== Control requests ====================

/// PING liveness probe. Awaits the empty reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

impl Request for Ping {
    fn request_type(&self) -> RequestType {
        RequestType::Ping
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        write_map_len(buf, 0)
    }
}

/// AUTH with a precomputed scramble.
#[derive(Debug, Clone)]
pub struct Auth {
    user: String,
    method: String,
    scramble: Vec<u8>,
}

impl Auth {
    pub fn chap_sha1(user: impl Into<String>, scramble: [u8; 20]) -> Self {
        Self {
            user: user.into(),
            method: CHAP_SHA1.to_string(),
            scramble: scramble.to_vec(),
        }
    }
}

impl Request for Auth {
    fn request_type(&self) -> RequestType {
        RequestType::Auth
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        write_map_len(buf, 2)?;
        write_key(buf, keys::TUPLE)?;
        write_array_len(buf, 2)?;
        write_str(buf, &self.method)?;
        // The scramble is raw bytes but travels as MP_STR.
        write_str_bytes(buf, &self.scramble)?;
        write_key(buf, keys::USER_NAME)?;
        write_str(buf, &self.user)?;
        Ok(())
    }
}

/// IPROTO_ID: advertise client protocol version and features.
#[derive(Debug, Clone)]
pub struct Id {
    pub version: u64,
    pub features: Vec<Feature>,
}

impl Request for Id {
    fn request_type(&self) -> RequestType {
        RequestType::Id
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        write_map_len(buf, 2)?;
        write_key(buf, keys::VERSION)?;
        write_uint(buf, self.version)?;
        write_key(buf, keys::FEATURES)?;
        write_array_len(buf, self.features.len() as u32)?;
        for feature in &self.features {
            write_uint(buf, feature.as_u64())?;
        }
        Ok(())
    }
}

/// BEGIN a transaction on a stream.
#[derive(Debug, Clone, Default)]
pub struct Begin {
    pub isolation: IsolationLevel,
    pub timeout: Option<Duration>,
}

impl Request for Begin {
    fn request_type(&self) -> RequestType {
        RequestType::Begin
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        let len = 1 + u32::from(self.timeout.is_some());
        write_map_len(buf, len)?;
        if let Some(timeout) = self.timeout {
            write_key(buf, keys::TIMEOUT)?;
            write_f64(buf, timeout.as_secs_f64())?;
        }
        write_key(buf, keys::TXN_ISOLATION)?;
        write_uint(buf, self.isolation as u64)?;
        Ok(())
    }
}

/// COMMIT the stream's transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Commit;

impl Request for Commit {
    fn request_type(&self) -> RequestType {
        RequestType::Commit
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        write_map_len(buf, 0)
    }
}

/// ROLLBACK the stream's transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rollback;

impl Request for Rollback {
    fn request_type(&self) -> RequestType {
        RequestType::Rollback
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        write_map_len(buf, 0)
    }
}

// ==================== Watcher requests ====================

/// Subscribe to server-pushed notifications for a key. Fire-and-forget.
#[derive(Debug, Clone)]
pub struct Watch {
    pub key: String,
}

impl Request for Watch {
    fn request_type(&self) -> RequestType {
        RequestType::Watch
    }

    fn is_async(&self) -> bool {
        true
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        write_map_len(buf, 1)?;
        write_key(buf, keys::EVENT_KEY)?;
        write_str(buf, &self.key)
    }
}

/// Drop the subscription for a key. Fire-and-forget.
#[derive(Debug, Clone)]
pub struct Unwatch {
    pub key: String,
}

impl Request for Unwatch {
    fn request_type(&self) -> RequestType {
        RequestType::Unwatch
    }

    fn is_async(&self) -> bool {
        true
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        write_map_len(buf, 1)?;
        write_key(buf, keys::EVENT_KEY)?;
        write_str(buf, &self.key)
    }
}

/// Fetch the current value of an event key without subscribing.
#[derive(Debug, Clone)]
pub struct WatchOnce {
    pub key: String,
}

impl Request for WatchOnce {
    fn request_type(&self) -> RequestType {
        RequestType::WatchOnce
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, buf: &mut Vec<u8>) -> Result<()> {
        write_map_len(buf, 1)?;
        write_key(buf, keys::EVENT_KEY)?;
        write_str(buf, &self.key)
    }
}

// ==================== Update operations ====================

/// Field address in an update operation: 1-based position or format name.
#[derive(Debug, Clone)]
pub enum FieldId {
    Num(i64),
    Name(String),
}

impl From<i64> for FieldId {
    fn from(n: i64) -> Self {
        FieldId::Num(n)
    }
}

impl From<i32> for FieldId {
    fn from(n: i32) -> Self {
        FieldId::Num(i64::from(n))
    }
}

impl From<u32> for FieldId {
    fn from(n: u32) -> Self {
        FieldId::Num(i64::from(n))
    }
}

impl From<&str> for FieldId {
    fn from(name: &str) -> Self {
        FieldId::Name(name.to_string())
    }
}

impl From<FieldId> for Value {
    fn from(f: FieldId) -> Value {
        match f {
            FieldId::Num(n) => Value::from(n),
            FieldId::Name(name) => Value::from(name),
        }
    }
}

/// Builder for the operation list of UPDATE and UPSERT.
#[derive(Debug, Clone, Default)]
pub struct UpdateOps {
    ops: Vec<Value>,
}

impl UpdateOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn push(mut self, operator: &str, field: FieldId, args: Vec<Value>) -> Self {
        let mut op = Vec::with_capacity(2 + args.len());
        op.push(Value::from(operator));
        op.push(field.into());
        op.extend(args);
        self.ops.push(Value::Array(op));
        self
    }

    pub fn add<T: Serialize>(self, field: impl Into<FieldId>, value: &T) -> Result<Self> {
        let v = to_value(value)?;
        Ok(self.push("+", field.into(), vec![v]))
    }

    pub fn sub<T: Serialize>(self, field: impl Into<FieldId>, value: &T) -> Result<Self> {
        let v = to_value(value)?;
        Ok(self.push("-", field.into(), vec![v]))
    }

    pub fn bit_and(self, field: impl Into<FieldId>, value: u64) -> Self {
        self.push("&", field.into(), vec![Value::from(value)])
    }

    pub fn bit_or(self, field: impl Into<FieldId>, value: u64) -> Self {
        self.push("|", field.into(), vec![Value::from(value)])
    }

    pub fn bit_xor(self, field: impl Into<FieldId>, value: u64) -> Self {
        self.push("^", field.into(), vec![Value::from(value)])
    }

    pub fn assign<T: Serialize>(self, field: impl Into<FieldId>, value: &T) -> Result<Self> {
        let v = to_value(value)?;
        Ok(self.push("=", field.into(), vec![v]))
    }

    pub fn insert<T: Serialize>(self, field: impl Into<FieldId>, value: &T) -> Result<Self> {
        let v = to_value(value)?;
        Ok(self.push("!", field.into(), vec![v]))
    }

    pub fn delete(self, field: impl Into<FieldId>, count: u64) -> Self {
        self.push("#", field.into(), vec![Value::from(count)])
    }

    /// Replace `len` bytes of a string field at `pos` with `replacement`.
    pub fn splice(
        self,
        field: impl Into<FieldId>,
        pos: i64,
        len: i64,
        replacement: impl Into<String>,
    ) -> Self {
        self.push(
            ":",
            field.into(),
            vec![
                Value::from(pos),
                Value::from(len),
                Value::from(replacement.into()),
            ],
        )
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Array(self.ops.clone())
    }
}
