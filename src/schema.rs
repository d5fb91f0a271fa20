//! Client-side view of server schema: spaces, indexes and name resolution.
//!
//! Metadata is fetched from the `_vspace` and `_vindex` system spaces and
//! kept as an immutable snapshot behind a read-write lock; lookups clone the
//! `Arc`, refreshes swap the whole snapshot. The reader loop marks the
//! snapshot stale when a response header carries a different schema version;
//! actual refetching is deferred until a lookup needs it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use rmpv::Value;

use crate::error::{Error, ProtocolError, Result, SchemaError};

/// A space referenced by numeric id or by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpaceRef {
    Id(u32),
    Name(String),
}

impl SpaceRef {
    pub fn is_name(&self) -> bool {
        matches!(self, SpaceRef::Name(_))
    }
}

impl From<u32> for SpaceRef {
    fn from(id: u32) -> Self {
        SpaceRef::Id(id)
    }
}

impl From<&str> for SpaceRef {
    fn from(name: &str) -> Self {
        SpaceRef::Name(name.to_string())
    }
}

impl From<String> for SpaceRef {
    fn from(name: String) -> Self {
        SpaceRef::Name(name)
    }
}

/// An index referenced by numeric id or by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexRef {
    Id(u32),
    Name(String),
}

impl IndexRef {
    pub fn is_name(&self) -> bool {
        matches!(self, IndexRef::Name(_))
    }
}

impl From<u32> for IndexRef {
    fn from(id: u32) -> Self {
        IndexRef::Id(id)
    }
}

impl From<&str> for IndexRef {
    fn from(name: &str) -> Self {
        IndexRef::Name(name.to_string())
    }
}

impl From<String> for IndexRef {
    fn from(name: String) -> Self {
        IndexRef::Name(name)
    }
}

/// Resolves space and index references while a request body is encoded.
///
/// When the peer advertises name support, names pass through to the wire
/// untouched and only numeric ids need resolution on the client.
pub trait SchemaResolver: Send + Sync {
    fn names_supported(&self) -> bool;
    fn space_id(&self, name: &str) -> Result<u32>;
    fn index_id(&self, space_id: u32, name: &str) -> Result<u32>;
}

/// Resolver for contexts where no schema is available; handshake requests
/// never reference spaces.
pub(crate) struct NoSchema;

impl SchemaResolver for NoSchema {
    fn names_supported(&self) -> bool {
        false
    }

    fn space_id(&self, name: &str) -> Result<u32> {
        Err(SchemaError::SpaceNotFound(name.to_string()).into())
    }

    fn index_id(&self, space_id: u32, name: &str) -> Result<u32> {
        Err(SchemaError::IndexNotFound(name.to_string(), space_id).into())
    }
}

/// One field of a space format.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFormat {
    pub name: String,
    pub field_type: String,
    pub is_nullable: bool,
}

/// One key part of an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPart {
    /// Zero-based field number within the tuple.
    pub field: u32,
    pub part_type: String,
    pub collation: Option<String>,
    pub is_nullable: bool,
}

#[derive(Debug, Clone)]
pub struct IndexMetadata {
    pub id: u32,
    pub space_id: u32,
    pub name: String,
    pub index_type: String,
    pub unique: bool,
    pub parts: Vec<IndexPart>,
}

#[derive(Debug, Clone)]
pub struct SpaceMetadata {
    pub id: u32,
    pub name: String,
    pub engine: String,
    pub fields: Vec<FieldFormat>,
    indexes_by_name: HashMap<String, Arc<IndexMetadata>>,
    indexes_by_id: HashMap<u32, Arc<IndexMetadata>>,
}

impl SpaceMetadata {
    pub fn index_by_name(&self, name: &str) -> Option<&Arc<IndexMetadata>> {
        self.indexes_by_name.get(name)
    }

    pub fn index_by_id(&self, id: u32) -> Option<&Arc<IndexMetadata>> {
        self.indexes_by_id.get(&id)
    }

    pub fn indexes(&self) -> impl Iterator<Item = &Arc<IndexMetadata>> {
        self.indexes_by_id.values()
    }
}

/// Immutable view of the server schema at one version.
#[derive(Debug)]
pub struct SchemaSnapshot {
    pub version: u64,
    by_name: HashMap<String, Arc<SpaceMetadata>>,
    by_id: HashMap<u32, Arc<SpaceMetadata>>,
}

impl SchemaSnapshot {
    pub fn space_by_name(&self, name: &str) -> Option<&Arc<SpaceMetadata>> {
        self.by_name.get(name)
    }

    pub fn space_by_id(&self, id: u32) -> Option<&Arc<SpaceMetadata>> {
        self.by_id.get(&id)
    }
}

fn malformed(what: &str) -> Error {
    Error::Protocol(ProtocolError::Malformed(format!(
        "unexpected system space row: {what}"
    )))
}

fn str_field<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn row_u32(row: &[Value], i: usize, what: &str) -> Result<u32> {
    row.get(i)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or_else(|| malformed(what))
}

fn row_str(row: &[Value], i: usize, what: &str) -> Result<String> {
    row.get(i)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| malformed(what))
}

/// Decode one `_vspace` row: `[id, owner, name, engine, field_count, flags,
/// format]`.
pub(crate) fn space_from_row(row: &Value) -> Result<SpaceMetadata> {
    let row = row.as_array().ok_or_else(|| malformed("not an array"))?;
    let id = row_u32(row, 0, "space id")?;
    let name = row_str(row, 2, "space name")?;
    let engine = row_str(row, 3, "space engine")?;

    let mut fields = Vec::new();
    if let Some(Value::Array(format)) = row.get(6) {
        for item in format {
            let map = match item.as_map() {
                Some(map) => map,
                None => continue,
            };
            fields.push(FieldFormat {
                name: str_field(map, "name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                field_type: str_field(map, "type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                is_nullable: str_field(map, "is_nullable")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }
    }

    Ok(SpaceMetadata {
        id,
        name,
        engine,
        fields,
        indexes_by_name: HashMap::new(),
        indexes_by_id: HashMap::new(),
    })
}

/// Decode one `_vindex` row: `[space_id, index_id, name, type, opts, parts]`.
///
/// `parts` comes in two shapes depending on server version: an array of
/// `[field, type]` pairs or an array of maps.
pub(crate) fn index_from_row(row: &Value) -> Result<IndexMetadata> {
    let row = row.as_array().ok_or_else(|| malformed("not an array"))?;
    let space_id = row_u32(row, 0, "index space id")?;
    let id = row_u32(row, 1, "index id")?;
    let name = row_str(row, 2, "index name")?;
    let index_type = row_str(row, 3, "index type")?;

    let unique = match row.get(4) {
        Some(Value::Map(opts)) => str_field(opts, "unique")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        _ => true,
    };

    let mut parts = Vec::new();
    if let Some(Value::Array(raw_parts)) = row.get(5) {
        for part in raw_parts {
            match part {
                Value::Map(map) => parts.push(IndexPart {
                    field: str_field(map, "field")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32,
                    part_type: str_field(map, "type")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    collation: str_field(map, "collation")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    is_nullable: str_field(map, "is_nullable")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }),
                Value::Array(pair) => parts.push(IndexPart {
                    field: pair.first().and_then(Value::as_u64).unwrap_or(0) as u32,
                    part_type: pair
                        .get(1)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    collation: None,
                    is_nullable: false,
                }),
                _ => return Err(malformed("index part")),
            }
        }
    }

    Ok(IndexMetadata {
        id,
        space_id,
        name,
        index_type,
        unique,
        parts,
    })
}

/// Assemble an immutable snapshot from raw `_vspace` and `_vindex` rows.
pub(crate) fn build_snapshot(
    version: u64,
    space_rows: &[Value],
    index_rows: &[Value],
) -> Result<SchemaSnapshot> {
    let mut spaces: HashMap<u32, SpaceMetadata> = HashMap::new();
    for row in space_rows {
        let space = space_from_row(row)?;
        spaces.insert(space.id, space);
    }

    for row in index_rows {
        let index = Arc::new(index_from_row(row)?);
        if let Some(space) = spaces.get_mut(&index.space_id) {
            space
                .indexes_by_name
                .insert(index.name.clone(), Arc::clone(&index));
            space.indexes_by_id.insert(index.id, index);
        }
    }

    let mut by_name = HashMap::with_capacity(spaces.len());
    let mut by_id = HashMap::with_capacity(spaces.len());
    for (id, space) in spaces {
        let space = Arc::new(space);
        by_name.insert(space.name.clone(), Arc::clone(&space));
        by_id.insert(id, space);
    }

    Ok(SchemaSnapshot {
        version,
        by_name,
        by_id,
    })
}

/// Shared schema cache: one per connection.
pub(crate) struct SchemaCache {
    snapshot: RwLock<Option<Arc<SchemaSnapshot>>>,
    stale: AtomicBool,
    names_supported: AtomicBool,
    /// Serializes refreshes so N concurrent stale lookups produce one fetch.
    pub(crate) refresh_gate: tokio::sync::Mutex<()>,
}

impl SchemaCache {
    pub(crate) fn new() -> Self {
        Self {
            snapshot: RwLock::new(None),
            stale: AtomicBool::new(false),
            names_supported: AtomicBool::new(false),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn snapshot(&self) -> Option<Arc<SchemaSnapshot>> {
        self.snapshot.read().expect("schema lock poisoned").clone()
    }

    pub(crate) fn install(&self, snapshot: SchemaSnapshot) {
        *self.snapshot.write().expect("schema lock poisoned") = Some(Arc::new(snapshot));
        self.stale.store(false, Ordering::Release);
    }

    /// Called by the reader loop for every response header carrying a schema
    /// version.
    pub(crate) fn observe_version(&self, version: u64) {
        if let Some(snapshot) = self.snapshot() {
            if snapshot.version != version {
                self.stale.store(true, Ordering::Release);
            }
        }
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub(crate) fn needs_refresh(&self) -> bool {
        self.stale.load(Ordering::Acquire) || self.snapshot().is_none()
    }

    pub(crate) fn set_names_supported(&self, supported: bool) {
        self.names_supported.store(supported, Ordering::Release);
    }
}

impl SchemaResolver for SchemaCache {
    fn names_supported(&self) -> bool {
        self.names_supported.load(Ordering::Acquire)
    }

    fn space_id(&self, name: &str) -> Result<u32> {
        let snapshot = self
            .snapshot()
            .ok_or_else(|| SchemaError::SpaceNotFound(name.to_string()))?;
        snapshot
            .space_by_name(name)
            .map(|s| s.id)
            .ok_or_else(|| SchemaError::SpaceNotFound(name.to_string()).into())
    }

    fn index_id(&self, space_id: u32, name: &str) -> Result<u32> {
        let snapshot = self
            .snapshot()
            .ok_or_else(|| SchemaError::IndexNotFound(name.to_string(), space_id))?;
        let space = snapshot
            .space_by_id(space_id)
            .ok_or_else(|| SchemaError::IndexNotFound(name.to_string(), space_id))?;
        space
            .index_by_name(name)
            .map(|i| i.id)
            .ok_or_else(|| SchemaError::IndexNotFound(name.to_string(), space_id).into())
    }
}
