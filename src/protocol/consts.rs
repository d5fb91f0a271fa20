//! IPROTO constants: header/body map keys, request types, iterators,
//! transaction isolation levels and protocol features.
//!
//! Only the subset used by this crate is listed.

/// Client protocol version advertised in IPROTO_ID.
pub const PROTOCOL_VERSION: u64 = 6;

/// System space holding space metadata, readable without schema access.
pub const VSPACE_ID: u32 = 281;

/// System space holding index metadata.
pub const VINDEX_ID: u32 = 289;

/// Error code reported by the server when the request was encoded against
/// an outdated schema version.
pub const ER_WRONG_SCHEMA_VERSION: u32 = 109;

/// IPROTO map keys.
pub mod keys {
    pub const REQUEST_TYPE: u8 = 0x00;
    pub const RESPONSE_CODE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SCHEMA_VERSION: u8 = 0x05;
    pub const STREAM_ID: u8 = 0x0a;
    pub const SPACE_ID: u8 = 0x10;
    pub const INDEX_ID: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const FETCH_POSITION: u8 = 0x1f;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION_NAME: u8 = 0x22;
    pub const USER_NAME: u8 = 0x23;
    pub const EXPR: u8 = 0x27;
    pub const OPS: u8 = 0x28;
    pub const AFTER_POSITION: u8 = 0x2e;
    pub const AFTER_TUPLE: u8 = 0x2f;
    pub const DATA: u8 = 0x30;
    pub const ERROR_24: u8 = 0x31;
    pub const POSITION: u8 = 0x35;
    pub const SQL_TEXT: u8 = 0x40;
    pub const SQL_BIND: u8 = 0x41;
    pub const SQL_INFO: u8 = 0x42;
    pub const STMT_ID: u8 = 0x43;
    pub const ERROR: u8 = 0x52;
    pub const VERSION: u8 = 0x54;
    pub const FEATURES: u8 = 0x55;
    pub const TIMEOUT: u8 = 0x56;
    pub const EVENT_KEY: u8 = 0x57;
    pub const EVENT_DATA: u8 = 0x58;
    pub const TXN_ISOLATION: u8 = 0x59;
    pub const AUTH_TYPE: u8 = 0x5b;
    pub const SPACE_NAME: u8 = 0x5e;
    pub const INDEX_NAME: u8 = 0x5f;
}

/// MP_ERROR payload keys (value of the [`keys::ERROR`] body field).
pub mod error_keys {
    pub const STACK: u8 = 0x00;
    pub const TYPE: u8 = 0x00;
    pub const FILE: u8 = 0x01;
    pub const LINE: u8 = 0x02;
    pub const MESSAGE: u8 = 0x03;
    pub const ERRNO: u8 = 0x04;
    pub const CODE: u8 = 0x05;
    pub const FIELDS: u8 = 0x06;
}

/// Request type constants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    Ok = 0,
    Select = 1,
    Insert = 2,
    Replace = 3,
    Update = 4,
    Delete = 5,
    /// CALL request wrapping results into the legacy [tuple, tuple, ...] form.
    Call16 = 6,
    Auth = 7,
    Eval = 8,
    Upsert = 9,
    /// CALL request returning arbitrary MessagePack.
    Call = 10,
    Execute = 11,
    Nop = 12,
    Prepare = 13,
    Begin = 14,
    Commit = 15,
    Rollback = 16,
    Ping = 64,
    Id = 73,
    Watch = 74,
    Unwatch = 75,
    Event = 76,
    WatchOnce = 77,
    /// Non-final response carrying a partial result.
    Chunk = 128,
}

impl RequestType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

pub mod response_codes {
    pub const OK: u64 = 0x0;
    pub const ERROR_RANGE_START: u64 = 0x8000;
    pub const ERROR_RANGE_END: u64 = 0x8FFF;
}

/// Iterator types for SELECT.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum IteratorType {
    #[default]
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
    BitsAllSet = 7,
    BitsAnySet = 8,
    BitsAllNotSet = 9,
    Overlaps = 10,
    Neighbor = 11,
}

/// Transaction isolation level for BEGIN.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum IsolationLevel {
    /// Use the default level from box.cfg.
    #[default]
    Default = 0,
    /// Read changes that are committed but not confirmed yet.
    ReadCommitted = 1,
    /// Read confirmed changes.
    ReadConfirmed = 2,
    /// Determine isolation level automatically.
    BestEffort = 3,
    /// Linearizable read view.
    Linearizable = 4,
}

/// Protocol features exchanged via IPROTO_ID.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Feature {
    Streams = 0,
    Transactions = 1,
    ErrorExtension = 2,
    Watchers = 3,
    Pagination = 4,
    SpaceAndIndexNames = 5,
    WatchOnce = 6,
}

impl Feature {
    /// Every feature this client understands, advertised in IPROTO_ID.
    pub const CLIENT: &'static [Feature] = &[
        Feature::Streams,
        Feature::Transactions,
        Feature::ErrorExtension,
        Feature::Watchers,
        Feature::Pagination,
        Feature::SpaceAndIndexNames,
        Feature::WatchOnce,
    ];

    pub fn as_u64(self) -> u64 {
        self as u64
    }
}
