use std::io;

use rmpv::Value;
use thiserror::Error;

/// All errors surfaced by this crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("peer does not support required feature: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("connection closed (retryable: {retryable})")]
    ConnectionClosed { retryable: bool },

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Whether retrying the same request on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConnectionClosed { retryable: true })
    }

    pub(crate) fn closed(retryable: bool) -> Self {
        Error::ConnectionClosed { retryable }
    }
}

/// Socket-level failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("truncated frame: expected {expected} payload bytes")]
    Truncated { expected: usize },

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u64),

    #[error("peer disconnected")]
    Disconnected,
}

/// Violations of the IPROTO framing or encoding rules by the peer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed messagepack: {0}")]
    Malformed(String),

    #[error("unsolicited response for sync {0}")]
    UnsolicitedResponse(u64),

    #[error("unknown request type {0}")]
    UnknownType(u64),

    #[error("invalid greeting: {0}")]
    InvalidGreeting(String),

    #[error("sync counter exhausted, reconnect required")]
    SyncExhausted,
}

/// Name resolution and schema cache failures.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("space '{0}' not found")]
    SpaceNotFound(String),

    #[error("index '{0}' not found in space {1}")]
    IndexNotFound(String, u32),

    #[error("server does not support name-based space/index references")]
    NameUnsupported,

    #[error("schema still stale after refresh")]
    StaleSchema,
}

/// Structured error reported by the server in a response body.
///
/// `code` is the IPROTO error code (response type minus the error range
/// base). `stack` carries the chained MP_ERROR frames when the server sent
/// the extended error payload; for legacy ERROR_24 responses it is empty.
#[derive(Error, Debug, Clone)]
#[error("server error {code}: {message}")]
pub struct ServerError {
    pub code: u32,
    pub message: String,
    pub stack: Vec<ErrorDetail>,
}

impl ServerError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: Vec::new(),
        }
    }
}

/// One frame of an MP_ERROR stack.
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    /// Error class, e.g. `ClientError` or `CustomError`.
    pub kind: String,
    pub message: String,
    pub code: u32,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub errno: Option<u64>,
    /// Extra key-value payload attached via `box.error.new{...}`.
    pub fields: Option<Value>,
}

impl From<rmpv::decode::Error> for Error {
    fn from(e: rmpv::decode::Error) -> Self {
        Error::Protocol(ProtocolError::Malformed(e.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
