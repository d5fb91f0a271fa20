//! Asynchronous Tokio-based client for the Tarantool IPROTO protocol.
//!
//! The crate implements the connection engine: a full-duplex, pipelined,
//! authenticated client that multiplexes requests over one TCP (or TLS)
//! socket, keeps a cached view of server schema, runs interactive
//! transactions over streams, delivers server-pushed watcher events and
//! reconnects with backoff when the transport fails.
//!
//! # Example
//!
//! ```rust,no_run
//! use tarantool_client::{Connection, Select};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tarantool_client::Error> {
//!     let conn = Connection::builder()
//!         .auth("guest", "")
//!         .build("127.0.0.1:3301")
//!         .await?;
//!
//!     conn.ping().await?;
//!
//!     // Select by space and index name; ids are resolved through the
//!     // schema cache or passed through when the server supports names.
//!     let response = conn
//!         .send(Select::new("clients").index("primary").key(&(1,))?)
//!         .await?;
//!     let rows: Vec<(u64, String)> = response.decode_data()?;
//!     println!("{rows:?}");
//!
//!     // Interactive transaction over a stream.
//!     let stream = conn.stream();
//!     stream.begin().await?;
//!     stream
//!         .send(tarantool_client::Insert::new("clients", &(2, "Jane"))?)
//!         .await?;
//!     stream.commit().await?;
//!
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod schema;

pub use client::{
    Connection, ConnectionBuilder, ConnectionState, ReconnectOptions, RequestOptions,
    ServerInfo, Stream, WatchHandler, WatchToken,
};
pub use error::{Error, ProtocolError, Result, SchemaError, ServerError, TransportError};
pub use protocol::{
    Auth, Begin, Call, Commit, Delete, Eval, Feature, Id, Insert, IsolationLevel, IteratorType,
    Ping, Replace, Request, RequestType, Response, Rollback, Select, Unwatch, Update, UpdateOps,
    Upsert, Watch, WatchOnce,
};
pub use rmpv::Value;
pub use schema::{
    FieldFormat, IndexMetadata, IndexPart, IndexRef, SchemaResolver, SpaceMetadata, SpaceRef,
};
