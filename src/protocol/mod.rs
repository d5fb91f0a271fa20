//! IPROTO wire protocol: constants, MessagePack codec, framing, greeting and
//! auth handshake pieces, request builders and response decoding.

pub mod auth;
pub mod codec;
pub mod consts;
pub mod frame;
pub mod greeting;
pub mod request;
pub mod response;

pub use consts::{Feature, IsolationLevel, IteratorType, RequestType};
pub use greeting::Greeting;
pub use request::{
    Auth, Begin, Call, Commit, Delete, Eval, Id, Insert, Ping, Replace, Request, Rollback,
    Select, Unwatch, Update, UpdateOps, Upsert, Watch, WatchOnce,
};
pub use response::{Header, Response};
