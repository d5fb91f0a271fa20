//! Stream handles: server-side ordered execution contexts that make
//! interactive transactions possible over a single connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::client::{Connection, RequestOptions};
use crate::error::{Error, Result};
use crate::protocol::request::{Begin, Commit, Request, Rollback};
use crate::protocol::response::Response;

/// A stream over its parent connection.
///
/// Every request sent through the handle is tagged with the stream id, so
/// the server executes them in submission order. A handle owns at most one
/// open transaction; dropping it without commit or rollback leaves the
/// cleanup to the server, which rolls back on disconnect.
pub struct Stream {
    conn: Connection,
    id: u64,
    tx_open: AtomicBool,
}

impl Stream {
    pub(crate) fn new(conn: Connection, id: u64) -> Self {
        Self {
            conn,
            id,
            tx_open: AtomicBool::new(false),
        }
    }

    /// The non-zero stream id carried in every frame header.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.tx_open.load(Ordering::Acquire)
    }

    /// Send any request within this stream.
    pub async fn send<R: Request>(&self, request: R) -> Result<Response> {
        self.conn
            .dispatch(Arc::new(request), Some(self.id), RequestOptions::default())
            .await
    }

    pub async fn send_with<R: Request>(
        &self,
        request: R,
        options: RequestOptions,
    ) -> Result<Response> {
        self.conn
            .dispatch(Arc::new(request), Some(self.id), options)
            .await
    }

    /// Open a transaction with default isolation.
    pub async fn begin(&self) -> Result<()> {
        self.begin_with(Begin::default()).await
    }

    pub async fn begin_with(&self, begin: Begin) -> Result<()> {
        if self.tx_open.swap(true, Ordering::AcqRel) {
            return Err(Error::Transaction(
                "transaction already open on this stream".to_string(),
            ));
        }
        match self
            .conn
            .dispatch(Arc::new(begin), Some(self.id), RequestOptions::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                self.tx_open.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub async fn commit(&self) -> Result<()> {
        if !self.tx_open.swap(false, Ordering::AcqRel) {
            return Err(Error::Transaction("no active transaction".to_string()));
        }
        self.conn
            .dispatch(Arc::new(Commit), Some(self.id), RequestOptions::default())
            .await
            .map(|_| ())
    }

    pub async fn rollback(&self) -> Result<()> {
        if !self.tx_open.swap(false, Ordering::AcqRel) {
            return Err(Error::Transaction("no active transaction".to_string()));
        }
        self.conn
            .dispatch(Arc::new(Rollback), Some(self.id), RequestOptions::default())
            .await
            .map(|_| ())
    }
}
