//! Connection engine: the public [`Connection`] handle plus the supervisor,
//! writer, reader and timer tasks behind it.

pub mod builder;
mod dialer;
mod reader;
mod registry;
mod stream;
mod supervisor;
mod watcher;
mod writer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rmpv::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

pub use builder::{ConnectionBuilder, ReconnectOptions};
pub use dialer::ServerInfo;
pub use stream::Stream;
pub use supervisor::ConnectionState;
pub use watcher::{WatchHandler, WatchToken};

use crate::error::{Error, Result, SchemaError};
use crate::protocol::consts::{IteratorType, ER_WRONG_SCHEMA_VERSION, VINDEX_ID, VSPACE_ID};
use crate::protocol::request::{Call, Eval, Ping, Request, Select, Unwatch, Watch, WatchOnce};
use crate::protocol::response::Response;
use crate::schema::{build_snapshot, SchemaCache, SchemaResolver, SpaceMetadata};
use registry::Registry;
use supervisor::{CloseMode, Supervisor};
use watcher::WatcherRegistry;
use writer::Submission;

/// Per-request knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Deadline for this request; overrides the builder-level default.
    pub timeout: Option<Duration>,
    /// Marks the request safe to retry: if the connection is torn down
    /// while it is in flight, the waiter fails with a retryable error.
    pub retry_safe: bool,
}

impl RequestOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_safe(mut self, retry_safe: bool) -> Self {
        self.retry_safe = retry_safe;
        self
    }
}

struct ConnectionInner {
    submit_tx: mpsc::Sender<Submission>,
    state_rx: watch::Receiver<ConnectionState>,
    close_tx: mpsc::Sender<CloseMode>,
    registry: Arc<Registry>,
    watchers: Arc<WatcherRegistry>,
    schema: Arc<SchemaCache>,
    server_info: Arc<RwLock<Option<ServerInfo>>>,
    last_error: Arc<Mutex<Option<Error>>>,
    request_timeout: Option<Duration>,
    next_stream_id: AtomicU64,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // Last handle gone: tell the supervisor to tear everything down.
        let _ = self.close_tx.try_send(CloseMode::Abort);
    }
}

/// Handle to one IPROTO connection. Cheap to clone; all clones share the
/// same wire connection and lifecycle.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub(crate) async fn start(
        dial_config: builder::DialConfig,
        reconnect: ReconnectOptions,
        request_timeout: Option<Duration>,
        queue_capacity: usize,
    ) -> Result<Connection> {
        let registry = Arc::new(Registry::new());
        let watchers = Arc::new(WatcherRegistry::new());
        let schema = Arc::new(SchemaCache::new());
        let server_info = Arc::new(RwLock::new(None));
        let last_error = Arc::new(Mutex::new(None));
        let (submit_tx, submit_rx) = mpsc::channel(queue_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (close_tx, close_rx) = mpsc::channel(2);

        let supervisor = Supervisor {
            dial_config,
            reconnect,
            registry: Arc::clone(&registry),
            watchers: Arc::clone(&watchers),
            schema: Arc::clone(&schema),
            state_tx,
            close_rx,
            submit_tx: submit_tx.clone(),
            submit_rx: Some(submit_rx),
            server_info: Arc::clone(&server_info),
            last_error: Arc::clone(&last_error),
        };
        tokio::spawn(supervisor.run());

        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                submit_tx,
                state_rx,
                close_tx,
                registry,
                watchers,
                schema,
                server_info,
                last_error,
                request_timeout,
                next_stream_id: AtomicU64::new(1),
            }),
        };

        // Hand the connection out only once the first handshake concluded.
        let mut state_rx = conn.inner.state_rx.clone();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Ready => return Ok(conn),
                ConnectionState::Closed => {
                    let err = conn
                        .inner
                        .last_error
                        .lock()
                        .expect("error slot poisoned")
                        .take();
                    return Err(err.unwrap_or(Error::ConnectionClosed { retryable: false }));
                }
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(Error::ConnectionClosed { retryable: false });
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// What the handshake learned about the server, once connected.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner
            .server_info
            .read()
            .expect("server info poisoned")
            .clone()
    }

    /// Submit a request and await its response.
    pub async fn send<R: Request>(&self, request: R) -> Result<Response> {
        self.dispatch(Arc::new(request), None, RequestOptions::default())
            .await
    }

    pub async fn send_with<R: Request>(
        &self,
        request: R,
        options: RequestOptions,
    ) -> Result<Response> {
        self.dispatch(Arc::new(request), None, options).await
    }

    /// Liveness probe; success is observable only through the reply.
    pub async fn ping(&self) -> Result<()> {
        self.send(Ping).await.map(|_| ())
    }

    /// Call a stored function.
    pub async fn call<T: serde::Serialize>(
        &self,
        function: &str,
        args: &T,
    ) -> Result<Response> {
        self.send(Call::new(function, args)?).await
    }

    /// Evaluate a Lua expression.
    pub async fn eval<T: serde::Serialize>(&self, expr: &str, args: &T) -> Result<Response> {
        self.send(Eval::new(expr, args)?).await
    }

    /// Read the current value of an event key without subscribing.
    pub async fn watch_once(&self, key: &str) -> Result<Option<Value>> {
        let response = self.send(WatchOnce { key: key.to_string() }).await?;
        Ok(response.data().cloned())
    }

    /// Open a new stream: requests sent through it execute in order on the
    /// server and may form an interactive transaction.
    pub fn stream(&self) -> Stream {
        let id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        Stream::new(self.clone(), id)
    }

    /// Subscribe to server-pushed notifications for `key`.
    ///
    /// The handler runs on the reader task for every notification, in
    /// arrival order; it must not block. The subscription survives
    /// reconnects until [`Connection::unwatch`] removes it.
    pub async fn watch(
        &self,
        key: &str,
        handler: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) -> Result<WatchToken> {
        let (token, first) = self.inner.watchers.register(key, Arc::new(handler));
        if first {
            let result = self
                .dispatch(
                    Arc::new(Watch {
                        key: key.to_string(),
                    }),
                    None,
                    RequestOptions::default(),
                )
                .await;
            if let Err(e) = result {
                self.inner.watchers.unregister(&token);
                return Err(e);
            }
        }
        Ok(token)
    }

    /// Remove a subscription; the last binding for a key sends UNWATCH.
    pub async fn unwatch(&self, token: WatchToken) -> Result<()> {
        if self.inner.watchers.unregister(&token) {
            self.dispatch(
                Arc::new(Unwatch {
                    key: token.key().to_string(),
                }),
                None,
                RequestOptions::default(),
            )
            .await?;
        }
        Ok(())
    }

    /// Space metadata by name, refreshing the schema cache as needed.
    pub async fn space(&self, name: &str) -> Result<Arc<SpaceMetadata>> {
        if self.inner.schema.needs_refresh() {
            self.refresh_schema().await?;
        }
        if let Some(snapshot) = self.inner.schema.snapshot() {
            if let Some(space) = snapshot.space_by_name(name) {
                return Ok(Arc::clone(space));
            }
        }
        Err(SchemaError::SpaceNotFound(name.to_string()).into())
    }

    /// Gracefully close: drain queued requests, deliver in-flight
    /// responses, then shut the transport down.
    pub async fn close(&self) -> Result<()> {
        let _ = self.inner.close_tx.send(CloseMode::Graceful).await;
        self.wait_closed().await;
        Ok(())
    }

    /// Abort immediately: every pending request fails with a non-retryable
    /// `ConnectionClosed`.
    pub async fn abort(&self) {
        let _ = self.inner.close_tx.send(CloseMode::Abort).await;
        self.wait_closed().await;
    }

    async fn wait_closed(&self) {
        let mut state_rx = self.inner.state_rx.clone();
        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Closed {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Route a request through the engine, transparently refreshing the
    /// schema and retrying once when the schema went stale under it.
    pub(crate) async fn dispatch(
        &self,
        request: Arc<dyn Request>,
        stream_id: Option<u64>,
        options: RequestOptions,
    ) -> Result<Response> {
        // A name-addressed request cannot encode without a snapshot when the
        // server takes only numeric ids.
        if request.uses_names()
            && !self.inner.schema.names_supported()
            && self.inner.schema.needs_refresh()
        {
            self.refresh_schema().await?;
        }

        match self.submit(Arc::clone(&request), stream_id, options).await {
            Err(e) if schema_retry(&e) => {
                debug!(error = %e, "schema went stale, refreshing and retrying once");
                self.inner.schema.mark_stale();
                self.refresh_schema().await?;
                self.submit(request, stream_id, options).await
            }
            other => other,
        }
    }

    /// Queue one submission and await its completion. No retries here.
    async fn submit(
        &self,
        request: Arc<dyn Request>,
        stream_id: Option<u64>,
        options: RequestOptions,
    ) -> Result<Response> {
        match self.state() {
            ConnectionState::Closed | ConnectionState::Shutdown => {
                return Err(Error::ConnectionClosed { retryable: false })
            }
            _ => {}
        }

        let deadline = options
            .timeout
            .or(self.inner.request_timeout)
            .map(|t| Instant::now() + t);

        if request.is_async() {
            let submission = Submission {
                request,
                stream_id,
                reply: None,
                deadline: None,
                retry_safe: options.retry_safe,
            };
            self.inner
                .submit_tx
                .send(submission)
                .await
                .map_err(|_| Error::ConnectionClosed { retryable: false })?;
            return Ok(Response::empty());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let submission = Submission {
            request,
            stream_id,
            reply: Some(reply_tx),
            deadline,
            retry_safe: options.retry_safe,
        };
        self.inner
            .submit_tx
            .send(submission)
            .await
            .map_err(|_| Error::ConnectionClosed { retryable: false })?;

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed { retryable: false }),
        }
    }

    /// Fetch `_vspace` and `_vindex` and swap in a fresh snapshot. Stale
    /// lookups racing here share one on-wire refresh.
    pub(crate) async fn refresh_schema(&self) -> Result<()> {
        let schema = Arc::clone(&self.inner.schema);
        let _gate = schema.refresh_gate.lock().await;
        if !schema.needs_refresh() {
            // Another task refreshed while this one waited on the gate.
            return Ok(());
        }

        let spaces = self
            .submit(
                Arc::new(Select::new(VSPACE_ID).iterator(IteratorType::All)),
                None,
                RequestOptions::default(),
            )
            .await?;
        let indexes = self
            .submit(
                Arc::new(Select::new(VINDEX_ID).iterator(IteratorType::All)),
                None,
                RequestOptions::default(),
            )
            .await?;

        let version = indexes
            .header
            .schema_version
            .or(spaces.header.schema_version)
            .unwrap_or(0);
        let empty = Vec::new();
        let space_rows = spaces
            .data()
            .and_then(Value::as_array)
            .unwrap_or(&empty);
        let index_rows = indexes
            .data()
            .and_then(Value::as_array)
            .unwrap_or(&empty);

        let snapshot = build_snapshot(version, space_rows, index_rows)?;
        debug!(
            version,
            spaces = space_rows.len(),
            "schema snapshot installed"
        );
        schema.install(snapshot);
        Ok(())
    }
}

fn schema_retry(e: &Error) -> bool {
    match e {
        Error::Schema(_) => true,
        Error::Server(server) => server.code == ER_WRONG_SCHEMA_VERSION,
        _ => false,
    }
}
