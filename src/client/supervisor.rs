//! Connection lifecycle supervisor.
//!
//! Owns the state machine `Connecting → Ready → {Shutdown, Reconnecting} →
//! Closed`, spawns the writer/reader/timer tasks for every generation, fails
//! outstanding waiters on teardown and re-subscribes watchers before a new
//! generation reports Ready.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::client::builder::{DialConfig, ReconnectOptions};
use crate::client::dialer::{dial, Handshake, ServerInfo};
use crate::client::reader::run_reader;
use crate::client::registry::{run_timer, Registry};
use crate::client::watcher::WatcherRegistry;
use crate::client::writer::{encode_request_frame, run_writer, Submission};
use crate::error::{Error, TransportError};
use crate::protocol::request::Watch;
use crate::schema::{NoSchema, SchemaCache};

/// Where the connection currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial transport establishment and handshake.
    Connecting,
    /// Fully operational.
    Ready,
    /// Graceful close in progress: the writer queue is draining.
    Shutdown,
    /// Transport lost; a new generation is being established.
    Reconnecting,
    /// Terminal.
    Closed,
}

/// Control signal shared by the per-generation loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopControl {
    Run,
    /// Writer flushes what is queued and exits; reader and timer keep
    /// serving in-flight responses.
    Drain,
    Abort,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum CloseMode {
    Graceful,
    Abort,
}

/// How long a graceful close waits for in-flight responses.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

enum ConnectOutcome {
    Connected(Box<Handshake>),
    Fatal(Error),
    CloseRequested,
}

enum GenerationEnd {
    Failed(Error),
    CloseGraceful,
    CloseAbort,
}

pub(crate) struct Supervisor {
    pub dial_config: DialConfig,
    pub reconnect: ReconnectOptions,
    pub registry: Arc<Registry>,
    pub watchers: Arc<WatcherRegistry>,
    pub schema: Arc<SchemaCache>,
    pub state_tx: watch::Sender<ConnectionState>,
    pub close_rx: mpsc::Receiver<CloseMode>,
    pub submit_tx: mpsc::Sender<Submission>,
    pub submit_rx: Option<mpsc::Receiver<Submission>>,
    pub server_info: Arc<RwLock<Option<ServerInfo>>>,
    pub last_error: Arc<Mutex<Option<Error>>>,
}

impl Supervisor {
    pub(crate) async fn run(mut self) {
        let mut reconnecting = false;
        loop {
            let _ = self.state_tx.send(if reconnecting {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            let handshake = match self.connect_with_backoff().await {
                ConnectOutcome::Connected(handshake) => *handshake,
                ConnectOutcome::Fatal(e) => {
                    warn!(error = %e, "giving up on connection");
                    self.enter_closed(Some(e));
                    return;
                }
                ConnectOutcome::CloseRequested => {
                    self.enter_closed(None);
                    return;
                }
            };

            match self.run_generation(handshake).await {
                GenerationEnd::Failed(e) => {
                    warn!(error = %e, "connection lost, reconnecting");
                    self.registry.fail_all(true);
                    *self.last_error.lock().expect("error slot poisoned") = Some(e);
                    reconnecting = true;
                }
                GenerationEnd::CloseGraceful | GenerationEnd::CloseAbort => {
                    self.enter_closed(None);
                    return;
                }
            }
        }
    }

    async fn connect_with_backoff(&mut self) -> ConnectOutcome {
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                result = dial(&self.dial_config) => result,
                _ = self.close_rx.recv() => return ConnectOutcome::CloseRequested,
            };
            match result {
                Ok(handshake) => return ConnectOutcome::Connected(Box::new(handshake)),
                // Bad credentials or a missing required feature will not fix
                // themselves by retrying.
                Err(e @ (Error::Auth(_) | Error::Unsupported(_))) => {
                    return ConnectOutcome::Fatal(e)
                }
                Err(e) => {
                    if self.reconnect.exhausted(attempt) {
                        return ConnectOutcome::Fatal(e);
                    }
                    let delay = self.reconnect.delay(attempt);
                    warn!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "handshake failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.close_rx.recv() => return ConnectOutcome::CloseRequested,
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Run one connection generation to completion.
    async fn run_generation(&mut self, handshake: Handshake) -> GenerationEnd {
        let Handshake {
            mut transport,
            server,
            next_sync,
        } = handshake;

        self.schema.set_names_supported(server.names_supported());
        // The snapshot (if any) was built against the previous server
        // incarnation.
        self.schema.mark_stale();
        *self.server_info.write().expect("server info poisoned") = Some(server);
        self.registry.reset(next_sync);

        // Watcher bindings survive reconnects: every live key is
        // re-subscribed before the connection reports Ready.
        let keys = self.watchers.keys();
        if !keys.is_empty() {
            let mut buf = Vec::with_capacity(64);
            for key in keys {
                let sync = match self.registry.allocate() {
                    Ok(sync) => sync,
                    Err(e) => return GenerationEnd::Failed(e),
                };
                buf.clear();
                if let Err(e) = encode_request_frame(
                    &Watch { key: key.clone() },
                    sync,
                    None,
                    &NoSchema,
                    &mut buf,
                ) {
                    return GenerationEnd::Failed(e);
                }
                if let Err(e) = transport.write_all(&buf).await {
                    return GenerationEnd::Failed(TransportError::Io(e).into());
                }
                debug!(key = %key, "watcher resubscribed");
            }
            if let Err(e) = transport.flush().await {
                return GenerationEnd::Failed(TransportError::Io(e).into());
            }
        }

        let (rd, wr) = tokio::io::split(transport);
        let (control_tx, control_rx) = watch::channel(LoopControl::Run);
        let (failure_tx, mut failure_rx) = mpsc::channel::<Error>(4);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let submit_rx = self
            .submit_rx
            .take()
            .expect("submission queue already in use");
        let writer = tokio::spawn(run_writer(
            wr,
            submit_rx,
            Arc::clone(&self.registry),
            Arc::clone(&self.schema),
            timer_tx,
            failure_tx.clone(),
            control_rx.clone(),
        ));
        let reader = tokio::spawn(run_reader(
            rd,
            Arc::clone(&self.registry),
            Arc::clone(&self.watchers),
            Arc::clone(&self.schema),
            self.submit_tx.clone(),
            failure_tx,
            control_rx.clone(),
        ));
        let timer = tokio::spawn(run_timer(
            timer_rx,
            Arc::clone(&self.registry),
            control_rx,
        ));

        let _ = self.state_tx.send(ConnectionState::Ready);
        info!("connection ready");

        let end = tokio::select! {
            failure = failure_rx.recv() => GenerationEnd::Failed(
                failure.unwrap_or_else(|| TransportError::Disconnected.into()),
            ),
            mode = self.close_rx.recv() => match mode {
                Some(CloseMode::Graceful) => GenerationEnd::CloseGraceful,
                // All handles dropped without an explicit close.
                Some(CloseMode::Abort) | None => GenerationEnd::CloseAbort,
            },
        };

        match end {
            GenerationEnd::CloseGraceful => {
                let _ = self.state_tx.send(ConnectionState::Shutdown);
                let _ = control_tx.send(LoopControl::Drain);
            }
            _ => {
                let _ = control_tx.send(LoopControl::Abort);
            }
        }

        // The writer hands the submission queue back for the next
        // generation (or the final drain).
        match writer.await {
            Ok(rx) => self.submit_rx = Some(rx),
            Err(e) => error!(error = %e, "writer task panicked"),
        }

        if matches!(end, GenerationEnd::CloseGraceful) {
            self.registry.wait_drained(SHUTDOWN_GRACE).await;
            let _ = control_tx.send(LoopControl::Abort);
        }

        let _ = reader.await;
        let _ = timer.await;
        end
    }

    /// Terminal transition: fail everything still pending and publish
    /// `Closed`.
    fn enter_closed(&mut self, err: Option<Error>) {
        if let Some(e) = err {
            *self.last_error.lock().expect("error slot poisoned") = Some(e);
        }
        self.registry.fail_all(false);
        if let Some(mut rx) = self.submit_rx.take() {
            rx.close();
            while let Ok(submission) = rx.try_recv() {
                if let Some(reply) = submission.reply {
                    let _ = reply.send(Err(Error::closed(false)));
                }
            }
        }
        let _ = self.state_tx.send(ConnectionState::Closed);
        info!("connection closed");
    }
}
