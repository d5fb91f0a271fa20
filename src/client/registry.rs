//! Outstanding request bookkeeping: sync id allocation, the sync → waiter
//! map, chunk accumulation and the deadline timer task.
//!
//! Sync ids grow strictly; they are never reused within a connection
//! generation. The waiter map sits behind a plain mutex whose critical
//! sections are all O(1).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use rmpv::Value;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::client::supervisor::LoopControl;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::response::Response;

struct Waiter {
    tx: oneshot::Sender<Result<Response>>,
    chunks: Vec<Value>,
    retry_safe: bool,
}

struct Inner {
    next_sync: u32,
    waiters: HashMap<u32, Waiter>,
}

pub(crate) struct Registry {
    inner: Mutex<Inner>,
    /// Signalled whenever the waiter map becomes empty; the graceful
    /// shutdown path waits on it.
    drained: Notify,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_sync: 1,
                waiters: HashMap::new(),
            }),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry lock poisoned")
    }

    /// Allocate the next sync id. The counter never wraps; exhausting it
    /// requires a reconnect, which resets the generation.
    pub(crate) fn allocate(&self) -> Result<u32> {
        let mut inner = self.lock();
        if inner.next_sync == u32::MAX {
            return Err(ProtocolError::SyncExhausted.into());
        }
        let sync = inner.next_sync;
        inner.next_sync += 1;
        Ok(sync)
    }

    pub(crate) fn register(
        &self,
        sync: u32,
        tx: oneshot::Sender<Result<Response>>,
        retry_safe: bool,
    ) {
        let prev = self.lock().waiters.insert(
            sync,
            Waiter {
                tx,
                chunks: Vec::new(),
                retry_safe,
            },
        );
        debug_assert!(prev.is_none(), "duplicate waiter for sync {sync}");
    }

    /// Deliver a final result to the waiter for `sync`. Returns false when no
    /// waiter is tracked, i.e. the response is unsolicited or the request was
    /// cancelled earlier.
    pub(crate) fn complete(&self, sync: u32, result: Result<Response>) -> bool {
        let waiter = {
            let mut inner = self.lock();
            let waiter = inner.waiters.remove(&sync);
            if inner.waiters.is_empty() {
                self.drained.notify_waiters();
            }
            waiter
        };
        match waiter {
            Some(waiter) => {
                let result = match result {
                    Ok(mut response) => {
                        response.chunks = waiter.chunks;
                        Ok(response)
                    }
                    err => err,
                };
                // The caller may have given up already; that is not an error.
                let _ = waiter.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Stash a partial result for `sync` without completing the waiter.
    pub(crate) fn append_chunk(&self, sync: u32, data: Value) -> bool {
        let mut inner = self.lock();
        match inner.waiters.get_mut(&sync) {
            Some(waiter) => {
                waiter.chunks.push(data);
                true
            }
            None => false,
        }
    }

    /// Fail one waiter, e.g. on deadline expiry.
    pub(crate) fn fail(&self, sync: u32, err: Error) -> bool {
        self.complete(sync, Err(err))
    }

    /// Fail every outstanding waiter at generation teardown. `transient`
    /// marks a reconnect in progress: requests flagged retry-safe get a
    /// retryable error then.
    pub(crate) fn fail_all(&self, transient: bool) {
        let waiters = {
            let mut inner = self.lock();
            let waiters: Vec<Waiter> = inner.waiters.drain().map(|(_, w)| w).collect();
            self.drained.notify_waiters();
            waiters
        };
        for waiter in waiters {
            let retryable = transient && waiter.retry_safe;
            let _ = waiter.tx.send(Err(Error::closed(retryable)));
        }
    }

    /// Begin a new connection generation: no waiters may survive, and the
    /// sync counter restarts above the syncs the handshake consumed.
    pub(crate) fn reset(&self, next_sync: u32) {
        let mut inner = self.lock();
        debug_assert!(inner.waiters.is_empty(), "reset with live waiters");
        inner.waiters.clear();
        inner.next_sync = next_sync;
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Wait until the waiter map is empty or `grace` elapses.
    pub(crate) async fn wait_drained(&self, grace: Duration) {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.outstanding() == 0 {
                    return;
                }
                notified.await;
            }
        };
        let _ = tokio::time::timeout(grace, wait).await;
    }
}

pub(crate) enum TimerMsg {
    Register { sync: u32, deadline: Instant },
}

/// Deadline timer task: one per connection generation. Fails waiters with
/// [`Error::Timeout`] when their deadline passes; a response arriving later
/// finds no waiter and is dropped by the reader.
pub(crate) async fn run_timer(
    mut rx: mpsc::UnboundedReceiver<TimerMsg>,
    registry: std::sync::Arc<Registry>,
    mut control: watch::Receiver<LoopControl>,
) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, u32)>> = BinaryHeap::new();
    loop {
        let next = deadlines
            .peek()
            .map(|Reverse((at, _))| *at)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

        tokio::select! {
            changed = control.changed() => {
                if changed.is_err() || *control.borrow() == LoopControl::Abort {
                    break;
                }
            }
            msg = rx.recv() => match msg {
                Some(TimerMsg::Register { sync, deadline }) => {
                    deadlines.push(Reverse((deadline, sync)));
                }
                None => break,
            },
            _ = tokio::time::sleep_until(next) => {
                let now = Instant::now();
                while let Some(Reverse((at, sync))) = deadlines.peek().copied() {
                    if at > now {
                        break;
                    }
                    deadlines.pop();
                    if registry.fail(sync, Error::Timeout) {
                        debug!(sync, "request deadline elapsed");
                    }
                }
            }
        }
    }
}
