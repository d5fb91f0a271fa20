//! Writer loop: the single task allowed to write to the transport.
//!
//! It consumes the submission queue, assigns sync ids, encodes frames and
//! pushes them on the wire in completion order. On transport failure it
//! notifies the supervisor and exits, handing the submission queue back for
//! the next generation.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::registry::{Registry, TimerMsg};
use crate::client::supervisor::LoopControl;
use crate::error::{Error, Result, TransportError};
use crate::protocol::codec::{write_key, write_map_len, write_uint};
use crate::protocol::consts::keys;
use crate::protocol::frame::{begin_frame, finish_frame};
use crate::protocol::request::Request;
use crate::protocol::response::Response;
use crate::schema::{SchemaCache, SchemaResolver};

/// One queued request with everything the writer needs to put it on the wire
/// and route its reply.
pub(crate) struct Submission {
    pub request: Arc<dyn Request>,
    pub stream_id: Option<u64>,
    /// Absent for fire-and-forget requests: no waiter is ever allocated.
    pub reply: Option<oneshot::Sender<Result<Response>>>,
    pub deadline: Option<Instant>,
    pub retry_safe: bool,
}

/// Encode a complete frame (length prefix, header map, body map) for a
/// request. Shared by the writer loop, the dialer and the watcher
/// resubscription path.
pub(crate) fn encode_request_frame(
    request: &dyn Request,
    sync: u32,
    stream_id: Option<u64>,
    resolver: &dyn SchemaResolver,
    buf: &mut Vec<u8>,
) -> Result<()> {
    let start = begin_frame(buf);
    let header_len = 2 + u32::from(stream_id.is_some());
    write_map_len(buf, header_len)?;
    write_key(buf, keys::REQUEST_TYPE)?;
    write_uint(buf, u64::from(request.request_type().as_u8()))?;
    write_key(buf, keys::SYNC)?;
    write_uint(buf, u64::from(sync))?;
    if let Some(stream_id) = stream_id {
        write_key(buf, keys::STREAM_ID)?;
        write_uint(buf, stream_id)?;
    }
    match request.encode_body(resolver, buf) {
        Ok(()) => {
            finish_frame(buf, start);
            Ok(())
        }
        Err(e) => {
            // Drop the partial frame so the buffer stays reusable.
            buf.truncate(start);
            Err(e)
        }
    }
}

pub(crate) async fn run_writer<W>(
    mut wr: W,
    mut rx: mpsc::Receiver<Submission>,
    registry: Arc<Registry>,
    schema: Arc<SchemaCache>,
    timer_tx: mpsc::UnboundedSender<TimerMsg>,
    failure_tx: mpsc::Sender<Error>,
    mut control: watch::Receiver<LoopControl>,
) -> mpsc::Receiver<Submission>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    loop {
        let submission = tokio::select! {
            changed = control.changed() => {
                match (changed, *control.borrow()) {
                    (Ok(()), LoopControl::Run) => continue,
                    (Ok(()), LoopControl::Drain) => break,
                    _ => return rx,
                }
            }
            submission = rx.recv() => match submission {
                Some(submission) => submission,
                // Every connection handle is gone.
                None => return rx,
            },
        };

        match write_submission(&mut wr, submission, &registry, &schema, &timer_tx, &mut buf).await
        {
            Ok(()) => {}
            Err(e) => {
                debug!(error = %e, "writer loop terminating");
                let _ = failure_tx.send(e).await;
                return rx;
            }
        }
    }

    // Graceful drain: flush whatever was already queued, then stop.
    while let Ok(submission) = rx.try_recv() {
        if write_submission(&mut wr, submission, &registry, &schema, &timer_tx, &mut buf)
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = wr.shutdown().await;
    rx
}

/// Put one submission on the wire. An `Err` means the transport is dead;
/// per-request problems (cancelled caller, encode failure) are resolved
/// against the submission itself and return `Ok`.
async fn write_submission<W>(
    wr: &mut W,
    mut submission: Submission,
    registry: &Registry,
    schema: &SchemaCache,
    timer_tx: &mpsc::UnboundedSender<TimerMsg>,
    buf: &mut Vec<u8>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Cancelled before transmission: drop it silently.
    if let Some(reply) = &submission.reply {
        if reply.is_closed() {
            return Ok(());
        }
    }

    let sync = match registry.allocate() {
        Ok(sync) => sync,
        Err(e) => {
            // Counter exhaustion requires a reconnect.
            return Err(e);
        }
    };

    buf.clear();
    let resolver: &dyn SchemaResolver = schema;
    if let Err(e) = encode_request_frame(
        submission.request.as_ref(),
        sync,
        submission.stream_id,
        resolver,
        buf,
    ) {
        match submission.reply.take() {
            Some(reply) => {
                let _ = reply.send(Err(e));
            }
            None => warn!(error = %e, "dropping unencodable fire-and-forget request"),
        }
        return Ok(());
    }

    // Register the waiter before the frame hits the wire; the response can
    // arrive on the reader before write_all returns.
    if !submission.request.is_async() {
        if let Some(reply) = submission.reply.take() {
            registry.register(sync, reply, submission.retry_safe);
            if let Some(deadline) = submission.deadline {
                let _ = timer_tx.send(TimerMsg::Register { sync, deadline });
            }
        }
    }

    wr.write_all(buf)
        .await
        .map_err(|e| Error::from(TransportError::Io(e)))?;
    wr.flush()
        .await
        .map_err(|e| Error::from(TransportError::Io(e)))?;
    Ok(())
}
