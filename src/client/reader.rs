//! Reader loop: the single task that owns the response side of the
//! transport.
//!
//! Every incoming frame is dispatched by sync to its waiter, routed to the
//! watcher registry when it is a server push, or logged and dropped when
//! nothing claims it. Header schema versions feed the schema cache staleness
//! check as a side effect.

use std::io::Cursor;
use std::sync::Arc;

use rmpv::Value;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::client::registry::Registry;
use crate::client::supervisor::LoopControl;
use crate::client::watcher::WatcherRegistry;
use crate::client::writer::Submission;
use crate::error::{Error, Result};
use crate::protocol::consts::{keys, RequestType};
use crate::protocol::frame::read_frame;
use crate::protocol::request::Watch;
use crate::protocol::response::{decode_body, decode_header, server_error, Response};
use crate::schema::SchemaCache;

pub(crate) async fn run_reader<R>(
    mut rd: R,
    registry: Arc<Registry>,
    watchers: Arc<WatcherRegistry>,
    schema: Arc<SchemaCache>,
    ack_tx: mpsc::Sender<Submission>,
    failure_tx: mpsc::Sender<Error>,
    mut control: watch::Receiver<LoopControl>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let payload = tokio::select! {
            changed = control.changed() => {
                // Keep reading through a graceful drain so in-flight
                // responses still reach their waiters.
                if changed.is_err() || *control.borrow() == LoopControl::Abort {
                    break;
                }
                continue;
            }
            frame = read_frame(&mut rd) => match frame {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(error = %e, "reader loop terminating");
                    let _ = failure_tx.send(e).await;
                    break;
                }
            },
        };

        if let Err(e) = handle_frame(&payload, &registry, &watchers, &schema, &ack_tx).await {
            // A frame we cannot even parse poisons the byte stream.
            debug!(error = %e, "reader loop terminating on malformed frame");
            let _ = failure_tx.send(e).await;
            break;
        }
    }
}

async fn handle_frame(
    payload: &[u8],
    registry: &Registry,
    watchers: &WatcherRegistry,
    schema: &SchemaCache,
    ack_tx: &mpsc::Sender<Submission>,
) -> Result<()> {
    let mut cur = Cursor::new(payload);
    let header = decode_header(&mut cur)?;

    if let Some(version) = header.schema_version {
        schema.observe_version(version);
    }

    if header.code == u64::from(RequestType::Event.as_u8()) {
        let mut fields = decode_body(&mut cur)?;
        let key = fields
            .get(&u64::from(keys::EVENT_KEY))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(key) = key else {
            warn!("event frame without a key, ignoring");
            return Ok(());
        };
        let value = fields
            .remove(&u64::from(keys::EVENT_DATA))
            .unwrap_or(Value::Nil);
        let delivered = watchers.dispatch(&key, &value);
        if delivered {
            // Acknowledge so the server sends the next state change. The
            // reader must never park on a full submission queue, so a
            // congested ack is dropped; the next reconnect re-subscribes.
            let ack = Submission {
                request: Arc::new(Watch { key: key.clone() }),
                stream_id: None,
                reply: None,
                deadline: None,
                retry_safe: false,
            };
            if ack_tx.try_send(ack).is_err() {
                warn!(key = %key, "submission queue full, dropping watch ack");
            }
        }
        return Ok(());
    }

    if header.code == u64::from(RequestType::Chunk.as_u8()) {
        let mut fields = decode_body(&mut cur)?;
        let data = fields.remove(&u64::from(keys::DATA)).unwrap_or(Value::Nil);
        let sync = header.sync as u32;
        if !registry.append_chunk(sync, data) {
            warn!(sync = header.sync, "chunk for unknown sync, dropping");
        }
        return Ok(());
    }

    let fields = decode_body(&mut cur)?;
    let result = match header.error_code() {
        Some(code) => Err(Error::Server(server_error(code, &fields))),
        None => Ok(Response {
            header: header.clone(),
            fields,
            chunks: Vec::new(),
        }),
    };

    let sync = header.sync as u32;
    if !registry.complete(sync, result) {
        // Unsolicited: either a cancelled request's late reply or a peer
        // bug. Neither warrants tearing the connection down.
        warn!(sync = header.sync, "unsolicited response, dropping");
    }
    Ok(())
}
