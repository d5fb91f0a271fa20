//! Shared test helpers: a scripted fake IPROTO server.
//!
//! The server speaks just enough of the protocol for end-to-end tests: it
//! sends a greeting, answers AUTH and IPROTO_ID itself, records every
//! decoded frame and lets each test script the replies for everything else.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use tarantool_client::protocol::auth::chap_sha1_scramble;
use tarantool_client::protocol::consts::{keys, Feature, RequestType};
use tarantool_client::protocol::greeting::render_greeting;

/// Salt every fake server hands out, so tests can verify scrambles.
pub const SALT: [u8; 32] = [0x5a; 32];

/// One decoded frame received from the client.
#[derive(Debug, Clone)]
pub struct Recorded {
    /// 1-based index of the connection the frame arrived on.
    pub conn: usize,
    pub request_type: u64,
    pub sync: u64,
    pub stream_id: Option<u64>,
    pub body: HashMap<u64, Value>,
}

impl Recorded {
    pub fn is(&self, t: RequestType) -> bool {
        self.request_type == u64::from(t.as_u8())
    }

    pub fn body_field(&self, key: u8) -> Option<&Value> {
        self.body.get(&u64::from(key))
    }
}

/// What the responder tells the server to do with a frame.
pub enum Reply {
    /// OK response carrying the value under DATA.
    Ok(Value),
    /// OK response with an empty body.
    OkEmpty,
    /// OK response with explicit body fields.
    Fields(Vec<(u8, Value)>),
    /// Error response; `message` travels in ERROR_24.
    Error { code: u32, message: String },
    /// Server push notification.
    Event { key: String, value: Value },
    /// OK response addressed to an arbitrary sync (for unsolicited-frame
    /// tests).
    OkWithSync { sync: u64, data: Value },
    /// Say nothing.
    None,
    /// Close the connection.
    Drop,
}

pub type Responder = Arc<dyn Fn(&Recorded) -> Vec<Reply> + Send + Sync>;

pub struct ServerOptions {
    pub features: Vec<Feature>,
    pub protocol_version: u64,
    /// Expected password; `None` accepts any AUTH.
    pub password: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            features: Feature::CLIENT.to_vec(),
            protocol_version: 6,
            password: None,
        }
    }
}

struct ServerState {
    options: ServerOptions,
    responder: Responder,
    recorded: Mutex<Vec<Recorded>>,
    notify: Notify,
    connections: AtomicUsize,
    schema_version: AtomicU64,
}

pub struct FakeServer {
    addr: String,
    state: Arc<ServerState>,
}

impl FakeServer {
    pub async fn spawn(
        options: ServerOptions,
        responder: impl Fn(&Recorded) -> Vec<Reply> + Send + Sync + 'static,
    ) -> FakeServer {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let state = Arc::new(ServerState {
            options,
            responder: Arc::new(responder),
            recorded: Mutex::new(Vec::new()),
            notify: Notify::new(),
            connections: AtomicUsize::new(0),
            schema_version: AtomicU64::new(1),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let conn = accept_state.connections.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = serve(stream, conn, &accept_state).await;
            }
        });

        FakeServer { addr, state }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.state.recorded.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn set_schema_version(&self, version: u64) {
        self.state.schema_version.store(version, Ordering::SeqCst);
    }

    /// Wait until the recorded frames satisfy `pred`, or panic after 5s.
    pub async fn wait_until(&self, what: &str, pred: impl Fn(&[Recorded]) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let notified = self.state.notify.notified();
            if pred(&self.state.recorded.lock().unwrap()) {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    panic!("timed out waiting for: {what}");
                }
            }
        }
    }
}

async fn serve(mut stream: TcpStream, conn: usize, state: &Arc<ServerState>) -> std::io::Result<()> {
    stream
        .write_all(&render_greeting("3.1.0", &SALT))
        .await?;
    stream.flush().await?;

    loop {
        let payload = match read_frame(&mut stream).await? {
            Some(payload) => payload,
            None => return Ok(()),
        };
        let recorded = match decode_frame(conn, &payload) {
            Some(recorded) => recorded,
            None => continue,
        };
        {
            let mut all = state.recorded.lock().unwrap();
            all.push(recorded.clone());
        }
        state.notify.notify_waiters();

        let replies = builtin_replies(&recorded, state)
            .unwrap_or_else(|| (state.responder)(&recorded));
        for reply in replies {
            if write_reply(&mut stream, &recorded, reply, state).await?.is_break() {
                return Ok(());
            }
        }
    }
}

/// The server answers the handshake itself so tests only script the
/// interesting frames.
fn builtin_replies(recorded: &Recorded, state: &Arc<ServerState>) -> Option<Vec<Reply>> {
    if recorded.is(RequestType::Auth) {
        let reply = match &state.options.password {
            None => Reply::OkEmpty,
            Some(password) => {
                let expected = chap_sha1_scramble(&SALT[..20], password);
                let sent = recorded
                    .body_field(keys::TUPLE)
                    .and_then(Value::as_array)
                    .and_then(|tuple| tuple.get(1))
                    .and_then(|v| match v {
                        Value::String(s) => Some(s.as_bytes().to_vec()),
                        Value::Binary(b) => Some(b.clone()),
                        _ => None,
                    });
                if sent.as_deref() == Some(&expected[..]) {
                    Reply::OkEmpty
                } else {
                    Reply::Error {
                        code: 47,
                        message: "User not found or supplied credentials are invalid".to_string(),
                    }
                }
            }
        };
        return Some(vec![reply]);
    }
    if recorded.is(RequestType::Id) {
        let features: Vec<Value> = state
            .options
            .features
            .iter()
            .map(|f| Value::from(f.as_u64()))
            .collect();
        return Some(vec![Reply::Fields(vec![
            (keys::VERSION, Value::from(state.options.protocol_version)),
            (keys::FEATURES, Value::Array(features)),
        ])]);
    }
    None
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut marker = [0u8; 1];
    match stream.read_exact(&mut marker).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = match marker[0] {
        m @ 0x00..=0x7f => usize::from(m),
        0xcc => {
            let mut b = [0u8; 1];
            stream.read_exact(&mut b).await?;
            usize::from(b[0])
        }
        0xcd => {
            let mut b = [0u8; 2];
            stream.read_exact(&mut b).await?;
            usize::from(u16::from_be_bytes(b))
        }
        0xce => {
            let mut b = [0u8; 4];
            stream.read_exact(&mut b).await?;
            u32::from_be_bytes(b) as usize
        }
        _ => return Ok(None),
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

fn decode_frame(conn: usize, payload: &[u8]) -> Option<Recorded> {
    let mut cur = Cursor::new(payload);
    let header = rmpv::decode::read_value(&mut cur).ok()?;
    let header = match header {
        Value::Map(entries) => entries,
        _ => return None,
    };
    let mut recorded = Recorded {
        conn,
        request_type: 0,
        sync: 0,
        stream_id: None,
        body: HashMap::new(),
    };
    for (key, value) in header {
        match key.as_u64()? {
            k if k == u64::from(keys::REQUEST_TYPE) => recorded.request_type = value.as_u64()?,
            k if k == u64::from(keys::SYNC) => recorded.sync = value.as_u64()?,
            k if k == u64::from(keys::STREAM_ID) => recorded.stream_id = value.as_u64(),
            _ => {}
        }
    }
    if (cur.position() as usize) < payload.len() {
        if let Ok(Value::Map(entries)) = rmpv::decode::read_value(&mut cur) {
            for (key, value) in entries {
                if let Some(k) = key.as_u64() {
                    recorded.body.insert(k, value);
                }
            }
        }
    }
    Some(recorded)
}

fn frame(header: Vec<(u64, Value)>, body: Vec<(u64, Value)>) -> Vec<u8> {
    let to_map = |entries: Vec<(u64, Value)>| {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::from(k), v))
                .collect(),
        )
    };
    let mut payload = Vec::new();
    rmpv::encode::write_value(&mut payload, &to_map(header)).unwrap();
    rmpv::encode::write_value(&mut payload, &to_map(body)).unwrap();

    let mut out = vec![0xce];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

async fn write_reply(
    stream: &mut TcpStream,
    recorded: &Recorded,
    reply: Reply,
    state: &Arc<ServerState>,
) -> std::io::Result<std::ops::ControlFlow<()>> {
    use std::ops::ControlFlow;

    let schema_version = state.schema_version.load(Ordering::SeqCst);
    let ok_header = |sync: u64| {
        vec![
            (u64::from(keys::RESPONSE_CODE), Value::from(0)),
            (u64::from(keys::SYNC), Value::from(sync)),
            (u64::from(keys::SCHEMA_VERSION), Value::from(schema_version)),
        ]
    };

    let bytes = match reply {
        Reply::Ok(data) => frame(
            ok_header(recorded.sync),
            vec![(u64::from(keys::DATA), data)],
        ),
        Reply::OkEmpty => frame(ok_header(recorded.sync), vec![]),
        Reply::Fields(fields) => frame(
            ok_header(recorded.sync),
            fields
                .into_iter()
                .map(|(k, v)| (u64::from(k), v))
                .collect(),
        ),
        Reply::Error { code, message } => frame(
            vec![
                (
                    u64::from(keys::RESPONSE_CODE),
                    Value::from(0x8000 + u64::from(code)),
                ),
                (u64::from(keys::SYNC), Value::from(recorded.sync)),
                (u64::from(keys::SCHEMA_VERSION), Value::from(schema_version)),
            ],
            vec![(u64::from(keys::ERROR_24), Value::from(message))],
        ),
        Reply::Event { key, value } => frame(
            vec![(
                u64::from(keys::REQUEST_TYPE),
                Value::from(u64::from(RequestType::Event.as_u8())),
            )],
            vec![
                (u64::from(keys::EVENT_KEY), Value::from(key)),
                (u64::from(keys::EVENT_DATA), value),
            ],
        ),
        Reply::OkWithSync { sync, data } => {
            frame(ok_header(sync), vec![(u64::from(keys::DATA), data)])
        }
        Reply::None => return Ok(ControlFlow::Continue(())),
        Reply::Drop => return Ok(ControlFlow::Break(())),
    };
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(ControlFlow::Continue(()))
}

/// Canned `_vspace` row for a space named `test` with id 512.
pub fn test_space_row() -> Value {
    Value::Array(vec![
        Value::from(512),
        Value::from(1),
        Value::from("test"),
        Value::from("memtx"),
        Value::from(2),
        Value::Map(vec![]),
        Value::Array(vec![
            Value::Map(vec![
                (Value::from("name"), Value::from("id")),
                (Value::from("type"), Value::from("unsigned")),
            ]),
            Value::Map(vec![
                (Value::from("name"), Value::from("value")),
                (Value::from("type"), Value::from("string")),
            ]),
        ]),
    ])
}

/// Canned `_vindex` row for the primary index of space 512.
pub fn test_index_row() -> Value {
    Value::Array(vec![
        Value::from(512),
        Value::from(0),
        Value::from("primary"),
        Value::from("TREE"),
        Value::Map(vec![(Value::from("unique"), Value::from(true))]),
        Value::Array(vec![Value::Map(vec![
            (Value::from("field"), Value::from(0)),
            (Value::from("type"), Value::from("unsigned")),
        ])]),
    ])
}
