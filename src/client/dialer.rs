//! Transport establishment and the connect-time handshake: greeting, AUTH,
//! IPROTO_ID negotiation and required-feature verification.

use std::io::Cursor;
use std::pin::Pin;
use std::task::{Context, Poll};

use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::client::builder::DialConfig;
use crate::client::writer::encode_request_frame;
use crate::error::{Error, Result, TransportError};
use crate::protocol::auth::chap_sha1_scramble;
use crate::protocol::consts::{keys, Feature, PROTOCOL_VERSION};
use crate::protocol::frame::read_frame;
use crate::protocol::greeting::{parse_greeting, GREETING_SIZE};
use crate::protocol::request::{Auth, Id, Request};
use crate::protocol::response::{decode_body, decode_header, server_error, Response};
use crate::schema::NoSchema;

/// Established byte transport: plain TCP or TLS over TCP.
pub(crate) enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// What the handshake learned about the peer.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Version from the greeting banner, e.g. `3.1.0`.
    pub version: String,
    /// Protocol version from IPROTO_ID; 0 for servers without ID support.
    pub protocol_version: u64,
    pub features: Vec<u64>,
    /// Auth method the server suggests for re-authentication.
    pub auth_method: Option<String>,
}

impl ServerInfo {
    pub fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature.as_u64())
    }

    pub fn names_supported(&self) -> bool {
        self.supports(Feature::SpaceAndIndexNames)
    }
}

pub(crate) struct Handshake {
    pub transport: Transport,
    pub server: ServerInfo,
    /// First sync id free for the writer loop; the handshake consumed the
    /// ones below it.
    pub next_sync: u32,
}

/// Open the transport and run the full handshake.
pub(crate) async fn dial(config: &DialConfig) -> Result<Handshake> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.addr))
        .await
        .map_err(|_| TransportError::ConnectFailed {
            addr: config.addr.clone(),
            reason: "connect timed out".to_string(),
        })?
        .map_err(|e| TransportError::ConnectFailed {
            addr: config.addr.clone(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true).map_err(TransportError::Io)?;

    #[cfg(feature = "tls")]
    let mut transport = match &config.tls {
        Some(tls) => {
            let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::clone(&tls.config));
            let stream = connector
                .connect(tls.server_name.clone(), stream)
                .await
                .map_err(|e| TransportError::ConnectFailed {
                    addr: config.addr.clone(),
                    reason: format!("tls: {e}"),
                })?;
            Transport::Tls(Box::new(stream))
        }
        None => Transport::Plain(stream),
    };
    #[cfg(not(feature = "tls"))]
    let mut transport = Transport::Plain(stream);

    let mut raw = [0u8; GREETING_SIZE];
    transport.read_exact(&mut raw).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::from(TransportError::Truncated {
                expected: GREETING_SIZE,
            })
        } else {
            Error::from(TransportError::Io(e))
        }
    })?;
    let greeting = parse_greeting(&raw)?;
    debug!(version = %greeting.version, "greeting received");

    let mut sync = 0u32;

    if let Some(credentials) = &config.credentials {
        sync += 1;
        let scramble = chap_sha1_scramble(greeting.auth_salt(), &credentials.password);
        let request = Auth::chap_sha1(credentials.user.as_str(), scramble);
        let response = roundtrip(&mut transport, &request, sync).await?;
        if let Some(code) = response.header.error_code() {
            let err = server_error(code, &response.fields);
            return Err(Error::Auth(err.message));
        }
        debug!(user = %credentials.user, "authenticated");
    }

    sync += 1;
    let id = Id {
        version: PROTOCOL_VERSION,
        features: Feature::CLIENT.to_vec(),
    };
    let response = roundtrip(&mut transport, &id, sync).await?;
    let server = match response.header.error_code() {
        // Servers predating IPROTO_ID reject it; they have no features.
        Some(_) => ServerInfo {
            version: greeting.version.clone(),
            protocol_version: 0,
            features: Vec::new(),
            auth_method: None,
        },
        None => ServerInfo {
            version: greeting.version.clone(),
            protocol_version: response
                .field(keys::VERSION)
                .and_then(Value::as_u64)
                .unwrap_or(0),
            features: response
                .field(keys::FEATURES)
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_u64).collect())
                .unwrap_or_default(),
            auth_method: response
                .field(keys::AUTH_TYPE)
                .and_then(Value::as_str)
                .map(str::to_string),
        },
    };

    for feature in &config.required_features {
        if !server.supports(*feature) {
            return Err(Error::Unsupported(format!("{feature:?}")));
        }
    }

    info!(
        addr = %config.addr,
        server = %server.version,
        protocol = server.protocol_version,
        "handshake complete"
    );

    Ok(Handshake {
        transport,
        server,
        next_sync: sync + 1,
    })
}

/// One blocking request/response exchange on the raw transport, used only
/// before the reader and writer loops exist.
async fn roundtrip(
    transport: &mut Transport,
    request: &dyn Request,
    sync: u32,
) -> Result<Response> {
    let mut buf = Vec::with_capacity(128);
    encode_request_frame(request, sync, None, &NoSchema, &mut buf)?;
    transport
        .write_all(&buf)
        .await
        .map_err(TransportError::Io)?;
    transport.flush().await.map_err(TransportError::Io)?;

    let payload = read_frame(transport).await?;
    let mut cur = Cursor::new(&payload[..]);
    let header = decode_header(&mut cur)?;
    let fields = decode_body(&mut cur)?;
    Ok(Response {
        header,
        fields,
        chunks: Vec::new(),
    })
}
