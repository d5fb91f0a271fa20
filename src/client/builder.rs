//! Connection configuration and builder.

use std::time::Duration;

use rand::Rng;

use crate::client::Connection;
use crate::error::Result;
use crate::protocol::consts::Feature;

/// Reconnect backoff policy: exponential with jitter.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Exponential growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound for the computed delay.
    pub max_delay: Duration,
    /// Fraction of the delay randomly shaved off, `0.0..=1.0`.
    pub jitter: f64,
    /// Attempts per connect cycle before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
            max_attempts: None,
        }
    }
}

impl ReconnectOptions {
    /// Do not reconnect at all: any handshake failure is fatal.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(16) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let shave: f64 = rand::thread_rng().gen();
        Duration::from_secs_f64(capped * (1.0 - self.jitter * shave))
    }

    pub(crate) fn exhausted(&self, attempt: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempt >= max)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Credentials {
    pub user: String,
    pub password: String,
}

/// TLS parameters for the dialer.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub(crate) struct TlsOptions {
    pub config: std::sync::Arc<tokio_rustls::rustls::ClientConfig>,
    pub server_name: tokio_rustls::rustls::pki_types::ServerName<'static>,
}

/// Everything the dialer needs to establish and authenticate a transport.
#[derive(Clone)]
pub(crate) struct DialConfig {
    pub addr: String,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    pub required_features: Vec<Feature>,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsOptions>,
}

/// Builder for [`Connection`].
///
/// ```rust,no_run
/// use tarantool_client::Connection;
///
/// #[tokio::main]
/// async fn main() -> Result<(), tarantool_client::Error> {
///     let conn = Connection::builder()
///         .auth("guest", "")
///         .connect_timeout(std::time::Duration::from_secs(5))
///         .build("127.0.0.1:3301")
///         .await?;
///     conn.ping().await?;
///     Ok(())
/// }
/// ```
pub struct ConnectionBuilder {
    credentials: Option<Credentials>,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    reconnect: ReconnectOptions,
    queue_capacity: usize,
    required_features: Vec<Feature>,
    #[cfg(feature = "tls")]
    tls: Option<TlsOptions>,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self {
            credentials: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            reconnect: ReconnectOptions::default(),
            queue_capacity: 1024,
            required_features: Vec::new(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticate with the given user after the greeting.
    pub fn auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Default deadline applied to every request that does not set its own.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn reconnect(mut self, options: ReconnectOptions) -> Self {
        self.reconnect = options;
        self
    }

    /// Capacity of the submission queue; senders suspend when it is full.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Fail the handshake unless the server advertises the feature. The
    /// check is repeated on every reconnect; a mismatch there is fatal.
    pub fn require_feature(mut self, feature: Feature) -> Self {
        self.required_features.push(feature);
        self
    }

    /// Wrap the transport in TLS.
    #[cfg(feature = "tls")]
    pub fn tls(
        mut self,
        config: std::sync::Arc<tokio_rustls::rustls::ClientConfig>,
        server_name: impl Into<String>,
    ) -> Result<Self> {
        let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(server_name.into())
            .map_err(|e| crate::error::Error::Encode(format!("invalid TLS server name: {e}")))?;
        self.tls = Some(TlsOptions {
            config,
            server_name,
        });
        Ok(self)
    }

    /// Connect, run the handshake and wait until the connection is ready.
    pub async fn build(self, addr: impl Into<String>) -> Result<Connection> {
        let dial = DialConfig {
            addr: addr.into(),
            credentials: self.credentials,
            connect_timeout: self.connect_timeout,
            required_features: self.required_features,
            #[cfg(feature = "tls")]
            tls: self.tls,
        };
        Connection::start(dial, self.reconnect, self.request_timeout, self.queue_capacity).await
    }
}
