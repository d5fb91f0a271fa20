//! Parsing of the 128-byte greeting the server sends immediately on accept.
//!
//! The first 64 bytes are a human-readable banner (`Tarantool 3.1.0 ...`),
//! the next 44 a base64-encoded salt used by the auth scramble, the rest
//! padding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::error::{Error, ProtocolError, Result};

pub const GREETING_SIZE: usize = 128;

const BANNER_SIZE: usize = 64;
const SALT_B64_SIZE: usize = 44;

/// Number of decoded salt bytes fed into the auth scramble.
pub const SALT_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct Greeting {
    /// Server version as printed in the banner, e.g. `3.1.0`.
    pub version: String,
    /// Decoded salt; [`Greeting::auth_salt`] yields the scramble slice.
    pub salt: Vec<u8>,
}

impl Greeting {
    /// The salt prefix used by the `chap-sha1` scramble.
    pub fn auth_salt(&self) -> &[u8] {
        &self.salt[..SALT_SIZE]
    }
}

pub fn parse_greeting(raw: &[u8; GREETING_SIZE]) -> Result<Greeting> {
    let banner = String::from_utf8_lossy(&raw[..BANNER_SIZE]);
    if !banner.starts_with("Tarantool") {
        return Err(Error::Protocol(ProtocolError::InvalidGreeting(format!(
            "unexpected banner: {:?}",
            banner.trim_end()
        ))));
    }

    let version = banner
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string();

    let salt_b64: &str = std::str::from_utf8(&raw[BANNER_SIZE..BANNER_SIZE + SALT_B64_SIZE])
        .map_err(|_| {
            Error::Protocol(ProtocolError::InvalidGreeting(
                "salt is not valid base64 text".to_string(),
            ))
        })?;
    let salt = BASE64.decode(salt_b64.trim_end()).map_err(|e| {
        Error::Protocol(ProtocolError::InvalidGreeting(format!(
            "salt decode failed: {e}"
        )))
    })?;
    if salt.len() < SALT_SIZE {
        return Err(Error::Protocol(ProtocolError::InvalidGreeting(format!(
            "salt too short: {} bytes",
            salt.len()
        ))));
    }

    Ok(Greeting { version, salt })
}

/// Render a syntactically valid greeting block. Used by test fixtures.
pub fn render_greeting(version: &str, salt: &[u8]) -> [u8; GREETING_SIZE] {
    let mut raw = [b' '; GREETING_SIZE];
    let banner = format!("Tarantool {version} (Binary) 00000000-0000-0000-0000-000000000000");
    let banner = banner.as_bytes();
    let n = banner.len().min(BANNER_SIZE - 1);
    raw[..n].copy_from_slice(&banner[..n]);
    raw[BANNER_SIZE - 1] = b'\n';

    let salt_b64 = BASE64.encode(salt);
    let salt_b64 = salt_b64.as_bytes();
    let n = salt_b64.len().min(SALT_B64_SIZE);
    raw[BANNER_SIZE..BANNER_SIZE + n].copy_from_slice(&salt_b64[..n]);
    raw[GREETING_SIZE - 1] = b'\n';
    raw
}
