//! Length-prefixed IPROTO framing.
//!
//! One frame on the wire is a MessagePack uint byte length followed by that
//! many payload bytes (header map, then body map). The write side reserves a
//! fixed-width 5-byte uint32 prefix up front and patches it once the payload
//! is encoded, so a frame is assembled in a single buffer and written with
//! one syscall.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, ProtocolError, Result, TransportError};

/// Upper bound for a single frame payload.
pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Number of bytes in the reserved length prefix: a `uint32` marker plus the
/// big-endian length.
const PREFIX_SIZE: usize = 5;

/// Reserve a frame length prefix in `buf` and return the frame start offset
/// to later pass to [`finish_frame`].
pub fn begin_frame(buf: &mut Vec<u8>) -> usize {
    let start = buf.len();
    buf.extend_from_slice(&[0xce, 0, 0, 0, 0]);
    start
}

/// Patch the reserved prefix with the number of payload bytes that follow it.
pub fn finish_frame(buf: &mut Vec<u8>, start: usize) {
    let len = (buf.len() - start - PREFIX_SIZE) as u32;
    buf[start + 1..start + PREFIX_SIZE].copy_from_slice(&len.to_be_bytes());
}

/// Read one frame payload from the stream.
///
/// The length is a single MessagePack unsigned int in any width the peer
/// chooses. A clean EOF before the first length byte maps to
/// [`TransportError::Disconnected`]; an EOF anywhere later is a truncated
/// frame.
pub async fn read_frame<R>(rd: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut marker = [0u8; 1];
    if let Err(e) = rd.read_exact(&mut marker).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(TransportError::Disconnected.into());
        }
        return Err(TransportError::Io(e).into());
    }

    let len = match marker[0] {
        m @ 0x00..=0x7f => u64::from(m),
        0xcc => read_len_bytes::<1, _>(rd).await?,
        0xcd => read_len_bytes::<2, _>(rd).await?,
        0xce => read_len_bytes::<4, _>(rd).await?,
        0xcf => read_len_bytes::<8, _>(rd).await?,
        m => {
            return Err(Error::Protocol(ProtocolError::Malformed(format!(
                "invalid frame length marker 0x{m:02x}"
            ))))
        }
    };

    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len).into());
    }

    let mut payload = vec![0u8; len as usize];
    rd.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::from(TransportError::Truncated {
                expected: len as usize,
            })
        } else {
            TransportError::Io(e).into()
        }
    })?;
    Ok(payload)
}

async fn read_len_bytes<const N: usize, R>(rd: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; N];
    rd.read_exact(&mut bytes).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::from(TransportError::Truncated { expected: N })
        } else {
            Error::from(TransportError::Io(e))
        }
    })?;
    let mut len = 0u64;
    for b in bytes {
        len = (len << 8) | u64::from(b);
    }
    Ok(len)
}
