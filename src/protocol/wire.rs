//! Wire format for message framing.
//!
//! Each message is one JSON value followed by a delimiter byte sequence:
//! `{json}{delimiter}`. The default delimiter is a single newline.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{ConnectionErrorKind, ProtocolErrorKind, RpcError};

/// Read one delimited frame from the reader.
///
/// Returns the frame payload with the delimiter stripped. End of stream,
/// including a truncated final frame, is reported as a closed connection.
///
/// The frame ends at the first complete occurrence of `delimiter`, so a
/// delimiter that overlaps itself (such as `}}`) can cut a frame short.
/// [`TransportConfig::validate`](crate::config::TransportConfig::validate)
/// refuses those.
pub async fn read_frame<R>(
    reader: &mut R,
    delimiter: &[u8],
    max_size: usize,
) -> Result<Vec<u8>, RpcError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(&last) = delimiter.last() else {
        return Err(RpcError::Config {
            message: "Frame delimiter must not be empty".to_string(),
        });
    };
    let limit = max_size.saturating_add(delimiter.len());

    let mut buf = Vec::new();
    loop {
        let remaining = (limit - buf.len()) as u64;
        let n = (&mut *reader)
            .take(remaining)
            .read_until(last, &mut buf)
            .await?;

        if n == 0 {
            return Err(RpcError::closed());
        }

        if buf.ends_with(delimiter) {
            buf.truncate(buf.len() - delimiter.len());
            return Ok(buf);
        }

        if buf.len() >= limit {
            return Err(RpcError::Protocol {
                kind: ProtocolErrorKind::FrameTooLarge {
                    size: buf.len(),
                    max: max_size,
                },
            });
        }
    }
}

/// Append the delimiter to an encoded message, checking it is unambiguous.
pub fn frame(payload: &[u8], delimiter: &[u8], max_size: usize) -> Result<Vec<u8>, RpcError> {
    if delimiter.is_empty() {
        return Err(RpcError::Config {
            message: "Frame delimiter must not be empty".to_string(),
        });
    }

    if payload.len() > max_size {
        return Err(RpcError::Protocol {
            kind: ProtocolErrorKind::FrameTooLarge {
                size: payload.len(),
                max: max_size,
            },
        });
    }

    if payload.windows(delimiter.len()).any(|w| w == delimiter) {
        return Err(RpcError::Protocol {
            kind: ProtocolErrorKind::DelimiterInPayload,
        });
    }

    let mut framed = Vec::with_capacity(payload.len() + delimiter.len());
    framed.extend_from_slice(payload);
    framed.extend_from_slice(delimiter);
    Ok(framed)
}

/// Write an already framed message.
pub async fn write_frame<W>(writer: &mut W, framed: &[u8]) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a framed message with a timeout.
///
/// Returns a WriteTimeout error if the write takes longer than the specified duration.
pub async fn write_frame_with_timeout<W>(
    writer: &mut W,
    framed: &[u8],
    timeout_duration: Duration,
) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    timeout(timeout_duration, write_frame(writer, framed))
        .await
        .map_err(|_| RpcError::Connection {
            kind: ConnectionErrorKind::WriteTimeout {
                timeout_secs: timeout_duration.as_secs(),
            },
        })?
}
