//! Newline-delimited JSON framing.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::msg::Msg;
use crate::TransportError;

pub const MAX_FRAME_BYTES: usize = 1 << 20;

pub async fn write_msg<W>(writer: &mut W, msg: &Msg) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let line = serde_json::to_string(msg)? + "\n";
    if line.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(MAX_FRAME_BYTES));
    }
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next frame, skipping blank lines. End of stream before a
/// frame is [`TransportError::Disconnected`].
pub async fn read_msg<R>(reader: &mut R) -> Result<Msg, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        let limit = (MAX_FRAME_BYTES + 1 - line.len().min(MAX_FRAME_BYTES)) as u64;
        let read = match (&mut *reader).take(limit).read_line(&mut line).await {
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if line.len() > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge(MAX_FRAME_BYTES));
        }
        if read == 0 && line.is_empty() {
            return Err(TransportError::Disconnected);
        }

        let raw = line.trim();
        if raw.is_empty() {
            line.clear();
            continue;
        }
        return Ok(serde_json::from_str(raw)?);
    }
}

/// Receives exactly one frame from `stream` within `timeout`.
pub async fn receive_msg<S>(stream: S, timeout: Duration) -> Result<Msg, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    tokio::time::timeout(timeout, read_msg(&mut reader))
        .await
        .map_err(|_| TransportError::Timeout)?
}
