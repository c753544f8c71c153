use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::NULL;
use crate::error::{Result, RunnerError};

/// Reads one NUL-terminated frame.
///
/// Returns `Ok(None)` on a clean end-of-stream before any byte arrived.
/// A stream that ends mid-frame yields what was read as a complete request.
/// More than `max_bytes` without a terminator is a protocol error; the
/// caller is expected to drop the connection without replying.
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = max_bytes as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(NULL, &mut buf).await?;

    if n == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&NULL) {
        buf.pop();
        return Ok(Some(buf));
    }

    if buf.len() > max_bytes {
        return Err(RunnerError::protocol(format!(
            "frame exceeds {} bytes without terminator",
            max_bytes
        )));
    }

    Ok(Some(buf))
}

/// Writes `body` plus the terminator. Embedded NULs would corrupt the
/// framing and are dropped.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.contains(&NULL) {
        tracing::warn!("dropping embedded NUL bytes from {}-byte response", body.len());
        let clean: Vec<u8> = body.iter().copied().filter(|&b| b != NULL).collect();
        writer.write_all(&clean).await?;
    } else {
        writer.write_all(body).await?;
    }
    writer.write_all(&[NULL]).await?;
    writer.flush().await?;
    Ok(())
}
