//! JSON-RPC message framing over byte streams.
//!
//! LSP frames every message with HTTP-style headers:
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! {"jsonrpc":"2.0",...}
//! ```
//!
//! Only `Content-Length` is required; unknown headers are ignored.

use anyhow::{bail, Context as _, Result};
use futures::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde_json::Value;

/// Read one framed JSON-RPC message.
///
/// Returns `Ok(None)` when the stream ends at a frame boundary. A frame with
/// no `Content-Length`, a body cut short, or a body that is not valid JSON
/// is a protocol error.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Value>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .context("reading frame header")?;
        if n == 0 {
            return Ok(None);
        }

        let line = line.trim();
        if line.is_empty() {
            break;
        }

        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                content_length = Some(
                    value
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid Content-Length: {value:?}"))?,
                );
            }
        }
    }

    let Some(length) = content_length else {
        bail!("frame header has no Content-Length");
    };

    tracing::trace!("reading frame body of {length} bytes");
    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .context("reading frame body")?;

    let message = serde_json::from_slice(&body).context("frame body is not valid JSON")?;
    Ok(Some(message))
}

/// Write one message with `Content-Length` framing and flush.
pub async fn write_message<W>(writer: &mut W, message: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
