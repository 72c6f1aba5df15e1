//! JSON Lines framing for protocol messages.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Serialize a message as one newline-terminated JSON line.
pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line (surrounding whitespace ignored).
pub fn decode<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim())
}

/// Encode `message` and write it to `writer`, flushing afterwards.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let line = encode(message)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
