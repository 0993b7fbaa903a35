//! Newline-delimited JSON framing.
//!
//! Every message is a UTF-8 JSON object on a single line terminated by a
//! line feed. The writer serializes, appends the terminator, and writes
//! atomically under a mutex; the reader buffers until a line feed and
//! parses. Partial messages are never delivered.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::Result;

/// Single-writer framed JSON sink over a pipe.
pub struct MessageWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> MessageWriter<W> {
    /// Wrap a writable stream.
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    /// Serialize `message`, append the line-feed terminator, and write the
    /// whole frame under the writer lock.
    pub async fn write_message<T: Serialize>(&self, message: &T) -> Result<()> {
        let mut frame = serde_json::to_vec(message)?;
        frame.push(b'\n');
        let mut writer = self.inner.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write pre-framed bytes under the writer lock.
    pub async fn write_raw(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Framed JSON source over a pipe.
pub struct MessageReader<R> {
    lines: tokio::io::Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin + Send> MessageReader<R> {
    /// Wrap a readable stream.
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Read the next complete message, skipping malformed lines.
    ///
    /// Returns `Ok(None)` at end of stream. Lines that fail to parse are
    /// logged and skipped; the stream stays usable.
    pub async fn next_message(&mut self) -> Result<Option<Value>> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(value) => return Ok(Some(value)),
                        Err(e) => {
                            tracing::warn!("skipping malformed message: {e}, raw data: {line}");
                            continue;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let writer = MessageWriter::new(client);
        let mut reader = MessageReader::new(server);

        writer
            .write_message(&json!({"command": "ping", "request_id": "req-1"}))
            .await
            .unwrap();

        let message = reader.next_message().await.unwrap().unwrap();
        assert_eq!(message["command"], "ping");
        assert_eq!(message["request_id"], "req-1");
    }

    #[tokio::test]
    async fn test_skips_malformed_lines() {
        let (client, server) = tokio::io::duplex(4096);
        let writer = MessageWriter::new(client);
        let mut reader = MessageReader::new(server);

        writer.write_raw(b"{not json}\n").await.unwrap();
        writer.write_message(&json!({"ok": true})).await.unwrap();

        let message = reader.next_message().await.unwrap().unwrap();
        assert_eq!(message["ok"], true);
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_interleave_frames() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let writer = Arc::new(MessageWriter::new(client));
        let mut reader = MessageReader::new(server);

        let tasks: Vec<_> = (0..8)
            .map(|task| {
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    for i in 0..25 {
                        let payload = "x".repeat(512);
                        writer
                            .write_message(&json!({
                                "request_id": format!("req-{task}-{i}"),
                                "data": payload,
                            }))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let message = reader.next_message().await.unwrap().unwrap();
            let id = message["request_id"].as_str().unwrap().to_string();
            assert_eq!(message["data"].as_str().unwrap().len(), 512);
            assert!(seen.insert(id), "duplicate frame delivered");
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(seen.len(), 200);
    }
}
