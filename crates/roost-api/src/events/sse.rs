// Streamed-push transport.
//
// A persistent GET whose response body is a sequence of newline-framed,
// `data:`-prefixed JSON packets. An explicit `{"status":"connected"}`
// line is the connect signal; a `{"action":"logout"}` line means the
// session was invalidated (usually a concurrent login elsewhere) and
// forces a close, as does any decode failure or the configured
// inactivity window elapsing.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EventConfig, EventSink, RunContext};
use crate::client::paths::SUBSCRIBE_PATH;
use crate::transport::TransportConfig;

/// What one decoded stream line means for the read loop.
#[derive(Debug, PartialEq, Eq)]
enum Signal {
    /// Transport-level connect acknowledgement.
    Connected,
    /// Session invalidated by the service.
    Logout,
    /// An ordinary packet to dispatch.
    Packet,
}

fn classify(packet: &Value) -> Signal {
    if packet.get("action").and_then(Value::as_str) == Some("logout") {
        return Signal::Logout;
    }
    if packet.get("status").and_then(Value::as_str) == Some("connected") {
        return Signal::Connected;
    }
    Signal::Packet
}

/// Strip the stream framing from one line, if it carries data.
fn data_line(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() { None } else { Some(payload) }
}

/// Open the stream and read it until it closes.
pub(crate) async fn run(
    config: &EventConfig,
    transport: &TransportConfig,
    ctx: &RunContext,
    sink: Arc<dyn EventSink>,
    cancel: &CancellationToken,
) {
    let client = match transport.build_stream_client() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "stream client build failed");
            return;
        }
    };

    let Ok(url) = config.host.join(SUBSCRIBE_PATH) else {
        warn!("bad subscribe url");
        return;
    };

    if config.stream_timeout.is_zero() {
        debug!(%url, "starting stream with no timeout");
    } else {
        debug!(%url, timeout = ?config.stream_timeout, "starting stream");
    }

    let resp = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        resp = client.get(url).headers(ctx.headers.clone()).send() => resp,
    };
    let resp = match resp {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            warn!(status = %resp.status(), "stream rejected");
            return;
        }
        Err(e) => {
            warn!(error = %e, "stream connect failed");
            return;
        }
    };

    let mut body = resp.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("stream stopped");
                return;
            }
            chunk = next_chunk(&mut body, config.stream_timeout) => chunk,
        };

        let bytes = match chunk {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                info!("stream ended by service");
                return;
            }
            Err(ChunkError::Inactive) => {
                warn!("no packet inside inactivity window, forcing close");
                return;
            }
            Err(ChunkError::Transport(message)) => {
                warn!(%message, "stream read failed");
                return;
            }
        };

        buffer.extend_from_slice(&bytes);
        while let Some(line) = take_line(&mut buffer) {
            let Some(payload) = data_line(&line) else { continue };

            let packet: Value = match serde_json::from_str(payload) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(error = %e, "closing: undecodable packet");
                    return;
                }
            };

            match classify(&packet) {
                Signal::Logout => {
                    warn!("logged out -- concurrent session elsewhere?");
                    return;
                }
                Signal::Connected => {
                    debug!("stream connected");
                    let _ = sink.on_connect().await;
                }
                Signal::Packet => sink.on_packet(packet).await,
            }
        }
    }
}

enum ChunkError {
    Inactive,
    Transport(String),
}

/// Pull the next body chunk, bounded by the inactivity window.
async fn next_chunk<S>(stream: &mut S, window: Duration) -> Result<Option<bytes::Bytes>, ChunkError>
where
    S: futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    let next = stream.next();
    let item = if window.is_zero() {
        next.await
    } else {
        match tokio::time::timeout(window, next).await {
            Ok(item) => item,
            Err(_) => return Err(ChunkError::Inactive),
        }
    };

    match item {
        Some(Ok(bytes)) => Ok(Some(bytes)),
        Some(Err(e)) => Err(ChunkError::Transport(e.to_string())),
        None => Ok(None),
    }
}

/// Pop one complete line from the front of the buffer.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = buffer.drain(..=pos).collect();
    let line = String::from_utf8_lossy(&line);
    Some(line.trim_end_matches(['\n', '\r']).to_owned())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_lines_are_unwrapped() {
        assert_eq!(data_line("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_line("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_line("event: ping"), None);
        assert_eq!(data_line("data:   "), None);
        assert_eq!(data_line(""), None);
    }

    #[test]
    fn signals_classify_in_priority_order() {
        assert_eq!(classify(&json!({"action": "logout"})), Signal::Logout);
        assert_eq!(classify(&json!({"status": "connected"})), Signal::Connected);
        assert_eq!(
            classify(&json!({"resource": "cameras/A", "properties": {}})),
            Signal::Packet
        );
    }

    #[test]
    fn line_buffer_handles_split_and_crlf_frames() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(b"data: {\"a\"");
        assert_eq!(take_line(&mut buffer), None);

        buffer.extend_from_slice(b":1}\r\ndata: {\"b\":2}\n");
        assert_eq!(take_line(&mut buffer).as_deref(), Some("data: {\"a\":1}"));
        assert_eq!(take_line(&mut buffer).as_deref(), Some("data: {\"b\":2}"));
        assert_eq!(take_line(&mut buffer), None);
    }
}
