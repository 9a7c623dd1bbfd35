//! Native messaging framing and message types.
//!
//! Each message is a 4-byte length in native byte order followed by that many
//! bytes of UTF-8 JSON. The browser refuses host messages over 1 MiB.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabsync_core::{BrowserTabEvent, UiEvent};
use tabsync_protocol::ErrorInfo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::commands::HostCommand;

/// Largest message the host may send to the extension.
pub const MAX_OUTBOUND_BYTES: usize = 1024 * 1024;
/// Largest message accepted from the extension.
pub const MAX_INBOUND_BYTES: usize = 64 * 1024 * 1024;

/// Extension → host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IncomingMessage {
    /// Answer to a host [`OutgoingMessage::Request`].
    Response {
        id: u64,
        ok: bool,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        error: Option<String>,
    },
    TabEvent {
        event: BrowserTabEvent,
    },
    Command {
        #[serde(default)]
        id: Option<u64>,
        command: HostCommand,
    },
}

/// Host → extension.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutgoingMessage {
    /// Tab-control call the extension executes with the browser APIs.
    Request {
        id: u64,
        method: &'static str,
        params: Value,
    },
    Event {
        event: UiEvent,
    },
    CommandResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        ok: bool,
        #[serde(skip_serializing_if = "Value::is_null")]
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Reads one message. `Ok(None)` means the extension closed the pipe;
/// `Some(Err(_))` is a frame that was consumed but could not be used.
pub async fn read_message<R>(
    reader: &mut R,
) -> io::Result<Option<Result<IncomingMessage, ErrorInfo>>>
where
    R: AsyncRead + Unpin,
{
    read_message_within(reader, MAX_INBOUND_BYTES).await
}

async fn read_message_within<R>(
    reader: &mut R,
    limit: usize,
) -> io::Result<Option<Result<IncomingMessage, ErrorInfo>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_ne_bytes(header) as usize;
    if len > limit {
        let mut rest = (&mut *reader).take(len as u64);
        tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
        return Ok(Some(Err(ErrorInfo::new(
            "message_too_large",
            format!("message of {} bytes exceeded maximum size", len),
        ))));
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    Ok(Some(serde_json::from_slice(&body).map_err(|err| {
        ErrorInfo::new("invalid_message", format!("message was not valid: {}", err))
    })))
}

/// Length-prefixed bytes for one message.
pub fn encode_message(message: &OutgoingMessage) -> Result<Vec<u8>, ErrorInfo> {
    let body = serde_json::to_vec(message)
        .map_err(|err| ErrorInfo::new("encode_failed", err.to_string()))?;
    if body.len() > MAX_OUTBOUND_BYTES {
        return Err(ErrorInfo::new(
            "message_too_large",
            format!("message of {} bytes exceeded maximum size", body.len()),
        ));
    }

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_ne_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Drains `messages` into `writer` until the channel closes or the pipe
/// breaks. Messages that cannot be encoded are dropped.
pub async fn write_loop<W>(mut writer: W, mut messages: mpsc::UnboundedReceiver<OutgoingMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = messages.recv().await {
        let frame = match encode_message(&message) {
            Ok(frame) => frame,
            Err(info) => {
                warn!(code = %info.code, message = %info.message, "Dropping outbound message");
                continue;
            }
        };
        if let Err(err) = writer.write_all(&frame).await {
            warn!(error = %err, "Extension pipe closed");
            return;
        }
        if let Err(err) = writer.flush().await {
            warn!(error = %err, "Extension pipe closed");
            return;
        }
    }
    debug!("Outbound channel closed");
}
