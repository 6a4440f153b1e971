//! WebSocket session lifecycle, from upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use pulse_core::Envelope;
use pulse_core::envelope::ErrorPayload;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, field, info, instrument};

use crate::authority::{ConnectionAuthority, DisconnectReason};
use crate::errors::AdmissionError;

/// How long the writer gets to flush its queue and the close frame.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Run one client session.
///
/// 1. Authenticates and admits the token (refusals get an `error` message
///    and a close frame)
/// 2. Spawns a writer that drains the connection's outbound queue and sends
///    the close frame once the connection is closed
/// 3. Feeds inbound text and binary frames to [`ConnectionAuthority::dispatch`]
/// 4. Disconnects through the authority when the peer leaves, the transport
///    fails, or the server shuts down
#[instrument(skip_all, fields(conn_id = field::Empty, user_id = field::Empty))]
pub async fn run_ws_session(
    ws: WebSocket,
    token: String,
    authority: Arc<ConnectionAuthority>,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (conn, mut outbound) = match authority.admit(&token).await {
        Ok(admitted) => admitted,
        Err(err) => {
            info!(error = %err, "handshake refused");
            refuse(&mut ws_tx, &err).await;
            return;
        }
    };
    let span = Span::current();
    let _ = span.record("conn_id", conn.id.as_str());
    let _ = span.record("user_id", conn.user_id.as_str());

    let writer_conn = Arc::clone(&conn);
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = outbound.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                        break;
                    }
                }
                () = writer_conn.closed() => {
                    let (code, reason) = writer_conn.close_frame();
                    let _ = ws_tx.send(close_message(code, reason)).await;
                    break;
                }
            }
        }
    });

    let reason = loop {
        tokio::select! {
            () = conn.closed() => break None,
            () = shutdown.cancelled() => break Some(DisconnectReason::Shutdown),
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    authority.dispatch(&conn.id, text.as_str().as_bytes()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    authority.dispatch(&conn.id, &data).await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.touch(),
                Some(Ok(Message::Close(_))) | None => break Some(DisconnectReason::ClientClosed),
                Some(Err(err)) => {
                    debug!(error = %err, "transport error");
                    break Some(DisconnectReason::TransportError);
                }
            },
        }
    };

    if let Some(reason) = reason {
        let _ = authority.disconnect(&conn.id, reason);
    }

    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        debug!("writer did not drain in time");
        writer.abort();
    }
}

async fn refuse(ws_tx: &mut SplitSink<WebSocket, Message>, err: &AdmissionError) {
    let payload = ErrorPayload::new(err.error_code(), err.to_string());
    if let Ok(text) = Envelope::error(&payload).to_json() {
        let _ = ws_tx.send(Message::Text(text.into())).await;
    }
    let reason = match err {
        AdmissionError::Authentication(_) => "authentication failed",
        AdmissionError::Capacity { .. } => "server at capacity",
    };
    let _ = ws_tx.send(close_message(err.close_code(), reason)).await;
}

fn close_message(code: u16, reason: impl Into<String>) -> Message {
    let mut reason = reason.into();
    // Close reasons are limited to 123 bytes.
    if reason.len() > 123 {
        let mut cut = 123;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_message_carries_code_and_reason() {
        let Message::Close(Some(frame)) = close_message(1008, "superseded by newer connection")
        else {
            panic!("expected a close frame");
        };
        assert_eq!(frame.code, 1008);
        assert_eq!(frame.reason.as_str(), "superseded by newer connection");
    }

    #[test]
    fn long_close_reason_is_truncated() {
        let Message::Close(Some(frame)) = close_message(1000, "é".repeat(100)) else {
            panic!("expected a close frame");
        };
        assert!(frame.reason.len() <= 123);
        assert!(frame.reason.as_str().chars().all(|c| c == 'é'));
    }
}
