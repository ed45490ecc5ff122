use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use switchboard_core::frame::Frame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::dispatcher::EventDispatcher;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Unregisters a connection when dropped, including when the task serving it
/// panics or is aborted.
pub(crate) struct DisconnectGuard {
    connection: Arc<Connection>,
    dispatcher: Arc<EventDispatcher>,
}

impl DisconnectGuard {
    pub(crate) fn new(connection: Arc<Connection>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            connection,
            dispatcher,
        }
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.dispatcher.on_disconnect(&self.connection.id);
        self.connection.mark_disconnected();
    }
}

/// Serve an accepted streaming connection until either side goes away.
///
/// The writer drains the connection's send queue and pings every 30s. The
/// reader turns each text frame into an `on_inbound_event` call, spawned so a
/// slow handler never stalls the socket.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection: Arc<Connection>,
    mut rx: mpsc::Receiver<String>,
    dispatcher: Arc<EventDispatcher>,
    shutdown: CancellationToken,
) {
    let _guard = DisconnectGuard::new(Arc::clone(&connection), Arc::clone(&dispatcher));
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_conn = Arc::clone(&connection);
    let writer_shutdown = shutdown.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_conn.id, "Sent ping");
                }
                () = writer_shutdown.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    let reader_conn = Arc::clone(&connection);
    let reader_dispatcher = Arc::clone(&dispatcher);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => {
                        let dispatcher = Arc::clone(&reader_dispatcher);
                        let connection_id = reader_conn.id.clone();
                        tokio::spawn(async move {
                            if let Err(e) = dispatcher
                                .on_inbound_event(&connection_id, &frame.event, frame.data)
                                .await
                            {
                                tracing::warn!(
                                    connection_id = %connection_id,
                                    event = %frame.event,
                                    error = %e,
                                    kind = e.error_kind(),
                                    "Inbound event failed"
                                );
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!(connection_id = %reader_conn.id, error = %e, "Unparseable frame");
                        let _ = reader_conn.send(&Frame::error("PARSE_ERROR", e.to_string()));
                    }
                },
                WsMessage::Pong(_) => reader_conn.record_pong(),
                WsMessage::Close(_) => break,
                // axum answers pings itself
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
}
