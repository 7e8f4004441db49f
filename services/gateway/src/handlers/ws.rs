use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use types::ids::ConnectionId;

use crate::state::AppState;

/// How long the writer gets to flush queued frames after the reader ends.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Floor for the ping period; `interval` panics on zero.
const MIN_KEEPALIVE: Duration = Duration::from_secs(1);

/// GET /online-game
/// Viewers receive leaderboard snapshots; text frames they send are
/// submitted as scores.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

enum Ending {
    ClientClosed,
    Shutdown,
    /// The writer stopped, usually because the connection was failed
    WriterGone,
    Error(String),
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, outbound) = state.registry.register();
    let (sink, mut stream) = socket.split();

    // New viewers start from the current board, queued ahead of any broadcast.
    let opened = state.registry.open_with(connection_id, || {
        state
            .latest
            .current()
            .map(|published| Message::Text(published.payload))
    });
    if opened.is_err() {
        state.registry.fail(connection_id, "could not open");
        return;
    }

    let mut writer = tokio::spawn(writer_task(
        sink,
        outbound,
        state.config.keepalive(),
        connection_id,
    ));
    let mut writer_finished = false;

    let ending = loop {
        tokio::select! {
            _ = state.shutdown.triggered() => break Ending::Shutdown,
            _ = &mut writer => {
                writer_finished = true;
                break Ending::WriterGone;
            }
            next = stream.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    match state.ingestion.submit(Some(text.as_str())).await {
                        Ok(event) => debug!(
                            connection_id = %connection_id,
                            user_id = %event.user_id,
                            "Score submitted over websocket"
                        ),
                        Err(err) => debug!(
                            connection_id = %connection_id,
                            error = %err,
                            "Websocket submission dropped"
                        ),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(connection_id = %connection_id, reason = ?frame, "Client initiated close");
                    break Ending::ClientClosed;
                }
                // Pings are answered by the protocol layer; binary frames are ignored.
                Some(Ok(_)) => {}
                Some(Err(err)) => break Ending::Error(err.to_string()),
                None => break Ending::ClientClosed,
            }
        }
    };

    match ending {
        Ending::Error(reason) => state.registry.fail(connection_id, &reason),
        Ending::Shutdown => {
            let _ = state.registry.send_to(
                connection_id,
                Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                })),
            );
            state.registry.close(connection_id);
        }
        Ending::ClientClosed | Ending::WriterGone => state.registry.close(connection_id),
    }

    // Dropping the registry entry closed the queue; let the writer flush it.
    if !writer_finished {
        let _ = tokio::time::timeout(WRITER_DRAIN, writer).await;
    }
    info!(connection_id = %connection_id, "Websocket session ended");
}

/// Owns the sink: forwards queued frames and pings every `keepalive`.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Message>,
    keepalive: Duration,
    connection_id: ConnectionId,
) {
    let mut ping = tokio::time::interval(keepalive.max(MIN_KEEPALIVE));
    // Skip the first immediate tick
    ping.tick().await;

    loop {
        let message = tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = ping.tick() => Message::Ping(Default::default()),
        };

        if let Err(err) = sink.send(message).await {
            debug!(connection_id = %connection_id, error = %err, "Websocket send failed");
            return;
        }
    }

    let _ = sink.close().await;
}
