//! WebSocket entrypoint.
//!
//! Upgrades an authenticated request, registers the connection with the hub
//! and runs its two pumps until either one stops.

use std::fmt::Display;
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tracing::{debug, info};

use kapi_core::UserId;

use crate::connection::{Connection, ConnectionState};
use crate::hub::Hub;
use crate::pumps::{Frame, PumpConfig, inbound_pump, outbound_pump};

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(bytes) => Frame::Binary(bytes),
            Message::Ping(bytes) => Frame::Ping(bytes),
            Message::Pong(bytes) => Frame::Pong(bytes),
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Ping(bytes) => Message::Ping(bytes),
            Frame::Pong(bytes) => Message::Pong(bytes),
            Frame::Close => Message::Close(None),
        }
    }
}

/// Finish the upgrade for an already authenticated user.
pub fn upgrade(ws: WebSocketUpgrade, hub: Hub, user_id: UserId, cfg: PumpConfig) -> Response {
    ws.max_message_size(cfg.max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, hub, user_id, cfg))
}

/// Serve an upgraded socket until either pump stops.
pub async fn serve_socket(socket: WebSocket, hub: Hub, user_id: UserId, cfg: PumpConfig) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<Message, axum::Error>(frame.into())));
    let stream = stream.map(|item| item.map(Frame::from));
    run_connection(stream, sink, hub, user_id, cfg).await;
}

/// Run one connection from registration to teardown over any pair of frame
/// halves. Returns the connection once both pumps have exited.
pub async fn run_connection<St, Si, E>(
    stream: St,
    sink: Si,
    hub: Hub,
    user_id: UserId,
    cfg: PumpConfig,
) -> Arc<Connection>
where
    St: Stream<Item = Result<Frame, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
    Si: Sink<Frame> + Unpin + Send + 'static,
    Si::Error: Display + Send,
{
    let (conn, queue) = Connection::with_capacity(user_id, cfg.queue_capacity);
    let conn_id = conn.id().to_string();
    hub.register(conn.clone());
    info!(conn_id = %conn_id, %user_id, "WebSocket connected");

    let mut send_task = tokio::spawn({
        let conn_id = conn_id.clone();
        let cfg = cfg.clone();
        async move { outbound_pump(&conn_id, queue, sink, &cfg).await }
    });
    let mut recv_task = tokio::spawn({
        let conn = conn.clone();
        let cfg = cfg.clone();
        async move { inbound_pump(&conn, stream, &cfg).await }
    });

    // Either pump stopping unregisters the connection. Unregistering closes
    // the queue, which lets the outbound pump send a close frame and exit.
    tokio::select! {
        exit = &mut recv_task => {
            debug!(conn_id = %conn_id, ?exit, "Inbound pump stopped");
            hub.unregister(&conn_id);
            if tokio::time::timeout(cfg.write_wait, &mut send_task).await.is_err() {
                send_task.abort();
                let _ = send_task.await;
            }
        }
        exit = &mut send_task => {
            debug!(conn_id = %conn_id, ?exit, "Outbound pump stopped");
            recv_task.abort();
            let _ = recv_task.await;
            hub.unregister(&conn_id);
        }
    }

    conn.advance(ConnectionState::Closed);
    info!(conn_id = %conn_id, %user_id, "WebSocket disconnected");
    conn
}
