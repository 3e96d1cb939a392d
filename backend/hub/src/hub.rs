//! Hub handle and its coordinator task.
//!
//! The coordinator is the only owner of the [`Registry`]. Every mutation and
//! broadcast is a command on one queue, so they are applied one at a time in
//! submission order. Enqueueing into connection queues never waits: a full
//! queue evicts the connection instead.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use kapi_core::{EventType, UserId};

use crate::connection::Connection;
use crate::protocol::encode_event;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub users: usize,
}

enum HubCommand {
    Register(Arc<Connection>),
    Unregister(String),
    Broadcast {
        user_id: UserId,
        frame: Arc<str>,
        exclude_client_id: Option<String>,
    },
    Stats(oneshot::Sender<HubStats>),
    UserConnections {
        user_id: UserId,
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown(oneshot::Sender<usize>),
}

/// Cloneable handle to the coordinator task.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Start the coordinator on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_coordinator(rx, Registry::new()));
        Self { tx }
    }

    fn submit(&self, command: HubCommand) {
        if self.tx.send(command).is_err() {
            debug!("Hub coordinator has stopped, dropping command");
        }
    }

    pub fn register(&self, conn: Arc<Connection>) {
        self.submit(HubCommand::Register(conn));
    }

    pub fn unregister(&self, conn_id: &str) {
        self.submit(HubCommand::Unregister(conn_id.to_string()));
    }

    /// Push an event to every live connection of `user_id`.
    pub fn broadcast_to_user<T: Serialize>(&self, user_id: UserId, kind: EventType, payload: &T) {
        self.broadcast(user_id, kind, payload, None);
    }

    /// Push an event to every live connection of `user_id` except the one
    /// whose id is `client_id`. A missing, empty or stale id excludes nobody.
    pub fn broadcast_to_user_except_by_client_id<T: Serialize>(
        &self,
        user_id: UserId,
        kind: EventType,
        payload: &T,
        client_id: Option<&str>,
    ) {
        self.broadcast(user_id, kind, payload, client_id);
    }

    fn broadcast<T: Serialize>(
        &self,
        user_id: UserId,
        kind: EventType,
        payload: &T,
        client_id: Option<&str>,
    ) {
        let frame = match encode_event(kind, payload) {
            Ok(frame) => frame,
            Err(e) => {
                error!(%user_id, event = %kind, error = %e, "Failed to encode event");
                return;
            }
        };
        self.submit(HubCommand::Broadcast {
            user_id,
            frame,
            exclude_client_id: client_id.map(str::to_string),
        });
    }

    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Stats(reply));
        rx.await.unwrap_or_default()
    }

    pub async fn user_connection_ids(&self, user_id: UserId) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::UserConnections { user_id, reply });
        rx.await.unwrap_or_default()
    }

    /// Close every connection queue and stop the coordinator. Returns the
    /// number of connections that were still open.
    pub async fn shutdown(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Shutdown(reply));
        rx.await.unwrap_or_default()
    }
}

async fn run_coordinator(mut rx: mpsc::UnboundedReceiver<HubCommand>, mut registry: Registry) {
    info!("Hub coordinator started");
    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Register(conn) => registry.register(conn),
            HubCommand::Unregister(conn_id) => {
                registry.unregister(&conn_id);
            }
            HubCommand::Broadcast {
                user_id,
                frame,
                exclude_client_id,
            } => {
                let delivery = registry.broadcast_to_user_except(
                    user_id,
                    frame,
                    exclude_client_id.as_deref(),
                );
                if !delivery.evicted.is_empty() {
                    warn!(%user_id, evicted = delivery.evicted.len(), "Broadcast evicted connections");
                }
                debug!(%user_id, delivered = delivery.delivered, "Broadcast delivered");
            }
            HubCommand::Stats(reply) => {
                let _ = reply.send(HubStats {
                    connections: registry.connection_count(),
                    users: registry.user_count(),
                });
            }
            HubCommand::UserConnections { user_id, reply } => {
                let _ = reply.send(registry.user_connection_ids(user_id));
            }
            HubCommand::Shutdown(reply) => {
                let closed = registry.clear();
                info!(closed, "Hub coordinator shutting down");
                let _ = reply.send(closed);
                return;
            }
        }
    }
    registry.clear();
    info!("Hub coordinator stopped");
}
