//! Per-connection read and write loops.
//!
//! The pumps are written against plain `Stream`/`Sink` halves so they can be
//! driven by an axum socket in production and by in-memory channels in tests.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::connection::{Connection, DEFAULT_QUEUE_CAPACITY};
use crate::protocol::{ControlMessage, client_connected_ack};

/// Transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Time allowed to write one frame.
    pub write_wait: Duration,
    /// Time allowed between pongs before the peer is considered gone.
    pub pong_wait: Duration,
    /// Ping interval. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    pub queue_capacity: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_size: 512,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    PeerClosed,
    ReadTimeout,
    ReadError(String),
    MessageTooLarge(usize),
    /// The handshake acknowledgement could not be queued.
    AckRejected,
    /// The outbound queue was closed by the hub.
    QueueClosed,
    WriteTimeout,
    WriteError(String),
}

/// Read frames until the peer goes away.
///
/// The read deadline starts at `pong_wait` and is pushed back only when a
/// pong arrives.
pub async fn inbound_pump<S, E>(conn: &Connection, mut stream: S, cfg: &PumpConfig) -> PumpExit
where
    S: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + cfg.pong_wait;
    loop {
        let frame = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => return PumpExit::ReadTimeout,
            Ok(None) => return PumpExit::PeerClosed,
            Ok(Some(Err(e))) => return PumpExit::ReadError(e.to_string()),
            Ok(Some(Ok(frame))) => frame,
        };

        let text = match frame {
            Frame::Pong(_) => {
                deadline = Instant::now() + cfg.pong_wait;
                continue;
            }
            Frame::Ping(_) => continue,
            Frame::Close => return PumpExit::PeerClosed,
            Frame::Text(text) => text,
            Frame::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        };

        if text.len() > cfg.max_message_size {
            return PumpExit::MessageTooLarge(text.len());
        }

        match ControlMessage::decode(&text) {
            Ok(ControlMessage::ClientConnect) => {
                let ack = match client_connected_ack(conn.id()) {
                    Ok(ack) => ack,
                    Err(e) => return PumpExit::ReadError(e.to_string()),
                };
                if let Err(e) = conn.try_enqueue(ack) {
                    debug!(conn_id = %conn.id(), reason = %e, "Handshake ack rejected");
                    return PumpExit::AckRejected;
                }
                debug!(conn_id = %conn.id(), "Client identified");
            }
            Ok(ControlMessage::Unknown(kind)) => {
                debug!(conn_id = %conn.id(), kind = %kind, "Ignoring unknown message type");
            }
            Err(e) => {
                trace!(conn_id = %conn.id(), error = %e, "Ignoring malformed message");
            }
        }
    }
}

/// Drain the outbound queue onto the transport and keep the peer alive.
///
/// Frames already waiting behind the first one are joined with `\n` into a
/// single text write. When the queue closes a close frame is sent.
pub async fn outbound_pump<S>(
    conn_id: &str,
    mut queue: mpsc::Receiver<Arc<str>>,
    mut sink: S,
    cfg: &PumpConfig,
) -> PumpExit
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + cfg.ping_period, cfg.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            next = queue.recv() => {
                let Some(first) = next else {
                    let _ = write_frame(&mut sink, Frame::Close, cfg.write_wait).await;
                    return PumpExit::QueueClosed;
                };

                let mut batch = String::from(&*first);
                let mut batched = 1;
                while batched < cfg.queue_capacity {
                    let Ok(more) = queue.try_recv() else { break };
                    batch.push('\n');
                    batch.push_str(&more);
                    batched += 1;
                }
                trace!(conn_id, batched, "Writing queued frames");

                if let Err(exit) = write_frame(&mut sink, Frame::Text(batch), cfg.write_wait).await {
                    return exit;
                }
            }

            _ = ticker.tick() => {
                if let Err(exit) = write_frame(&mut sink, Frame::Ping(Vec::new()), cfg.write_wait).await {
                    return exit;
                }
            }
        }
    }
}

async fn write_frame<S>(sink: &mut S, frame: Frame, wait: Duration) -> Result<(), PumpExit>
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(wait, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PumpExit::WriteError(e.to_string())),
        Err(_) => Err(PumpExit::WriteTimeout),
    }
}
