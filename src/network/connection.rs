//! Connections
//!
//! One [`ConnectionHandle`] per socket. The hub and the match tick tasks hold
//! clones of it and push serialized frames into its bounded outbound queue.
//! Two pumps move bytes between the queue and the socket.
//!
//! A handle is either open or closed. Closing is one-way and wakes both
//! pumps; a full queue closes the handle instead of blocking the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::game::UserId;
use crate::network::hub::HubHandle;

/// Distinguishes successive connections of the same user.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Cloneable sender side of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    user_id: UserId,
    conn_id: ConnId,
    tx: mpsc::Sender<String>,
    closed: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// New open handle plus the receiving end of its outbound queue.
    pub fn new(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let handle = Self {
            user_id,
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            closed: Arc::new(closed),
        };
        (handle, rx)
    }

    /// Owning user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Unique id of this connection.
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Whether frames can still be queued.
    pub fn is_open(&self) -> bool {
        !*self.closed.borrow() && !self.tx.is_closed()
    }

    /// Queue a frame without waiting.
    ///
    /// On a full or closed queue the handle closes itself and `false` is
    /// returned; the caller is expected to evict it.
    pub fn send_text(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(user = self.user_id, conn = self.conn_id, "Outbound queue full, closing");
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
    }

    /// Resolves once the handle is closed.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Socket timing and limits.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Ping period.
    pub keepalive_interval: Duration,
    /// Read deadline; any frame from the peer resets it.
    pub pong_wait: Duration,
    /// Largest accepted inbound text frame, in bytes.
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            max_message_size: 64 * 1024,
        }
    }
}

async fn wait_closed(signal: &mut watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

/// Drive an upgraded socket until either side gives up.
///
/// Registers `handle` with the hub first and unregisters it on the way out.
pub async fn serve<S>(
    ws: WebSocketStream<S>,
    handle: ConnectionHandle,
    mut outbound: mpsc::Receiver<String>,
    hub: HubHandle,
    config: ConnectionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let user_id = handle.user_id();
    let conn_id = handle.conn_id();
    let (mut ws_sender, mut ws_receiver) = ws.split();

    if !hub.register(handle.clone()).await {
        return;
    }

    // Write pump
    let mut write_closed = handle.close_signal();
    let keepalive = config.keepalive_interval;
    let writer = tokio::spawn(async move {
        let mut ping = interval(keepalive);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.tick().await;

        loop {
            tokio::select! {
                msg = outbound.recv() => {
                    let Some(text) = msg else { break };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                _ = wait_closed(&mut write_closed) => break,
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // Read pump
    let mut read_closed = handle.close_signal();
    loop {
        let frame = tokio::select! {
            frame = timeout(config.pong_wait, ws_receiver.next()) => frame,
            _ = wait_closed(&mut read_closed) => break,
        };

        match frame {
            Ok(Some(Ok(Message::Text(text)))) => {
                if text.len() > config.max_message_size {
                    warn!(user = user_id, size = text.len(), "Inbound frame too large, closing");
                    break;
                }
                if !hub.inbound(user_id, text).await {
                    break;
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                debug!(user = user_id, "Peer closed");
                break;
            }
            Ok(Some(Ok(_))) => {
                // ping / pong / binary only refresh the deadline
            }
            Ok(Some(Err(e))) => {
                debug!(user = user_id, "WebSocket read error: {}", e);
                break;
            }
            Err(_) => {
                info!(user = user_id, "Peer silent past deadline, closing");
                break;
            }
        }
    }

    handle.close();
    hub.unregister(user_id, conn_id).await;
    let _ = writer.await;
    debug!(user = user_id, conn = conn_id, "Connection finished");
}
