//! WebSocket Game Server
//!
//! Accepts TCP connections, upgrades requests for the websocket path (404
//! otherwise), resolves the caller's identity during the upgrade and hands
//! each socket to its own connection pumps.
//! Everything else happens in the [`Hub`].

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, instrument, warn};

use crate::network::auth::{resolve_identity, AuthConfig};
use crate::network::connection::{self, ConnectionConfig, ConnectionHandle};
use crate::network::hub::{Hub, HubConfig, HubHandle};
use crate::network::persistence::{Persistence, PersistenceConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Request path that upgrades to a websocket; anything else gets 404.
    pub ws_path: String,
    /// Outbound frames buffered per connection before it is evicted.
    pub outbound_queue_capacity: usize,
    /// Socket timing and limits.
    pub connection: ConnectionConfig,
    /// Hub, match and tournament tunables.
    pub hub: HubConfig,
    /// Collaborator endpoints.
    pub persistence: PersistenceConfig,
    /// Identity resolution.
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4001)),
            ws_path: "/ws".to_string(),
            outbound_queue_capacity: 1024,
            connection: ConnectionConfig::default(),
            hub: HubConfig::default(),
            persistence: PersistenceConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by environment variables.
    ///
    /// Unparsable values are logged and ignored. An empty `CHAT_STORE_URL`
    /// or `MATCH_STORE_URL` disables that collaborator call.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("WS_PATH") {
            if path.starts_with('/') {
                config.ws_path = path;
            } else {
                warn!("Ignoring WS_PATH={:?}: must start with '/'", path);
            }
        }
        if let Some(capacity) = env_parse("OUTBOUND_QUEUE_CAPACITY") {
            config.outbound_queue_capacity = capacity;
        }
        if let Some(size) = env_parse("MAX_MESSAGE_SIZE") {
            config.connection.max_message_size = size;
        }
        if let Some(secs) = env_parse("KEEPALIVE_SECS") {
            config.connection.keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("PONG_WAIT_SECS") {
            config.connection.pong_wait = Duration::from_secs(secs);
        }

        if let Ok(url) = std::env::var("CHAT_STORE_URL") {
            config.persistence.chat_url = (!url.is_empty()).then_some(url);
        }
        if let Ok(url) = std::env::var("MATCH_STORE_URL") {
            config.persistence.match_url = (!url.is_empty()).then_some(url);
        }
        if let Some(ms) = env_parse("PERSIST_TIMEOUT_MS") {
            config.persistence.timeout = Duration::from_millis(ms);
        }

        if let Some(score) = env_parse("WINNING_SCORE") {
            config.hub.game.winning_score = score;
        }
        if let Some(secs) = env_parse("MATCH_DURATION_SECS") {
            config.hub.game.match_duration_secs = secs;
        }
        if let Some(secs) = env_parse("SEMIFINAL_COUNTDOWN_SECS") {
            config.hub.tournament.semifinal_countdown_secs = secs;
        }
        if let Some(secs) = env_parse("FINAL_COUNTDOWN_SECS") {
            config.hub.tournament.final_countdown_secs = secs;
        }

        config.auth = AuthConfig::from_env();
        config
    }
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The game server.
pub struct GameServer {
    config: ServerConfig,
    auth: Arc<AuthConfig>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let auth = Arc::new(config.auth.clone());
        Self {
            config,
            auth,
            shutdown_tx,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        if self.config.auth.is_configured() {
            info!("Game server listening on {} (token identity)", local);
        } else {
            info!("Game server listening on {} (trusted identity)", local);
        }

        let persistence = Persistence::new(&self.config.persistence);
        let (hub, hub_handle) = Hub::new(self.config.hub.clone(), persistence);
        let hub_task = tokio::spawn(hub.run(self.shutdown_tx.subscribe()));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr, hub_handle.clone());
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(hub_handle);
        if let Err(e) = hub_task.await {
            error!("Hub task failed: {}", e);
        }
        Ok(())
    }

    /// Upgrade one socket and run its pumps.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, hub: HubHandle) {
        let auth = self.auth.clone();
        let capacity = self.config.outbound_queue_capacity;
        let conn_config = self.config.connection.clone();
        let ws_path = self.config.ws_path.clone();

        tokio::spawn(async move {
            let mut identity = None;
            let callback = |req: &Request, resp: Response| {
                if req.uri().path() != ws_path {
                    let mut refusal = ErrorResponse::new(Some("Not Found".to_string()));
                    *refusal.status_mut() = StatusCode::NOT_FOUND;
                    return Err(refusal);
                }
                let id_header = req.headers().get("id").and_then(|v| v.to_str().ok());
                match resolve_identity(req.uri().query(), id_header, &auth) {
                    Ok(user) => {
                        identity = Some(user);
                        Ok(resp)
                    }
                    Err(e) => {
                        let mut refusal = ErrorResponse::new(Some(e.to_string()));
                        *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                        Err(refusal)
                    }
                }
            };

            let ws = match accept_hdr_async(stream, callback).await {
                Ok(ws) => ws,
                Err(e) => {
                    info!("Rejected connection from {}: {}", addr, e);
                    return;
                }
            };
            let Some(user) = identity else {
                return;
            };

            info!(user, %addr, "Connection accepted");
            let (handle, outbound) = ConnectionHandle::new(user, capacity);
            connection::serve(ws, handle, outbound, hub, conn_config).await;
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
