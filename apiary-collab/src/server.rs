//! WebSocket server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌── Client A
//!            ├── handle_connection ── hub task ──┼── Client B
//! Client B ──┘   (decode, forward)   (Session)   └── Client C
//!                        ▲                │
//!                        └── BroadcastGroup (audience filter)
//! ```
//!
//! A connection task never touches coordinator state. It decodes frames,
//! queues them on the hub, and forwards the deliveries whose audience
//! includes its participant.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use apiary_core::{Coordinator, CoordinatorConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::hub::{spawn_hub, CoordinatorHandle, HubConfig, Session};
use crate::protocol::{Body, Event, Frame};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Deliveries a slow connection may fall behind before losing some
    pub broadcast_capacity: usize,
    /// Inbound calls buffered ahead of the coordinator task
    pub queue_capacity: usize,
    /// Seconds between maintenance passes
    pub cleanup_interval_secs: u64,
    /// Largest WebSocket message accepted from a client
    pub max_message_bytes: usize,
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            broadcast_capacity: 256,
            queue_capacity: 1024,
            cleanup_interval_secs: 3600,
            max_message_bytes: 1 << 20,
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `APIARY_BIND` or, failing that, `PORT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(bind) = lookup("APIARY_BIND").filter(|v| !v.trim().is_empty()) {
            config.bind_addr = bind.trim().to_string();
        } else if let Some(port) = lookup("PORT").and_then(|p| p.trim().parse::<u16>().ok()) {
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        config
    }

    fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.queue_capacity,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        }
    }

    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_message_bytes))
            .max_frame_size(Some(self.max_message_bytes))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
}

pub struct ApiaryServer {
    config: ServerConfig,
    broadcast: Arc<BroadcastGroup>,
    stats: Arc<RwLock<ServerStats>>,
}

impl ApiaryServer {
    pub fn new(config: ServerConfig) -> Self {
        let broadcast = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        Self {
            config,
            broadcast,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind, start the coordinator task, and accept connections forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Apiary server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Like [`run`](Self::run), but returns once `shutdown` completes.
    pub async fn run_until<F>(
        &self,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => result,
            () = shutdown => {
                let stats = self.stats().await;
                log::info!(
                    "Shutting down with {} active connections ({} total)",
                    stats.active_connections,
                    stats.total_connections
                );
                Ok(())
            }
        }
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let session = Session::new(Coordinator::new(self.config.coordinator.clone()));
        let (hub, _hub_task) = spawn_hub(session, self.broadcast.clone(), self.config.hub_config());

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = hub.clone();
            let group = self.broadcast.clone();
            let stats = self.stats.clone();
            let ws_config = self.config.websocket_config();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, ws_config, hub, group, stats).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ws_config: WebSocketConfig,
        hub: CoordinatorHandle,
        group: Arc<BroadcastGroup>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream =
            tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let actor = Uuid::new_v4().to_string();
        log::info!("WebSocket connection established from {addr} as {actor}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Subscribe before announcing so the welcome cannot be missed
        let mut deliveries = group.subscribe();

        let result = async {
            hub.connect(&actor).await?;
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_frames += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                match Frame::decode(&data) {
                                    Ok(Frame { correlation, body: Body::Request(request), .. }) => {
                                        hub.submit(&actor, correlation, request).await?;
                                    }
                                    Ok(Frame { correlation, .. }) => {
                                        stats.write().await.rejected_frames += 1;
                                        let reply = Frame::event(&actor, correlation, Event::Error {
                                            message: "clients may only send requests".into(),
                                        });
                                        let bytes = reply.encode()?;
                                        ws_sender.send(Message::Binary(bytes.into())).await?;
                                    }
                                    Err(e) => {
                                        stats.write().await.rejected_frames += 1;
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        let reply = Frame::event(&actor, 0, Event::Error {
                                            message: e.to_string(),
                                        });
                                        let bytes = reply.encode()?;
                                        ws_sender.send(Message::Binary(bytes.into())).await?;
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    delivery = deliveries.recv() => {
                        match delivery {
                            Ok(delivery) => {
                                if delivery.audience.includes(&actor) {
                                    let bytes = delivery.bytes.clone();
                                    ws_sender.send(Message::Binary(bytes.into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                group.record_dropped(n);
                                log::warn!("{actor} lagged by {n} deliveries");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        if let Err(e) = hub.disconnect(&actor).await {
            log::warn!("Could not announce departure of {actor}: {e}");
        }
        stats.write().await.active_connections -= 1;

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3001");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.cleanup_interval_secs, 3600);
        assert_eq!(config.max_message_bytes, 1 << 20);
        assert_eq!(config.coordinator.default_lock_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_config_from_lookup() {
        let bind = ServerConfig::from_lookup(|key| match key {
            "APIARY_BIND" => Some("0.0.0.0:8080".into()),
            "PORT" => Some("9000".into()),
            _ => None,
        });
        assert_eq!(bind.bind_addr, "0.0.0.0:8080");

        let port = ServerConfig::from_lookup(|key| (key == "PORT").then(|| "9000".to_string()));
        assert_eq!(port.bind_addr, "0.0.0.0:9000");

        let junk = ServerConfig::from_lookup(|key| (key == "PORT").then(|| "nope".to_string()));
        assert_eq!(junk.bind_addr, "127.0.0.1:3001");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = ApiaryServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:3001");
        assert_eq!(server.broadcast().capacity(), 256);
    }

    #[tokio::test]
    async fn test_failed_join_releases_connection_slot() {
        let config = ServerConfig::default();
        let group = Arc::new(BroadcastGroup::new(8));
        let session = Session::new(Coordinator::with_defaults());
        let (hub, task) = spawn_hub(session, group.clone(), config.hub_config());
        task.abort();
        let _ = task.await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            tokio_tungstenite::connect_async(format!("ws://{addr}")).await
        });
        let (stream, peer) = listener.accept().await.unwrap();

        let stats = Arc::new(RwLock::new(ServerStats::default()));
        let result = ApiaryServer::handle_connection(
            stream,
            peer,
            config.websocket_config(),
            hub,
            group,
            stats.clone(),
        )
        .await;
        assert!(result.is_err());

        let stats = stats.read().await;
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_connections, 0);
        client.abort();
    }

    #[test]
    fn test_websocket_config_caps_message_size() {
        let config = ServerConfig {
            max_message_bytes: 4096,
            ..ServerConfig::default()
        };
        let ws = config.websocket_config();
        assert_eq!(ws.max_message_size, Some(4096));
        assert_eq!(ws.max_frame_size, Some(4096));
    }

    #[tokio::test]
    async fn test_run_until_returns_on_shutdown() {
        let server = ApiaryServer::new(ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        });
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = stopped.await;
                })
                .await
                .is_ok()
        });

        stop.send(()).unwrap();
        let clean = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap();
        assert!(clean);
    }
}
