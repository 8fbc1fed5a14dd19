//! WebSocket front door for the hub.
//!
//! ```text
//!              accept_hdr_async (Bearer / ?agent_secret=)
//!  TcpListener ───────────────────────────────────────────┐
//!                                                         ▼
//!                     ┌──────── reader loop ─────► Dispatcher::handle_frame
//!   WebSocket ────────┤
//!                     └──────── writer task ◄──── mpsc (Peer) ◄── Hub sends
//! ```
//!
//! Every connection gets a bounded outbound queue. The hub's write timeout
//! applies when enqueueing and again to each socket write; a writer that
//! stalls or fails exits, which closes the queue and gets the connection
//! evicted on the next send.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Connection, Credentials, Dispatcher};
use crate::graph::{GraphError, DEFAULT_MAX_CHAIN_DEPTH};
use crate::hub::{HubStats, Peer, DEFAULT_WRITE_TIMEOUT};
use crate::router::Router;

pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Shared secret for agent/voice/assistant (None = open mode)
    pub agent_secret: Option<String>,
    /// Deadline for each outbound write
    pub write_timeout: Duration,
    /// Ceiling on processing one inbound frame
    pub process_timeout: Duration,
    /// Per-connection outbound queue depth
    pub outbound_buffer: usize,
    /// Bound on chain walks
    pub max_chain_depth: usize,
    /// RocksDB directory (None = in-memory graph)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            agent_secret: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            process_timeout: DEFAULT_PROCESS_TIMEOUT,
            outbound_buffer: 256,
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, short timeouts, in-memory graph.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            write_timeout: Duration::from_secs(2),
            process_timeout: Duration::from_secs(10),
            outbound_buffer: 64,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Store error: {0}")]
    Store(#[from] GraphError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub hub: HubStats,
}

#[derive(Default)]
struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
    frames: AtomicU64,
    bytes: AtomicU64,
}

pub struct HubServer {
    config: ServerConfig,
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    counters: Arc<ConnectionCounters>,
    shutdown: CancellationToken,
}

impl HubServer {
    /// Bind the listener around an existing router.
    pub async fn bind(config: ServerConfig, router: Arc<Router>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let dispatcher = Arc::new(Dispatcher::new(
            router,
            config.agent_secret.clone(),
            config.process_timeout,
        ));
        Ok(Self {
            config,
            listener,
            dispatcher,
            counters: Arc::new(ConnectionCounters::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Open the configured store, build the router and bind.
    pub async fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let router = Arc::new(Router::from_config(&config)?);
        Self::bind(config, router).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn router(&self) -> &Arc<Router> {
        self.dispatcher.router()
    }

    /// Token that stops [`run`](Self::run) and every open connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            frames_received: self.counters.frames.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes.load(Ordering::Relaxed),
            hub: self.router().hub().stats().await,
        }
    }

    /// Accept connections until stopped.
    pub async fn run(&self) -> Result<(), ServerError> {
        log::info!("Hub server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let dispatcher = self.dispatcher.clone();
                    let counters = self.counters.clone();
                    let shutdown = self.shutdown.clone();
                    let write_timeout = self.config.write_timeout;
                    let outbound_buffer = self.config.outbound_buffer;
                    tokio::spawn(async move {
                        counters.total.fetch_add(1, Ordering::Relaxed);
                        counters.active.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = handle_connection(
                            stream,
                            addr,
                            dispatcher,
                            counters.clone(),
                            shutdown,
                            write_timeout,
                            outbound_buffer,
                        )
                        .await
                        {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                        counters.active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                _ = self.shutdown.cancelled() => {
                    log::info!("Hub server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Pull the privileged-role secret out of the upgrade request.
pub fn credentials_from_request(request: &Request) -> Credentials {
    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());

    let query_secret = request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key != "agent_secret" {
                return None;
            }
            urlencoding::decode(value).ok().map(|v| v.into_owned())
        })
    });

    Credentials::new(bearer, query_secret)
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    counters: Arc<ConnectionCounters>,
    shutdown: CancellationToken,
    write_timeout: Duration,
    outbound_buffer: usize,
) -> Result<(), ServerError> {
    let mut credentials = Credentials::default();
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            credentials = credentials_from_request(request);
            Ok(response)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (peer, mut outbound) = Peer::channel(outbound_buffer);
    let conn_id = peer.id();
    log::info!("WebSocket connection {conn_id} established from {addr}");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let send = ws_sender.send(Message::Binary(frame.to_vec().into()));
            match tokio::time::timeout(write_timeout, send).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::debug!("Write to {conn_id} failed: {e}");
                    break;
                }
                Err(_) => {
                    log::warn!("Write to {conn_id} exceeded {write_timeout:?}");
                    break;
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut conn = Connection::new(peer, credentials);
    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    counters.frames.fetch_add(1, Ordering::Relaxed);
                    counters.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                    dispatcher.handle_frame(&mut conn, data.into()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(_))) => {
                    log::debug!("Ignoring text frame from {conn_id}");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Read from {conn_id} failed: {e}");
                    break;
                }
            },
            _ = shutdown.cancelled() => break,
        }
    }

    dispatcher.close(&mut conn).await;
    writer.abort();
    log::info!("Connection {conn_id} from {addr} closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.process_timeout, Duration::from_secs(300));
        assert_eq!(config.max_chain_depth, 10_000);
        assert!(config.agent_secret.is_none());
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_credentials_from_bearer_header() {
        let mut request = "ws://localhost/ws".into_client_request().unwrap();
        request
            .headers_mut()
            .insert("authorization", "Bearer s3cret".parse().unwrap());
        let credentials = credentials_from_request(&request);
        assert_eq!(credentials.bearer.as_deref(), Some("s3cret"));
        assert!(credentials.authorizes(Some("s3cret")));
    }

    #[test]
    fn test_credentials_from_query() {
        let request = "ws://localhost/ws?foo=1&agent_secret=a%20b"
            .into_client_request()
            .unwrap();
        let credentials = credentials_from_request(&request);
        assert_eq!(credentials.query_secret.as_deref(), Some("a b"));
        assert!(credentials.bearer.is_none());
        assert!(!credentials.authorizes(Some("other")));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_and_stop() {
        let server = HubServer::open(ServerConfig::for_testing()).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);

        server.stop();
        tokio::time::timeout(Duration::from_secs(1), server.run())
            .await
            .unwrap()
            .unwrap();
    }
}
