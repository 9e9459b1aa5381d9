//! WebSocket front end with two namespaces.
//!
//! ```text
//!  ws://host/            ──▶ DocumentSession ──▶ RoomRegistry ──▶ PageStore
//!  ws://host/space       ──▶ SpaceSession ─────▶ Broadcaster
//! ```
//!
//! Each socket gets one task. The task owns the WebSocket and forwards
//! frames between it and the session; sessions only ever see text.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::context::{SyncConfig, SyncContext};
use crate::document::DocumentSession;
use crate::error::SyncError;
use crate::services::StaticDirectory;
use crate::space::SpaceSession;
use crate::storage::{MemoryPageStore, PageStore, RocksPageStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Trust any `<uuid>[:<name>]` token and grant full access
    /// (`QUILL_DEV_AUTH`). Off unless set explicitly.
    pub dev_auth: bool,
    pub sync: SyncConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            dev_auth: false,
            sync: SyncConfig::default(),
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparseable {key}={raw}");
            None
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `QUILL_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = env::var("QUILL_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = env::var("QUILL_STORAGE_PATH") {
            if !path.is_empty() {
                config.storage_path = Some(PathBuf::from(path));
            }
        }
        config.dev_auth = env::var("QUILL_DEV_AUTH").is_ok_and(|raw| parse_flag(&raw));
        if let Some(history) = env_parse("QUILL_HISTORY_LENGTH") {
            config.sync.history_length = history;
        }
        if let Some(interval) = env_parse::<u64>("QUILL_SAVE_INTERVAL") {
            config.sync.save_interval = interval.max(1);
        }
        if let Some(delay) = env_parse("QUILL_CLEANUP_DELAY_MS") {
            config.sync.cleanup_delay = Duration::from_millis(delay);
        }
        config
    }

    /// The directory used for sessions, permissions and membership.
    ///
    /// The only built-in one is the permissive development directory, so
    /// this fails unless `dev_auth` is on.
    pub fn directory(&self) -> Result<Arc<StaticDirectory>, SyncError> {
        if !self.dev_auth {
            return Err(SyncError::Service(
                "no session verifier configured, set QUILL_DEV_AUTH=1 to accept development tokens"
                    .to_string(),
            ));
        }
        log::warn!("Development auth enabled: any <uuid>:<name> token gets full access");
        Ok(Arc::new(StaticDirectory::permissive()))
    }

    /// Opens the configured store: RocksDB when a path is set, otherwise
    /// an in-memory store that is lost on exit.
    pub fn open_store(&self) -> Result<Arc<dyn PageStore>, SyncError> {
        match &self.storage_path {
            Some(path) => {
                let store = RocksPageStore::open(StoreConfig::new(path))?;
                log::info!("Opened page store at {}", path.display());
                Ok(Arc::new(store))
            }
            None => {
                log::warn!("No storage path configured, pages are kept in memory only");
                Ok(Arc::new(MemoryPageStore::new()))
            }
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespace {
    Document,
    Space,
}

impl Namespace {
    fn from_path(path: &str) -> Self {
        if path.starts_with("/space") {
            Namespace::Space
        } else {
            Namespace::Document
        }
    }
}

/// What the socket task drives. Both namespaces share the same pump.
#[async_trait]
trait Session: Send + Sync {
    async fn open(&self);
    async fn on_message(&mut self, text: &str);
    async fn close(&mut self);
}

#[async_trait]
impl Session for DocumentSession {
    async fn open(&self) {
        DocumentSession::open(self).await
    }

    async fn on_message(&mut self, text: &str) {
        DocumentSession::on_message(self, text).await
    }

    async fn close(&mut self) {
        DocumentSession::close(self).await
    }
}

#[async_trait]
impl Session for SpaceSession {
    async fn open(&self) {
        SpaceSession::open(self).await
    }

    async fn on_message(&mut self, text: &str) {
        SpaceSession::on_message(self, text).await
    }

    async fn close(&mut self) {
        SpaceSession::close(self).await
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    ctx: Arc<SyncContext>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, ctx: Arc<SyncContext>) -> Self {
        Self {
            config,
            ctx,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// The shared context, e.g. for inspecting rooms in tests.
    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// A copy of the connection counters.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Binds the configured address and serves until the listener fails.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accepts connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<SyncContext>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), SyncError> {
        let mut path = String::new();
        let capture_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            Ok(response)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;
        let namespace = Namespace::from_path(&path);
        log::info!("WebSocket connection from {addr} on {namespace:?} namespace");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let result = match namespace {
            Namespace::Document => {
                let session = DocumentSession::new(ctx, tx);
                Self::pump(ws_stream, session, rx, &stats).await
            }
            Namespace::Space => {
                let session = SpaceSession::new(ctx, tx);
                Self::pump(ws_stream, session, rx, &stats).await
            }
        };

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection closed from {addr}");
        result
    }

    /// Runs the socket until either side hangs up. The session is always
    /// closed, even when the socket errors.
    async fn pump<S: Session>(
        ws_stream: WebSocketStream<TcpStream>,
        mut session: S,
        mut rx: mpsc::UnboundedReceiver<String>,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), SyncError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        session.open().await;

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += text.len() as u64;
                        }
                        session.on_message(text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(Message::Binary(_))) => log::debug!("Ignoring binary frame"),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                },
                Some(frame) = rx.recv() => {
                    if let Err(e) = ws_sender.send(Message::Text(frame.into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        session.close().await;
        result
    }
}
