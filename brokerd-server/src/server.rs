//! TCP server implementation.
//!
//! Each accepted socket gets its own task that runs
//! negotiate -> register -> dispatch -> unregister. The accept loop never
//! waits on any single connection.

use crate::config::Config;
use crate::connection::Connection;
use crate::context::ServerContext;
use crate::dispatch::{dispatch, SessionOutcome};
use crate::error::{ErrorKind, ServerError};
use crate::metrics::Metrics;
use crate::negotiate::Negotiator;
use crate::protocol::ProtocolTable;
use crate::registry::ConnectionRegistry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Time allowed for the protocol magic to arrive.
    pub handshake_timeout: Option<Duration>,
    /// Idle session timeout.
    pub idle_timeout: Option<Duration>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the runtime configuration from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            handshake_timeout: config.network.handshake_timeout(),
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub bad_protocols: AtomicU64,
    pub registry_rejections: AtomicU64,
    pub session_errors: AtomicU64,
    /// Woken when `connections_active` drops to zero.
    drained: Notify,
}

impl ServerStats {
    fn record_failure(&self, error: &ServerError) {
        let counter = match error.kind() {
            ErrorKind::HandshakeRead => &self.handshake_failures,
            ErrorKind::UnsupportedProtocol => &self.bad_protocols,
            ErrorKind::Registry => &self.registry_rejections,
            ErrorKind::Session => &self.session_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts one connection as active until dropped.
///
/// Lives in the connection's task, so the count is released even when the
/// task unwinds from a panicking handler.
struct ActiveConnection {
    stats: Arc<ServerStats>,
    metrics: Option<Arc<Metrics>>,
}

impl ActiveConnection {
    fn new(stats: Arc<ServerStats>, metrics: Option<Arc<Metrics>>) -> Self {
        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::SeqCst);
        if let Some(metrics) = &metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }
        Self { stats, metrics }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.connections_active.dec();
        }
        if self.stats.connections_active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.stats.drained.notify_waiters();
        }
    }
}

/// TCP front door for brokerd.
pub struct Server {
    ctx: Arc<ServerContext>,
    negotiator: Negotiator,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a server speaking every built-in protocol.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_protocols(config, ProtocolTable::with_defaults())
    }

    /// Creates a server that negotiates only the protocols in `table`.
    pub fn with_protocols(config: ServerConfig, table: ProtocolTable) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let ctx = Arc::new(ServerContext::new(config));
        let negotiator = Negotiator::new(Arc::new(table), ctx.clone());
        Self {
            ctx,
            negotiator,
            registry: Arc::new(ConnectionRegistry::new()),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.ctx.config().bind_addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections from `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        // Subscribed first, so a shutdown racing startup is seen either here
        // or by the receiver.
        if self.registry.is_sealed() {
            return Err(ServerError::ShuttingDown);
        }

        self.running.store(true, Ordering::SeqCst);
        tracing::info!("TCP: listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => self.accept(tcp_stream, addr),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("TCP: closing {}", listener.local_addr()?);
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Spawns the handling task for one accepted socket.
    fn accept(&self, tcp_stream: TcpStream, addr: SocketAddr) {
        if self.stats.connections_active.load(Ordering::SeqCst)
            >= self.ctx.config().max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            return;
        }

        let active = ActiveConnection::new(self.stats.clone(), self.ctx.metrics().cloned());

        if let Err(e) = tcp_stream.set_nodelay(true) {
            tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
        }

        let conn = Connection::new(self.ctx.next_connection_id(), addr, Box::new(tcp_stream));
        let ctx = self.ctx.clone();
        let negotiator = self.negotiator.clone();
        let registry = self.registry.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let _active = active;
            Self::handle_connection(conn, &ctx, &negotiator, &registry, &stats).await;
            tracing::info!("Client disconnected: {}", addr);
        });
    }

    /// Runs one connection from handshake to close.
    async fn handle_connection(
        mut conn: Connection,
        ctx: &ServerContext,
        negotiator: &Negotiator,
        registry: &Arc<ConnectionRegistry>,
        stats: &ServerStats,
    ) {
        let addr = conn.remote_addr();
        tracing::info!("TCP: new client({})", addr);

        let handler = match negotiator.negotiate(&mut conn).await {
            Ok(handler) => handler,
            Err(e) => {
                stats.record_failure(&e);
                return;
            }
        };

        let registration = match registry.insert(&conn) {
            Ok(registration) => registration,
            Err(e) => {
                tracing::warn!("[{}] Not starting session: {}", addr, e);
                stats.record_failure(&e);
                return;
            }
        };

        if let SessionOutcome::Failed(e) = dispatch(ctx, conn, handler, registration).await {
            stats.record_failure(&e);
        }
    }

    /// Initiates server shutdown.
    ///
    /// Seals the registry, force-closes every registered connection, then
    /// stops the accept loop. Returns the number of connections closed.
    pub fn shutdown(&self) -> usize {
        self.registry.seal();
        let closed = self.registry.close_all();
        if let Some(metrics) = self.ctx.metrics() {
            metrics.registry_closed_total.inc_by(closed as f64);
        }
        tracing::info!("Server shutting down, closed {} connection(s)", closed);
        let _ = self.shutdown.send(());
        closed
    }

    /// Waits until no connection is being handled, or `timeout` elapses.
    ///
    /// Returns whether the server drained in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.stats.drained.notified();
                tokio::pin!(notified);
                // Registered before the check so a concurrent last drop
                // cannot be missed.
                notified.as_mut().enable();
                if self.stats.connections_active.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    /// Returns a receiver that fires when shutdown is initiated.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Returns the live connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolHandler;
    use async_trait::async_trait;
    use brokerd_protocol::{Decoder, Frame, FrameType, MAGIC_V2};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    /// Handler that panics as soon as its session starts.
    struct Crash;

    #[async_trait]
    impl ProtocolHandler for Crash {
        fn name(&self) -> &'static str {
            "crash"
        }

        async fn io_loop(&mut self, conn: &mut Connection) -> Result<(), ServerError> {
            if conn.id() > 0 {
                panic!("handler crashed");
            }
            Ok(())
        }
    }

    async fn start(config: ServerConfig) -> (Arc<Server>, SocketAddr, JoinHandle<()>) {
        start_server(Server::new(config)).await
    }

    async fn start_server(server: Server) -> (Arc<Server>, SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server);
        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                server.serve(listener).await.unwrap();
            })
        };
        (server, addr, task)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn read_frames(stream: &mut TcpStream) -> Vec<Frame> {
        let mut bytes = Vec::new();
        let _ = stream.read_to_end(&mut bytes).await;
        let mut decoder = Decoder::new();
        decoder.extend(&bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_server_basic() {
        let server = Server::new(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        assert!(!server.is_running());
        assert!(server.registry().is_empty());
        assert!(server.wait_for_drain(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_panicking_handler_releases_its_slot() {
        let mut config = ServerConfig::default();
        config.max_connections = 1;
        let mut table = ProtocolTable::new();
        table.register(MAGIC_V2, |_ctx: Arc<ServerContext>| {
            Box::new(Crash) as Box<dyn ProtocolHandler>
        });
        let (server, addr, _task) = start_server(Server::with_protocols(config, table)).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"  V2").await.unwrap();
        assert!(read_frames(&mut first).await.is_empty());

        assert!(server.wait_for_drain(Duration::from_secs(5)).await);
        assert_eq!(server.stats().connections_active.load(Ordering::SeqCst), 0);
        assert!(server.registry().is_empty());

        // Still under the limit of one, so the next client is handled.
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"  V2").await.unwrap();
        assert!(read_frames(&mut second).await.is_empty());
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 2);
        assert!(server.wait_for_drain(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_v2_session_is_registered_while_active() {
        let (server, addr, _task) = start(ServerConfig::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let key = client.local_addr().unwrap();
        client.write_all(b"  V2").await.unwrap();

        wait_until(|| server.registry().contains(&key)).await;

        client.write_all(b"NOP\nCLS\n").await.unwrap();
        let frames = read_frames(&mut client).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::Response);
        assert_eq!(frames[0].body.as_ref(), b"CLOSE_WAIT");

        wait_until(|| !server.registry().contains(&key)).await;
        assert!(server.wait_for_drain(Duration::from_secs(5)).await);
        assert_eq!(server.stats().session_errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_bad_magic_gets_one_error_frame() {
        let (server, addr, _task) = start(ServerConfig::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"XXXX").await.unwrap();

        let frames = read_frames(&mut client).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::Error);
        assert_eq!(frames[0].body.as_ref(), b"E_BAD_PROTOCOL");

        assert!(server.wait_for_drain(Duration::from_secs(5)).await);
        assert!(server.registry().is_empty());
        assert_eq!(server.stats().bad_protocols.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_short_handshake_sends_nothing() {
        let (server, addr, _task) = start(ServerConfig::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b" V").await.unwrap();
        client.shutdown().await.unwrap();

        assert!(read_frames(&mut client).await.is_empty());
        wait_until(|| server.stats().handshake_failures.load(Ordering::Relaxed) == 1).await;
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_sessions() {
        let (server, addr, task) = start(ServerConfig::default()).await;

        let mut clients = Vec::new();
        for _ in 0..5 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"  V2").await.unwrap();
            clients.push(client);
        }
        wait_until(|| server.registry().len() == 5).await;

        assert_eq!(server.shutdown(), 5);

        for client in clients.iter_mut() {
            let mut buf = [0u8; 16];
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .expect("client was not disconnected");
            assert!(matches!(n, Ok(0) | Err(_)));
        }

        assert!(server.wait_for_drain(Duration::from_secs(5)).await);
        assert!(server.registry().is_empty());
        task.await.unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_failed_connection_does_not_affect_others() {
        let (server, addr, _task) = start(ServerConfig::default()).await;

        let mut good = TcpStream::connect(addr).await.unwrap();
        let good_key = good.local_addr().unwrap();
        good.write_all(b"  V2").await.unwrap();
        wait_until(|| server.registry().contains(&good_key)).await;

        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"  V2BOGUS\n").await.unwrap();
        let frames = read_frames(&mut bad).await;
        assert_eq!(frames[0].error_code(), Some("E_INVALID"));

        assert!(server.registry().contains(&good_key));
        good.write_all(b"CLS\n").await.unwrap();
        let frames = read_frames(&mut good).await;
        assert_eq!(frames[0].body.as_ref(), b"CLOSE_WAIT");
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = ServerConfig::default();
        config.max_connections = 1;
        let (server, addr, _task) = start(config).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        let first_key = first.local_addr().unwrap();
        first.write_all(b"  V2").await.unwrap();
        wait_until(|| server.registry().contains(&first_key)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .expect("over-limit connection was not dropped");
        assert!(matches!(n, Ok(0) | Err(_)));
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let server = Server::new(ServerConfig::default());
        assert_eq!(server.shutdown(), 0);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            server.serve(listener).await,
            Err(ServerError::ShuttingDown)
        ));
    }
}
