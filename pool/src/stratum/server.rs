/// Stratum TCP server
///
/// Accepts miners on a listening port, frames newline-delimited JSON-RPC
/// and hands every request to a [`StratumHandler`]. Each connection runs
/// three tasks: the reader (this module), a writer draining the outbound
/// queue, and a request task that feeds the handler in arrival order.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::StratumConnection;
use super::protocol::StratumRequest;
use super::proxy_protocol::{self, Preamble};
use crate::banning::BanManager;
use crate::config::TcpProxyProtocolConfig;
use crate::metrics::prometheus as metrics;
use crate::worker::WorkerContext;

/// Longest accepted request line.
pub const MAX_LINE_LENGTH: usize = 0x8000;

/// A connection must send its first line within this period.
pub const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Ban applied to peers that send unparseable data.
pub const JUNK_BAN_DURATION: Duration = Duration::from_secs(30 * 60);

#[async_trait]
pub trait StratumHandler: Send + Sync + 'static {
    /// Fresh per-connection state for a client on `port`.
    fn create_context(&self, port: u16, remote: SocketAddr) -> WorkerContext;

    async fn on_connect(&self, _connection: &Arc<StratumConnection>) {}

    /// `received` is when the request was read off the socket.
    async fn on_request(&self, connection: &Arc<StratumConnection>, request: StratumRequest, received: Instant);

    async fn on_disconnect(&self, _connection: &Arc<StratumConnection>) {}
}

/// Per-port listener settings.
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    pub port: u16,
    pub proxy_protocol: Option<TcpProxyProtocolConfig>,
}

pub struct StratumServer<H: StratumHandler> {
    pool_id: String,
    handler: Arc<H>,
    ban_manager: Option<Arc<dyn BanManager>>,
    ban_on_junk: bool,
}

enum ReadOutcome {
    Line(String),
    Closed,
}

impl<H: StratumHandler> StratumServer<H> {
    pub fn new(pool_id: impl Into<String>, handler: Arc<H>, ban_manager: Option<Arc<dyn BanManager>>, ban_on_junk: bool) -> Self {
        Self {
            pool_id: pool_id.into(),
            handler,
            ban_manager,
            ban_on_junk,
        }
    }

    /// Bind `address:port` with SO_REUSEADDR so restarts don't trip over
    /// sockets in TIME_WAIT.
    pub fn bind(address: &str, port: u16) -> io::Result<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", address, port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}:{}: {}", address, port, e)))?;
        let domain = if addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
        let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        TcpListener::from_std(socket.into())
    }

    fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.ban_manager.as_ref().is_some_and(|b| b.is_banned(&addr.ip()))
    }

    /// Accept loop for one port. Returns when `cancel` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, options: ListenerOptions, cancel: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => tracing::info!("[{}] ✅ Stratum port {} online ({})", self.pool_id, options.port, addr),
            Err(_) => tracing::info!("[{}] ✅ Stratum port {} online", self.pool_id, options.port),
        }
        let options = Arc::new(options);
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    if self.is_banned(&peer) {
                        tracing::debug!("[{}] Rejecting banned client {}", self.pool_id, peer);
                        continue;
                    }
                    let server = Arc::clone(&self);
                    let options = Arc::clone(&options);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        server.handle_socket(socket, peer, &options, cancel).await;
                    });
                }
                Err(e) => tracing::error!("[{}] Failed to accept connection: {}", self.pool_id, e),
            }
        }
        tracing::info!("[{}] Stratum port {} stopped", self.pool_id, options.port);
    }

    async fn handle_socket(&self, socket: TcpStream, peer: SocketAddr, options: &ListenerOptions, cancel: CancellationToken) {
        let _ = socket.set_nodelay(true);
        let (read_half, write_half) = socket.into_split();
        let mut reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        // zombie guard: nothing within the grace period means drop
        let first = match tokio::time::timeout(FIRST_FRAME_TIMEOUT, reader.next()).await {
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(e))) => {
                self.log_read_error(&peer, &e);
                return;
            }
            Ok(None) => return,
            Err(_) => {
                tracing::debug!("[{}] Dropping zombie connection {}", self.pool_id, peer);
                return;
            }
        };

        let mut remote = peer;
        let mut pending_first = Some(first);
        if let Some(proxy) = options.proxy_protocol.as_ref().filter(|p| p.enable) {
            let line = pending_first.take().unwrap_or_default();
            match proxy_protocol::inspect_first_line(proxy, peer.ip(), line.trim()) {
                Ok(Preamble::Header(Some(real))) => {
                    tracing::debug!("[{}] PROXY header: {} is {}", self.pool_id, peer, real);
                    remote = real;
                }
                Ok(Preamble::Header(None)) => {}
                Ok(Preamble::Request) => pending_first = Some(line),
                Err(e) => {
                    tracing::warn!("[{}] ⚠️  Dropping {}: {}", self.pool_id, peer, e);
                    return;
                }
            }
            if self.is_banned(&remote) {
                tracing::debug!("[{}] Rejecting banned client {}", self.pool_id, remote);
                return;
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let context = self.handler.create_context(options.port, remote);
        let connection = Arc::new(StratumConnection::new(
            Uuid::new_v4().simple().to_string(),
            remote,
            options.port,
            tx,
            context,
        ));
        metrics::inc_connections();
        tracing::debug!("[{}] 🔌 Accepted connection {} from {}", self.pool_id, connection.id(), remote);

        let writer = tokio::spawn(Self::write_loop(
            FramedWrite::new(write_half, LinesCodec::new()),
            rx,
            connection.close_token(),
        ));

        self.handler.on_connect(&connection).await;

        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<(StratumRequest, Instant)>();
        let handler = Arc::clone(&self.handler);
        let request_conn = Arc::clone(&connection);
        let requests = tokio::spawn(async move {
            while let Some((request, received)) = req_rx.recv().await {
                if request_conn.is_closed() {
                    break;
                }
                handler.on_request(&request_conn, request, received).await;
            }
        });

        let closed = connection.close_token();
        loop {
            let outcome = match pending_first.take() {
                Some(line) => ReadOutcome::Line(line),
                None => tokio::select! {
                    _ = closed.cancelled() => ReadOutcome::Closed,
                    _ = cancel.cancelled() => ReadOutcome::Closed,
                    frame = reader.next() => match frame {
                        Some(Ok(line)) => ReadOutcome::Line(line),
                        Some(Err(e)) => {
                            if matches!(e, LinesCodecError::MaxLineLengthExceeded) {
                                self.junk(&connection, "oversized request");
                            }
                            self.log_read_error(&remote, &e);
                            ReadOutcome::Closed
                        }
                        None => ReadOutcome::Closed,
                    },
                },
            };
            let line = match outcome {
                ReadOutcome::Line(line) => line,
                ReadOutcome::Closed => break,
            };

            // a ban issued mid-session takes effect before the next frame
            if self.is_banned(&remote) {
                tracing::debug!("[{}] Disconnecting banned client {}", self.pool_id, remote);
                break;
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StratumRequest>(line) {
                Ok(request) => {
                    if req_tx.send((request, Instant::now())).is_err() {
                        break;
                    }
                }
                Err(e) => self.junk(&connection, &e.to_string()),
            }
        }

        drop(req_tx);
        connection.disconnect();
        let _ = requests.await;
        let _ = writer.await;
        metrics::dec_connections();
        self.handler.on_disconnect(&connection).await;
        tracing::debug!("[{}] Connection {} closed", self.pool_id, connection.id());
    }

    fn junk(&self, connection: &StratumConnection, reason: &str) {
        tracing::warn!(
            "[{}] ⚠️  Junk from {} ({}): {}",
            self.pool_id,
            connection.remote_endpoint(),
            connection.id(),
            reason
        );
        if self.ban_on_junk {
            if let Some(bans) = &self.ban_manager {
                tracing::info!("[{}] Banning {} for sending junk", self.pool_id, connection.remote_endpoint().ip());
                bans.ban(connection.remote_endpoint().ip(), JUNK_BAN_DURATION);
            }
        }
    }

    fn log_read_error(&self, peer: &SocketAddr, e: &LinesCodecError) {
        match e {
            LinesCodecError::Io(io) if io.kind() == io::ErrorKind::ConnectionReset => {
                tracing::debug!("[{}] Connection reset by {}", self.pool_id, peer)
            }
            other => tracing::error!("[{}] Read error from {}: {}", self.pool_id, peer, other),
        }
    }

    /// Drain the outbound queue, coalescing whatever is already queued into
    /// a single flush. On close, flush what is left and stop.
    async fn write_loop(
        mut sink: FramedWrite<OwnedWriteHalf, LinesCodec>,
        mut rx: mpsc::UnboundedReceiver<String>,
        closed: CancellationToken,
    ) {
        loop {
            let first = tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = closed.cancelled() => {
                    while let Ok(msg) = rx.try_recv() {
                        if sink.feed(msg).await.is_err() {
                            return;
                        }
                    }
                    let _ = SinkExt::<String>::flush(&mut sink).await;
                    break;
                }
            };
            if sink.feed(first).await.is_err() {
                break;
            }
            while let Ok(msg) = rx.try_recv() {
                if sink.feed(msg).await.is_err() {
                    return;
                }
            }
            if SinkExt::<String>::flush(&mut sink).await.is_err() {
                break;
            }
        }
        let _ = SinkExt::<String>::close(&mut sink).await;
        closed.cancel();
    }
}
