//! TCP server for the increment protocol.
//!
//! Owns the listener lifecycle (unstarted, running, closed), accepts
//! connections and runs one handler task per connection against the shared
//! counter.

use crate::address::{AddrError, Endpoint, Network};
use crate::connection::{handle_connection, ShutdownBehavior};
use crate::counter::Counter;
use crate::registry::SharedRegistry;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Listen backlog passed to `listen(2)`
const LISTEN_BACKLOG: i32 = 1024;

/// Tunables for a [`Server`]
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Upper bound on connections served at once. `None` means unlimited.
    /// Connections beyond the limit wait in the listen backlog.
    pub max_connections: Option<usize>,
    /// What live connections do when the server closes.
    pub on_shutdown: ShutdownBehavior,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: None,
            on_shutdown: ShutdownBehavior::Linger,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Unstarted,
    Running { local_addr: SocketAddr },
    Closed,
}

impl Lifecycle {
    fn ensure_unstarted(self) -> Result<(), ServerError> {
        match self {
            Lifecycle::Unstarted => Ok(()),
            Lifecycle::Running { .. } => Err(ServerError::AlreadyRunning),
            Lifecycle::Closed => Err(ServerError::AlreadyClosed),
        }
    }
}

/// State shared with the background tasks
struct Shared {
    lifecycle: Mutex<Lifecycle>,
    /// Present only while running. Dropping it releases the port.
    listener: Mutex<Option<TcpListener>>,
    /// Flips to `true` exactly once, when the server closes.
    closed_tx: watch::Sender<bool>,
    counter: Counter,
    registry: SharedRegistry,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listener(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        !matches!(*self.lock(), Lifecycle::Running { .. })
    }

    /// Poll the listener for a connection. `Ready(None)` once it is gone.
    fn poll_accept(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<(TcpStream, SocketAddr)>>> {
        match self.listener().as_ref() {
            Some(listener) => listener.poll_accept(cx).map(Some),
            None => Poll::Ready(None),
        }
    }

    fn close(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lock();
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Closed);
        // Unbind before reporting closed.
        drop(self.listener().take());
        drop(lifecycle);
        self.closed_tx.send_replace(true);

        match previous {
            Lifecycle::Running { local_addr } => {
                info!(
                    address = %local_addr,
                    live_connections = self.registry.len(),
                    "Server closed"
                );
                for info in self.registry.connections() {
                    debug!(
                        peer = %info.peer,
                        age_ms = info.accepted_at.elapsed().as_millis() as u64,
                        "Connection still open at close"
                    );
                }
                Ok(())
            }
            Lifecycle::Unstarted => Ok(()),
            Lifecycle::Closed => Err(ServerError::AlreadyClosed),
        }
    }
}

/// Increment server
pub struct Server {
    endpoint: Endpoint,
    options: ServerOptions,
    shared: Arc<Shared>,
}

impl Server {
    /// Create an unstarted server for `endpoint` with default options
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_options(endpoint, ServerOptions::default())
    }

    pub fn with_options(endpoint: Endpoint, options: ServerOptions) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Server {
            endpoint,
            options,
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle::Unstarted),
                listener: Mutex::new(None),
                closed_tx,
                counter: Counter::new(),
                registry: SharedRegistry::default(),
            }),
        }
    }

    /// Parse `url` (e.g. `tcp://localhost:8080`) and create an unstarted server.
    pub fn from_url(url: &str) -> Result<Self, ServerError> {
        Ok(Self::new(url.parse()?))
    }

    /// Bind the listener and start serving in the background.
    ///
    /// Returns as soon as the listener is bound, with the bound address
    /// (useful when the endpoint asks for port 0). The server closes itself
    /// when `shutdown` completes. Must be called from within a Tokio runtime.
    pub fn start<F>(&self, shutdown: F) -> Result<SocketAddr, ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| ServerError::NoRuntime)?;
        self.shared.lock().ensure_unstarted()?;

        // Name resolution may block, so bind without holding the lifecycle lock.
        let listener = bind(&self.endpoint).map_err(|source| ServerError::Bind {
            endpoint: self.endpoint.clone(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            endpoint: self.endpoint.clone(),
            source,
        })?;

        let mut lifecycle = self.shared.lock();
        // Another caller may have started or closed the server meanwhile, in
        // which case the new listener is dropped here.
        lifecycle.ensure_unstarted()?;
        *self.shared.listener() = Some(listener);
        *lifecycle = Lifecycle::Running { local_addr };
        drop(lifecycle);

        info!(
            endpoint = %self.endpoint,
            address = %local_addr,
            max_connections = ?self.options.max_connections,
            on_shutdown = ?self.options.on_shutdown,
            "Server listening"
        );

        runtime.spawn(watch_shutdown(Arc::clone(&self.shared), shutdown));
        runtime.spawn(accept_loop(Arc::clone(&self.shared), self.options.clone()));

        Ok(local_addr)
    }

    /// True unless the server is running: before `start` and after `close`.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop accepting connections and release the listener.
    ///
    /// Live connections are not interrupted unless the server was built with
    /// [`ShutdownBehavior::Close`]. Closing twice returns
    /// [`ServerError::AlreadyClosed`]; the server stays closed.
    pub fn close(&self) -> Result<(), ServerError> {
        self.shared.close()
    }

    /// Wait until the server has been closed, by [`Server::close`] or by the
    /// shutdown future passed to [`Server::start`].
    pub async fn closed(&self) {
        let mut closed = self.shared.closed_tx.subscribe();
        // The sender lives in `self.shared`, so this only ends on a close.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.shared.lock() {
            Lifecycle::Running { local_addr } => Some(local_addr),
            _ => None,
        }
    }

    /// Current counter value, read with a zero increment.
    pub fn counter(&self) -> u64 {
        self.shared.counter.add_and_get(0)
    }

    /// Number of connections whose handler is still running
    pub fn active_connections(&self) -> usize {
        self.shared.registry.len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Background tasks hold their own handle on the shared state, so a
        // dropped server would otherwise keep listening.
        let _ = self.shared.close();
    }
}

/// Close the server once `shutdown` completes. Exits early if the server is
/// closed some other way first.
async fn watch_shutdown<F>(shared: Arc<Shared>, shutdown: F)
where
    F: Future<Output = ()>,
{
    let mut closed = shared.closed_tx.subscribe();

    tokio::select! {
        _ = shutdown => {
            info!("Shutdown signal received");
            if let Err(e) = shared.close() {
                warn!(error = %e, "Error while closing server on shutdown");
            }
        }
        _ = closed.wait_for(|closed| *closed) => {}
    }
}

/// Accept connections until the server closes, spawning a handler for each.
async fn accept_loop(shared: Arc<Shared>, options: ServerOptions) {
    let mut closed = shared.closed_tx.subscribe();
    let connection_limit = options
        .max_connections
        .map(|limit| Arc::new(Semaphore::new(limit)));

    loop {
        // Wait for a connection slot
        let permit = match &connection_limit {
            Some(limit) => tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => break,
                permit = Arc::clone(limit).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            },
            None => None,
        };

        let (stream, peer) = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break,
            accepted = poll_fn(|cx| shared.poll_accept(cx)) => match accepted {
                None => break,
                Some(Ok(accepted)) => accepted,
                Some(Err(e)) => {
                    if shared.is_closed() {
                        break;
                    }
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        // A close may have raced with the accept.
        if shared.is_closed() {
            debug!(peer = %peer, "Dropping connection accepted during close");
            break;
        }

        let registration = shared.registry.register(peer);
        debug!(peer = %peer, conn_id = registration.id(), "New connection");

        let counter = shared.counter.clone();
        let closed_rx = shared.closed_tx.subscribe();
        let on_shutdown = options.on_shutdown;

        tokio::spawn(async move {
            match handle_connection(stream, counter, closed_rx, on_shutdown).await {
                Ok(served) => debug!(peer = %peer, served, "Connection closed"),
                Err(e) => warn!(peer = %peer, error = %e, "Connection error"),
            }
            drop(registration);
            drop(permit);
        });
    }

    debug!("Accept loop stopped");
}

/// Bind the first resolved address of `endpoint` that accepts a listener.
fn bind(endpoint: &Endpoint) -> io::Result<TcpListener> {
    let mut last_error = None;

    for addr in endpoint.resolve()? {
        match create_listener(addr, endpoint.network()) {
            Ok(listener) => return TcpListener::from_std(listener),
            Err(e) => {
                debug!(address = %addr, error = %e, "Bind attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to bind")
    }))
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, network: Network) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(network == Network::Tcp6)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Server construction and lifecycle errors
#[derive(Debug)]
pub enum ServerError {
    /// The address specification could not be parsed
    Addr(AddrError),
    /// The listener could not be bound
    Bind { endpoint: Endpoint, source: io::Error },
    /// `start` was called outside a Tokio runtime
    NoRuntime,
    /// `start` was called on a running server
    AlreadyRunning,
    /// The server has already been closed
    AlreadyClosed,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Addr(e) => write!(f, "invalid listen address: {}", e),
            ServerError::Bind { endpoint, source } => {
                write!(f, "failed to bind {}: {}", endpoint, source)
            }
            ServerError::NoRuntime => write!(f, "server must be started inside a Tokio runtime"),
            ServerError::AlreadyRunning => write!(f, "server is already running"),
            ServerError::AlreadyClosed => write!(f, "server is already closed"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Addr(e) => Some(e),
            ServerError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<AddrError> for ServerError {
    fn from(e: AddrError) -> Self {
        ServerError::Addr(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use std::time::Duration;

    fn local_server() -> Server {
        Server::from_url("tcp://127.0.0.1:0").unwrap()
    }

    #[test]
    fn test_unstarted_server_is_closed() {
        let server = local_server();
        assert!(server.is_closed());
        assert!(server.local_addr().is_none());
        assert_eq!(server.counter(), 0);
    }

    #[test]
    fn test_start_outside_runtime() {
        let server = local_server();
        assert!(matches!(
            server.start(pending()),
            Err(ServerError::NoRuntime)
        ));
        assert!(server.is_closed());
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            Server::from_url("localhost:8080"),
            Err(ServerError::Addr(AddrError::MissingScheme(_)))
        ));
    }

    #[tokio::test]
    async fn test_start_and_close() {
        let server = local_server();
        let addr = server.start(pending()).unwrap();

        assert!(!server.is_closed());
        assert_eq!(server.local_addr(), Some(addr));
        assert_ne!(addr.port(), 0);

        server.close().unwrap();
        assert!(server.is_closed());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = local_server();
        server.start(pending()).unwrap();
        assert!(matches!(
            server.start(pending()),
            Err(ServerError::AlreadyRunning)
        ));
        assert!(!server.is_closed());
        server.close().unwrap();
    }

    #[tokio::test]
    async fn test_closed_server_cannot_restart() {
        let server = local_server();
        server.start(pending()).unwrap();
        server.close().unwrap();
        assert!(matches!(
            server.start(pending()),
            Err(ServerError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_twice_is_benign() {
        let server = local_server();
        server.start(pending()).unwrap();

        server.close().unwrap();
        assert!(matches!(server.close(), Err(ServerError::AlreadyClosed)));
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_close_unstarted() {
        let server = local_server();
        server.close().unwrap();
        assert!(server.is_closed());
        assert!(matches!(
            server.start(pending()),
            Err(ServerError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let first = local_server();
        let addr = first.start(pending()).unwrap();

        let second = Server::from_url(&format!("tcp://{}", addr)).unwrap();
        match second.start(pending()) {
            Err(ServerError::Bind { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse)
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(second.is_closed());

        first.close().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_future_closes_server() {
        let server = local_server();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        server
            .start(async move {
                let _ = rx.await;
            })
            .unwrap();

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), server.closed())
            .await
            .expect("server did not close");
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_listener_released_after_close() {
        let server = local_server();
        let addr = server.start(pending()).unwrap();
        server.close().unwrap();

        // No yield point between close and connect: the port is already gone.
        assert!(std::net::TcpStream::connect(addr).is_err());
    }

    #[tokio::test]
    async fn test_rebind_immediately_after_close() {
        let first = local_server();
        let addr = first.start(pending()).unwrap();
        first.close().unwrap();

        let second = Server::from_url(&format!("tcp://{}", addr)).unwrap();
        assert_eq!(second.start(pending()).unwrap(), addr);
        assert!(!second.is_closed());
        second.close().unwrap();
    }

    #[tokio::test]
    async fn test_failed_bind_leaves_server_unstarted() {
        let first = local_server();
        let addr = first.start(pending()).unwrap();

        let second = Server::from_url(&format!("tcp://{}", addr)).unwrap();
        assert!(second.start(pending()).is_err());

        first.close().unwrap();
        assert!(second.local_addr().is_none());
        assert_eq!(second.start(pending()).unwrap(), addr);
        second.close().unwrap();
    }
}
