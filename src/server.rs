//! # Server
//!
//! Fleet-level state for the server side: the connection registry, the
//! connected/disconnected hooks, ID generation, broadcast, and the
//! server-wide waiter table that lets cross-connection asks (for example
//! stack-exchange-driven ones) correlate their replies.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::conn::{Conn, ConnOptions};
use crate::error::Error;
use crate::message::{gen_exchange_wait, Message};
use crate::namespaces::Namespaces;
use crate::socket::{Socket, WsSocket};

type ConnectedHook = Arc<dyn Fn(Arc<Conn>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;
type DisconnectedHook = Arc<dyn Fn(Arc<Conn>) + Send + Sync>;
type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Cross-instance pub/sub used to fan messages out across a cluster.
///
/// The server only holds the seam: connections subscribe per namespace on
/// connect and unsubscribe on disconnect, and `broadcast` offers outgoing
/// messages to `publish` first. Implementations deliver remote traffic back
/// through [`Conn::handle_payload`].
#[async_trait]
pub trait StackExchange: Send + Sync {
    /// Called once per accepted connection; an error rejects it.
    async fn on_connect(&self, conn: &Arc<Conn>) -> Result<(), Error>;

    /// Called when a connection goes away.
    async fn on_disconnect(&self, conn: &Arc<Conn>);

    /// Offers messages for cluster-wide delivery. Returning true means the
    /// exchange took ownership and local fan-out must be skipped.
    async fn publish(&self, msgs: &[Message]) -> bool;

    /// Registers a connection's interest in a namespace.
    async fn subscribe(&self, conn: &Arc<Conn>, namespace: &str);

    /// Drops a connection's interest in a namespace.
    async fn unsubscribe(&self, conn: &Arc<Conn>, namespace: &str);
}

/// The server side of the framework.
pub struct Server {
    namespaces: Namespaces,
    options: ConnOptions,
    connections: DashMap<String, Arc<Conn>>,
    /// Server-wide wait token → delivery slot; disjoint from the
    /// per-connection token spaces by prefix.
    waiting: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    wait_counter: AtomicU64,
    on_connected: Option<ConnectedHook>,
    on_disconnected: Option<DisconnectedHook>,
    id_generator: IdGenerator,
    stack_exchange: Option<Arc<dyn StackExchange>>,
}

impl Server {
    /// Creates a server declaring the given namespaces.
    pub fn new(namespaces: Namespaces) -> Self {
        Self {
            namespaces,
            options: ConnOptions::default(),
            connections: DashMap::new(),
            waiting: Mutex::new(HashMap::new()),
            wait_counter: AtomicU64::new(0),
            on_connected: None,
            on_disconnected: None,
            id_generator: Arc::new(|| uuid::Uuid::new_v4().to_string()),
            stack_exchange: None,
        }
    }

    /// Sets the per-connection read/write timeouts.
    pub fn with_options(mut self, options: ConnOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers the hook that runs when a connection is accepted. Its
    /// result resolves the connection's readiness: success completes the
    /// acknowledgement, an error rejects the connection and the error text
    /// becomes the client's dial error.
    pub fn on_connected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Conn>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.on_connected = Some(Arc::new(move |conn| Box::pin(hook(conn))));
        self
    }

    /// Registers the hook that runs after a connection closed and left the
    /// registry.
    pub fn on_disconnected<F>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Conn>) + Send + Sync + 'static,
    {
        self.on_disconnected = Some(Arc::new(hook));
        self
    }

    /// Replaces the connection ID generator (UUID v4 by default).
    pub fn with_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.id_generator = Arc::new(generator);
        self
    }

    /// Attaches a cross-instance stack exchange.
    pub fn with_stack_exchange(mut self, exchange: Arc<dyn StackExchange>) -> Self {
        self.stack_exchange = Some(exchange);
        self
    }

    pub(crate) fn stack_exchange(&self) -> Option<&Arc<dyn StackExchange>> {
        self.stack_exchange.as_ref()
    }

    /// Accepts WebSocket connections on the listener until it fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("wsmux server listening on {}", addr);
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                server.accept_socket(Arc::new(WsSocket::new(ws_stream))).await;
                            }
                            Err(e) => {
                                warn!("websocket handshake with {} failed: {}", peer_addr, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Adopts an established transport as a server-side connection: assigns
    /// an ID, registers it, spawns the reader and drives the connected-hook
    /// into the connection's readiness latch. Public so custom transports can
    /// plug in below the WebSocket layer.
    pub async fn accept_socket(self: &Arc<Self>, socket: Arc<dyn Socket>) -> Arc<Conn> {
        let id = (self.id_generator)();
        let conn = Conn::new(
            socket,
            self.namespaces.clone(),
            Some((Arc::downgrade(self), id.clone())),
            self.options.clone(),
        )
        .await;

        self.connections.insert(id.clone(), conn.clone());
        debug!("accepted connection {}", id);

        tokio::spawn(conn.clone().start_reader());

        if let Some(exchange) = &self.stack_exchange {
            if let Err(e) = exchange.on_connect(&conn).await {
                warn!("stack exchange rejected connection {}: {}", id, e);
                conn.resolve_readiness(Err(e));
                return conn;
            }
        }

        let server = self.clone();
        let accepted = conn.clone();
        tokio::spawn(async move {
            let result = match &server.on_connected {
                Some(hook) => hook(accepted.clone()).await,
                None => Ok(()),
            };

            match result {
                Ok(()) => accepted.resolve_readiness(Ok(())),
                Err(e) => {
                    debug!("connection {} rejected: {}", accepted.id(), e);
                    accepted.resolve_readiness(Err(e));
                    // Native-only connections have no acknowledgement to
                    // fail through; drop them directly.
                    if accepted.is_native_only() {
                        accepted.close().await;
                    }
                }
            }
        });

        conn
    }

    /// Returns a registered connection by ID.
    pub fn connection(&self, conn_id: &str) -> Option<Arc<Conn>> {
        self.connections.get(conn_id).map(|entry| entry.value().clone())
    }

    /// Number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sends a message to every registered connection. The `except`
    /// connection ID is excluded via the message's explicit-from field. When
    /// a stack exchange is attached it gets the first shot at delivery.
    pub async fn broadcast(&self, except: Option<&str>, mut msg: Message) {
        if let Some(exchange) = &self.stack_exchange {
            if exchange.publish(std::slice::from_ref(&msg)).await {
                return;
            }
        }

        msg.from_explicit = except.unwrap_or_default().to_string();

        let conns: Vec<Arc<Conn>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for conn in conns {
            conn.write(msg.clone()).await;
        }
    }

    /// Asks a specific registered connection and blocks for its reply. The
    /// wait token registers in the server-wide table, so the reply correlates
    /// no matter which delivery path carries it back.
    pub async fn ask(
        &self,
        conn_id: &str,
        mut msg: Message,
        deadline: Option<Instant>,
    ) -> Result<Message, Error> {
        let Some(conn) = self.connection(conn_id) else {
            return Err(Error::Write);
        };

        if let Some(deadline) = deadline {
            if deadline.elapsed() > Duration::from_secs(1) {
                return Err(Error::DeadlineExceeded);
            }
        }

        msg.wait = gen_exchange_wait(&self.wait_counter);
        let token = msg.wait.clone();

        let (slot, reply) = oneshot::channel();
        self.waiting.lock().insert(token.clone(), slot);

        if !conn.write(msg).await {
            self.waiting.lock().remove(&token);
            return Err(Error::Write);
        }

        let expired = async {
            match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            received = reply => match received {
                Ok(reply) => match reply.err.clone() {
                    Some(e) => Err(e),
                    None => Ok(reply),
                },
                Err(_) => Err(Error::Write),
            },
            _ = expired => {
                self.waiting.lock().remove(&token);
                Err(Error::DeadlineExceeded)
            }
        }
    }

    pub(crate) fn take_waiting(&self, wait: &str) -> Option<oneshot::Sender<Message>> {
        self.waiting.lock().remove(wait)
    }

    pub(crate) async fn handle_disconnect(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            info!("connection {} disconnected", conn_id);

            if let Some(exchange) = &self.stack_exchange {
                exchange.on_disconnect(&conn).await;
            }

            if let Some(hook) = &self.on_disconnected {
                hook(conn);
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("namespaces", &self.namespaces.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespaces::Events;

    #[test]
    fn test_default_id_generator_is_unique() {
        let server = Server::new(Namespaces::new());
        let a = (server.id_generator)();
        let b = (server.id_generator)();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_custom_id_generator() {
        let server = Server::new(Namespaces::new().namespace("chat", Events::new()))
            .with_id_generator(|| "fixed".to_string());
        assert_eq!((server.id_generator)(), "fixed");
    }

    #[tokio::test]
    async fn test_ask_unknown_connection_fails() {
        let server = Server::new(Namespaces::new());
        let result = server
            .ask("missing", Message::new("chat", "event", Vec::new()), None)
            .await;
        assert!(matches!(result, Err(Error::Write)));
    }
}
