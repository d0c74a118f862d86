//! # Client
//!
//! Dialing side of the framework: establish a WebSocket connection, run the
//! acknowledgement handshake and hand back a usable connection. A failed
//! server-side connected-hook surfaces here as the dial error.

use std::sync::Arc;
use std::time::Instant;

use tokio_tungstenite::connect_async;
use tracing::{debug, info};

use crate::conn::{Conn, ConnOptions};
use crate::error::Error;
use crate::namespaces::Namespaces;
use crate::nsconn::NsConn;
use crate::socket::{Socket, WsSocket};

/// A client-side framework connection.
pub struct Client {
    conn: Arc<Conn>,
}

impl Client {
    /// The underlying connection.
    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    /// Connects to a namespace. See [`Conn::connect`].
    pub async fn connect(
        &self,
        namespace: &str,
        deadline: Option<Instant>,
    ) -> Result<Arc<NsConn>, Error> {
        self.conn.connect(namespace, deadline).await
    }

    /// Waits for the server to force-connect a namespace. See
    /// [`Conn::wait_connect`].
    pub async fn wait_connect(
        &self,
        namespace: &str,
        deadline: Option<Instant>,
    ) -> Result<Arc<NsConn>, Error> {
        self.conn.wait_connect(namespace, deadline).await
    }

    /// Terminates the connection. See [`Conn::close`].
    pub async fn close(&self) {
        self.conn.close().await;
    }

    /// Runs the client side of the acknowledgement over an established
    /// transport. Public seam for transports other than the shipped
    /// WebSocket adapter (in-memory pipes, custom streams).
    pub async fn with_socket(
        socket: Arc<dyn Socket>,
        namespaces: Namespaces,
        options: ConnOptions,
    ) -> Result<Client, Error> {
        let conn = Conn::new(socket, namespaces, None, options).await;

        // The reader must be up before the announcement: it delivers the
        // server's answer into the readiness latch.
        tokio::spawn(conn.clone().start_reader());

        conn.send_client_ack().await?;
        debug!("client connection {} acknowledged", conn.id());

        Ok(Client { conn })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("conn", &self.conn).finish()
    }
}

/// Dials a wsmux server over WebSocket and completes the acknowledgement.
pub async fn dial(url: &str, namespaces: Namespaces, options: ConnOptions) -> Result<Client, Error> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| Error::Socket(format!("websocket connect failed: {}", e)))?;

    info!("websocket connected to {}", url);

    let socket = Arc::new(WsSocket::new(ws_stream));
    Client::with_socket(socket, namespaces, options).await
}
