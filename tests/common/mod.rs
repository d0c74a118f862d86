//! Shared test helpers: an in-memory socket pair and connection builders.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use wsmux::{Client, Conn, ConnOptions, Error, Namespaces, Server, Socket};

/// One end of an in-memory full-duplex pipe. Frames keep their boundaries;
/// closing either end surfaces as a close error on both.
pub struct PipeSocket {
    peer_tx: mpsc::UnboundedSender<Option<Vec<u8>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Option<Vec<u8>>>>,
    closed: AtomicBool,
    close_notify: Notify,
}

/// Creates a connected in-memory socket pair.
pub fn pipe() -> (Arc<PipeSocket>, Arc<PipeSocket>) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();

    let a = Arc::new(PipeSocket {
        peer_tx: tx_b,
        rx: Mutex::new(rx_a),
        closed: AtomicBool::new(false),
        close_notify: Notify::new(),
    });
    let b = Arc::new(PipeSocket {
        peer_tx: tx_a,
        rx: Mutex::new(rx_b),
        closed: AtomicBool::new(false),
        close_notify: Notify::new(),
    });

    (a, b)
}

impl PipeSocket {
    fn send(&self, body: &[u8]) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("socket closed".to_string()));
        }
        self.peer_tx
            .send(Some(body.to_vec()))
            .map_err(|_| Error::Closed("peer closed".to_string()))
    }
}

#[async_trait]
impl Socket for PipeSocket {
    async fn read_data(&self, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("socket closed".to_string()));
        }

        let mut rx = self.rx.lock().await;
        let recv = async {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(Some(body)) => Ok(body),
                    Some(None) | None => Err(Error::Closed("peer closed".to_string())),
                },
                _ = self.close_notify.notified() => Err(Error::Closed("socket closed".to_string())),
            }
        };

        match timeout {
            Some(duration) => tokio::time::timeout(duration, recv)
                .await
                .map_err(|_| Error::Socket("read timeout".to_string()))?,
            None => recv.await,
        }
    }

    async fn write_binary(&self, body: &[u8], _timeout: Option<Duration>) -> Result<(), Error> {
        self.send(body)
    }

    async fn write_text(&self, body: &[u8], _timeout: Option<Duration>) -> Result<(), Error> {
        self.send(body)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.peer_tx.send(None);
            self.close_notify.notify_waiters();
        }
    }
}

/// Builds an acknowledged server/client pair over an in-memory pipe.
/// Returns the server, its side of the connection, and the client.
pub async fn connected_pair(
    server_namespaces: Namespaces,
    client_namespaces: Namespaces,
) -> (Arc<Server>, Arc<Conn>, Client) {
    let (server_end, client_end) = pipe();

    let server = Arc::new(Server::new(server_namespaces));
    let server_conn = server.accept_socket(server_end).await;

    let client = Client::with_socket(client_end, client_namespaces, ConnOptions::new())
        .await
        .expect("client acknowledgement failed");

    (server, server_conn, client)
}

/// Installs a tracing subscriber when RUST_LOG is set, so failing runs can
/// be traced. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A deadline a few moments from now.
pub fn deadline_in(ms: u64) -> Option<Instant> {
    Some(Instant::now() + Duration::from_millis(ms))
}

/// Polls a condition until it holds or the timeout expires.
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
