//! # Connection State Machine
//!
//! One [`Conn`] per WebSocket connection, on either side. The connection
//! owns the acknowledgement handshake, the single reader task, payload
//! dispatch, reply correlation for [`Conn::ask`], the namespace
//! connect/disconnect protocol and the close cascade.
//!
//! Client and server run the same state machine; the roles only differ in
//! who initiates the acknowledgement, which side consults the server-wide
//! waiter table, and whether the disconnect handler may veto.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{debug, warn};

use crate::error::Error;
use crate::message::{
    deserialize_message, gen_wait, serialize_empty_reply, serialize_message, Message,
};
use crate::namespaces::{
    Namespaces, ON_NAMESPACE_CONNECT, ON_NAMESPACE_CONNECTED, ON_NAMESPACE_DISCONNECT,
    ON_NATIVE_MESSAGE, ON_ROOM_JOIN, ON_ROOM_LEAVE,
};
use crate::nsconn::NsConn;
use crate::process::ProcessGates;
use crate::readiness::ReadinessLatch;
use crate::server::Server;
use crate::socket::Socket;

// Acknowledgement frame tags; the first byte of every pre-ack frame.
const ACK_BINARY: u8 = b'M'; // client to server at startup
const ACK_ID_BINARY: u8 = b'A'; // server to client; remainder is the connection ID
const ACK_NOT_OK_BINARY: u8 = b'H'; // server to client; remainder is the rejection text
#[allow(dead_code)]
const ACK_OK_BINARY: u8 = b'K'; // reserved; no peer sends it anymore

/// Poll interval for the acknowledged flag and for `wait_connect`.
const SYNC_WAIT: Duration = Duration::from_millis(15);

/// Upper bound for the server-side acknowledgement wait inside `connect`.
/// Far above anything a healthy network needs, but slow links exist.
const MAX_SYNC_WAIT: Duration = Duration::from_secs(10);

/// Per-connection configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnOptions {
    /// Maximum wait for a single read; no timeout by default
    pub read_timeout: Option<Duration>,
    /// Maximum wait for a single write; no timeout by default
    pub write_timeout: Option<Duration>,
}

impl ConnOptions {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Sets the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }
}

/// A live framework connection over one socket.
pub struct Conn {
    /// Assigned by the server's ID generator; a client learns it during ack.
    id: parking_lot::RwLock<String>,
    socket: Arc<dyn Socket>,
    /// Present on server-side connections only.
    server: Option<Weak<Server>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    namespaces: Namespaces,
    acknowledged: AtomicBool,
    /// Namespace name → connected namespace. A name is present exactly when
    /// both peers completed the connect handshake from this side's view.
    connected: RwLock<HashMap<String, Arc<NsConn>>>,
    processes: ProcessGates,
    /// Wait token → one-shot delivery slot for a pending ask.
    waiting: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    wait_counter: AtomicU64,
    /// Frames received before the acknowledgement completed.
    queue: Mutex<Vec<Vec<u8>>>,
    readiness: ReadinessLatch,
    allow_native: bool,
    native_only: bool,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl Conn {
    pub(crate) async fn new(
        socket: Arc<dyn Socket>,
        namespaces: Namespaces,
        server: Option<(Weak<Server>, String)>,
        options: ConnOptions,
    ) -> Arc<Self> {
        let (server, id) = match server {
            Some((server, id)) => (Some(server), id),
            None => (None, String::new()),
        };

        let empty_ns = namespaces.get("");
        let allow_native = empty_ns.map(|events| events.has(ON_NATIVE_MESSAGE)).unwrap_or(false);
        // A single empty namespace whose only handler is the native one means
        // the peer is a plain WebSocket client: no ack, no connect protocol.
        let native_only = allow_native
            && namespaces.len() == 1
            && empty_ns.map(|events| events.len() == 1).unwrap_or(false);

        let (close_tx, _) = watch::channel(false);

        let conn = Arc::new(Self {
            id: parking_lot::RwLock::new(id),
            socket,
            server,
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
            namespaces,
            acknowledged: AtomicBool::new(false),
            connected: RwLock::new(HashMap::new()),
            processes: ProcessGates::new(),
            waiting: Mutex::new(HashMap::new()),
            wait_counter: AtomicU64::new(0),
            queue: Mutex::new(Vec::new()),
            readiness: ReadinessLatch::new(),
            allow_native,
            native_only,
            closed: AtomicBool::new(false),
            close_tx,
        });

        if conn.native_only {
            if let Some(events) = conn.namespaces.get("").cloned() {
                let ns = NsConn::new(conn.clone(), String::new(), events);
                conn.connected.write().await.insert(String::new(), ns);
            }
            conn.acknowledged.store(true, Ordering::SeqCst);
            conn.readiness.resolve(Ok(()));
        }

        conn
    }

    /// The unique identifier of this connection. Empty on a client that has
    /// not completed the acknowledgement yet.
    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    /// Reports whether `conn_id` identifies this connection.
    pub fn is(&self, conn_id: &str) -> bool {
        !conn_id.is_empty() && *self.id.read() == conn_id
    }

    /// Reports whether this is a client-side connection.
    pub fn is_client(&self) -> bool {
        self.server.is_none()
    }

    /// The owning server; `None` on client-side connections.
    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.as_ref().and_then(Weak::upgrade)
    }

    /// The underlying socket.
    pub fn socket(&self) -> &Arc<dyn Socket> {
        &self.socket
    }

    /// Reports whether this connection only carries native messages.
    pub fn is_native_only(&self) -> bool {
        self.native_only
    }

    /// Reports whether the acknowledgement handshake completed.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    /// Reports whether this connection was terminated, remotely or locally.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// A receiver that flips to true when the connection closes. Lets
    /// message-waiting subscribers observe the shutdown without polling.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    pub(crate) fn resolve_readiness(&self, result: Result<(), Error>) {
        self.readiness.resolve(result);
    }

    /// Client side of the acknowledgement: announce, then wait for the
    /// assigned ID or the server's rejection.
    pub(crate) async fn send_client_ack(self: &Arc<Self>) -> Result<(), Error> {
        if self.native_only {
            return Ok(());
        }

        if !self.write_raw(&[ACK_BINARY], false).await {
            self.close().await;
            return Err(Error::Write);
        }

        match self.readiness.wait().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    /// The single reader task. Exits on read error or close, and always
    /// tears the connection down on the way out.
    pub(crate) async fn start_reader(self: Arc<Self>) {
        if self.is_closed() {
            return;
        }

        loop {
            match self.socket.read_data(self.read_timeout).await {
                Err(e) => {
                    debug!("reader {}: {}", self.id(), e);
                    self.readiness.resolve(Err(e));
                    break;
                }
                Ok(payload) if payload.is_empty() => continue,
                Ok(payload) => {
                    if !self.is_acknowledged() {
                        if !self.handle_ack(&payload).await {
                            break;
                        }
                        continue;
                    }

                    if let Err(e) = self.handle_payload(&payload).await {
                        debug!("dispatch on {}: {}", self.id(), e);
                    }
                }
            }
        }

        self.close().await;
    }

    /// Handles one pre-ack frame. Returns false when the reader must stop.
    async fn handle_ack(self: &Arc<Self>, payload: &[u8]) -> bool {
        match payload[0] {
            ACK_BINARY => match self.readiness.wait().await {
                Err(e) => {
                    // The connected-hook rejected this connection; the text
                    // becomes the client's dial error.
                    let mut frame = vec![ACK_NOT_OK_BINARY];
                    frame.extend_from_slice(e.to_string().as_bytes());
                    self.write_raw(&frame, false).await;
                    false
                }
                Ok(()) => {
                    self.acknowledged.store(true, Ordering::SeqCst);
                    self.drain_queue().await;

                    let mut frame = vec![ACK_ID_BINARY];
                    frame.extend_from_slice(self.id().as_bytes());
                    self.write_raw(&frame, false).await
                }
            },
            ACK_ID_BINARY => {
                *self.id.write() = String::from_utf8_lossy(&payload[1..]).into_owned();
                self.acknowledged.store(true, Ordering::SeqCst);
                self.readiness.resolve(Ok(()));
                true
            }
            ACK_NOT_OK_BINARY => {
                let text = String::from_utf8_lossy(&payload[1..]).into_owned();
                self.readiness.resolve(Err(Error::from_text(text)));
                false
            }
            _ => {
                // Application frame ahead of the handshake; keep it until the
                // acknowledgement completes.
                self.queue.lock().push(payload.to_vec());
                true
            }
        }
    }

    /// Dispatches the queued pre-ack frames in arrival order.
    async fn drain_queue(self: &Arc<Self>) {
        let drained: Vec<Vec<u8>> = std::mem::take(&mut *self.queue.lock());
        for payload in drained {
            if let Err(e) = self.handle_payload(&payload).await {
                debug!("queued dispatch on {}: {}", self.id(), e);
            }
        }
    }

    /// Decodes a raw frame the way this connection's reader would.
    pub fn deserialize(&self, payload: &[u8]) -> Message {
        deserialize_message(payload, self.allow_native, self.native_only)
    }

    /// Decodes and dispatches a raw frame. Exposed so external deliverers
    /// (e.g. a stack exchange) can inject messages into the state machine.
    pub async fn handle_payload(self: &Arc<Self>, payload: &[u8]) -> Result<(), Error> {
        let msg = self.deserialize(payload);
        self.handle_message(msg).await
    }

    async fn handle_message(self: &Arc<Self>, msg: Message) -> Result<(), Error> {
        if msg.is_invalid {
            return Err(Error::InvalidPayload);
        }

        if msg.is_native && self.allow_native {
            let Some(ns) = self.namespace("").await else {
                return Err(Error::BadNamespace);
            };
            return ns.events().fire_event(&ns, msg).await;
        }

        let is_client = self.is_client();

        // Cross-connection asks register in the server-wide waiter table;
        // consult it before the per-connection one.
        if !is_client && !msg.wait.is_empty() {
            if let Some(server) = self.server() {
                if let Some(slot) = server.take_waiting(&msg.wait) {
                    let _ = slot.send(msg);
                    return Ok(());
                }
            }
        }

        if msg.is_wait(is_client) {
            let slot = self.waiting.lock().remove(&msg.wait);
            match slot {
                Some(slot) => {
                    let _ = slot.send(msg);
                }
                None => {
                    // The ask behind this token gave up already; a late reply
                    // addresses nobody.
                    debug!("dropping reply for abandoned ask {}", msg.wait);
                }
            }
            return Ok(());
        }

        match msg.event.as_str() {
            ON_NAMESPACE_CONNECT => self.reply_connect(msg).await,
            ON_NAMESPACE_DISCONNECT => self.reply_disconnect(msg).await,
            ON_ROOM_JOIN => {
                if let Some(ns) = self.try_namespace(msg.clone()).await {
                    ns.reply_room_join(msg).await;
                }
            }
            ON_ROOM_LEAVE => {
                if let Some(ns) = self.try_namespace(msg.clone()).await {
                    ns.reply_room_leave(msg).await;
                }
            }
            _ => {
                let Some(ns) = self.try_namespace(msg.clone()).await else {
                    return Err(Error::BadNamespace);
                };

                let mut msg = msg;
                msg.is_local = false;
                if let Err(e) = ns.events().fire_event(&ns, msg.clone()).await {
                    msg.err = Some(e.clone());
                    self.write(msg).await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Returns the already-connected namespace with the given name.
    pub async fn namespace(&self, namespace: &str) -> Option<Arc<NsConn>> {
        self.connected.read().await.get(namespace).cloned()
    }

    /// Resolves the namespace an inbound message addresses, first waiting out
    /// any connect handshake in flight for that name so an arriving event
    /// cannot overtake the local completion of its connect. Unknown
    /// namespaces are echoed back with an error.
    async fn try_namespace(self: &Arc<Self>, mut msg: Message) -> Option<Arc<NsConn>> {
        self.processes.wait(&msg.namespace).await;

        if let Some(ns) = self.namespace(&msg.namespace).await {
            return Some(ns);
        }

        debug!("message for unknown namespace {:?}", msg.namespace);
        msg.err = Some(Error::BadNamespace);
        self.write(msg).await;
        None
    }

    /// Connects this side to a namespace, running the connect handshake with
    /// the remote side. Both peers must have declared the namespace.
    ///
    /// On the server side the call first waits for the client's
    /// acknowledgement to land, polling up to a hard cap.
    pub async fn connect(
        self: &Arc<Self>,
        namespace: &str,
        deadline: Option<Instant>,
    ) -> Result<Arc<NsConn>, Error> {
        if !self.is_client() {
            // A server writer must never stall on its own acknowledgement.
            self.readiness.resolve(Ok(()));

            let mut waited = Duration::ZERO;
            while !self.is_acknowledged() {
                tokio::time::sleep(SYNC_WAIT).await;
                waited += SYNC_WAIT;

                if waited >= MAX_SYNC_WAIT / 2 && self.is_closed() {
                    return Err(Error::Write);
                }

                if waited >= MAX_SYNC_WAIT {
                    return Err(if self.is_closed() {
                        Error::Write
                    } else {
                        Error::DeadlineExceeded
                    });
                }
            }
        }

        self.ask_connect(namespace, deadline).await
    }

    /// Waits until the remote side force-connects this connection to the
    /// namespace. Use instead of [`Conn::connect`] on the side that expects
    /// the other peer to initiate. A deadline is strongly recommended.
    pub async fn wait_connect(
        &self,
        namespace: &str,
        deadline: Option<Instant>,
    ) -> Result<Arc<NsConn>, Error> {
        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::DeadlineExceeded);
                }
            }

            if self.is_closed() {
                return Err(Error::Write);
            }

            if self.is_acknowledged() {
                if let Some(ns) = self.namespace(namespace).await {
                    return Ok(ns);
                }
            }

            tokio::time::sleep(SYNC_WAIT).await;
        }
    }

    /// Initiator side of the connect handshake.
    async fn ask_connect(
        self: &Arc<Self>,
        namespace: &str,
        deadline: Option<Instant>,
    ) -> Result<Arc<NsConn>, Error> {
        // Holds inbound dispatch for this name until the handshake settles.
        let _gate = self.processes.start(namespace).await;

        if let Some(ns) = self.namespace(namespace).await {
            return Ok(ns);
        }

        let Some(events) = self.namespaces.get(namespace).cloned() else {
            return Err(Error::BadNamespace);
        };

        let mut connect_msg = Message::new(namespace, ON_NAMESPACE_CONNECT, Vec::new());
        connect_msg.is_local = true;

        let ns = NsConn::new(self.clone(), namespace.to_string(), events);
        ns.events().fire_event(&ns, connect_msg.clone()).await?;

        // Waits for the remote answer no matter whether the other side is
        // already connected; its reply is idempotent.
        self.ask(connect_msg.clone(), deadline).await?;

        self.connected
            .write()
            .await
            .insert(namespace.to_string(), ns.clone());

        self.notify_namespace_connected(&ns, connect_msg).await;
        Ok(ns)
    }

    /// Responder side of the connect handshake.
    async fn reply_connect(self: &Arc<Self>, mut msg: Message) {
        // Signalling without a wait token needs no answer.
        if msg.wait.is_empty() || msg.is_noop {
            return;
        }

        if self.namespace(&msg.namespace).await.is_some() {
            self.write_empty_reply(&msg.wait).await;
            return;
        }

        // Both peers connecting the same namespace at once: our own
        // ask_connect holds the gate and will install the entry exactly once,
        // so only acknowledge the remote initiator here.
        if self.processes.is_held(&msg.namespace) {
            self.write_empty_reply(&msg.wait).await;
            return;
        }

        let Some(events) = self.namespaces.get(&msg.namespace).cloned() else {
            msg.err = Some(Error::BadNamespace);
            self.write(msg).await;
            return;
        };

        let ns = NsConn::new(self.clone(), msg.namespace.clone(), events);
        if let Err(e) = ns.events().fire_event(&ns, msg.clone()).await {
            msg.err = Some(e);
            self.write(msg).await;
            return;
        }

        self.connected
            .write()
            .await
            .insert(msg.namespace.clone(), ns.clone());

        self.write_empty_reply(&msg.wait).await;

        self.notify_namespace_connected(&ns, msg).await;
    }

    async fn notify_namespace_connected(self: &Arc<Self>, ns: &Arc<NsConn>, mut connect_msg: Message) {
        connect_msg.event = ON_NAMESPACE_CONNECTED.to_string();
        // The namespace is connected regardless of what the handler thinks.
        let _ = ns.events().fire_event(ns, connect_msg).await;

        if let Some(server) = self.server() {
            if let Some(exchange) = server.stack_exchange() {
                exchange.subscribe(self, ns.namespace()).await;
            }
        }
    }

    async fn notify_namespace_disconnect(self: &Arc<Self>, ns: &Arc<NsConn>) {
        if let Some(server) = self.server() {
            if let Some(exchange) = server.stack_exchange() {
                exchange.unsubscribe(self, ns.namespace()).await;
            }
        }
    }

    /// Disconnects from every connected namespace, notifying the remote side
    /// for each. The local disconnect handlers fire with the local flag set.
    pub async fn disconnect_all(self: &Arc<Self>, deadline: Option<Instant>) -> Result<(), Error> {
        if self.native_only {
            return Ok(());
        }

        // The table lock is held for the whole loop; the disconnect messages
        // carry the locked flag so nested writes skip re-acquisition.
        let mut table = self.connected.write().await;
        let names: Vec<String> = table.keys().cloned().collect();

        for name in names {
            let Some(ns) = table.get(&name).cloned() else {
                continue;
            };

            let mut msg = Message::new(name.clone(), ON_NAMESPACE_DISCONNECT, Vec::new());
            msg.is_local = true;
            msg.locked = true;

            self.ask(msg.clone(), deadline).await?;

            ns.force_leave_all(true).await;
            table.remove(&name);

            let _ = ns.events().fire_event(&ns, msg).await;
            self.notify_namespace_disconnect(&ns).await;
        }

        Ok(())
    }

    /// Initiator side of the disconnect handshake for one namespace.
    pub(crate) async fn ask_disconnect(
        self: &Arc<Self>,
        msg: Message,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        let ns = {
            let table = self.connected.read().await;
            table.get(&msg.namespace).cloned()
        };
        let Some(ns) = ns else {
            return Err(Error::BadNamespace);
        };

        self.ask(msg.clone(), deadline).await?;

        // Rooms go first, forced, before the namespace disappears.
        ns.force_leave_all(true).await;

        self.connected.write().await.remove(&msg.namespace);

        let mut msg = msg;
        msg.is_local = true;
        let _ = ns.events().fire_event(&ns, msg).await;

        self.notify_namespace_disconnect(&ns).await;
        Ok(())
    }

    /// Responder side of the disconnect handshake. A client applies the
    /// server's disconnect unconditionally and only then fires the handler;
    /// the server-side handler may veto by returning an error.
    async fn reply_disconnect(self: &Arc<Self>, mut msg: Message) {
        if msg.wait.is_empty() || msg.is_noop {
            return;
        }

        let Some(ns) = self.namespace(&msg.namespace).await else {
            self.write_empty_reply(&msg.wait).await;
            return;
        };

        if self.is_client() {
            ns.force_leave_all(false).await;

            self.connected.write().await.remove(&msg.namespace);

            self.write_empty_reply(&msg.wait).await;

            let _ = ns.events().fire_event(&ns, msg).await;
            return;
        }

        if let Err(e) = ns.events().fire_event(&ns, msg.clone()).await {
            msg.err = Some(e);
            self.write(msg).await;
            return;
        }

        ns.force_leave_all(false).await;

        self.connected.write().await.remove(&msg.namespace);

        self.notify_namespace_disconnect(&ns).await;

        self.write_empty_reply(&msg.wait).await;
    }

    /// Sends a message and blocks until the reply bearing the same wait
    /// token arrives, the deadline expires or the connection closes.
    pub async fn ask(
        self: &Arc<Self>,
        mut msg: Message,
        deadline: Option<Instant>,
    ) -> Result<Message, Error> {
        if self.native_only || self.is_closed() {
            return Err(Error::Write);
        }

        // A deadline that expired over a second ago is a caller bug; fail it
        // without touching the wire.
        if let Some(deadline) = deadline {
            if deadline.elapsed() > Duration::from_secs(1) {
                return Err(Error::DeadlineExceeded);
            }
        }

        msg.wait = gen_wait(self.is_client(), &self.wait_counter);
        let token = msg.wait.clone();

        let (slot, reply) = oneshot::channel();
        self.waiting.lock().insert(token.clone(), slot);

        if !self.write(msg).await {
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
                // The close cascade dropped the slot.
                Err(_) => Err(Error::Write),
            },
            _ = expired => {
                self.waiting.lock().remove(&token);
                if self.is_closed() {
                    Err(Error::Write)
                } else {
                    Err(Error::DeadlineExceeded)
                }
            }
        }
    }

    /// Sends a message to the remote side. Reports whether the message was
    /// written; gating suppressions and write failures both report false.
    pub async fn write(self: &Arc<Self>, mut msg: Message) -> bool {
        if !self.can_write(&msg).await {
            return false;
        }

        msg.from_explicit.clear();
        let binary = msg.set_binary;
        let payload = serialize_message(&msg);
        self.write_raw(&payload, binary).await
    }

    /// Outbound gating for user messages.
    async fn can_write(&self, msg: &Message) -> bool {
        if self.is_closed() {
            return false;
        }

        if !self.is_client() {
            // A server writer must never stall on its own acknowledgement.
            self.readiness.resolve(Ok(()));
        }

        // A locked message declares its caller already holds the table locks
        // and validated the targets. An error echo addresses the namespace
        // that just failed validation, so it skips the checks too.
        if !msg.is_connect() && !msg.is_disconnect() && !msg.locked && msg.err.is_none() {
            let Some(ns) = self.namespace(&msg.namespace).await else {
                return false;
            };

            if !msg.room.is_empty() && !msg.is_room_join() && !msg.is_room_leave() {
                if ns.room(&msg.room).await.is_none() {
                    // Tried to send to a room this side has not joined.
                    return false;
                }
            }
        }

        if self.is(&msg.from_explicit) {
            return false;
        }

        true
    }

    pub(crate) async fn write_empty_reply(self: &Arc<Self>, wait: &str) -> bool {
        let payload = serialize_empty_reply(wait);
        self.write_raw(&payload, false).await
    }

    async fn write_raw(self: &Arc<Self>, payload: &[u8], binary: bool) -> bool {
        let result = if binary {
            self.socket.write_binary(payload, self.write_timeout).await
        } else {
            self.socket.write_text(payload, self.write_timeout).await
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                if e.is_close() {
                    self.close().await;
                } else {
                    warn!("write on {}: {}", self.id(), e);
                }
                false
            }
        }
    }

    /// Force-disconnects every namespace, force-leaves every room, abandons
    /// every pending ask and terminates the socket. Idempotent; only the
    /// first call runs the cascade.
    pub async fn close(self: &Arc<Self>) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        debug!("closing connection {}", self.id());

        if !self.native_only {
            let drained: Vec<Arc<NsConn>> = {
                let mut table = self.connected.write().await;
                table.drain().map(|(_, ns)| ns).collect()
            };

            for ns in drained {
                ns.force_leave_all(true).await;

                let mut msg =
                    Message::new(ns.namespace().to_string(), ON_NAMESPACE_DISCONNECT, Vec::new());
                msg.is_forced = true;
                msg.is_local = true;
                let _ = ns.events().fire_event(&ns, msg).await;
            }

            // Dropping the slots unblocks every pending ask with a write
            // error.
            self.waiting.lock().clear();
        }

        self.acknowledged.store(false, Ordering::SeqCst);

        // Server bookkeeping runs detached so close can never deadlock with
        // the accept path.
        if let Some(server) = self.server.clone() {
            let id = self.id();
            tokio::spawn(async move {
                if let Some(server) = server.upgrade() {
                    server.handle_disconnect(&id).await;
                }
            });
        }

        let _ = self.close_tx.send(true);
        self.socket.close().await;
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &*self.id.read())
            .field("client", &self.is_client())
            .field("acknowledged", &self.is_acknowledged())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_options_builder() {
        let options = ConnOptions::new()
            .with_read_timeout(Duration::from_secs(30))
            .with_write_timeout(Duration::from_secs(5));

        assert_eq!(options.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.write_timeout, Some(Duration::from_secs(5)));

        let defaults = ConnOptions::default();
        assert!(defaults.read_timeout.is_none());
        assert!(defaults.write_timeout.is_none());
    }
}
