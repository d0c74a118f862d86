//! # Namespace Connections and Rooms
//!
//! A [`NsConn`] is one connected namespace on one connection: it owns the
//! room table and the event table and is the value handlers receive. Rooms
//! are sub-topics inside a namespace; joining and leaving follow the same
//! ask/reply shape as the namespace connect handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::debug;

use crate::conn::Conn;
use crate::error::Error;
use crate::message::Message;
use crate::namespaces::{Events, ON_NAMESPACE_DISCONNECT, ON_ROOM_JOIN, ON_ROOM_JOINED, ON_ROOM_LEAVE, ON_ROOM_LEFT};

/// A connected namespace on a connection.
pub struct NsConn {
    conn: Arc<Conn>,
    namespace: String,
    events: Events,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl NsConn {
    pub(crate) fn new(conn: Arc<Conn>, namespace: String, events: Events) -> Arc<Self> {
        Arc::new(Self {
            conn,
            namespace,
            events,
            rooms: RwLock::new(HashMap::new()),
        })
    }

    /// The owning connection.
    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    /// The namespace name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn events(&self) -> &Events {
        &self.events
    }

    /// Sends a fire-and-forget event on this namespace. Reports whether the
    /// message was written.
    pub async fn emit(&self, event: impl Into<String>, body: Vec<u8>) -> bool {
        self.conn
            .write(Message::new(self.namespace.clone(), event, body))
            .await
    }

    /// Sends an event and blocks until the remote side replies, the deadline
    /// expires or the connection closes.
    pub async fn ask(
        &self,
        event: impl Into<String>,
        body: Vec<u8>,
        deadline: Option<Instant>,
    ) -> Result<Message, Error> {
        self.conn
            .ask(Message::new(self.namespace.clone(), event, body), deadline)
            .await
    }

    /// Returns the joined room with the given name, if any.
    pub async fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Names of all currently joined rooms.
    pub async fn rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Joins a room, running the join handshake with the remote side.
    /// Returns the existing room when already joined.
    pub async fn join_room(
        self: &Arc<Self>,
        room_name: &str,
        deadline: Option<Instant>,
    ) -> Result<Arc<Room>, Error> {
        if let Some(room) = self.room(room_name).await {
            return Ok(room);
        }

        let mut join = Message::new(self.namespace.clone(), ON_ROOM_JOIN, Vec::new());
        join.room = room_name.to_string();
        join.is_local = true;

        self.events.fire_event(self, join.clone()).await?;
        self.conn.ask(join.clone(), deadline).await?;

        let room = Arc::new(Room {
            ns: self.clone(),
            name: room_name.to_string(),
        });
        self.rooms
            .write()
            .await
            .insert(room_name.to_string(), room.clone());

        join.event = ON_ROOM_JOINED.to_string();
        let _ = self.events.fire_event(self, join).await;

        Ok(room)
    }

    /// Leaves a room, running the leave handshake with the remote side.
    pub async fn leave_room(
        self: &Arc<Self>,
        room_name: &str,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        let mut leave = Message::new(self.namespace.clone(), ON_ROOM_LEAVE, Vec::new());
        leave.room = room_name.to_string();
        leave.is_local = true;

        self.ask_room_leave(leave, deadline).await
    }

    pub(crate) async fn ask_room_leave(
        self: &Arc<Self>,
        msg: Message,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        if self.room(&msg.room).await.is_none() {
            return Err(Error::BadRoom);
        }

        self.conn.ask(msg.clone(), deadline).await?;
        self.events.fire_event(self, msg.clone()).await?;

        self.rooms.write().await.remove(&msg.room);

        let mut left = msg;
        left.event = ON_ROOM_LEFT.to_string();
        let _ = self.events.fire_event(self, left).await;

        Ok(())
    }

    /// Responder side of the room join handshake.
    pub(crate) async fn reply_room_join(self: &Arc<Self>, mut msg: Message) {
        if msg.wait.is_empty() || msg.is_noop {
            return;
        }

        if self.room(&msg.room).await.is_some() {
            self.conn.write_empty_reply(&msg.wait).await;
            return;
        }

        if let Err(e) = self.events.fire_event(self, msg.clone()).await {
            msg.err = Some(e);
            self.conn.write(msg).await;
            return;
        }

        let room = Arc::new(Room {
            ns: self.clone(),
            name: msg.room.clone(),
        });
        self.rooms.write().await.insert(msg.room.clone(), room);

        self.conn.write_empty_reply(&msg.wait).await;

        msg.event = ON_ROOM_JOINED.to_string();
        let _ = self.events.fire_event(self, msg).await;
    }

    /// Responder side of the room leave handshake.
    pub(crate) async fn reply_room_leave(self: &Arc<Self>, mut msg: Message) {
        if msg.wait.is_empty() || msg.is_noop {
            return;
        }

        if self.room(&msg.room).await.is_none() {
            self.conn.write_empty_reply(&msg.wait).await;
            return;
        }

        if let Err(e) = self.events.fire_event(self, msg.clone()).await {
            msg.err = Some(e);
            self.conn.write(msg).await;
            return;
        }

        self.rooms.write().await.remove(&msg.room);

        self.conn.write_empty_reply(&msg.wait).await;

        msg.event = ON_ROOM_LEFT.to_string();
        let _ = self.events.fire_event(self, msg).await;
    }

    /// Leaves every joined room without notifying the remote side. Used by
    /// the disconnect and close cascades; each room fires `_OnRoomLeave` and
    /// `_OnRoomLeft` with the forced flag set.
    pub(crate) async fn force_leave_all(self: &Arc<Self>, is_local: bool) {
        let drained: Vec<Arc<Room>> = {
            let mut rooms = self.rooms.write().await;
            rooms.drain().map(|(_, room)| room).collect()
        };

        for room in drained {
            debug!("force leaving room {}:{}", self.namespace, room.name);

            let mut leave = Message::new(self.namespace.clone(), ON_ROOM_LEAVE, Vec::new());
            leave.room = room.name.clone();
            leave.is_forced = true;
            leave.is_local = is_local;
            leave.locked = true;

            let _ = self.events.fire_event(self, leave.clone()).await;

            let mut left = leave;
            left.event = ON_ROOM_LEFT.to_string();
            let _ = self.events.fire_event(self, left).await;
        }
    }

    /// Disconnects this namespace, running the disconnect handshake with the
    /// remote side. All joined rooms are force-left first.
    pub async fn disconnect(&self, deadline: Option<Instant>) -> Result<(), Error> {
        let mut msg = Message::new(self.namespace.clone(), ON_NAMESPACE_DISCONNECT, Vec::new());
        msg.is_local = true;

        self.conn.ask_disconnect(msg, deadline).await
    }
}

impl std::fmt::Debug for NsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsConn")
            .field("namespace", &self.namespace)
            .field("conn", &self.conn.id())
            .finish()
    }
}

/// A joined room inside a namespace.
pub struct Room {
    ns: Arc<NsConn>,
    name: String,
}

impl Room {
    /// The room name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The namespace this room belongs to.
    pub fn ns(&self) -> &Arc<NsConn> {
        &self.ns
    }

    /// Sends a fire-and-forget event scoped to this room.
    pub async fn emit(&self, event: impl Into<String>, body: Vec<u8>) -> bool {
        let mut msg = Message::new(self.ns.namespace.clone(), event, body);
        msg.room = self.name.clone();
        self.ns.conn.write(msg).await
    }

    /// Leaves this room.
    pub async fn leave(&self, deadline: Option<Instant>) -> Result<(), Error> {
        self.ns.leave_room(&self.name, deadline).await
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("namespace", &self.ns.namespace)
            .finish()
    }
}
