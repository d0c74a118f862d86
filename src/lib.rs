//! # wsmux
//!
//! Bidirectional WebSocket messaging with namespaces, rooms and
//! request/reply semantics over one full-duplex connection.
//!
//! ## Features
//!
//! - Namespaces: logical channels multiplexed on a single connection, each
//!   with its own event table
//! - Rooms: sub-topics scoped to a namespace
//! - Ask/reply: request/reply correlation layered on a fire-and-forget
//!   transport, with deadlines
//! - Symmetric roles: either peer may initiate namespace connects and
//!   disconnects, free of handshake races
//! - Native fall-through: plain WebSocket clients can talk to a server that
//!   registers a native-message handler, with no framework envelope
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wsmux::{dial, ConnOptions, Events, Namespaces, Server};
//!
//! # async fn run() -> Result<(), wsmux::Error> {
//! let namespaces = Namespaces::new().namespace(
//!     "chat",
//!     Events::new().on("message", |ns, msg| async move {
//!         ns.emit("message", msg.body.clone()).await;
//!         Ok(())
//!     }),
//! );
//!
//! // Server
//! let server = Arc::new(Server::new(namespaces.clone()));
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080")
//!     .await
//!     .map_err(|e| wsmux::Error::Socket(e.to_string()))?;
//! tokio::spawn(server.serve(listener));
//!
//! // Client
//! let client = dial("ws://127.0.0.1:8080", namespaces, ConnOptions::new()).await?;
//! let chat = client.connect("chat", None).await?;
//! chat.emit("message", b"hello".to_vec()).await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod conn;
pub mod error;
pub mod message;
pub mod namespaces;
pub mod nsconn;
pub mod server;
pub mod socket;

mod process;
mod readiness;

pub use client::{dial, Client};
pub use conn::{Conn, ConnOptions};
pub use error::{Error, Result};
pub use message::Message;
pub use namespaces::{
    Events, EventResult, Namespaces, ON_ANY_EVENT, ON_NAMESPACE_CONNECT, ON_NAMESPACE_CONNECTED,
    ON_NAMESPACE_DISCONNECT, ON_NATIVE_MESSAGE, ON_ROOM_JOIN, ON_ROOM_JOINED, ON_ROOM_LEAVE,
    ON_ROOM_LEFT,
};
pub use nsconn::{NsConn, Room};
pub use server::{Server, StackExchange};
pub use socket::{Socket, WsSocket};
