//! # Message Envelope
//!
//! The framework message envelope and its wire codec.
//!
//! Framework messages travel as a JSON envelope; native messages (raw frames
//! for plain WebSocket clients) bypass the envelope in both directions. A
//! frame that fails to decode becomes a native message when the connection
//! allows native traffic, otherwise it is marked invalid and rejected by the
//! dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::namespaces::{
    ON_NAMESPACE_CONNECT, ON_NAMESPACE_DISCONNECT, ON_NATIVE_MESSAGE, ON_ROOM_JOIN, ON_ROOM_LEAVE,
};

/// Wait-token prefix for client-originated asks
pub(crate) const CLIENT_WAIT_PREFIX: &str = "c$";

/// Wait-token prefix for server-originated asks
pub(crate) const SERVER_WAIT_PREFIX: &str = "s$";

/// Wait-token prefix for server-wide (cross-connection) asks
pub(crate) const EXCHANGE_WAIT_PREFIX: &str = "x$";

/// A single framework message.
///
/// Messages flow both directions: inbound ones are produced by the
/// deserializer and dispatched to event handlers, outbound ones are built by
/// callers and serialized onto the wire. A handler that wants to answer an
/// `ask` writes the message it received back with a new body; the wait token
/// it carries correlates the reply on the remote side.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// The namespace this message addresses
    pub namespace: String,
    /// The room this message addresses, if any
    pub room: String,
    /// The event name; reserved events start with an underscore
    pub event: String,
    /// The payload
    pub body: Vec<u8>,
    /// Error carried by the message; stamped locally on handler failure,
    /// decoded from the wire on inbound replies
    pub err: Option<Error>,
    /// True when this message is a raw frame outside the envelope
    pub is_native: bool,
    /// True when the action was forced (close cascade, force-leave)
    pub is_forced: bool,
    /// True while the message is being handled on the side that produced it
    pub is_local: bool,
    /// Send as a binary WebSocket frame instead of text
    pub set_binary: bool,
    /// Excludes the connection with this ID from receiving the message
    pub from_explicit: String,
    /// Reply-correlation token; empty for fire-and-forget messages
    pub(crate) wait: String,
    /// Signalling-only message; responders must not act on it
    pub(crate) is_noop: bool,
    /// Set by the deserializer on malformed input
    pub(crate) is_invalid: bool,
    /// Declares the caller already holds the relevant table locks
    pub(crate) locked: bool,
}

impl Message {
    /// Creates an event message addressed to a namespace.
    pub fn new(namespace: impl Into<String>, event: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            namespace: namespace.into(),
            event: event.into(),
            body,
            ..Default::default()
        }
    }

    /// Creates a raw message outside the framework envelope, for peers that
    /// speak plain WebSocket.
    pub fn native(body: Vec<u8>) -> Self {
        Self {
            event: ON_NATIVE_MESSAGE.to_string(),
            body,
            is_native: true,
            ..Default::default()
        }
    }

    /// Returns the message body as lossy UTF-8 text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Reply-correlation token carried by this message, if any.
    pub fn wait_token(&self) -> &str {
        &self.wait
    }

    pub(crate) fn is_connect(&self) -> bool {
        self.event == ON_NAMESPACE_CONNECT
    }

    pub(crate) fn is_disconnect(&self) -> bool {
        self.event == ON_NAMESPACE_DISCONNECT
    }

    pub(crate) fn is_room_join(&self) -> bool {
        self.event == ON_ROOM_JOIN
    }

    pub(crate) fn is_room_leave(&self) -> bool {
        self.event == ON_ROOM_LEAVE
    }

    /// Reports whether the wait token was generated by this side, i.e. the
    /// message is a reply to one of our own asks.
    pub(crate) fn is_wait(&self, is_client: bool) -> bool {
        if self.wait.is_empty() {
            return false;
        }
        if is_client {
            self.wait.starts_with(CLIENT_WAIT_PREFIX)
        } else {
            self.wait.starts_with(SERVER_WAIT_PREFIX)
        }
    }
}

/// Mints a connection-unique wait token tagged with the originating side so
/// the two peers never collide.
pub(crate) fn gen_wait(is_client: bool, counter: &AtomicU64) -> String {
    let prefix = if is_client {
        CLIENT_WAIT_PREFIX
    } else {
        SERVER_WAIT_PREFIX
    };
    format!("{}{}", prefix, counter.fetch_add(1, Ordering::Relaxed))
}

/// Mints a server-wide wait token; a distinct prefix keeps the server-wide
/// waiter table disjoint from every per-connection token space.
pub(crate) fn gen_exchange_wait(counter: &AtomicU64) -> String {
    format!(
        "{}{}",
        EXCHANGE_WAIT_PREFIX,
        counter.fetch_add(1, Ordering::Relaxed)
    )
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// The JSON wire envelope. Empty fields are skipped so signalling frames such
/// as the empty reply stay small.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    room: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    event: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    wait: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    err: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    noop: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    body: Vec<u8>,
}

/// Serializes a message for the wire. Native messages pass through raw.
pub(crate) fn serialize_message(msg: &Message) -> Vec<u8> {
    if msg.is_native {
        return msg.body.clone();
    }

    let env = Envelope {
        namespace: msg.namespace.clone(),
        room: msg.room.clone(),
        event: msg.event.clone(),
        wait: msg.wait.clone(),
        err: msg.err.as_ref().map(|e| e.to_string()),
        noop: msg.is_noop,
        body: msg.body.clone(),
    };

    serde_json::to_vec(&env).unwrap_or_default()
}

/// The empty-reply fast path: a responder that only signals success writes a
/// frame carrying nothing but the wait token.
pub(crate) fn serialize_empty_reply(wait: &str) -> Vec<u8> {
    serialize_message(&Message {
        wait: wait.to_string(),
        ..Default::default()
    })
}

fn native_message(payload: &[u8]) -> Message {
    Message::native(payload.to_vec())
}

/// Decodes a wire frame into a message.
///
/// In native-only mode every frame is a native message. Otherwise a decode
/// failure falls through to a native message when native traffic is allowed,
/// or to an invalid message the dispatcher rejects.
pub(crate) fn deserialize_message(payload: &[u8], allow_native: bool, native_only: bool) -> Message {
    if native_only {
        return native_message(payload);
    }

    let env: Envelope = match serde_json::from_slice(payload) {
        Ok(env) => env,
        Err(_) if allow_native => return native_message(payload),
        Err(_) => {
            return Message {
                is_invalid: true,
                ..Default::default()
            }
        }
    };

    // An envelope with no event, namespace or wait token addresses nothing.
    if env.event.is_empty() && env.namespace.is_empty() && env.wait.is_empty() {
        return Message {
            is_invalid: true,
            ..Default::default()
        };
    }

    Message {
        namespace: env.namespace,
        room: env.room,
        event: env.event,
        wait: env.wait,
        err: env.err.map(Error::from_text),
        is_noop: env.noop,
        body: env.body,
        ..Default::default()
    }
}
