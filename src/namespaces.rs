//! # Namespaces and Event Tables
//!
//! Each side of a connection declares its namespaces up front; a namespace
//! maps event names to async handlers. Both peers must declare a namespace
//! for the connect handshake on it to succeed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Error;
use crate::message::Message;
use crate::nsconn::NsConn;

/// Fired on the responder and the initiator while a namespace connect is in
/// progress; returning an error rejects the connect.
pub const ON_NAMESPACE_CONNECT: &str = "_OnNamespaceConnect";

/// Fired on both sides once a namespace connect completed; errors are ignored.
pub const ON_NAMESPACE_CONNECTED: &str = "_OnNamespaceConnected";

/// Fired while a namespace disconnect is in progress; on the server side a
/// returned error vetoes the disconnect.
pub const ON_NAMESPACE_DISCONNECT: &str = "_OnNamespaceDisconnect";

/// Fired while a room join is in progress; returning an error rejects it.
pub const ON_ROOM_JOIN: &str = "_OnRoomJoin";

/// Fired once a room join completed; errors are ignored.
pub const ON_ROOM_JOINED: &str = "_OnRoomJoined";

/// Fired while a room leave is in progress; returning an error rejects it.
pub const ON_ROOM_LEAVE: &str = "_OnRoomLeave";

/// Fired once a room leave completed; errors are ignored.
pub const ON_ROOM_LEFT: &str = "_OnRoomLeft";

/// Fired for raw frames from plain WebSocket clients. Registering this
/// handler on the empty namespace enables native traffic; when it is the only
/// handler of the only namespace the connection runs in native-only mode and
/// skips the acknowledgement protocol entirely.
pub const ON_NATIVE_MESSAGE: &str = "_OnNativeMessage";

/// Fall-through handler invoked for events with no dedicated entry.
pub const ON_ANY_EVENT: &str = "_OnAnyEvent";

/// Result type of an event handler
pub type EventResult = Result<(), Error>;

type EventCallback = Arc<dyn Fn(Arc<NsConn>, Message) -> BoxFuture<'static, EventResult> + Send + Sync>;

/// Event table of a single namespace: event name → async handler.
#[derive(Clone, Default)]
pub struct Events {
    handlers: HashMap<String, EventCallback>,
}

impl Events {
    /// Creates an empty event table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for an event.
    pub fn on<F, Fut>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<NsConn>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EventResult> + Send + 'static,
    {
        self.handlers
            .insert(event.into(), Arc::new(move |ns, msg| Box::pin(handler(ns, msg))));
        self
    }

    /// Reports whether a handler is registered for the event.
    pub fn has(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Reports whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Invokes the handler registered for `msg.event`, falling through to the
    /// `_OnAnyEvent` handler when no dedicated entry exists. Events with no
    /// handler at all succeed silently.
    pub(crate) async fn fire_event(&self, ns: &Arc<NsConn>, msg: Message) -> EventResult {
        if let Some(handler) = self.handlers.get(&msg.event) {
            return handler(ns.clone(), msg).await;
        }

        if let Some(handler) = self.handlers.get(ON_ANY_EVENT) {
            return handler(ns.clone(), msg).await;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Events").field("events", &names).finish()
    }
}

/// The namespaces a peer declares: namespace name → event table.
#[derive(Clone, Default, Debug)]
pub struct Namespaces {
    tables: HashMap<String, Events>,
}

impl Namespaces {
    /// Creates an empty declaration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a namespace with its event table.
    pub fn namespace(mut self, name: impl Into<String>, events: Events) -> Self {
        self.tables.insert(name.into(), events);
        self
    }

    /// Returns the event table declared for a namespace.
    pub fn get(&self, name: &str) -> Option<&Events> {
        self.tables.get(name)
    }

    /// Number of declared namespaces.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Reports whether no namespace is declared.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_registration() {
        let events = Events::new()
            .on("chat", |_ns, _msg| async { Ok(()) })
            .on(ON_NAMESPACE_CONNECT, |_ns, _msg| async { Ok(()) });

        assert_eq!(events.len(), 2);
        assert!(events.has("chat"));
        assert!(events.has(ON_NAMESPACE_CONNECT));
        assert!(!events.has("missing"));
    }

    #[test]
    fn test_namespaces_lookup() {
        let namespaces = Namespaces::new()
            .namespace("chat", Events::new().on("message", |_ns, _msg| async { Ok(()) }))
            .namespace("", Events::new());

        assert_eq!(namespaces.len(), 2);
        assert!(namespaces.get("chat").is_some());
        assert!(namespaces.get("").is_some());
        assert!(namespaces.get("other").is_none());
    }
}
