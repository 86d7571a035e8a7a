//! Typed fan-out of inbound frames to registered handlers
//!
//! Handlers are keyed by [`MessageKind`]; any number may be registered per
//! kind. Dispatch runs each handler in isolation: a panicking handler is
//! logged and skipped, and the remaining handlers still see the frame.

use super::protocol::{Envelope, MessageKind};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

pub type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;
pub type ConnectionHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Returned by registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Channel lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Closed {
        /// Close code from the peer, None when the connection just dropped
        code: Option<u16>,
        /// True when the close came from `disconnect()`
        intentional: bool,
    },
}

#[derive(Default)]
struct Handlers {
    next_id: u64,
    messages: HashMap<MessageKind, Vec<(HandlerId, MessageHandler)>>,
    connection: Vec<(HandlerId, ConnectionHandler)>,
}

impl Handlers {
    fn allocate(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}

#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<Handlers>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: MessageKind, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let mut handlers = self.lock();
        let id = handlers.allocate();
        handlers
            .messages
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn on_connection<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.lock();
        let id = handlers.allocate();
        handlers.connection.push((id, Arc::new(handler)));
        id
    }

    /// Unregister a handler; false if it was not registered
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        for list in handlers.messages.values_mut() {
            if let Some(pos) = list.iter().position(|(h, _)| *h == id) {
                list.remove(pos);
                return true;
            }
        }
        if let Some(pos) = handlers.connection.iter().position(|(h, _)| *h == id) {
            handlers.connection.remove(pos);
            return true;
        }
        false
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.lock().messages.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver a frame to every handler for its kind
    ///
    /// Returns how many handlers completed without panicking.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let targets: Vec<MessageHandler> = self
            .lock()
            .messages
            .get(&envelope.kind)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        targets
            .iter()
            .filter(|handler| isolate(envelope.kind.as_str(), || handler(envelope)))
            .count()
    }

    pub fn notify(&self, event: &ConnectionEvent) {
        let targets: Vec<ConnectionHandler> = self
            .lock()
            .connection
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in targets {
            isolate("connection", || handler(event));
        }
    }

    // Handlers run outside the lock, so a poisoned lock only means a
    // registration call panicked; the map itself is intact.
    fn lock(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run one handler, containing any panic
fn isolate<F: FnOnce()>(what: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            let reason = if let Some(msg) = panic.downcast_ref::<&'static str>() {
                (*msg).to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "unknown panic".to_string()
            };
            tracing::warn!("Handler for '{}' panicked: {}", what, reason);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protocol::parse_frame;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Envelope) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &Envelope| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fans_out_to_every_handler_of_kind() {
        let bus = EventBus::new();
        let (a, handler_a) = counter();
        let (b, handler_b) = counter();
        let (other, handler_other) = counter();
        bus.on(MessageKind::Transcript, handler_a);
        bus.on(MessageKind::Transcript, handler_b);
        bus.on(MessageKind::History, handler_other);

        let frame = parse_frame(r#"{"type":"transcript","text":"hi"}"#).unwrap();
        assert_eq!(bus.dispatch(&frame), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let (before, handler_before) = counter();
        let (after, handler_after) = counter();
        bus.on(MessageKind::Status, handler_before);
        bus.on(MessageKind::Status, |_| panic!("faulty subscriber"));
        bus.on(MessageKind::Status, handler_after);

        let frame = parse_frame(r#"{"type":"status","state":"idle"}"#).unwrap();
        assert_eq!(bus.dispatch(&frame), 2);
        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);

        // Still usable afterwards
        assert_eq!(bus.dispatch(&frame), 2);
        assert_eq!(after.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_off_removes_handler() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        let id = bus.on(MessageKind::Pong, handler);
        assert_eq!(bus.handler_count(MessageKind::Pong), 1);

        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.handler_count(MessageKind::Pong), 0);

        let frame = parse_frame(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(bus.dispatch(&frame), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connection_handlers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let id = bus.on_connection(move |event| s.lock().unwrap().push(event.clone()));
        bus.on_connection(|_| panic!("boom"));

        bus.notify(&ConnectionEvent::Open);
        bus.notify(&ConnectionEvent::Closed {
            code: Some(1000),
            intentional: true,
        });
        assert!(bus.off(id));
        bus.notify(&ConnectionEvent::Open);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ConnectionEvent::Open,
                ConnectionEvent::Closed {
                    code: Some(1000),
                    intentional: true
                }
            ]
        );
    }
}
