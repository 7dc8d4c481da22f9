//! Inbound telemetry event bus
//!
//! Owned by the application and shared by `Arc` with the connection pool, which
//! publishes every inbound data message here as `(device_id, topic, payload)`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::error;

/// Receives inbound data messages with the thing-name prefix already stripped
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, device_id: &str, topic: &str, payload: &str);
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &str, &str) + Send + Sync,
{
    fn on_message(&self, device_id: &str, topic: &str, payload: &str) {
        self(device_id, topic, payload)
    }
}

/// Registration handle returned by [`MessageBus::add_handler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct MessageBus {
    handlers: RwLock<Vec<(HandlerId, Arc<dyn MessageHandler>)>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write_handlers().push((id, handler));
        id
    }

    /// Returns false if the handler was not registered
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.write_handlers();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn clear(&self) {
        self.write_handlers().clear();
    }

    pub fn handler_count(&self) -> usize {
        self.read_handlers().len()
    }

    /// Deliver to every handler; a panicking handler is logged and skipped
    pub fn dispatch(&self, device_id: &str, topic: &str, payload: &str) {
        let snapshot: Vec<Arc<dyn MessageHandler>> = self
            .read_handlers()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler.on_message(device_id, topic, payload)
            }));
            if outcome.is_err() {
                error!(device_id, topic, "Message handler panicked");
            }
        }
    }

    fn read_handlers(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, Vec<(HandlerId, Arc<dyn MessageHandler>)>> {
        self.handlers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_handlers(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, Vec<(HandlerId, Arc<dyn MessageHandler>)>> {
        self.handlers.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<dyn MessageHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |device: &str, topic: &str, payload: &str| {
            sink.lock().unwrap().push(format!("{device}|{topic}|{payload}"));
        };
        (seen, Arc::new(handler))
    }

    #[test]
    fn test_dispatch_reaches_all_handlers() {
        let bus = MessageBus::new();
        let (first, h1) = recorder();
        let (second, h2) = recorder();
        bus.add_handler(h1);
        bus.add_handler(h2);

        bus.dispatch("dev-1", "temp", "21");

        assert_eq!(*first.lock().unwrap(), vec!["dev-1|temp|21"]);
        assert_eq!(*second.lock().unwrap(), vec!["dev-1|temp|21"]);
    }

    #[test]
    fn test_remove_handler() {
        let bus = MessageBus::new();
        let (seen, handler) = recorder();
        let id = bus.add_handler(handler);

        assert!(bus.remove_handler(id));
        assert!(!bus.remove_handler(id));
        bus.dispatch("dev-1", "temp", "21");

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let bus = MessageBus::new();
        bus.add_handler(Arc::new(|_: &str, _: &str, _: &str| panic!("boom")));
        let (seen, handler) = recorder();
        bus.add_handler(handler);

        bus.dispatch("dev-1", "temp", "21");

        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
