//! Event-name → handler registry with ordered, snapshot-based dispatch.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::conn::Conn;
use crate::message::Line;

/// Handlers run serially on the connection's owner task and may freely
/// mutate the [`Conn`] they are given.
pub(crate) type Handler = dyn Fn(&mut Conn, &Line) + Send + Sync;

/// Opaque token identifying one registration; pass to `remove_handler`.
/// Unique per registration, even for the same event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Inner {
    next_id: u64,
    handlers: HashMap<String, Vec<(HandlerId, Arc<Handler>)>>,
}

/// Shared handler table. Cloning is cheap; clones observe the same table.
#[derive(Clone, Default)]
pub(crate) struct CallbackRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl CallbackRegistry {
    pub fn new() -> CallbackRegistry {
        CallbackRegistry::default()
    }

    /// Append a handler for `name`, preserving registration order.
    pub fn add<F>(&self, name: &str, handler: F) -> HandlerId
    where
        F: Fn(&mut Conn, &Line) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = HandlerId(inner.next_id);
        inner.next_id += 1;
        inner
            .handlers
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a registration. Unknown ids are a no-op.
    pub fn remove(&self, id: HandlerId) {
        let mut inner = self.inner.lock();
        for list in inner.handlers.values_mut() {
            list.retain(|(have, _)| *have != id);
        }
    }

    /// The subscriber list for `name` at this instant. Dispatch iterates
    /// the snapshot, so handlers may add or remove registrations (including
    /// themselves) mid-dispatch without disturbing the iteration; additions
    /// become visible on the next dispatch.
    fn snapshot(&self, name: &str) -> Vec<Arc<Handler>> {
        self.inner
            .lock()
            .handlers
            .get(name)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Invoke every subscriber for `name` in registration order, on the
    /// calling task. Returns whether at least one subscriber existed.
    ///
    /// A panicking handler is logged and skipped; the remaining handlers
    /// for the event still run.
    pub fn dispatch(&self, name: &str, conn: &mut Conn, line: &Line) -> bool {
        let handlers = self.snapshot(name);
        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(conn, line))).is_err() {
                tracing::error!(event = name, "handler panicked; continuing dispatch");
            }
        }
        !handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::conn::test_conn;

    #[tokio::test]
    async fn dispatch_runs_in_registration_order() {
        let (mut conn, _rx) = test_conn();
        let reg = CallbackRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            reg.add("PRIVMSG", move |_conn, _line| order.lock().push(tag));
        }

        let line = Line::event("PRIVMSG", Default::default());
        assert!(reg.dispatch("PRIVMSG", &mut conn, &line));
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn dispatch_reports_missing_subscribers() {
        let (mut conn, _rx) = test_conn();
        let reg = CallbackRegistry::new();
        let line = Line::event("NOTICE", Default::default());
        assert!(!reg.dispatch("NOTICE", &mut conn, &line));
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_scoped() {
        let (mut conn, _rx) = test_conn();
        let reg = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let keep = reg.add("X", move |_c, _l| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = Arc::clone(&hits);
        let gone = reg.add("X", move |_c, _l| {
            h.fetch_add(100, Ordering::SeqCst);
        });
        assert_ne!(keep, gone);

        reg.remove(gone);
        reg.remove(gone); // unknown by now; no-op

        let line = Line::event("X", Default::default());
        reg.dispatch("X", &mut conn, &line);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_may_remove_itself_mid_dispatch() {
        let (mut conn, _rx) = test_conn();
        let reg = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let reg2 = reg.clone();
        let slot2 = Arc::clone(&slot);
        let h = Arc::clone(&hits);
        let id = reg.add("X", move |_c, _l| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = slot2.lock().take() {
                reg2.remove(id);
            }
        });
        *slot.lock() = Some(id);
        let h = Arc::clone(&hits);
        reg.add("X", move |_c, _l| {
            h.fetch_add(10, Ordering::SeqCst);
        });

        let line = Line::event("X", Default::default());
        // First dispatch: both run, first one unregisters itself.
        reg.dispatch("X", &mut conn, &line);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        // Second dispatch: only the survivor.
        reg.dispatch("X", &mut conn, &line);
        assert_eq!(hits.load(Ordering::SeqCst), 21);
    }

    #[tokio::test]
    async fn additions_during_dispatch_take_effect_next_time() {
        let (mut conn, _rx) = test_conn();
        let reg = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let reg2 = reg.clone();
        let h = Arc::clone(&hits);
        reg.add("X", move |_c, _l| {
            let h = Arc::clone(&h);
            reg2.add("X", move |_c, _l| {
                h.fetch_add(10, Ordering::SeqCst);
            });
        });

        let line = Line::event("X", Default::default());
        reg.dispatch("X", &mut conn, &line);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        reg.dispatch("X", &mut conn, &line);
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_abort_dispatch() {
        let (mut conn, _rx) = test_conn();
        let reg = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        reg.add("X", |_c, _l| panic!("boom"));
        let h = Arc::clone(&hits);
        reg.add("X", move |_c, _l| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let line = Line::event("X", Default::default());
        assert!(reg.dispatch("X", &mut conn, &line));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
