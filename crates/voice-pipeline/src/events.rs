//! Typed publish/subscribe used by every pipeline component.
//!
//! Handlers are keyed by a small `Copy` enum of event kinds. `emit` runs them in
//! registration order and awaits async ones. A handler that panics is logged and
//! skipped; the remaining handlers still run, so one bad listener cannot take the
//! pipeline down.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::error;

/// Identifies a registration so it can be removed with [`EventEmitter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type SyncHandler<P> = Arc<dyn Fn(&P) + Send + Sync>;
type AsyncHandler<P> = Arc<dyn Fn(P) -> BoxFuture<'static, ()> + Send + Sync>;

enum Handler<P> {
    Sync(SyncHandler<P>),
    Async(AsyncHandler<P>),
}

impl<P> Clone for Handler<P> {
    fn clone(&self) -> Self {
        match self {
            Handler::Sync(f) => Handler::Sync(Arc::clone(f)),
            Handler::Async(f) => Handler::Async(Arc::clone(f)),
        }
    }
}

type Registry<K, P> = HashMap<K, Vec<(HandlerId, Handler<P>)>>;

/// Handler lists keyed by event kind `K`, each receiving a payload `P`.
pub struct EventEmitter<K, P> {
    handlers: Mutex<Registry<K, P>>,
    next_id: AtomicU64,
}

impl<K, P> Default for EventEmitter<K, P>
where
    K: Copy + Eq + Hash + Debug + Send,
    P: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> EventEmitter<K, P>
where
    K: Copy + Eq + Hash + Debug + Send,
    P: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a synchronous handler.
    pub fn on<F>(&self, event: K, handler: F) -> HandlerId
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.register(event, Handler::Sync(Arc::new(handler)))
    }

    /// Register an async handler; `emit` awaits it before moving to the next one.
    pub fn on_async<F, Fut>(&self, event: K, handler: F) -> HandlerId
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: AsyncHandler<P> = Arc::new(move |payload| handler(payload).boxed());
        self.register(event, Handler::Async(wrapped))
    }

    /// Remove a handler. Returns false if it was not registered for `event`.
    pub fn off(&self, event: K, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        match handlers.get_mut(&event) {
            Some(list) => {
                let before = list.len();
                list.retain(|(hid, _)| *hid != id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Invoke every handler registered for `event`, in registration order.
    pub async fn emit(&self, event: K, payload: P) {
        // Snapshot so handlers may call on/off without deadlocking.
        let snapshot: Vec<Handler<P>> = match self.lock().get(&event) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };

        for handler in snapshot {
            match handler {
                Handler::Sync(f) => {
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| f(&payload)));
                    if outcome.is_err() {
                        error!(event = ?event, "Event handler panicked; continuing dispatch");
                    }
                }
                Handler::Async(f) => {
                    let fut = f(payload.clone());
                    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                        error!(event = ?event, "Async event handler panicked; continuing dispatch");
                    }
                }
            }
        }
    }

    /// Remove the handlers of one event kind, or of all kinds when `None`.
    pub fn clear_listeners(&self, event: Option<K>) {
        let mut handlers = self.lock();
        match event {
            Some(kind) => {
                handlers.remove(&kind);
            }
            None => handlers.clear(),
        }
    }

    pub fn listener_count(&self, event: K) -> usize {
        self.lock().get(&event).map_or(0, Vec::len)
    }

    fn register(&self, event: K, handler: Handler<P>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().entry(event).or_default().push((id, handler));
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<K, P>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
