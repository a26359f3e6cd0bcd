//! One-way cancellation flag with observer registry.
//!
//! A [`Cancellable`] starts pending and can be flipped to cancelled exactly
//! once. Cancellation is edge-triggered and monotonic: there is no reset, and
//! observers fire at most once. Observers run on the thread that calls
//! [`Cancellable::cancel`] and must not block it.
//!
//! # Example
//!
//! ```
//! use ebbtide_task::Cancellable;
//!
//! let cancellable = Cancellable::new();
//! let id = cancellable.connect(|| println!("cancelled!"));
//!
//! assert!(!cancellable.is_cancelled());
//! cancellable.cancel();
//! assert!(cancellable.is_cancelled());
//!
//! // Already fired; disconnecting afterwards is a no-op.
//! cancellable.disconnect(id);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Identifier for a connected cancellation handler.
    ///
    /// Returned by [`Cancellable::connect`]; pass to
    /// [`Cancellable::disconnect`] to remove the handler before it fires.
    pub struct HandlerId;
}

/// A boxed cancellation handler.
type Handler = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancellableState {
    cancelled: AtomicBool,
    handlers: Mutex<SlotMap<HandlerId, Handler>>,
}

/// A shareable, one-shot cancellation flag.
///
/// Clones share the same underlying flag. Operations that support
/// cancellation hold a `Cancellable` and either poll
/// [`is_cancelled`](Self::is_cancelled) or register a handler with
/// [`connect`](Self::connect) to be notified once.
#[derive(Clone, Default)]
pub struct Cancellable {
    inner: Arc<CancellableState>,
}

impl Cancellable {
    /// Create a new, pending cancellable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation.
    ///
    /// The first call flips the flag and runs every connected handler, on the
    /// calling thread, in connection order. Subsequent calls do nothing.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        // Drain under the lock, run outside it: a handler may connect or
        // disconnect on this same cancellable.
        let handlers: Vec<Handler> = {
            let mut map = self.inner.handlers.lock();
            map.drain().map(|(_, h)| h).collect()
        };
        for handler in handlers {
            handler();
        }
    }

    /// Register a handler to run when cancellation is requested.
    ///
    /// If the cancellable is already cancelled the handler runs immediately,
    /// on this thread, and the returned id is the null key (disconnecting it
    /// is a no-op). Handlers run exactly once.
    pub fn connect<F>(&self, handler: F) -> HandlerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut map = self.inner.handlers.lock();
        // Checked under the lock so a concurrent cancel() either sees this
        // handler in the map or we see the flag already set.
        if self.is_cancelled() {
            drop(map);
            handler();
            return HandlerId::default();
        }
        map.insert(Box::new(handler))
    }

    /// Remove a previously connected handler.
    ///
    /// Returns `true` if the handler was still registered (and is now
    /// guaranteed never to run), `false` if it already ran, was already
    /// disconnected, or `id` is the null key.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        self.inner.handlers.lock().remove(id).is_some()
    }

}

impl std::fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .field("handlers", &self.inner.handlers.lock().len())
            .finish()
    }
}
