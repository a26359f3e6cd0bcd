//! Cooperative event-loop contexts.
//!
//! A [`MainContext`] owns a set of attached [`Source`]s and dispatches the
//! ready ones, in priority order, each time [`MainContext::iteration`] runs.
//! Dispatch always happens on the thread that iterates the context; sources
//! may be attached from any thread, and attaching wakes a blocked iteration.
//!
//! Each thread can push a context as its *thread-default* via
//! [`MainContext::push_thread_default`]; async primitives constructed on that
//! thread capture it and dispatch their callbacks there. Threads without a
//! thread-default fall back to the process-wide [`MainContext::global`]
//! context.
//!
//! Sources attached while the context is dispatching an iteration are held
//! back until the next iteration. This is what lets async primitives promise
//! that a callback never runs before the code that scheduled it has returned
//! to the event loop, even when the result is produced immediately.
//!
//! # Example
//!
//! ```
//! use ebbtide_task::{MainContext, MainLoop};
//!
//! let context = MainContext::new();
//! let main_loop = MainLoop::new(&context);
//!
//! let loop_clone = main_loop.clone();
//! context.invoke(move || {
//!     println!("ran on the context");
//!     loop_clone.quit();
//! });
//!
//! main_loop.run();
//! ```

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use slotmap::SlotMap;

use crate::source::{Dispatch, Priority, Source, SourceId};

/// Process-wide fallback context for threads without a thread-default.
static GLOBAL_CONTEXT: OnceLock<MainContext> = OnceLock::new();

thread_local! {
    /// Stack of thread-default contexts for the current thread.
    static THREAD_DEFAULT: RefCell<Vec<MainContext>> = const { RefCell::new(Vec::new()) };
}

/// A source slot inside a context.
///
/// The `Source` is taken out of the slot while its callback runs, so a
/// callback can remove its own source without deadlocking.
struct AttachedSource {
    source: Option<Source>,
    seq: u64,
    /// First iteration this source may dispatch in. Zero for sources attached
    /// outside dispatch; `iteration + 1` for sources attached from inside a
    /// callback.
    not_before: u64,
    /// Last iteration this source dispatched in; a `Continue` source fires at
    /// most once per iteration.
    last_dispatched: u64,
}

struct ContextState {
    sources: SlotMap<SourceId, AttachedSource>,
    next_seq: u64,
    /// Monotonic iteration counter, incremented at the top of each iteration.
    iteration: u64,
    /// True while this iteration is running callbacks.
    dispatching: bool,
    /// Set by [`MainContext::wakeup`] to break a blocked iteration.
    woken: bool,
}

struct ContextInner {
    state: Mutex<ContextState>,
    wakeup: Condvar,
}

/// A per-thread cooperative scheduler for sources and idle callbacks.
///
/// Clones share the same context. See the [module docs](self) for the
/// dispatch and thread-default rules.
#[derive(Clone)]
pub struct MainContext {
    inner: Arc<ContextInner>,
}

impl MainContext {
    /// Create a new, empty context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                state: Mutex::new(ContextState {
                    sources: SlotMap::with_key(),
                    next_seq: 0,
                    iteration: 0,
                    dispatching: false,
                    woken: false,
                }),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// The process-wide fallback context.
    ///
    /// Used by primitives constructed on a thread with no thread-default
    /// context. Somebody has to iterate it for those callbacks to run,
    /// conventionally the program's main thread.
    pub fn global() -> Self {
        GLOBAL_CONTEXT.get_or_init(Self::new).clone()
    }

    /// The current thread's thread-default context, if one is pushed.
    pub fn thread_default() -> Option<Self> {
        THREAD_DEFAULT.with(|stack| stack.borrow().last().cloned())
    }

    /// The context a primitive constructed right now would capture: the
    /// thread-default if pushed, the global context otherwise.
    pub(crate) fn capture_current() -> Self {
        Self::thread_default().unwrap_or_else(Self::global)
    }

    /// Push this context as the calling thread's thread-default.
    ///
    /// The returned guard pops it again on drop. Guards nest; drop them in
    /// reverse push order.
    pub fn push_thread_default(&self) -> ThreadDefaultGuard {
        THREAD_DEFAULT.with(|stack| stack.borrow_mut().push(self.clone()));
        ThreadDefaultGuard {
            context: self.clone(),
            _not_send: PhantomData,
        }
    }

    /// Whether `other` is the same context as `self`.
    pub fn is_same(&self, other: &MainContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach a source; it becomes eligible for dispatch on the next
    /// iteration boundary. Wakes the context if it is blocked.
    pub fn attach(&self, source: Source) -> SourceId {
        let mut state = self.inner.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let not_before = if state.dispatching {
            state.iteration + 1
        } else {
            0
        };
        let id = state.sources.insert(AttachedSource {
            source: Some(source),
            seq,
            not_before,
            last_dispatched: 0,
        });
        self.inner.wakeup.notify_all();
        id
    }

    /// Detach a source.
    ///
    /// Returns `true` if the source was attached. Safe to call from within
    /// the source's own callback.
    pub fn remove(&self, id: SourceId) -> bool {
        self.inner.state.lock().sources.remove(id).is_some()
    }

    /// The name of an attached source, if it has one.
    ///
    /// Returns `None` for unknown ids, unnamed sources, and sources whose
    /// callback is currently running.
    pub fn source_name(&self, id: SourceId) -> Option<std::borrow::Cow<'static, str>> {
        let state = self.inner.state.lock();
        state
            .sources
            .get(id)
            .and_then(|slot| slot.source.as_ref())
            .and_then(|source| source.name.clone())
    }

    /// Attach a one-shot idle callback at [`Priority::DEFAULT`].
    pub fn invoke<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.invoke_with_priority(Priority::DEFAULT, f);
    }

    /// Attach a one-shot idle callback at an explicit priority.
    pub fn invoke_with_priority<F>(&self, priority: Priority, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut f = Some(f);
        let mut source = Source::idle(move || {
            if let Some(f) = f.take() {
                f();
            }
            Dispatch::Remove
        });
        source.set_priority(priority);
        self.attach(source);
    }

    /// Break a blocked [`iteration`](Self::iteration) without dispatching.
    pub fn wakeup(&self) {
        let mut state = self.inner.state.lock();
        state.woken = true;
        self.inner.wakeup.notify_all();
    }

    /// The value of the monotonic iteration counter.
    pub fn iteration_count(&self) -> u64 {
        self.inner.state.lock().iteration
    }

    /// Run one iteration: dispatch every ready source, in priority order
    /// (ties in attach order).
    ///
    /// With `may_block` set and nothing ready, blocks until a source becomes
    /// ready, one is attached, or [`wakeup`](Self::wakeup) is called.
    /// Returns whether any source was dispatched.
    pub fn iteration(&self, may_block: bool) -> bool {
        let mut state = self.inner.state.lock();
        state.iteration += 1;
        let iter = state.iteration;
        tracing::trace!(
            target: crate::logging::targets::CONTEXT,
            iteration = iter,
            sources = state.sources.len(),
            "context iteration"
        );

        let mut dispatched = self.dispatch_ready(&mut state, iter);
        if !dispatched && may_block {
            self.wait_for_work(&mut state, iter);
            dispatched = self.dispatch_ready(&mut state, iter);
        }
        dispatched
    }

    /// Dispatch all currently eligible sources for iteration `iter`.
    fn dispatch_ready(
        &self,
        state: &mut parking_lot::MutexGuard<'_, ContextState>,
        iter: u64,
    ) -> bool {
        let mut dispatched = false;
        loop {
            let now = Instant::now();
            let next = state
                .sources
                .iter()
                .filter_map(|(id, slot)| {
                    let source = slot.source.as_ref()?;
                    (slot.not_before <= iter
                        && slot.last_dispatched != iter
                        && source.is_ready(now))
                    .then_some((source.priority, slot.seq, id))
                })
                .min();
            let Some((_, _, id)) = next else { break };

            let slot = &mut state.sources[id];
            slot.last_dispatched = iter;
            let mut source = slot.source.take().expect("ready source present");

            state.dispatching = true;
            let disposition = {
                // Callbacks run unlocked so they can attach, remove, or
                // return results on this same context.
                parking_lot::MutexGuard::unlocked(state, || (source.callback)())
            };
            state.dispatching = false;

            match disposition {
                Dispatch::Remove => {
                    state.sources.remove(id);
                }
                Dispatch::Continue => {
                    if let crate::source::SourceKind::Timeout { due, interval } = &mut source.kind
                    {
                        *due = Instant::now() + *interval;
                    }
                    // The callback may have removed its own source; only put
                    // it back if the slot survived.
                    if let Some(slot) = state.sources.get_mut(id) {
                        slot.source = Some(source);
                    }
                }
            }
            dispatched = true;
        }
        dispatched
    }

    /// Block until a source is eligible for iteration `iter`, a new source is
    /// attached and ready, or the context is woken.
    fn wait_for_work(&self, state: &mut parking_lot::MutexGuard<'_, ContextState>, iter: u64) {
        loop {
            if state.woken {
                state.woken = false;
                return;
            }
            let now = Instant::now();
            let has_ready = state.sources.iter().any(|(_, slot)| {
                slot.source.as_ref().is_some_and(|s| {
                    slot.not_before <= iter && slot.last_dispatched != iter && s.is_ready(now)
                })
            });
            if has_ready {
                return;
            }
            let earliest = state
                .sources
                .iter()
                .filter_map(|(_, slot)| slot.source.as_ref().and_then(|s| s.due()))
                .min();
            match earliest {
                Some(due) => {
                    if self.inner.wakeup.wait_until(state, due).timed_out() {
                        return;
                    }
                }
                None => self.inner.wakeup.wait(state),
            }
        }
    }
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MainContext")
            .field("sources", &state.sources.len())
            .field("iteration", &state.iteration)
            .finish()
    }
}

/// RAII guard for a pushed thread-default context.
///
/// Pops the context from the calling thread's stack on drop.
pub struct ThreadDefaultGuard {
    context: MainContext,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for ThreadDefaultGuard {
    fn drop(&mut self) {
        THREAD_DEFAULT.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert!(
                popped.is_some_and(|c| c.is_same(&self.context)),
                "thread-default guards dropped out of push order"
            );
        });
    }
}

/// Runs a [`MainContext`] until told to quit.
///
/// Clones share the same quit flag, so a callback dispatched by the loop can
/// hold a clone and stop it.
#[derive(Clone)]
pub struct MainLoop {
    context: MainContext,
    running: Arc<AtomicBool>,
}

impl MainLoop {
    /// Create a loop driving `context`.
    pub fn new(context: &MainContext) -> Self {
        Self {
            context: context.clone(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The context this loop drives.
    pub fn context(&self) -> &MainContext {
        &self.context
    }

    /// Whether [`run`](Self::run) is currently executing.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Iterate the context until [`quit`](Self::quit) is called.
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            self.context.iteration(true);
        }
    }

    /// Stop the loop. Callable from any thread, including from a callback
    /// the loop itself is dispatching.
    pub fn quit(&self) {
        self.running.store(false, Ordering::Release);
        self.context.wakeup();
    }
}
