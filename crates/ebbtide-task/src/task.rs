//! The deferred task primitive.
//!
//! A task bridges a producer of a single deferred result to a consumer
//! running on a specific [`MainContext`]. The producer constructs the task
//! (capturing the current thread-default context), optionally configures it,
//! and eventually calls exactly one of the `return_*` operations, from any
//! thread. The consumer's callback is then dispatched on the captured
//! context, where it extracts the result with one of the `propagate_*`
//! operations.
//!
//! The two roles are split at the type level over one shared record:
//!
//! - [`TaskProducer`]: configuration (`set_*`), the terminal `return_*`
//!   family, and worker-pool offload ([`run_in_thread`],
//!   [`run_in_thread_sync`]).
//! - [`TaskResult`]: handed to the callback; the `propagate_*` family, each
//!   consuming the handle so a result can only be extracted once.
//! - [`Task`]: a cheaply clonable handle with the shared getters and the
//!   completion observer, available from both roles via deref.
//!
//! # Guarantees
//!
//! - The callback runs exactly once, on the captured context, never before
//!   the producer has returned to the event loop, even when the result is
//!   set in the same loop iteration the task was created in.
//! - A second terminal call is a contract violation: it is reported as an
//!   `error!` diagnostic on the [`targets::TASK`] target and dropped.
//! - [`Task::completed`] becomes true only after the callback has returned;
//!   completion observers fire on the following loop iteration.
//! - The task keeps its source object alive, and the worker pool keeps the
//!   task alive, until both the worker function and the dispatched callback
//!   have finished.
//!
//! # Example
//!
//! ```
//! use ebbtide_task::{MainContext, MainLoop, Task};
//!
//! let context = MainContext::new();
//! let guard = context.push_thread_default();
//! let main_loop = MainLoop::new(&context);
//!
//! let loop_clone = main_loop.clone();
//! let producer = Task::new(
//!     None,
//!     None,
//!     Some(Box::new(move |result| {
//!         assert_eq!(result.propagate_int().unwrap(), 42);
//!         loop_clone.quit();
//!     })),
//! );
//!
//! producer.return_int(42);
//! main_loop.run();
//! drop(guard);
//! ```
//!
//! [`run_in_thread`]: TaskProducer::run_in_thread
//! [`run_in_thread_sync`]: TaskProducer::run_in_thread_sync
//! [`targets::TASK`]: crate::logging::targets::TASK

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use crate::cancellable::{Cancellable, HandlerId};
use crate::context::MainContext;
use crate::error::{Error, ErrorKind};
use crate::logging::targets;
use crate::source::{Dispatch, Priority, Source, SourceId};
use crate::threadpool;

new_key_type! {
    /// Identifier for a registered completion observer.
    pub struct CompletionId;
}

/// Opaque owning reference to the logical producer of a task.
///
/// Held for the task's whole lifetime, including across thread offload, and
/// handed back to the consumer via [`Task::source_object`].
pub type SourceObject = Arc<dyn Any + Send + Sync>;

/// The consumer callback, invoked at most once on the captured context.
pub type TaskCallback = Box<dyn FnOnce(TaskResult) + Send>;

/// Destroy hook for a pointer result or task payload.
///
/// Invoked with the stored value when it is discarded without transferring
/// ownership: a replaced payload, a never-propagated pointer result, or a
/// stored result overridden by cancellation.
pub type DestroyNotify = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;

/// An owned value plus its optional destroy hook.
///
/// Dropping the payload runs the hook; [`Payload::take`] transfers the value
/// out and disarms it.
struct Payload {
    value: Option<Box<dyn Any + Send>>,
    destroy: Option<DestroyNotify>,
}

impl Payload {
    fn new(value: Box<dyn Any + Send>, destroy: Option<DestroyNotify>) -> Self {
        Self {
            value: Some(value),
            destroy,
        }
    }

    fn take(&mut self) -> Option<Box<dyn Any + Send>> {
        self.destroy = None;
        self.value.take()
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let (Some(value), Some(destroy)) = (self.value.take(), self.destroy.take()) {
            destroy(value);
        }
    }
}

/// The terminal result slot.
enum ResultSlot {
    Pending,
    Int(i64),
    Bool(bool),
    Pointer(Payload),
    Boxed(Box<dyn Any + Send>),
    Error(Error),
    /// The result has been propagated; ownership left the task.
    Taken,
}

struct TaskState {
    name: Option<Cow<'static, str>>,
    priority: Priority,
    source_tag: Option<&'static str>,
    task_data: Option<Payload>,
    callback: Option<TaskCallback>,
    check_cancellable: bool,
    return_on_cancel: bool,
    thread_cancelled: bool,
    /// True from pool enqueue until the worker function returns.
    running_in_pool: bool,
    /// True for tasks executed through the synchronous pool entry point.
    synchronous: bool,
    ever_returned: bool,
    /// Set when a propagate operation handed out an error, so
    /// [`Task::had_error`] stays true afterwards.
    propagated_error: bool,
    result: ResultSlot,
    completion_observers: SlotMap<CompletionId, Box<dyn FnOnce() + Send>>,
    cancel_handler: Option<HandlerId>,
    /// Rendezvous for [`TaskProducer::run_in_thread_sync`], fired when the
    /// worker function returns.
    sync_complete: Option<crossbeam_channel::Sender<()>>,
}

pub(crate) struct TaskInner {
    context: MainContext,
    cancellable: Option<Cancellable>,
    source_object: Option<SourceObject>,
    state: Mutex<TaskState>,
    completed: AtomicBool,
}

impl TaskInner {
    /// Store a terminal result, honoring the single-completion discipline,
    /// and schedule dispatch unless the task is synchronous.
    fn complete_with(inner: &Arc<TaskInner>, slot: ResultSlot) {
        let mut state = inner.state.lock();
        if state.ever_returned {
            if state.thread_cancelled {
                // Cancellation won the race; the worker's late result is
                // dropped without diagnostic. Its destructors still run when
                // `slot` goes out of scope.
                return;
            }
            tracing::error!(
                target: targets::TASK,
                name = state.name.as_deref(),
                source_tag = state.source_tag,
                "task result returned twice; dropping the second result"
            );
            return;
        }
        state.ever_returned = true;
        state.result = slot;
        if state.synchronous {
            // run_in_thread_sync completes the task once the worker returns.
            return;
        }
        let priority = state.priority;
        let name = state.name.clone();
        drop(state);
        Self::schedule_dispatch(inner, priority, name);
    }

    /// Attach the completion idle source to the captured context.
    ///
    /// The source holds a strong reference on the task until dispatch has
    /// finished, and fires no earlier than the next context iteration.
    fn schedule_dispatch(inner: &Arc<TaskInner>, priority: Priority, name: Option<Cow<'static, str>>) {
        let mut pending = Some(inner.clone());
        let mut source = Source::idle(move || {
            let inner = pending.take().expect("completion source fires once");
            TaskInner::dispatch(inner);
            Dispatch::Remove
        });
        source.set_priority(priority);
        source.set_name(name.unwrap_or(Cow::Borrowed("task completion")));
        inner.context.attach(source);
    }

    /// Run the callback, flip `completed`, and queue observer notification
    /// for the next loop turn.
    fn dispatch(inner: Arc<TaskInner>) {
        let callback = inner.state.lock().callback.take();
        if let Some(callback) = callback {
            callback(TaskResult {
                task: Task {
                    inner: inner.clone(),
                },
            });
        }
        inner.completed.store(true, Ordering::Release);
        Self::notify_completion(&inner, false);
    }

    /// Deliver completion observers: inline for synchronous tasks, on the
    /// next context iteration otherwise.
    fn notify_completion(inner: &Arc<TaskInner>, inline: bool) {
        let (observers, priority) = {
            let mut state = inner.state.lock();
            let observers: Vec<_> = state
                .completion_observers
                .drain()
                .map(|(_, observer)| observer)
                .collect();
            (observers, state.priority)
        };
        if observers.is_empty() {
            return;
        }
        if inline {
            for observer in observers {
                observer();
            }
            return;
        }
        let mut pending = Some(observers);
        let mut source = Source::idle(move || {
            for observer in pending.take().unwrap_or_default() {
                observer();
            }
            Dispatch::Remove
        });
        source.set_priority(priority);
        source.set_name("task completion notify");
        inner.context.attach(source);
    }

    /// Cancellation observer, registered at construction.
    ///
    /// Serialized against terminal calls and `set_return_on_cancel` through
    /// the per-task mutex. Only acts while the task is in the pool with
    /// return-on-cancel enabled; otherwise cancellation is just a flag the
    /// task notices during propagation.
    fn cancelled_observer(inner: &Arc<TaskInner>) {
        {
            let state = inner.state.lock();
            if !state.running_in_pool {
                return;
            }
        }
        // A cancelled task jumps the pool queue so its result is delivered
        // promptly even under heavy load.
        threadpool::resort();
        Self::store_cancelled_result(inner);
    }

    /// The return-on-cancel terminal path: store a cancelled error through
    /// the single-terminal discipline and deliver it, by dispatch for
    /// ordinary tasks or by releasing the blocked caller for synchronous
    /// ones.
    ///
    /// No-op unless return-on-cancel is enabled and the task has not fired or
    /// returned yet. The worker function keeps running either way; its late
    /// `return_*` is dropped.
    fn store_cancelled_result(inner: &Arc<TaskInner>) {
        let mut state = inner.state.lock();
        if !state.return_on_cancel || state.thread_cancelled || state.ever_returned {
            return;
        }
        state.thread_cancelled = true;
        state.return_on_cancel = false;
        state.ever_returned = true;
        state.result = ResultSlot::Error(Error::cancelled());
        if state.synchronous {
            let sender = state.sync_complete.take();
            drop(state);
            if let Some(sender) = sender {
                let _ = sender.send(());
            }
            return;
        }
        let priority = state.priority;
        let name = state.name.clone();
        drop(state);
        Self::schedule_dispatch(inner, priority, name);
    }

    /// Pool bookkeeping after the worker function returns.
    pub(crate) fn worker_finished(inner: &Arc<TaskInner>) {
        let sender = {
            let mut state = inner.state.lock();
            state.running_in_pool = false;
            state.sync_complete.take()
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    pub(crate) fn cancellable_cancelled(&self) -> bool {
        self.cancellable.as_ref().is_some_and(Cancellable::is_cancelled)
    }

    /// Priority snapshot taken by the pool at enqueue time.
    pub(crate) fn pool_priority(&self) -> Priority {
        self.state.lock().priority
    }

    #[cfg(test)]
    pub(crate) fn for_pool_tests(producer: &TaskProducer) -> Arc<TaskInner> {
        producer.task.inner.clone()
    }
}

impl Drop for TaskInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let (Some(cancellable), Some(handler)) = (&self.cancellable, state.cancel_handler.take())
        {
            cancellable.disconnect(handler);
        }
        if !state.ever_returned {
            if state.callback.is_some() {
                tracing::error!(
                    target: targets::TASK,
                    name = state.name.as_deref(),
                    source_tag = state.source_tag,
                    has_source_object = self.source_object.is_some(),
                    "task dropped without ever returning a result, but a callback was set"
                );
            } else {
                tracing::debug!(
                    target: targets::TASK,
                    name = state.name.as_deref(),
                    source_tag = state.source_tag,
                    has_source_object = self.source_object.is_some(),
                    "task dropped without ever returning a result"
                );
            }
        }
        // Result and payload destructors run through their Drop impls.
    }
}

/// Shared handle to a task: getters and the completion observer.
///
/// Obtained by cloning from either role handle (both deref to `Task`). See
/// the [module docs](self) for the role split.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Create a task, capturing the calling thread's thread-default context
    /// (or the global context if none is pushed).
    ///
    /// `source_object` is kept alive for the task's lifetime. `cancellable`,
    /// if given, is bound for the task's lifetime; an observer is registered
    /// for the return-on-cancel machinery. The callback, if given, runs
    /// exactly once on the captured context after a terminal call.
    pub fn new(
        source_object: Option<SourceObject>,
        cancellable: Option<&Cancellable>,
        callback: Option<TaskCallback>,
    ) -> TaskProducer {
        let inner = Arc::new(TaskInner {
            context: MainContext::capture_current(),
            cancellable: cancellable.cloned(),
            source_object,
            state: Mutex::new(TaskState {
                name: None,
                priority: Priority::DEFAULT,
                source_tag: None,
                task_data: None,
                callback,
                check_cancellable: true,
                return_on_cancel: false,
                thread_cancelled: false,
                running_in_pool: false,
                synchronous: false,
                ever_returned: false,
                propagated_error: false,
                result: ResultSlot::Pending,
                completion_observers: SlotMap::with_key(),
                cancel_handler: None,
                sync_complete: None,
            }),
            completed: AtomicBool::new(false),
        });

        if let Some(cancellable) = &inner.cancellable {
            let weak = Arc::downgrade(&inner);
            let handler = cancellable.connect(move || {
                if let Some(inner) = weak.upgrade() {
                    TaskInner::cancelled_observer(&inner);
                }
            });
            inner.state.lock().cancel_handler = Some(handler);
        }

        TaskProducer {
            task: Task { inner },
        }
    }

    /// Create a task that has already failed and dispatch it.
    ///
    /// Convenience for producers that hit an error before they have anything
    /// asynchronous to do: the callback still runs through normal deferred
    /// dispatch, preserving the never-reentrant contract.
    pub fn report_error(
        source_object: Option<SourceObject>,
        callback: Option<TaskCallback>,
        source_tag: Option<&'static str>,
        error: Error,
    ) {
        let producer = Task::new(source_object, None, callback);
        if let Some(tag) = source_tag {
            producer.set_source_tag(tag);
        }
        producer.return_error(error);
    }

    /// The context captured at construction, where the callback runs.
    pub fn context(&self) -> &MainContext {
        &self.inner.context
    }

    /// The bound cancellable, if any.
    pub fn cancellable(&self) -> Option<&Cancellable> {
        self.inner.cancellable.as_ref()
    }

    /// The source object, if any. The task holds its own reference until
    /// finalization.
    pub fn source_object(&self) -> Option<SourceObject> {
        self.inner.source_object.clone()
    }

    /// The debug name, if one was set.
    pub fn name(&self) -> Option<Cow<'static, str>> {
        self.inner.state.lock().name.clone()
    }

    /// The dispatch priority.
    pub fn priority(&self) -> Priority {
        self.inner.state.lock().priority
    }

    /// The source tag, if one was set.
    pub fn source_tag(&self) -> Option<&'static str> {
        self.inner.state.lock().source_tag
    }

    /// Whether this task carries the given source tag.
    pub fn is_tagged(&self, tag: &'static str) -> bool {
        self.source_tag() == Some(tag)
    }

    /// Whether propagation checks the cancellable first (default true).
    pub fn check_cancellable(&self) -> bool {
        self.inner.state.lock().check_cancellable
    }

    /// Whether return-on-cancel is currently enabled.
    pub fn return_on_cancel(&self) -> bool {
        self.inner.state.lock().return_on_cancel
    }

    /// Whether return-on-cancel fired while the worker function was running.
    pub fn thread_cancelled(&self) -> bool {
        self.inner.state.lock().thread_cancelled
    }

    /// Whether the task has completed: the terminal result is stored and the
    /// callback, if any, has returned. Observers running inside the callback
    /// itself still see `false`.
    pub fn completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Whether propagation would (or did) yield an error: an error result is
    /// stored, an error was already propagated, or the cancellable is
    /// cancelled while `check_cancellable` is set.
    pub fn had_error(&self) -> bool {
        let state = self.inner.state.lock();
        if matches!(state.result, ResultSlot::Error(_)) || state.propagated_error {
            return true;
        }
        state.check_cancellable && self.inner.cancellable_cancelled()
    }

    /// Typed access to the task payload set with
    /// [`TaskProducer::set_task_data`].
    ///
    /// Returns `None` if no payload is set or it has a different type. The
    /// closure runs under the task's lock and must not call back into this
    /// task.
    pub fn with_task_data<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut state = self.inner.state.lock();
        let value = state.task_data.as_mut()?.value.as_mut()?;
        value.downcast_mut::<T>().map(f)
    }

    /// Register an observer for the completion transition.
    ///
    /// Observers fire once, on the context iteration after the one that ran
    /// the callback (inline after the wait for synchronous pool tasks).
    /// Observers registered after the task completed are never invoked.
    pub fn connect_completed<F>(&self, observer: F) -> CompletionId
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .state
            .lock()
            .completion_observers
            .insert(Box::new(observer))
    }

    /// Remove a completion observer that has not fired yet.
    pub fn disconnect_completed(&self, id: CompletionId) -> bool {
        self.inner.state.lock().completion_observers.remove(id).is_some()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Task")
            .field("name", &state.name)
            .field("priority", &state.priority)
            .field("ever_returned", &state.ever_returned)
            .field("completed", &self.inner.completed.load(Ordering::Relaxed))
            .finish()
    }
}

/// The producer role: configuration, terminal operations, pool offload.
///
/// Derefs to [`Task`] for the shared getters. Not clonable; the producer
/// role moves into the worker function on offload.
pub struct TaskProducer {
    task: Task,
}

impl Deref for TaskProducer {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl TaskProducer {
    /// A shared handle to this task, for observing completion or reading
    /// getters after the producer role has moved on.
    pub fn handle(&self) -> Task {
        self.task.clone()
    }

    /// Set the task payload, replacing any previous one.
    ///
    /// The previous payload's destroy hook runs synchronously before the new
    /// value is stored. The hook also runs at finalization if the payload is
    /// never replaced again.
    pub fn set_task_data<T: Any + Send>(&self, value: T, destroy: Option<DestroyNotify>) {
        let previous = self.task.inner.state.lock().task_data.take();
        drop(previous);
        self.task.inner.state.lock().task_data =
            Some(Payload::new(Box::new(value), destroy));
    }

    /// Set the dispatch priority used for the completion source (and the
    /// pool queue, when offloaded).
    pub fn set_priority(&self, priority: Priority) {
        self.task.inner.state.lock().priority = priority;
    }

    /// Set an owned debug name.
    pub fn set_name(&self, name: impl Into<String>) {
        self.task.inner.state.lock().name = Some(Cow::Owned(name.into()));
    }

    /// Set a borrowed debug name with static lifetime, avoiding the copy.
    pub fn set_static_name(&self, name: &'static str) {
        self.task.inner.state.lock().name = Some(Cow::Borrowed(name));
    }

    /// Tag the task so consumers can match the result to the API that
    /// produced it (see [`Task::is_tagged`]).
    pub fn set_source_tag(&self, tag: &'static str) {
        self.task.inner.state.lock().source_tag = Some(tag);
    }

    /// Control whether propagation reports cancellation even when a result
    /// was stored (default true). Does not invalidate a stored result.
    pub fn set_check_cancellable(&self, check: bool) {
        self.task.inner.state.lock().check_cancellable = check;
    }

    /// Enable or disable return-on-cancel.
    ///
    /// Safe to call from the worker thread while the worker function runs;
    /// the transition is serialized against the cancellation observer.
    /// Returns whether the transition took effect: `false` when
    /// return-on-cancel already fired, or when enabling while the bound
    /// cancellable is already cancelled and the task is in the pool. In
    /// both cases the state established by the cancellation observer stands.
    pub fn set_return_on_cancel(&self, enabled: bool) -> bool {
        let inner = &self.task.inner;
        let mut state = inner.state.lock();
        if state.thread_cancelled {
            return false;
        }
        if enabled
            && !state.return_on_cancel
            && state.running_in_pool
            && inner.cancellable_cancelled()
        {
            return false;
        }
        state.return_on_cancel = enabled;
        true
    }

    /// Bind an event-loop source to this task: the source gets the task's
    /// priority, adopts the task's name if it has none of its own, and is
    /// attached to the task's captured context.
    ///
    /// Producers use this to run their own work inside the task's context.
    pub fn attach_source(&self, mut source: Source) -> SourceId {
        let (priority, name) = {
            let state = self.task.inner.state.lock();
            (state.priority, state.name.clone())
        };
        source.set_priority(priority);
        if source.name().is_none() {
            if let Some(name) = name {
                source.set_name(name);
            }
        }
        self.task.inner.context.attach(source)
    }

    /// Store an integer result and schedule dispatch.
    pub fn return_int(&self, result: i64) {
        TaskInner::complete_with(&self.task.inner, ResultSlot::Int(result));
    }

    /// Store a boolean result and schedule dispatch.
    pub fn return_boolean(&self, result: bool) {
        TaskInner::complete_with(&self.task.inner, ResultSlot::Bool(result));
    }

    /// Store a pointer-style result with a destroy hook and schedule
    /// dispatch.
    ///
    /// If the result is never propagated, `destroy` runs exactly once at
    /// finalization (or when cancellation overrides the result). If it is
    /// propagated, ownership transfers to the caller and `destroy` never
    /// runs.
    pub fn return_pointer(&self, value: Box<dyn Any + Send>, destroy: Option<DestroyNotify>) {
        TaskInner::complete_with(
            &self.task.inner,
            ResultSlot::Pointer(Payload::new(value, destroy)),
        );
    }

    /// Store a boxed value result and schedule dispatch. The value is
    /// dropped at finalization if never propagated.
    pub fn return_value(&self, value: Box<dyn Any + Send>) {
        TaskInner::complete_with(&self.task.inner, ResultSlot::Boxed(value));
    }

    /// Store an error result and schedule dispatch.
    pub fn return_error(&self, error: Error) {
        TaskInner::complete_with(&self.task.inner, ResultSlot::Error(error));
    }

    /// Store `inner` with `prefix` prepended to its message, preserving its
    /// kind, and schedule dispatch.
    pub fn return_prefixed_error(&self, inner: Error, prefix: impl fmt::Display) {
        self.return_error(inner.prefixed(prefix));
    }

    /// If the bound cancellable is cancelled, store a cancelled error,
    /// schedule dispatch, and return `true`. Otherwise do nothing.
    pub fn return_error_if_cancelled(&self) -> bool {
        if !self.task.inner.cancellable_cancelled() {
            return false;
        }
        TaskInner::complete_with(
            &self.task.inner,
            ResultSlot::Error(Error::cancelled()),
        );
        true
    }

    /// Run `worker` on the worker pool; completion flows through normal
    /// dispatch on the captured context. Never blocks.
    ///
    /// The worker receives the producer role and normally ends with a
    /// `return_*` call. If the cancellable is already cancelled and
    /// return-on-cancel is enabled, the cancelled result is dispatched
    /// immediately; the worker still runs, and its late return is dropped.
    pub fn run_in_thread<F>(self, worker: F)
    where
        F: FnOnce(TaskProducer) + Send + 'static,
    {
        let inner = self.task.inner.clone();
        inner.state.lock().running_in_pool = true;
        Self::return_early_if_cancelled(&inner);
        threadpool::push(inner, Box::new(move || worker(self)));
    }

    /// Run `worker` on the worker pool and block until it returns; the
    /// callback is not dispatched, but the task still completes (observers
    /// fire inline). Returns the consumer handle for propagation.
    ///
    /// Safe to call from inside another pool worker: the pool spawns a
    /// transient worker while this one is blocked, so chains of nested
    /// synchronous tasks cannot starve it.
    pub fn run_in_thread_sync<F>(self, worker: F) -> TaskResult
    where
        F: FnOnce(TaskProducer) + Send + 'static,
    {
        let inner = self.task.inner.clone();
        let (sender, receiver) = crossbeam_channel::bounded(1);
        {
            let mut state = inner.state.lock();
            state.synchronous = true;
            state.running_in_pool = true;
            state.sync_complete = Some(sender);
        }
        Self::return_early_if_cancelled(&inner);
        threadpool::push(inner.clone(), Box::new(move || worker(self)));
        threadpool::block_in_place(|| {
            let _ = receiver.recv();
        });

        inner.completed.store(true, Ordering::Release);
        TaskInner::notify_completion(&inner, true);
        TaskResult {
            task: Task { inner },
        }
    }

    /// Pre-start cancellation: a task entering the pool with return-on-cancel
    /// enabled and an already-cancelled token returns immediately; the worker
    /// function still runs.
    fn return_early_if_cancelled(inner: &Arc<TaskInner>) {
        if inner.cancellable_cancelled() {
            TaskInner::store_cancelled_result(inner);
        }
    }
}

impl fmt::Debug for TaskProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskProducer").field(&self.task).finish()
    }
}

/// The consumer role: extracts the terminal result.
///
/// Handed to the callback on dispatch, or returned by
/// [`TaskProducer::run_in_thread_sync`]. Each `propagate_*` operation
/// consumes the handle, so a result can be extracted at most once. Derefs to
/// [`Task`] for the shared getters.
pub struct TaskResult {
    task: Task,
}

impl Deref for TaskResult {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl TaskResult {
    /// Take the stored result slot, applying the cancellation override.
    fn take_result(&self) -> Result<ResultSlot, Error> {
        let inner = &self.task.inner;
        let mut state = inner.state.lock();
        let slot = std::mem::replace(&mut state.result, ResultSlot::Taken);

        if state.check_cancellable && inner.cancellable_cancelled() {
            state.propagated_error = true;
            drop(state);
            // A stored pointer or boxed result is still freed by its
            // destructor; it never reaches the caller.
            drop(slot);
            return Err(Error::cancelled());
        }

        match slot {
            ResultSlot::Error(error) => {
                state.propagated_error = true;
                Err(error)
            }
            ResultSlot::Pending => {
                tracing::error!(
                    target: targets::TASK,
                    name = state.name.as_deref(),
                    "task result propagated before any result was returned"
                );
                Err(Error::new(ErrorKind::Failed, "Task has no result"))
            }
            ResultSlot::Taken => {
                tracing::error!(
                    target: targets::TASK,
                    name = state.name.as_deref(),
                    "task result propagated twice"
                );
                Err(Error::new(ErrorKind::Failed, "Task result already propagated"))
            }
            other => Ok(other),
        }
    }

    fn type_mismatch(&self, expected: &str) -> Error {
        tracing::error!(
            target: targets::TASK,
            name = self.task.name().as_deref(),
            expected,
            "task result propagated with the wrong type"
        );
        Error::new(ErrorKind::Failed, "Task result has a different type")
    }

    /// Extract an integer result stored with
    /// [`TaskProducer::return_int`].
    pub fn propagate_int(self) -> Result<i64, Error> {
        match self.take_result()? {
            ResultSlot::Int(value) => Ok(value),
            _ => Err(self.type_mismatch("int")),
        }
    }

    /// Extract a boolean result stored with
    /// [`TaskProducer::return_boolean`].
    pub fn propagate_boolean(self) -> Result<bool, Error> {
        match self.take_result()? {
            ResultSlot::Bool(value) => Ok(value),
            _ => Err(self.type_mismatch("boolean")),
        }
    }

    /// Extract a pointer-style result stored with
    /// [`TaskProducer::return_pointer`]. Ownership transfers to the caller;
    /// the destroy hook will not run.
    pub fn propagate_pointer(self) -> Result<Box<dyn Any + Send>, Error> {
        match self.take_result()? {
            ResultSlot::Pointer(mut payload) => {
                Ok(payload.take().expect("stored pointer result present"))
            }
            _ => Err(self.type_mismatch("pointer")),
        }
    }

    /// Extract a boxed value result stored with
    /// [`TaskProducer::return_value`]. Ownership transfers to the caller.
    pub fn propagate_value(self) -> Result<Box<dyn Any + Send>, Error> {
        match self.take_result()? {
            ResultSlot::Boxed(value) => Ok(value),
            _ => Err(self.type_mismatch("value")),
        }
    }
}

impl fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskResult").field(&self.task).finish()
    }
}

static_assertions::assert_impl_all!(Task: Send, Sync, Clone);
static_assertions::assert_impl_all!(TaskProducer: Send, Sync);
static_assertions::assert_impl_all!(TaskResult: Send, Sync);
