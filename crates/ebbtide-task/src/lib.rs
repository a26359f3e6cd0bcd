//! Core async support for Ebbtide.
//!
//! This crate provides the deferred task primitive used throughout the
//! Ebbtide I/O libraries, together with the event-loop pieces it is built
//! on:
//!
//! - **Task**: a one-shot deferred operation whose callback is dispatched on
//!   the event-loop context captured at construction
//! - **Worker pool**: bounded, priority-ordered offload of task work onto OS
//!   threads, with nesting-safe synchronous waits
//! - **Cancellable**: a one-way cancellation flag with observer registry
//! - **MainContext**: a per-thread cooperative scheduler for idle and
//!   timeout sources, with thread-default capture
//! - **Errors**: a coarse error taxonomy with a `std::io` adapter
//!
//! # Task Example
//!
//! ```
//! use ebbtide_task::{MainContext, MainLoop, Task};
//!
//! let context = MainContext::new();
//! let guard = context.push_thread_default();
//! let main_loop = MainLoop::new(&context);
//!
//! // The producer side of some async API:
//! let loop_clone = main_loop.clone();
//! let producer = Task::new(
//!     None,
//!     None,
//!     Some(Box::new(move |result| {
//!         // The consumer callback, dispatched on the captured context.
//!         println!("got {}", result.propagate_int().unwrap());
//!         loop_clone.quit();
//!     })),
//! );
//!
//! // Offload the work; the callback fires back on this thread.
//! producer.run_in_thread(|producer| {
//!     producer.return_int(6 * 7);
//! });
//!
//! main_loop.run();
//! drop(guard);
//! ```
//!
//! # Cancellation Example
//!
//! ```
//! use ebbtide_task::{Cancellable, ErrorKind, MainContext, Task};
//!
//! let context = MainContext::new();
//! let guard = context.push_thread_default();
//!
//! let cancellable = Cancellable::new();
//! let producer = Task::new(None, Some(&cancellable), None);
//! cancellable.cancel();
//!
//! let result = producer.run_in_thread_sync(|producer| {
//!     if producer.return_error_if_cancelled() {
//!         return;
//!     }
//!     producer.return_int(1);
//! });
//! assert_eq!(result.propagate_int().unwrap_err().kind(), ErrorKind::Cancelled);
//! # drop(guard);
//! ```

#![warn(missing_docs)]

mod cancellable;
mod context;
mod error;
pub mod logging;
mod source;
mod task;
pub mod threadpool;

pub use cancellable::{Cancellable, HandlerId};
pub use context::{MainContext, MainLoop, ThreadDefaultGuard};
pub use error::{Error, ErrorKind};
pub use source::{Dispatch, Priority, Source, SourceCallback, SourceId};
pub use task::{
    CompletionId, DestroyNotify, SourceObject, Task, TaskCallback, TaskProducer, TaskResult,
};
pub use threadpool::POOL_WIDTH;
