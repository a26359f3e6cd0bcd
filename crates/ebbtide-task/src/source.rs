//! Dispatch sources and priorities.
//!
//! A [`Source`] is an attachable unit of work inside a [`MainContext`]: an
//! idle callback that fires as soon as the context iterates, or a timeout
//! that fires once its deadline passes. Sources carry a [`Priority`] and an
//! optional debug name.
//!
//! [`MainContext`]: crate::MainContext

use std::borrow::Cow;
use std::time::{Duration, Instant};

use slotmap::new_key_type;

new_key_type! {
    /// Identifier of a source attached to a context.
    ///
    /// Returned by [`MainContext::attach`](crate::MainContext::attach); pass
    /// to [`MainContext::remove`](crate::MainContext::remove) to detach the
    /// source before it removes itself.
    pub struct SourceId;
}

/// Dispatch urgency of a source or task.
///
/// Lower values are more urgent. Within one context iteration, ready sources
/// dispatch in ascending priority, ties broken by attach order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Urgent work that should preempt normal dispatch.
    pub const HIGH: Priority = Priority(-100);
    /// The default priority for most sources and tasks.
    pub const DEFAULT: Priority = Priority(0);
    /// High-priority idle work.
    pub const HIGH_IDLE: Priority = Priority(100);
    /// Ordinary idle work.
    pub const DEFAULT_IDLE: Priority = Priority(200);
    /// Background work that should yield to everything else.
    pub const LOW: Priority = Priority(300);
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// What a source callback wants done with its source after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep the source attached; a timeout source re-arms from now.
    Continue,
    /// Detach and drop the source.
    Remove,
}

/// A boxed source callback.
pub type SourceCallback = Box<dyn FnMut() -> Dispatch + Send>;

pub(crate) enum SourceKind {
    Idle,
    Timeout { due: Instant, interval: Duration },
}

/// An attachable unit of work: an idle or timeout callback with a priority
/// and an optional name.
///
/// Build one with [`Source::idle`] or [`Source::timeout`], configure it, and
/// hand it to [`MainContext::attach`](crate::MainContext::attach) (or
/// [`TaskProducer::attach_source`](crate::TaskProducer::attach_source), which
/// applies the task's priority and name first).
///
/// # Example
///
/// ```
/// use ebbtide_task::{Dispatch, MainContext, Priority, Source};
///
/// let context = MainContext::new();
/// let mut source = Source::idle(|| {
///     println!("idle fired");
///     Dispatch::Remove
/// });
/// source.set_priority(Priority::HIGH);
/// context.attach(source);
/// context.iteration(false);
/// ```
pub struct Source {
    pub(crate) kind: SourceKind,
    pub(crate) priority: Priority,
    pub(crate) name: Option<Cow<'static, str>>,
    pub(crate) callback: SourceCallback,
}

impl Source {
    /// An idle source: ready on every iteration until the callback returns
    /// [`Dispatch::Remove`].
    pub fn idle<F>(callback: F) -> Self
    where
        F: FnMut() -> Dispatch + Send + 'static,
    {
        Self {
            kind: SourceKind::Idle,
            priority: Priority::DEFAULT,
            name: None,
            callback: Box::new(callback),
        }
    }

    /// A timeout source: ready once `interval` has elapsed. Returning
    /// [`Dispatch::Continue`] re-arms it for another `interval`.
    pub fn timeout<F>(interval: Duration, callback: F) -> Self
    where
        F: FnMut() -> Dispatch + Send + 'static,
    {
        Self {
            kind: SourceKind::Timeout {
                due: Instant::now() + interval,
                interval,
            },
            priority: Priority::DEFAULT,
            name: None,
            callback: Box::new(callback),
        }
    }

    /// Set the dispatch priority.
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// The dispatch priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Set a debug name, replacing any previous one.
    pub fn set_name(&mut self, name: impl Into<Cow<'static, str>>) {
        self.name = Some(name.into());
    }

    /// The debug name, if one was set.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether this source is ready to dispatch at `now`.
    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        match self.kind {
            SourceKind::Idle => true,
            SourceKind::Timeout { due, .. } => due <= now,
        }
    }

    /// The deadline this source is waiting for, if any.
    pub(crate) fn due(&self) -> Option<Instant> {
        match self.kind {
            SourceKind::Idle => None,
            SourceKind::Timeout { due, .. } => Some(due),
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            SourceKind::Idle => "idle",
            SourceKind::Timeout { .. } => "timeout",
        };
        f.debug_struct("Source")
            .field("kind", &kind)
            .field("priority", &self.priority)
            .field("name", &self.name)
            .finish()
    }
}
