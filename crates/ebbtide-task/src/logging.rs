//! Tracing integration.
//!
//! Ebbtide instruments itself with the `tracing` crate. Install a subscriber
//! in your application to see the output:
//!
//! ```ignore
//! tracing_subscriber::fmt::init();
//! ```
//!
//! Contract violations (a second terminal call, a task dropped without ever
//! returning while a callback was attached) are reported as `error!` events
//! on the [`targets::TASK`] target; they are diagnostics, not recoverable
//! errors, and tests can assert on them with a capturing subscriber.

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter by subsystem, e.g.
/// `ebbtide_task::task=trace`.
pub mod targets {
    /// The task core: terminal calls, dispatch, finalization.
    pub const TASK: &str = "ebbtide_task::task";
    /// Context iteration and source dispatch.
    pub const CONTEXT: &str = "ebbtide_task::context";
    /// Worker pool scheduling.
    pub const POOL: &str = "ebbtide_task::threadpool";
}
