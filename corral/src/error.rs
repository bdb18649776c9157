use std::any::Any;
use std::sync::Arc;

use crate::context::CancelToken;
use crate::task::TaskId;

/// Result of any library operation that can be interrupted or fail.
pub type Outcome<T> = std::result::Result<T, Fault>;

/// A centralized error type for everything that can unwind a task.
///
/// `Fault` plays the role exceptions play in runtimes with stack unwinding:
/// it travels out of task bodies via `?`, is delivered between tasks through
/// interrupt cells, and is inspected by the scope machinery to decide whether
/// an unwind was expected (an honored cancellation, a scope tearing itself
/// down) or a real failure that must reach the scope owner.
///
/// Faults are cheap to clone; user errors and nested faults are `Arc`ed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Fault {
    /// Raised synchronously when spawning into a scope that already closed.
    #[error("scope is closed")]
    ScopeClosed,

    /// Sentinel delivered to children while their scope hard-closes.
    ///
    /// Task code that catches faults wholesale must re-raise this one; the
    /// completion machinery recognizes it as expected unwind once the scope
    /// is marked closed.
    #[error("scope closing")]
    ScopeClosing,

    /// Exception form of a soft cancellation.
    ///
    /// Raised by [`sleep`](crate::time::sleep) and by user code honoring
    /// [`Context::cancelled`](crate::context::Context::cancelled). A scope
    /// swallows it only when the token matches its own context's token; a
    /// token smuggled from another subtree propagates like any failure.
    #[error("cancelled (token {0})")]
    Cancelled(CancelToken),

    /// What a scope owner ultimately sees when a propagating child failed.
    #[error("thread {id} failed: {fault}")]
    ThreadFailed { id: TaskId, fault: Arc<Fault> },

    /// In-flight form of [`Fault::ThreadFailed`].
    ///
    /// Child failures are delivered in this wrapper so a body's ordinary
    /// error handling does not absorb them by accident; `scoped` unwraps it
    /// exactly once at the scope boundary.
    #[error("thread {id} failed (in flight): {fault}")]
    AsyncThreadFailed { id: TaskId, fault: Arc<Fault> },

    /// A task failed with an application error.
    #[error("{0}")]
    Other(Arc<anyhow::Error>),

    /// A task panicked; the payload is captured as text.
    #[error("task panicked: {0}")]
    Panicked(Arc<str>),
}

impl Fault {
    /// Wraps an application error. See also the [`fail`] shorthand.
    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        Fault::Other(Arc::new(err.into()))
    }

    /// Returns true if the fault is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Fault::Cancelled(_))
    }

    pub fn is_scope_closed(&self) -> bool {
        matches!(self, Fault::ScopeClosed)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Fault::Panicked(_))
    }

    pub fn is_thread_failed(&self) -> bool {
        matches!(
            self,
            Fault::ThreadFailed { .. } | Fault::AsyncThreadFailed { .. }
        )
    }

    /// Attempts to view an application error as a concrete type `E`.
    ///
    /// Looks through `ThreadFailed` wrappers, so callers can match on the
    /// original error a child failed with.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Fault::Other(err) => err.downcast_ref::<E>(),
            Fault::ThreadFailed { fault, .. } | Fault::AsyncThreadFailed { fault, .. } => {
                fault.downcast_ref::<E>()
            }
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Fault {
    fn from(err: anyhow::Error) -> Self {
        Fault::Other(Arc::new(err))
    }
}

/// Shorthand for failing a task body with an application error.
///
/// ```
/// use corral::{fail, Outcome};
///
/// fn parse(input: &str) -> Outcome<u32> {
///     match input.parse() {
///         Ok(n) => Ok(n),
///         Err(err) => fail(err),
///     }
/// }
///
/// assert!(parse("17").is_ok());
/// assert!(parse("q").is_err());
/// ```
pub fn fail<T>(err: impl Into<anyhow::Error>) -> Outcome<T> {
    Err(Fault::other(err))
}

/// Best-effort extraction of a panic message from a payload.
pub(crate) fn panic_payload_as_str(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Some(s)
    } else {
        payload.downcast_ref::<String>().map(String::as_str)
    }
}

pub(crate) fn fault_from_panic(payload: Box<dyn Any + Send>) -> Fault {
    let msg = panic_payload_as_str(payload.as_ref()).unwrap_or("non-string payload");
    Fault::Panicked(Arc::from(msg))
}
