//! Structured concurrency for plain threads.
//!
//! Every task is owned by a lexically-delimited [`Scope`]; no task outlives
//! the scope it was spawned into, and child failures reach the scope's owner
//! deterministically. Cancellation is soft and flows down a tree of
//! [`Context`]s; all blocking is transactional (see [`stm`]) and therefore
//! composable and interruptible.

pub mod context;
pub use context::{CancelToken, Context};

mod error;
pub use error::{Fault, Outcome, fail};

pub mod implicit;

mod scope;
pub use scope::{Scope, scoped};

pub mod stm;

pub mod task;
pub use task::{TaskId, ThreadHandle, Unmask, current_id};

pub mod time;
pub use time::{sleep, timeout_stm};
