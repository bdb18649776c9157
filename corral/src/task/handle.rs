use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Fault, Outcome};
use crate::stm::{StmResult, TVar, Tx, or_else, retry};
use crate::task::{self, TaskId};
use crate::time::timer;

/// What a spawned task eventually leaves behind for its awaiters.
pub(crate) type Slot<T> = Option<std::result::Result<T, Fault>>;

/// An awaitable claim on a spawned task's result.
///
/// The handle does *not* own the task's lifetime (the scope does), so
/// dropping a handle is always fine and a handle may outlive its usefulness
/// without leaking. Any number of tasks may [`join`](ThreadHandle::join) the
/// same handle; each gets a clone of the result.
///
/// Handles compare and hash by task id, so they can live in ordered
/// collections.
///
/// Whether the slot is ever filled depends on the spawn mode: see
/// [`Scope::fork`](crate::Scope::fork) for the one case that leaves it empty
/// on failure.
pub struct ThreadHandle<T> {
    id: TaskId,
    slot: TVar<Slot<T>>,
}

impl<T: Clone + Send + Sync + 'static> ThreadHandle<T> {
    pub(crate) fn new(id: TaskId, slot: TVar<Slot<T>>) -> Self {
        ThreadHandle { id, slot }
    }

    /// The id of the task behind this handle.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the result slot has been filled.
    ///
    /// Note that a propagating child that failed never fills its slot, so
    /// this can stay `false` after the task has terminated.
    pub fn is_finished(&self) -> bool {
        self.slot.read_now().is_some()
    }

    /// Blocks until the slot is filled and returns the value.
    ///
    /// A failure recorded in the slot re-raises wrapped as
    /// [`Fault::ThreadFailed`] carrying the task's id.
    pub fn join(&self) -> Outcome<T> {
        task::interruptible(|tx| self.join_stm(tx))?
    }

    /// Transactional form of [`join`](ThreadHandle::join): retries until the
    /// slot is filled, then yields the same value `join` would return.
    pub fn join_stm(&self, tx: &mut Tx) -> StmResult<Outcome<T>> {
        match tx.read(&self.slot) {
            None => retry(),
            Some(Ok(value)) => Ok(Ok(value)),
            Some(Err(fault)) => Ok(Err(Fault::ThreadFailed {
                id: self.id,
                fault: Arc::new(fault),
            })),
        }
    }

    /// Like [`join`](ThreadHandle::join) with a deadline: `None` if the slot
    /// is still empty after `timeout`.
    pub fn join_for(&self, timeout: Duration) -> Outcome<Option<T>> {
        let fired = timer::register(timeout);
        let joined = task::interruptible(|tx| {
            or_else(
                tx,
                |tx| self.join_stm(tx).map(Some),
                |tx| if tx.read(&fired) { Ok(None) } else { retry() },
            )
        })?;

        match joined {
            Some(outcome) => outcome.map(Some),
            None => Ok(None),
        }
    }
}

impl<T> Clone for ThreadHandle<T> {
    fn clone(&self) -> Self {
        ThreadHandle {
            id: self.id,
            slot: self.slot.clone(),
        }
    }
}

impl<T> PartialEq for ThreadHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ThreadHandle<T> {}

impl<T> PartialOrd for ThreadHandle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ThreadHandle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> Hash for ThreadHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for ThreadHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle").field("id", &self.id).finish()
    }
}
