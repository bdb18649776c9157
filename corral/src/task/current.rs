//! Per-thread task state: identity, interrupt cell, mask level, and the
//! stack of scopes the task currently owns.
//!
//! Asynchronous delivery is modeled cooperatively: every task owns an
//! interrupt cell, and every blocking operation of the library is an
//! *interruptible wait* that races the cell (and the failure cells of owned
//! scopes) against the awaited condition. A task that never suspends is
//! never interrupted; that is the nature of the host.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{Fault, Outcome};
use crate::stm::{StmResult, TVar, Tx, atomically, or_else, retry};
use crate::task::TaskId;

/// How eligible the current task is to receive asynchronously delivered
/// faults at its suspension points.
///
/// Without preemption, delivery only ever happens at suspension points, so
/// "masked but interruptible" coincides with unmasked and the type has two
/// inhabitants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mask {
    Unmasked,
    Uninterruptible,
}

/// A failure propagated from a child, parked in its scope's failure cell
/// until the scope owner reaches a suspension point.
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub(crate) child: TaskId,
    pub(crate) fault: Fault,
}

pub(crate) type FailureCell = TVar<Option<Delivery>>;

pub(crate) struct TaskState {
    pub(crate) id: TaskId,
    pub(crate) interrupt: TVar<Option<Fault>>,
    mask: Cell<Mask>,
    /// Failure cells of scopes this task opened, innermost last.
    owned: RefCell<Vec<FailureCell>>,
}

impl TaskState {
    fn new(id: TaskId, interrupt: TVar<Option<Fault>>, mask: Mask) -> Rc<Self> {
        Rc::new(TaskState {
            id,
            interrupt,
            mask: Cell::new(mask),
            owned: RefCell::new(Vec::new()),
        })
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<TaskState>>> = const { RefCell::new(None) };
}

/// The state of the calling thread's task.
///
/// Threads not spawned by this crate (the main thread, test threads) are
/// adopted on first contact: they get an id and an interrupt cell and behave
/// like any unmasked task from then on.
pub(crate) fn current() -> Rc<TaskState> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_ref() {
            Some(state) => Rc::clone(state),
            None => {
                let state = TaskState::new(TaskId::next(), TVar::new(None), Mask::Unmasked);
                *slot = Some(Rc::clone(&state));
                state
            }
        }
    })
}

/// The [`TaskId`] of the calling task.
pub fn current_id() -> TaskId {
    current().id
}

/// Installs a spawned task's identity on the calling thread; restores the
/// previous state when dropped (threads are fresh, but the discipline keeps
/// re-entry correct under tests that reuse a thread).
pub(crate) struct EnterGuard {
    prior: Option<Rc<TaskState>>,
}

pub(crate) fn enter(id: TaskId, interrupt: TVar<Option<Fault>>, mask: Mask) -> EnterGuard {
    let state = TaskState::new(id, interrupt, mask);
    let prior = CURRENT.with(|slot| slot.borrow_mut().replace(state));
    EnterGuard { prior }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT.with(|slot| *slot.borrow_mut() = self.prior.take());
    }
}

/// Runs `body` with asynchronous delivery fully disabled.
///
/// Scope open, spawn setup, and close run under this so their bookkeeping
/// cannot be torn by an interrupt landing between transactions.
pub(crate) fn mask_uninterruptible<R>(body: impl FnOnce() -> R) -> R {
    struct Restore {
        state: Rc<TaskState>,
        prior: Mask,
    }
    impl Drop for Restore {
        fn drop(&mut self) {
            self.state.mask.set(self.prior);
        }
    }

    let state = current();
    let prior = state.mask.replace(Mask::Uninterruptible);
    let _restore = Restore { state, prior };
    body()
}

/// Capability to temporarily restore interruptibility, handed to tasks
/// spawned with a `*_with_unmask` operation.
///
/// Not `Send`: the capability acts on the task it was issued to.
pub struct Unmask {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Unmask {
    pub(crate) fn new() -> Self {
        Unmask {
            _not_send: std::marker::PhantomData,
        }
    }

    /// Runs `body` unmasked, restoring the previous mask level afterwards.
    pub fn unmasked<R>(&self, body: impl FnOnce() -> R) -> R {
        struct Restore {
            state: Rc<TaskState>,
            prior: Mask,
        }
        impl Drop for Restore {
            fn drop(&mut self) {
                self.state.mask.set(self.prior);
            }
        }

        let state = current();
        let prior = state.mask.replace(Mask::Unmasked);
        let _restore = Restore { state, prior };
        body()
    }
}

/// Registers a scope's failure cell with its owner for the duration of the
/// scope body; interruptible waits race every registered cell.
pub(crate) struct OwnerGuard {
    state: Rc<TaskState>,
}

pub(crate) fn push_owned_scope(cell: FailureCell) -> OwnerGuard {
    let state = current();
    state.owned.borrow_mut().push(cell);
    OwnerGuard { state }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        self.state.owned.borrow_mut().pop();
    }
}

/// Blocks on `wait`, racing it against asynchronous delivery.
///
/// Precedence when several sources are ready in the same attempt: the
/// task's own interrupt cell first (a hard close outranks everything), then
/// child failures of owned scopes (innermost scope first), then the awaited
/// condition. Under `Mask::Uninterruptible` the races are skipped entirely.
pub(crate) fn interruptible<T>(mut wait: impl FnMut(&mut Tx) -> StmResult<T>) -> Outcome<T> {
    let state = current();
    if state.mask.get() == Mask::Uninterruptible {
        return Ok(atomically(|tx| wait(tx)));
    }

    let interrupt = state.interrupt.clone();
    let owned: SmallVec<[FailureCell; 4]> = state.owned.borrow().iter().cloned().collect();

    enum Woken<T> {
        Interrupted(Fault),
        ChildFailed(Delivery),
        Ready(T),
    }

    let woken = atomically(|tx| {
        or_else(
            tx,
            |tx| match tx.read(&interrupt) {
                Some(fault) => {
                    tx.write(&interrupt, None);
                    Ok(Woken::Interrupted(fault))
                }
                None => retry(),
            },
            |tx| {
                or_else(
                    tx,
                    |tx| {
                        for cell in owned.iter().rev() {
                            if let Some(delivery) = tx.read(cell) {
                                tx.write(cell, None);
                                return Ok(Woken::ChildFailed(delivery));
                            }
                        }
                        retry()
                    },
                    |tx| wait(tx).map(Woken::Ready),
                )
            },
        )
    });

    match woken {
        Woken::Interrupted(fault) => Err(fault),
        Woken::ChildFailed(delivery) => Err(Fault::AsyncThreadFailed {
            id: delivery.child,
            fault: Arc::new(delivery.fault),
        }),
        Woken::Ready(value) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_foreign_thread_adoption_is_stable() {
        let a = current_id();
        let b = current_id();
        assert_eq!(a, b);
    }

    #[test]
    fn test_interruptible_wait_takes_delivered_fault() -> Result<()> {
        let interrupt = current().interrupt.clone();

        let writer = {
            let interrupt = interrupt.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                atomically(|tx| {
                    tx.write(&interrupt, Some(Fault::ScopeClosing));
                    Ok(())
                });
            })
        };

        // The condition can never fire; only the delivery can wake us.
        let never = TVar::new(false);
        let woken = interruptible(|tx| if tx.read(&never) { Ok(()) } else { retry() });
        assert!(matches!(woken, Err(Fault::ScopeClosing)));

        // The cell was drained by the wait.
        assert!(interrupt.read_now().is_none());

        writer.join().map_err(|_| anyhow::anyhow!("writer panicked"))?;
        Ok(())
    }

    #[test]
    fn test_mask_uninterruptible_defers_delivery() {
        let interrupt = current().interrupt.clone();
        atomically(|tx| {
            tx.write(&interrupt, Some(Fault::ScopeClosing));
            Ok(())
        });

        let done = TVar::new(true);
        let out = mask_uninterruptible(|| {
            interruptible(|tx| if tx.read(&done) { Ok(42) } else { retry() })
        });
        assert!(matches!(out, Ok(42)));

        // Still pending; drain it so later tests on this thread start clean.
        let out = interruptible(|tx| if tx.read(&done) { Ok(()) } else { retry() });
        assert!(matches!(out, Err(Fault::ScopeClosing)));
    }

    #[test]
    fn test_unmask_restores_prior_level() {
        let state = current();
        mask_uninterruptible(|| {
            let unmask = Unmask::new();
            unmask.unmasked(|| {
                assert_eq!(current().mask.get(), Mask::Unmasked);
            });
            assert_eq!(state.mask.get(), Mask::Uninterruptible);
        });
        assert_eq!(state.mask.get(), Mask::Unmasked);
    }
}
