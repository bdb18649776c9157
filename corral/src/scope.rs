//! Scopes: lexically-delimited owners of concurrent tasks.
//!
//! A scope is opened by [`scoped`], tasks are spawned into it with the
//! `fork*` family, and by the time `scoped` returns every task it spawned
//! has terminated, whether the body returned, failed, or panicked.
//! Failures of propagating children reach the scope owner deterministically;
//! soft cancellation flows down the scope's [`Context`]; a hard close
//! delivers a sentinel to whatever is still running.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use smallvec::SmallVec;

use crate::context::{self, Context};
use crate::error::{self, Fault, Outcome};
use crate::stm::{StmResult, TVar, Tx, atomically, or_else, retry};
use crate::task::{self, Delivery, FailureCell, Mask, Slot, TaskId, ThreadHandle, Unmask};
use crate::time::timer;

/// What the scope keeps per live child: its id and the interrupt cell a
/// hard close delivers the sentinel through.
#[derive(Clone)]
struct ChildRef {
    id: TaskId,
    interrupt: TVar<Option<Fault>>,
}

struct ScopeInner {
    context: Context,
    /// Once true, no new task may be spawned. Monotonic.
    closed: TVar<bool>,
    /// Tasks admitted but not yet registered in `running`.
    starting: TVar<u32>,
    running: TVar<HashMap<TaskId, ChildRef>>,
    /// Propagation cell: the first failing propagating child parks its
    /// failure here; the owner's interruptible waits race it.
    failure: FailureCell,
}

/// A live scope. Cheap to clone; clones share the scope, so children can
/// spawn siblings or drive [`wait_for`](Scope::wait_for) from inside.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

/// How a child's outcome is disposed of when it terminates.
#[derive(Clone, Copy)]
enum OnOutcome {
    /// Success fills the slot; failure is routed to the scope owner.
    Propagate,
    /// Everything goes to the slot; observers must join.
    Capture,
}

type TaskFn<T> = Box<dyn FnOnce(Context, &Unmask) -> Outcome<T> + Send + 'static>;

/// Opens a scope against `parent`, runs `body`, and closes the scope.
///
/// Returns what `body` returned unless closure converts a child failure
/// into the return: if any propagating child failed while the body
/// succeeded, the failure is re-raised here as [`Fault::ThreadFailed`]. A
/// failure the body already surfaced (by `?`-ing a wait) is unwrapped to
/// the same clean form. If the body itself fails, its error takes
/// precedence and child failures still pending are discarded.
///
/// Guarantee: every child task has terminated before `scoped` returns, on
/// every exit path (normal return, error, panic of the body, a close driven
/// from inside).
///
/// ```
/// use corral::{Context, scoped};
///
/// let out = scoped(&Context::global(), |s| {
///     let t = s.fork(|_ctx| Ok(7))?;
///     t.join()
/// });
/// assert_eq!(out.unwrap(), 7);
/// ```
pub fn scoped<T>(parent: &Context, body: impl FnOnce(&Scope) -> Outcome<T>) -> Outcome<T> {
    let scope = Scope::open(parent);
    let _owner = task::push_owned_scope(scope.inner.failure.clone());

    let result = panic::catch_unwind(AssertUnwindSafe(|| body(&scope)));

    // Children die before the body's outcome is surfaced, panic included.
    let close_result = scope.close();

    let result = match result {
        Ok(result) => result,
        Err(payload) => panic::resume_unwind(payload),
    };

    match result {
        Err(Fault::AsyncThreadFailed { id, fault }) => Err(Fault::ThreadFailed { id, fault }),
        Err(other) => Err(other),
        Ok(value) => {
            close_result?;
            match scope.take_failure() {
                Some(delivery) => Err(Fault::ThreadFailed {
                    id: delivery.child,
                    fault: Arc::new(delivery.fault),
                }),
                None => Ok(value),
            }
        }
    }
}

impl Scope {
    fn open(parent: &Context) -> Scope {
        let context = parent.derive();
        tracing::trace!(ctx = ?context, "scope opened");
        Scope {
            inner: Arc::new(ScopeInner {
                context,
                closed: TVar::new(false),
                starting: TVar::new(0),
                running: TVar::new(HashMap::new()),
                failure: TVar::new(None),
            }),
        }
    }

    /// The scope's own context; tasks derive nested scopes from it.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Requests soft cancellation of the scope's context subtree.
    ///
    /// Idempotent; tasks observe it through their context and decide when to
    /// honor it. Nothing is killed.
    pub fn cancel(&self) {
        self.inner.context.cancel();
    }

    /// The token this scope was cancelled with, if any.
    pub fn cancelled(&self) -> Option<crate::context::CancelToken> {
        self.inner.context.cancelled()
    }

    /// Spawns a propagating task and returns its handle.
    ///
    /// On success the handle's slot is filled with the value. On failure the
    /// slot stays **empty** and the failure is routed to the scope owner, so
    /// joining such a handle blocks until the scope's teardown interrupts
    /// the joiner. Failures recognized as expected unwind (the scope-closing
    /// sentinel once the scope is closed, this scope's own cancel token) are
    /// discarded instead.
    pub fn fork<T>(
        &self,
        task: impl FnOnce(Context) -> Outcome<T> + Send + 'static,
    ) -> Outcome<ThreadHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let handle = self.fork_impl(
            Mask::Unmasked,
            OnOutcome::Propagate,
            true,
            Box::new(move |ctx, _| task(ctx)),
        )?;
        // Safety: a slot was requested, so fork_impl built a handle.
        Ok(handle.expect("handle for slotted spawn"))
    }

    /// [`fork`](Scope::fork) without a handle, for tasks whose only output
    /// is their effect (or their failure).
    pub fn fork_unit(
        &self,
        task: impl FnOnce(Context) -> Outcome<()> + Send + 'static,
    ) -> Outcome<()> {
        self.fork_impl::<()>(
            Mask::Unmasked,
            OnOutcome::Propagate,
            false,
            Box::new(move |ctx, _| task(ctx)),
        )?;
        Ok(())
    }

    /// [`fork`](Scope::fork), but the task starts fully masked and receives
    /// an [`Unmask`] capability to restore interruptibility where it chooses
    /// to be killable.
    pub fn fork_with_unmask<T>(
        &self,
        task: impl FnOnce(Context, &Unmask) -> Outcome<T> + Send + 'static,
    ) -> Outcome<ThreadHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let handle = self.fork_impl(
            Mask::Uninterruptible,
            OnOutcome::Propagate,
            true,
            Box::new(task),
        )?;
        // Safety: a slot was requested, so fork_impl built a handle.
        Ok(handle.expect("handle for slotted spawn"))
    }

    /// [`fork_unit`](Scope::fork_unit) with the masked start of
    /// [`fork_with_unmask`](Scope::fork_with_unmask).
    pub fn fork_unit_with_unmask(
        &self,
        task: impl FnOnce(Context, &Unmask) -> Outcome<()> + Send + 'static,
    ) -> Outcome<()> {
        self.fork_impl::<()>(
            Mask::Uninterruptible,
            OnOutcome::Propagate,
            false,
            Box::new(task),
        )?;
        Ok(())
    }

    /// A propagating task that may fail *synchronously* with the declared
    /// error type `E`: such failures are caught into the slot as `Err(E)`.
    /// Anything else (panics, cancellation, other error types) still
    /// propagates to the scope owner.
    pub fn fork_try<T, E>(
        &self,
        task: impl FnOnce(Context) -> Outcome<T> + Send + 'static,
    ) -> Outcome<ThreadHandle<std::result::Result<T, E>>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        let run: TaskFn<std::result::Result<T, E>> =
            Box::new(move |ctx, _| match task(ctx) {
                Ok(value) => Ok(Ok(value)),
                Err(Fault::Other(err)) => match err.downcast_ref::<E>().cloned() {
                    Some(caught) => Ok(Err(caught)),
                    None => Err(Fault::Other(err)),
                },
                Err(other) => Err(other),
            });
        let handle = self.fork_impl(Mask::Unmasked, OnOutcome::Propagate, true, run)?;
        // Safety: a slot was requested, so fork_impl built a handle.
        Ok(handle.expect("handle for slotted spawn"))
    }

    /// Spawns a task whose whole outcome, value or failure, lands in the
    /// slot. Nothing propagates out of band; observers must
    /// [`join`](ThreadHandle::join), which re-raises recorded failures as
    /// [`Fault::ThreadFailed`] to the joiner only.
    pub fn fork_catch<T>(
        &self,
        task: impl FnOnce(Context) -> Outcome<T> + Send + 'static,
    ) -> Outcome<ThreadHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let handle = self.fork_impl(
            Mask::Unmasked,
            OnOutcome::Capture,
            true,
            Box::new(move |ctx, _| task(ctx)),
        )?;
        // Safety: a slot was requested, so fork_impl built a handle.
        Ok(handle.expect("handle for slotted spawn"))
    }

    /// [`fork_catch`](Scope::fork_catch) with the masked start of
    /// [`fork_with_unmask`](Scope::fork_with_unmask).
    pub fn fork_catch_with_unmask<T>(
        &self,
        task: impl FnOnce(Context, &Unmask) -> Outcome<T> + Send + 'static,
    ) -> Outcome<ThreadHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let handle = self.fork_impl(
            Mask::Uninterruptible,
            OnOutcome::Capture,
            true,
            Box::new(task),
        )?;
        // Safety: a slot was requested, so fork_impl built a handle.
        Ok(handle.expect("handle for slotted spawn"))
    }

    /// Blocks until no task is starting or running. Does not close the
    /// scope; new tasks may be spawned afterwards.
    pub fn wait(&self) -> Outcome<()> {
        task::interruptible(|tx| self.wait_stm(tx))
    }

    /// Transactional form of [`wait`](Scope::wait).
    pub fn wait_stm(&self, tx: &mut Tx) -> StmResult<()> {
        if tx.read(&self.inner.starting) == 0 && tx.read(&self.inner.running).is_empty() {
            Ok(())
        } else {
            retry()
        }
    }

    /// Cancels the scope, waits up to `timeout` for children to drain
    /// gracefully, and hard-closes whatever remains.
    ///
    /// `Duration::ZERO` hard-closes immediately. Legal from inside a child
    /// of this scope: the closer then kills its siblings, waits for them,
    /// and raises the scope-closing sentinel in itself.
    pub fn wait_for(&self, timeout: Duration) -> Outcome<()> {
        self.cancel();
        let fired = timer::register(timeout);
        let drained = task::interruptible(|tx| {
            or_else(
                tx,
                |tx| self.wait_stm(tx).map(|()| true),
                |tx| if tx.read(&fired) { Ok(false) } else { retry() },
            )
        })?;
        if !drained {
            self.close()?;
        }
        Ok(())
    }

    fn take_failure(&self) -> Option<Delivery> {
        let failure = &self.inner.failure;
        atomically(|tx| {
            let delivery = tx.read(failure);
            if delivery.is_some() {
                tx.write(failure, None);
            }
            Ok(delivery)
        })
    }

    fn fork_impl<T>(
        &self,
        start_mask: Mask,
        mode: OnOutcome,
        with_slot: bool,
        run: TaskFn<T>,
    ) -> Outcome<Option<ThreadHandle<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        task::mask_uninterruptible(|| {
            let inner = &self.inner;

            let admitted = atomically(|tx| {
                if tx.read(&inner.closed) {
                    return Ok(false);
                }
                let n = tx.read(&inner.starting);
                tx.write(&inner.starting, n + 1);
                Ok(true)
            });
            if !admitted {
                return Err(Fault::ScopeClosed);
            }

            let id = TaskId::next();
            let slot: Option<TVar<Slot<T>>> = with_slot.then(|| TVar::new(None));
            let child = ChildRef {
                id,
                interrupt: TVar::new(None),
            };

            let spawned = {
                let inner = Arc::clone(&self.inner);
                let child = child.clone();
                let slot = slot.clone();
                thread::Builder::new()
                    .name(format!("corral-{id}"))
                    .spawn(move || child_main(inner, child, start_mask, mode, slot, run))
            };

            if let Err(err) = spawned {
                atomically(|tx| {
                    let n = tx.read(&inner.starting);
                    tx.write(&inner.starting, n - 1);
                    Ok(())
                });
                return Err(Fault::other(
                    anyhow::Error::new(err).context("failed to spawn scope child"),
                ));
            }

            atomically(|tx| {
                let n = tx.read(&inner.starting);
                tx.write(&inner.starting, n - 1);
                let mut running = tx.read(&inner.running);
                running.insert(id, child.clone());
                tx.write(&inner.running, running);
                Ok(())
            });

            tracing::trace!(%id, "child spawned");
            Ok(slot.map(|slot| ThreadHandle::new(id, slot)))
        })
    }

    /// The close protocol. Runs fully masked.
    ///
    /// The first closer marks the scope, delivers the scope-closing sentinel
    /// to every running child but itself, and deregisters the context once
    /// the scope has drained. *Every* closer waits for the drain: a
    /// non-first closer returning early could let `scoped` return while the
    /// inside-closer is still unwinding. A closer that is itself a child of
    /// the scope waits for its siblings only, then raises the sentinel in
    /// itself by returning it.
    fn close(&self) -> Outcome<()> {
        task::mask_uninterruptible(|| {
            let inner = &self.inner;
            let me = task::current_id();

            let (first_closer, from_inside) = atomically(|tx| {
                if tx.read(&inner.starting) != 0 {
                    return retry();
                }
                let from_inside = tx.read(&inner.running).contains_key(&me);
                if tx.read(&inner.closed) {
                    Ok((false, from_inside))
                } else {
                    tx.write(&inner.closed, true);
                    Ok((true, from_inside))
                }
            });

            if first_closer {
                let children: SmallVec<[ChildRef; 8]> =
                    atomically(|tx| Ok(tx.read(&inner.running).values().cloned().collect()));

                let mut delivered = 0_usize;
                for child in children.iter().filter(|c| c.id != me) {
                    // Blocks while the target's cell is busy; resolves once
                    // the child consumes its interrupt or terminates.
                    atomically(|tx| {
                        if !tx.read(&inner.running).contains_key(&child.id) {
                            return Ok(());
                        }
                        match tx.read(&child.interrupt) {
                            None => {
                                tx.write(&child.interrupt, Some(Fault::ScopeClosing));
                                Ok(())
                            }
                            Some(_) => retry(),
                        }
                    });
                    delivered += 1;
                }
                if delivered > 0 {
                    tracing::debug!(delivered, "scope hard-closing");
                }
            }

            atomically(|tx| {
                let running = tx.read(&inner.running);
                let drained = if from_inside {
                    running.len() == 1 && running.contains_key(&me)
                } else {
                    running.is_empty()
                };
                if drained { Ok(()) } else { retry() }
            });

            if first_closer {
                inner.context.remove();
                tracing::trace!("scope closed");
            }

            if from_inside {
                Err(Fault::ScopeClosing)
            } else {
                Ok(())
            }
        })
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("context", &self.inner.context)
            .field("closed", &self.inner.closed.read_now())
            .field("starting", &self.inner.starting.read_now())
            .field("running", &self.inner.running.read_now().len())
            .finish()
    }
}

/// Entry wrapper of every spawned task.
fn child_main<T>(
    inner: Arc<ScopeInner>,
    child: ChildRef,
    start_mask: Mask,
    mode: OnOutcome,
    slot: Option<TVar<Slot<T>>>,
    run: TaskFn<T>,
) where
    T: Clone + Send + Sync + 'static,
{
    let _task = task::enter(child.id, child.interrupt.clone(), start_mask);
    let _ambient = context::bind_ambient(inner.context.clone());

    // The spawn is observable (our id in `running`) before any user-visible
    // action of the task.
    atomically(|tx| {
        if tx.read(&inner.running).contains_key(&child.id) {
            Ok(())
        } else {
            retry()
        }
    });

    let unmask = Unmask::new();
    let ctx = inner.context.clone();
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| run(ctx, &unmask))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(error::fault_from_panic(payload)),
    };

    complete(&inner, &child, mode, slot.as_ref(), outcome);
}

enum Fate {
    Stored,
    Propagated,
    Discarded,
}

/// The completion step: one transaction that removes the child from
/// `running` and disposes of its outcome. Fusing the two is what makes a
/// propagated failure visible no later than the child's disappearance from
/// `running`; observers can never see the scope idle with a failure still
/// in flight.
fn complete<T>(
    inner: &ScopeInner,
    child: &ChildRef,
    mode: OnOutcome,
    slot: Option<&TVar<Slot<T>>>,
    outcome: Outcome<T>,
) where
    T: Clone + Send + Sync + 'static,
{
    let fate = atomically(|tx| {
        let mut running = tx.read(&inner.running);
        running.remove(&child.id);
        tx.write(&inner.running, running);

        match (&outcome, mode) {
            (Ok(value), _) => {
                if let Some(slot) = slot {
                    tx.write(slot, Some(Ok(value.clone())));
                }
                Ok(Fate::Stored)
            }
            (Err(fault), OnOutcome::Capture) => {
                // Safety: capture mode always spawns with a slot.
                let slot = slot.expect("capture spawn carries a slot");
                tx.write(slot, Some(Err(fault.clone())));
                Ok(Fate::Stored)
            }
            (Err(fault), OnOutcome::Propagate) => {
                let closed = tx.read(&inner.closed);
                let expected_unwind = match fault {
                    Fault::ScopeClosing => closed,
                    Fault::Cancelled(token) => {
                        inner.context.cancelled_stm(tx) == Some(*token)
                    }
                    _ => false,
                };
                if expected_unwind || closed {
                    return Ok(Fate::Discarded);
                }
                if tx.read(&inner.failure).is_none() {
                    tx.write(
                        &inner.failure,
                        Some(Delivery {
                            child: child.id,
                            fault: fault.clone(),
                        }),
                    );
                    Ok(Fate::Propagated)
                } else {
                    // Another child already won the propagation race.
                    Ok(Fate::Discarded)
                }
            }
        }
    });

    match fate {
        Fate::Stored => {}
        Fate::Propagated => tracing::debug!(id = %child.id, "child failure propagated"),
        Fate::Discarded => tracing::trace!(id = %child.id, "child unwind discarded"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::fail;
    use anyhow::{Result, anyhow};

    #[test]
    fn test_child_is_registered_before_its_body_runs() -> Result<()> {
        let out = scoped(&Context::global(), |s| {
            let inner = Arc::clone(&s.inner);
            let t = s.fork(move |_| Ok(inner.running.read_now().len()))?;
            t.join()
        });
        assert_eq!(out?, 1);
        Ok(())
    }

    #[test]
    fn test_result_is_visible_no_later_than_deregistration() -> Result<()> {
        scoped(&Context::global(), |s| {
            let t = s.fork(|_| Ok(3))?;
            let inner = Arc::clone(&s.inner);

            // One snapshot: once the id has left `running`, the slot must
            // already be filled; fill and removal are a single commit.
            let filled = atomically(|tx| {
                if tx.read(&inner.running).contains_key(&t.id()) {
                    return retry();
                }
                match t.join_stm(tx) {
                    Ok(out) => Ok(out.is_ok()),
                    Err(_retry) => Ok(false),
                }
            });
            assert!(filled);
            Ok(())
        })?;
        Ok(())
    }

    #[test]
    fn test_failed_fork_never_fills_its_slot() {
        let out = scoped(&Context::global(), |s| {
            let t = s.fork(|_| -> Outcome<i32> { fail(anyhow!("A")) })?;
            let inner = Arc::clone(&s.inner);

            // Block until the child has left `running`; the commit that
            // removed it also parked the failure and left the slot empty
            // for good.
            atomically(|tx| {
                if tx.read(&inner.running).is_empty() {
                    Ok(())
                } else {
                    retry()
                }
            });
            assert!(!t.is_finished());

            // The parked failure still reaches the owner at its next
            // suspension point.
            s.wait()
        });

        match out.unwrap_err() {
            Fault::ThreadFailed { fault, .. } => assert_eq!(fault.to_string(), "A"),
            other => panic!("expected ThreadFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_closed_scope_bookkeeping_is_drained() {
        let mut stash: Option<Scope> = None;
        scoped(&Context::global(), |s| {
            stash = Some(s.clone());
            s.fork_unit(|_| Ok(()))?;
            s.wait()
        })
        .expect("clean scope");

        let scope = stash.expect("stashed");
        assert!(scope.inner.closed.read_now());
        assert_eq!(scope.inner.starting.read_now(), 0);
        assert!(scope.inner.running.read_now().is_empty());
    }
}
