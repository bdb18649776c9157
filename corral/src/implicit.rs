//! The ambient-context façade.
//!
//! The core API threads [`Context`] explicitly. This module carries it in a
//! thread-local binding instead: [`with_global_context`] seeds it at the
//! program edge, [`scoped`] rebinds it for the body, and every spawned task
//! is seeded with its scope's context, so task closures take no context
//! argument and read the ambient one through [`cancelled`], [`sleep`], and
//! friends.
//!
//! Both façades share one semantics; mixing them is fine.
//!
//! Calling any of these without an ambient context is a programmer error
//! and panics.

use std::time::Duration;

use crate::context::{self, CancelToken, Context};
use crate::error::Outcome;
use crate::scope::{Scope, scoped as scoped_explicit};
use crate::task::{ThreadHandle, Unmask};

/// Seeds the ambient context with the global root for the duration of
/// `body`. Call once at the edge of the program (or test).
pub fn with_global_context<R>(body: impl FnOnce() -> R) -> R {
    let _ambient = context::bind_ambient(Context::global());
    body()
}

fn ambient() -> Context {
    context::ambient().expect(
        "no ambient context on this thread: wrap the program in \
         implicit::with_global_context, or spawn through a scope",
    )
}

/// [`corral::scoped`](crate::scoped) against the ambient context; the body
/// runs with the new scope's context bound.
pub fn scoped<T>(body: impl FnOnce(&Scope) -> Outcome<T>) -> Outcome<T> {
    let parent = ambient();
    scoped_explicit(&parent, |scope| {
        let _ambient = context::bind_ambient(scope.context().clone());
        body(scope)
    })
}

/// The ambient context's cancel token, if it has been cancelled.
pub fn cancelled() -> Option<CancelToken> {
    ambient().cancelled()
}

/// Blocks until the ambient context is cancelled.
pub fn cancel_token() -> Outcome<CancelToken> {
    ambient().cancel_token()
}

/// [`time::sleep`](crate::time::sleep) against the ambient context.
pub fn sleep(duration: Duration) -> Outcome<()> {
    crate::time::sleep(&ambient(), duration)
}

/// [`Scope::fork`] with a context-less closure.
pub fn fork<T>(
    scope: &Scope,
    task: impl FnOnce() -> Outcome<T> + Send + 'static,
) -> Outcome<ThreadHandle<T>>
where
    T: Clone + Send + Sync + 'static,
{
    scope.fork(move |_| task())
}

/// [`Scope::fork_unit`] with a context-less closure.
pub fn fork_unit(scope: &Scope, task: impl FnOnce() -> Outcome<()> + Send + 'static) -> Outcome<()> {
    scope.fork_unit(move |_| task())
}

/// [`Scope::fork_with_unmask`] with a context-less closure.
pub fn fork_with_unmask<T>(
    scope: &Scope,
    task: impl FnOnce(&Unmask) -> Outcome<T> + Send + 'static,
) -> Outcome<ThreadHandle<T>>
where
    T: Clone + Send + Sync + 'static,
{
    scope.fork_with_unmask(move |_, unmask| task(unmask))
}

/// [`Scope::fork_unit_with_unmask`] with a context-less closure.
pub fn fork_unit_with_unmask(
    scope: &Scope,
    task: impl FnOnce(&Unmask) -> Outcome<()> + Send + 'static,
) -> Outcome<()> {
    scope.fork_unit_with_unmask(move |_, unmask| task(unmask))
}

/// [`Scope::fork_try`] with a context-less closure.
pub fn fork_try<T, E>(
    scope: &Scope,
    task: impl FnOnce() -> Outcome<T> + Send + 'static,
) -> Outcome<ThreadHandle<std::result::Result<T, E>>>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
{
    scope.fork_try(move |_| task())
}

/// [`Scope::fork_catch`] with a context-less closure.
pub fn fork_catch<T>(
    scope: &Scope,
    task: impl FnOnce() -> Outcome<T> + Send + 'static,
) -> Outcome<ThreadHandle<T>>
where
    T: Clone + Send + Sync + 'static,
{
    scope.fork_catch(move |_| task())
}

/// [`Scope::fork_catch_with_unmask`] with a context-less closure.
pub fn fork_catch_with_unmask<T>(
    scope: &Scope,
    task: impl FnOnce(&Unmask) -> Outcome<T> + Send + 'static,
) -> Outcome<ThreadHandle<T>>
where
    T: Clone + Send + Sync + 'static,
{
    scope.fork_catch_with_unmask(move |_, unmask| task(unmask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambient_flows_into_children() {
        with_global_context(|| {
            assert!(cancelled().is_none());

            let out = scoped(|s| {
                let t = fork(s, || {
                    // Spawned tasks are seeded with their scope's context.
                    Ok(cancelled().is_none())
                })?;
                t.join()
            });
            assert_eq!(out.unwrap(), true);
        });
    }

    #[test]
    fn test_cancel_visible_through_ambient() {
        with_global_context(|| {
            let out = scoped(|s| {
                s.cancel();
                let t = fork(s, || Ok(cancelled()))?;
                t.join()
            });
            assert!(out.unwrap().is_some());
        });
    }

    #[test]
    #[should_panic(expected = "no ambient context")]
    fn test_unseeded_thread_panics() {
        let _ = cancelled();
    }
}
