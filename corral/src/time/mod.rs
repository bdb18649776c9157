//! Bounded waiting: a monotonic timer, transactional timeouts, and
//! cancellation-aware sleep.
//!
//! Timeouts never interrupt anything: they race a deadline signal against
//! the awaited condition inside one transaction and run whichever branch
//! wins. The loser's effects never commit.

use std::time::Duration;

use crate::context::Context;
use crate::error::{Fault, Outcome};
use crate::stm::{StmResult, Tx, atomically, or_else, retry};
use crate::task;

pub(crate) mod timer;

/// Races the transactional `action` against a deadline.
///
/// If `action` commits within `timeout`, its value is returned; otherwise
/// `on_timeout` runs. The race is won exactly once.
///
/// ```
/// use std::time::Duration;
/// use corral::stm::{TVar, retry};
///
/// let ready = TVar::new(false);
/// let out = corral::time::timeout_stm(
///     Duration::from_millis(10),
///     |tx| if tx.read(&ready) { Ok("done") } else { retry() },
///     || "timed out",
/// );
/// assert_eq!(out, "timed out");
/// ```
pub fn timeout_stm<T>(
    timeout: Duration,
    mut action: impl FnMut(&mut Tx) -> StmResult<T>,
    on_timeout: impl FnOnce() -> T,
) -> T {
    let fired = timer::register(timeout);

    enum Winner<T> {
        Done(T),
        Elapsed,
    }

    let winner = atomically(|tx| {
        or_else(
            tx,
            |tx| action(tx).map(Winner::Done),
            |tx| {
                if tx.read(&fired) {
                    Ok(Winner::Elapsed)
                } else {
                    retry()
                }
            },
        )
    });

    match winner {
        Winner::Done(value) => value,
        Winner::Elapsed => on_timeout(),
    }
}

/// Blocks until `duration` elapses or `ctx` is cancelled, whichever comes
/// first. Cancellation wins ties and raises its token as
/// [`Fault::Cancelled`].
pub fn sleep(ctx: &Context, duration: Duration) -> Outcome<()> {
    let fired = timer::register(duration);
    task::interruptible(|tx| {
        or_else(
            tx,
            |tx| match ctx.cancelled_stm(tx) {
                Some(token) => Ok(Err(Fault::Cancelled(token))),
                None => retry(),
            },
            |tx| {
                if tx.read(&fired) {
                    Ok(Ok(()))
                } else {
                    retry()
                }
            },
        )
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_sleep_elapses() {
        let ctx = Context::global().derive();
        let start = Instant::now();
        sleep(&ctx, Duration::from_millis(20)).expect("uncancelled sleep");
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_sleep_wakes_on_cancel_with_token() {
        let ctx = Context::global().derive();
        let canceller = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                ctx.cancel();
            })
        };

        let start = Instant::now();
        let out = sleep(&ctx, Duration::from_secs(3600));
        assert!(start.elapsed() < Duration::from_secs(10));

        let token = ctx.cancelled().expect("cancelled");
        assert!(matches!(out, Err(Fault::Cancelled(t)) if t == token));

        canceller.join().expect("canceller panicked");
    }

    #[test]
    fn test_timeout_stm_action_wins_when_ready() {
        let out = timeout_stm(Duration::from_secs(3600), |_| Ok(7), || 0);
        assert_eq!(out, 7);
    }
}
