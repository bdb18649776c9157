//! Cancellation across the scope/context tree: inheritance, push-down
//! wakeups, and honoring semantics.

use std::time::{Duration, Instant};

use anyhow::Result;

use corral::{Context, Outcome, scoped, sleep};

#[test]
fn test_nested_scope_inherits_cancellation_token() {
    let out: Outcome<()> = scoped(&Context::global(), |outer| {
        outer.cancel();
        let token = outer.cancelled().expect("just cancelled");

        scoped(outer.context(), |inner| {
            // Born cancelled with the originating token, not rebranded.
            assert_eq!(inner.cancelled(), Some(token));
            Ok(())
        })
    });
    out.expect("no failures involved");
}

#[test]
fn test_cancel_wakes_blocked_descendants() -> Result<()> {
    let out = scoped(&Context::global(), |s| {
        let t = s.fork(|ctx| ctx.cancel_token())?;

        std::thread::sleep(Duration::from_millis(20));
        s.cancel();

        let token = t.join()?;
        assert_eq!(Some(token), s.cancelled());
        Ok(())
    });
    out?;
    Ok(())
}

#[test]
fn test_cancel_reaches_grandchildren() -> Result<()> {
    let out = scoped(&Context::global(), |s| {
        let t = s.fork(|ctx| {
            // A nested scope derived inside the child: still in the subtree.
            scoped(&ctx, |nested| {
                let inner = nested.fork(|ctx| ctx.cancel_token())?;
                inner.join()
            })
        })?;

        std::thread::sleep(Duration::from_millis(20));
        s.cancel();

        let token = t.join()?;
        assert_eq!(Some(token), s.cancelled());
        Ok(())
    });
    out?;
    Ok(())
}

#[test]
fn test_sleep_in_child_honors_cancel() {
    let start = Instant::now();
    let out: Outcome<()> = scoped(&Context::global(), |s| {
        s.fork_unit(|ctx| {
            // Returning the raised token is the honoring pattern; the scope
            // recognizes its own token and discards the unwind.
            sleep(&ctx, Duration::from_secs(3600))
        })?;

        std::thread::sleep(Duration::from_millis(20));
        s.cancel();
        s.wait()
    });

    assert!(out.is_ok(), "got {out:?}");
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_cancel_before_spawn_marks_children_at_birth() -> Result<()> {
    let out = scoped(&Context::global(), |s| {
        s.cancel();
        let token = s.cancelled().expect("cancelled");

        let t = s.fork(move |ctx| Ok(ctx.cancelled() == Some(token)))?;
        t.join()
    });
    assert!(out?);
    Ok(())
}

#[test]
fn test_sibling_scopes_cancel_independently() {
    let out: Outcome<()> = scoped(&Context::global(), |parent| {
        let ctx = parent.context();

        scoped(ctx, |left| {
            left.cancel();
            Ok(())
        })?;

        scoped(ctx, |right| {
            // The sibling's cancel never reached us.
            assert!(right.cancelled().is_none());
            Ok(())
        })
    });
    out.expect("independent siblings");
}
