//! The cancellation tree.
//!
//! A [`Context`] is a node carrying soft-cancellation state. Scopes derive a
//! child context when they open and deregister it when they close; tasks
//! observe cancellation through the context they were handed. Cancellation
//! is pushed *down* the tree when it happens, so the hot path (a task asking
//! "am I cancelled?" or blocking until it is) touches a single local cell.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use crate::error::Outcome;
use crate::stm::{TVar, Tx, atomically, retry};
use crate::task;

/// Identity of one cancellation event.
///
/// A fresh token is minted when a context is first cancelled and is pushed
/// to every descendant, so two tokens compare equal iff they originate from
/// the same event. Honoring a cancellation means raising
/// [`Fault::Cancelled`](crate::Fault::Cancelled) with the token your own
/// context handed you; a token from another subtree is not recognized and
/// propagates as an ordinary failure.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct CancelToken(NonZeroU64);

impl CancelToken {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let token = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Safety: wrapping this counter takes centuries of continuous
        // cancellation; a zero means memory corruption, not wraparound.
        let Some(token) = NonZeroU64::new(token) else {
            Self::exhausted();
        };

        CancelToken(token)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique cancel token: bitspace exhausted")
    }
}

impl fmt::Display for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub(crate) struct CtxNode {
    /// Registration key in the parent's children map.
    key: u64,
    cancel: TVar<Option<CancelToken>>,
    /// Down-links are weak: the parent lists children for push-down
    /// cancellation but does not own their lifetimes.
    children: TVar<HashMap<u64, Weak<CtxNode>>>,
    parent: Option<Weak<CtxNode>>,
}

fn next_key() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A node in the cancellation tree. Cheap to clone; clones share the node.
#[derive(Clone)]
pub struct Context {
    node: Arc<CtxNode>,
}

static GLOBAL: LazyLock<Context> = LazyLock::new(|| Context {
    node: Arc::new(CtxNode {
        key: next_key(),
        cancel: TVar::new(None),
        children: TVar::new(HashMap::new()),
        parent: None,
    }),
});

impl Context {
    /// The root of the tree. Never cancelled.
    pub fn global() -> Context {
        GLOBAL.clone()
    }

    /// Creates a child node, inheriting this node's current cancel state,
    /// and registers it, all in one transaction, so a child can never
    /// observe a cancel state older than its own registration.
    pub(crate) fn derive(&self) -> Context {
        let node = Arc::new(CtxNode {
            key: next_key(),
            cancel: TVar::new(None),
            children: TVar::new(HashMap::new()),
            parent: Some(Arc::downgrade(&self.node)),
        });

        atomically(|tx| {
            let inherited = tx.read(&self.node.cancel);
            tx.write(&node.cancel, inherited);

            let mut children = tx.read(&self.node.children);
            children.insert(node.key, Arc::downgrade(&node));
            tx.write(&self.node.children, children);
            Ok(())
        });

        Context { node }
    }

    /// Cancels this node and its whole subtree with one fresh token.
    ///
    /// Idempotent: an already-cancelled node keeps its token and the call is
    /// a no-op. Descendants cancelled earlier with their own sub-token keep
    /// theirs; everything else in the subtree gets the originating token, in
    /// a single transaction.
    pub(crate) fn cancel(&self) {
        // Minted outside the transaction; an attempt that loses the race or
        // finds the node already cancelled burns the id.
        let token = CancelToken::next();

        let newly = atomically(|tx| {
            if tx.read(&self.node.cancel).is_some() {
                return Ok(false);
            }
            mark_subtree(tx, &self.node, token);
            Ok(true)
        });

        if newly {
            tracing::debug!(%token, "context cancelled");
        }
    }

    /// The token this context was cancelled with, if any. Non-blocking.
    pub fn cancelled(&self) -> Option<CancelToken> {
        self.node.cancel.read_now()
    }

    /// Transactional form of [`cancelled`](Context::cancelled), for
    /// composing with other `_stm` operations.
    pub fn cancelled_stm(&self, tx: &mut Tx) -> Option<CancelToken> {
        tx.read(&self.node.cancel)
    }

    /// Blocks until this context is cancelled, then returns the token.
    pub fn cancel_token(&self) -> Outcome<CancelToken> {
        let cancel = self.node.cancel.clone();
        task::interruptible(|tx| match tx.read(&cancel) {
            Some(token) => Ok(token),
            None => retry(),
        })
    }

    /// Deregisters this node from its parent. Idempotent; called when the
    /// owning scope closes.
    pub(crate) fn remove(&self) {
        let Some(parent) = self.node.parent.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        atomically(|tx| {
            let mut children = tx.read(&parent.children);
            children.remove(&self.node.key);
            tx.write(&parent.children, children);
            Ok(())
        });
    }
}

fn mark_subtree(tx: &mut Tx, node: &Arc<CtxNode>, token: CancelToken) {
    if tx.read(&node.cancel).is_some() {
        // Cancelled earlier with its own token; by the push-down invariant
        // the whole subtree below it already is too.
        return;
    }
    tx.write(&node.cancel, Some(token));

    let children = tx.read(&node.children);
    for child in children.values().filter_map(Weak::upgrade) {
        mark_subtree(tx, &child, token);
    }
}

// Skip parent and children to avoid printing the whole tree.
impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("key", &self.node.key)
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

thread_local! {
    static AMBIENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// The ambient context of the calling thread, if one was established by
/// `implicit::with_global_context`, `implicit::scoped`, or a spawn.
pub(crate) fn ambient() -> Option<Context> {
    AMBIENT.with(|slot| slot.borrow().clone())
}

/// Rebinds the ambient context for the lifetime of the guard.
pub(crate) struct AmbientGuard {
    prior: Option<Context>,
}

pub(crate) fn bind_ambient(ctx: Context) -> AmbientGuard {
    let prior = AMBIENT.with(|slot| slot.borrow_mut().replace(ctx));
    AmbientGuard { prior }
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        AMBIENT.with(|slot| *slot.borrow_mut() = self.prior.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_is_never_cancelled() {
        assert!(Context::global().cancelled().is_none());
    }

    #[test]
    fn test_child_inherits_cancel_state_at_creation() {
        let parent = Context::global().derive();
        let before = parent.derive();
        assert!(before.cancelled().is_none());

        parent.cancel();
        let token = parent.cancelled().expect("parent just cancelled");

        // Born after the cancel: born cancelled, same token.
        let after = parent.derive();
        assert_eq!(after.cancelled(), Some(token));
        // Alive before the cancel: pushed down, same token.
        assert_eq!(before.cancelled(), Some(token));
    }

    #[test]
    fn test_cancel_is_idempotent_and_keeps_first_token() {
        let ctx = Context::global().derive();
        ctx.cancel();
        let first = ctx.cancelled().expect("cancelled");
        ctx.cancel();
        assert_eq!(ctx.cancelled(), Some(first));
    }

    #[test]
    fn test_earlier_subtree_token_is_retained() {
        let parent = Context::global().derive();
        let child = parent.derive();
        let grandchild = child.derive();

        child.cancel();
        let sub_token = child.cancelled().expect("child cancelled");

        parent.cancel();
        let parent_token = parent.cancelled().expect("parent cancelled");
        assert_ne!(sub_token, parent_token);

        // The earlier event owns the inner subtree.
        assert_eq!(child.cancelled(), Some(sub_token));
        assert_eq!(grandchild.cancelled(), Some(sub_token));
    }

    #[test]
    fn test_removed_child_escapes_later_cancel() {
        let parent = Context::global().derive();
        let child = parent.derive();
        child.remove();
        child.remove(); // idempotent

        parent.cancel();
        assert!(child.cancelled().is_none());
    }

    #[test]
    fn test_cancel_token_blocks_then_returns() {
        let ctx = Context::global().derive();
        let waiter = {
            let ctx = ctx.clone();
            std::thread::spawn(move || ctx.cancel_token())
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        ctx.cancel();

        let token = waiter.join().expect("waiter panicked").expect("interrupted");
        assert_eq!(ctx.cancelled(), Some(token));
    }
}
