use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

/// A transactional variable.
///
/// A `TVar` holds a single value that can only be mutated from inside a
/// transaction (see [`atomically`](super::atomically)). Clones share the
/// underlying cell; a `TVar` is an `Arc` plus a type tag.
///
/// The stored type must be `Clone` because reads hand out owned values and
/// commits may be re-attempted.
pub struct TVar<T> {
    pub(super) core: Arc<VarCore>,
    _marker: PhantomData<fn(T) -> T>,
}

/// Type-erased cell shared between clones of a `TVar` and transaction logs.
///
/// The committed value is always an `Arc` allocated at write time, so two
/// observations of the same pointer imply no commit happened in between.
pub(super) struct VarCore {
    pub(super) value: Mutex<Arc<dyn Any + Send + Sync>>,
}

impl<T: Clone + Send + Sync + 'static> TVar<T> {
    pub fn new(value: T) -> Self {
        TVar {
            core: Arc::new(VarCore {
                value: Mutex::new(Arc::new(value)),
            }),
            _marker: PhantomData,
        }
    }

    /// Reads the last committed value without entering a transaction.
    ///
    /// Equivalent to `atomically(|tx| Ok(tx.read(self)))` but cheaper; use it
    /// for one-off snapshots where no consistency with other vars is needed.
    pub fn read_now(&self) -> T {
        let value = self.core.value.lock();
        super::downcast::<T>(&value)
    }
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        TVar {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TVar").finish_non_exhaustive()
    }
}
