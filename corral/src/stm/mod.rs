//! Software transactional memory.
//!
//! All shared bookkeeping in this crate (scope state, cancellation trees,
//! result slots, interrupt cells) lives in [`TVar`]s and is mutated only
//! inside [`atomically`] blocks. Transactions compose: [`retry`] abandons the
//! current attempt and blocks until one of the vars it read changes, and
//! [`or_else`] tries an alternative branch when the first one retries.
//!
//! The engine keeps a per-attempt log: reads are validated by pointer
//! identity at commit time under a global commit lock, writes are buffered
//! and applied on a successful commit. An attempt may observe values from
//! different commits while it runs; such an attempt can never commit, so
//! torn state is never published. Transaction bodies must therefore be pure
//! apart from `Tx` operations; they can run any number of times.

use std::any::Any;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

mod tvar;
pub use tvar::TVar;
use tvar::VarCore;

/// Marker signalling that the current attempt cannot proceed.
#[derive(Debug, Clone, Copy)]
pub struct Retry;

/// What a transaction body returns: a value, or a request to block.
pub type StmResult<T> = std::result::Result<T, Retry>;

/// Abandons the current attempt; the transaction blocks until one of the
/// vars read so far changes, then re-runs.
pub fn retry<T>() -> StmResult<T> {
    Err(Retry)
}

/// Serializes commits and read-set validation. The counter bumps on every
/// write commit so blocked transactions can wait for "anything changed".
static COMMIT: Mutex<u64> = Mutex::new(0);
static WAKEUP: Condvar = Condvar::new();

/// A transaction log handed to the body of [`atomically`].
pub struct Tx {
    reads: Vec<(Arc<VarCore>, Arc<dyn Any + Send + Sync>)>,
    writes: Vec<(Arc<VarCore>, Arc<dyn Any + Send + Sync>)>,
}

impl Tx {
    fn new() -> Self {
        Tx {
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Reads a var inside the transaction.
    ///
    /// Re-reads of the same var within one attempt are stable: the first
    /// observation wins, writes made by this attempt are visible.
    pub fn read<T: Clone + Send + Sync + 'static>(&mut self, var: &TVar<T>) -> T {
        for (core, value) in self.writes.iter().rev() {
            if Arc::ptr_eq(core, &var.core) {
                return downcast::<T>(value);
            }
        }
        for (core, value) in &self.reads {
            if Arc::ptr_eq(core, &var.core) {
                return downcast::<T>(value);
            }
        }

        let value = Arc::clone(&*var.core.value.lock());
        self.reads.push((Arc::clone(&var.core), Arc::clone(&value)));
        downcast::<T>(&value)
    }

    /// Buffers a write; it becomes visible to other transactions only if
    /// this attempt commits.
    pub fn write<T: Clone + Send + Sync + 'static>(&mut self, var: &TVar<T>, value: T) {
        self.writes.push((Arc::clone(&var.core), Arc::new(value)));
    }

    fn validate(&self) -> bool {
        self.reads
            .iter()
            .all(|(core, seen)| Arc::ptr_eq(&*core.value.lock(), seen))
    }

    fn commit(mut self) -> bool {
        let mut generation = COMMIT.lock();
        if !self.validate() {
            return false;
        }

        if !self.writes.is_empty() {
            // Later writes to the same var overwrite earlier ones.
            for (core, value) in self.writes.drain(..) {
                *core.value.lock() = value;
            }
            *generation = generation.wrapping_add(1);
            WAKEUP.notify_all();
        }
        true
    }

    fn block(self) {
        assert!(
            !self.reads.is_empty(),
            "transaction retried without reading any var; it would block forever"
        );

        let mut generation = COMMIT.lock();
        while self.validate() {
            WAKEUP.wait(&mut generation);
        }
    }
}

/// Runs a transaction to completion, blocking on [`retry`].
///
/// The body may run any number of times; only one attempt's writes are ever
/// published.
pub fn atomically<T>(mut body: impl FnMut(&mut Tx) -> StmResult<T>) -> T {
    loop {
        let mut tx = Tx::new();
        match body(&mut tx) {
            Ok(value) => {
                if tx.commit() {
                    return value;
                }
            }
            Err(Retry) => tx.block(),
        }
    }
}

/// Tries `first`; if it retries, rolls its writes back and tries `second`.
///
/// The read set of the abandoned branch is kept, so a blocked transaction
/// wakes when *either* branch could make progress.
pub fn or_else<T>(
    tx: &mut Tx,
    first: impl FnOnce(&mut Tx) -> StmResult<T>,
    second: impl FnOnce(&mut Tx) -> StmResult<T>,
) -> StmResult<T> {
    let mark = tx.writes.len();
    match first(tx) {
        Err(Retry) => {
            tx.writes.truncate(mark);
            second(tx)
        }
        done => done,
    }
}

fn downcast<T: Clone + 'static>(value: &Arc<dyn Any + Send + Sync>) -> T {
    // Safety: a VarCore is only ever written through a TVar<T> of one T.
    value
        .downcast_ref::<T>()
        .expect("TVar holds a value of a different type")
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_read_write_roundtrip() {
        let var = TVar::new(41);
        let seen = atomically(|tx| {
            let n = tx.read(&var);
            tx.write(&var, n + 1);
            Ok(tx.read(&var))
        });
        assert_eq!(seen, 42);
        assert_eq!(var.read_now(), 42);
    }

    #[test]
    fn test_concurrent_increments_do_not_lose_updates() -> Result<()> {
        let var = TVar::new(0_u32);
        let threads = 8_u32;
        let per_thread = 200_u32;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let var = var.clone();
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        atomically(|tx| {
                            let n = tx.read(&var);
                            tx.write(&var, n + 1);
                            Ok(())
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
        }

        assert_eq!(var.read_now(), threads * per_thread);
        Ok(())
    }

    #[test]
    fn test_retry_blocks_until_var_changes() -> Result<()> {
        let flag = TVar::new(false);

        let writer = {
            let flag = flag.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                atomically(|tx| {
                    tx.write(&flag, true);
                    Ok(())
                });
            })
        };

        atomically(|tx| if tx.read(&flag) { Ok(()) } else { retry() });

        writer.join().map_err(|_| anyhow::anyhow!("writer panicked"))?;
        Ok(())
    }

    #[test]
    fn test_or_else_rolls_back_first_branch_writes() {
        let var = TVar::new(1);
        let other = TVar::new("untouched");

        let picked = atomically(|tx| {
            or_else(
                tx,
                |tx| {
                    tx.write(&other, "scribbled");
                    retry()
                },
                |tx| Ok(tx.read(&var)),
            )
        });

        assert_eq!(picked, 1);
        assert_eq!(other.read_now(), "untouched");
    }

    #[test]
    fn test_or_else_first_branch_wins_when_ready() {
        let var = TVar::new(10);
        let n = atomically(|tx| or_else(tx, |tx| Ok(tx.read(&var)), |_| Ok(0)));
        assert_eq!(n, 10);
    }

    #[test]
    #[should_panic(expected = "without reading any var")]
    fn test_retry_with_empty_read_set_panics() {
        atomically(|_| -> StmResult<()> { retry() });
    }
}
