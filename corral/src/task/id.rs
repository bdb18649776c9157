use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque ID that uniquely identifies a spawned task.
///
/// IDs are minted from a global counter and are strictly increasing in spawn
/// order, so handles of siblings sort in the order their spawns were
/// admitted. An ID is never reused for the lifetime of the process.
///
/// The ID of the current task is available via
/// [`task::current_id`](crate::task::current_id); the ID of a spawned task
/// via [`ThreadHandle::id`](crate::task::ThreadHandle::id).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskId(NonZeroU64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Safety: even at a billion spawns per second this counter takes
        // centuries to wrap, so a zero here means something else broke.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        TaskId(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_and_increasing() {
        let ids: Vec<TaskId> = (0..64).map(|_| TaskId::next()).collect();

        let unique: HashSet<TaskId> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());

        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
