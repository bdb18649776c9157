use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::stm::{TVar, atomically};

/// An entry in the timer queue: a deadline plus the transactional signal
/// flipped when it is reached.
struct Entry {
    at: Instant,
    fired: TVar<bool>,
}

impl Eq for Entry {}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at.eq(&other.at)
    }
}

impl Ord for Entry {
    /// Reversed so a `BinaryHeap<Entry>` behaves as a min-heap: the earliest
    /// deadline pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TimerShared {
    queue: Mutex<BinaryHeap<Entry>>,
    cv: Condvar,
}

/// One timer thread for the whole process, started on first registration.
static TIMER: LazyLock<Arc<TimerShared>> = LazyLock::new(|| {
    let shared = Arc::new(TimerShared {
        queue: Mutex::new(BinaryHeap::new()),
        cv: Condvar::new(),
    });

    let worker = Arc::clone(&shared);
    std::thread::Builder::new()
        .name("corral-timer".into())
        .spawn(move || run(worker))
        .expect("failed to spawn timer thread");

    shared
});

/// Registers a deadline `timeout` from now and returns the signal that
/// becomes `true` once it elapses. The signal is only ever written by the
/// timer thread, transactionally, so it composes with any `_stm` wait.
pub(crate) fn register(timeout: Duration) -> TVar<bool> {
    if timeout.is_zero() {
        return TVar::new(true);
    }
    // Beyond the representable horizon: a signal that never fires.
    let Some(at) = Instant::now().checked_add(timeout) else {
        return TVar::new(false);
    };

    let fired = TVar::new(false);
    let timer = &*TIMER;
    timer.queue.lock().push(Entry {
        at,
        fired: fired.clone(),
    });
    timer.cv.notify_one();
    fired
}

fn run(timer: Arc<TimerShared>) {
    let mut due: Vec<TVar<bool>> = Vec::new();
    loop {
        {
            let mut queue = timer.queue.lock();
            loop {
                let now = Instant::now();
                let next_at = match queue.peek() {
                    Some(head) if head.at <= now => {
                        let entry = queue.pop().expect("peeked entry is poppable");
                        due.push(entry.fired);
                        continue;
                    }
                    Some(head) => Some(head.at),
                    None => None,
                };

                if !due.is_empty() {
                    break;
                }
                match next_at {
                    Some(at) => {
                        let _timed_out = timer.cv.wait_until(&mut queue, at);
                    }
                    None => timer.cv.wait(&mut queue),
                }
            }
        }

        // Fire outside the queue lock; each write is its own commit.
        for fired in due.drain(..) {
            atomically(|tx| {
                tx.write(&fired, true);
                Ok(())
            });
        }
    }
}
