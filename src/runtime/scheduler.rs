use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use super::ready_ring::ReadyRing;

pub type FiberId = usize;

/// Upper bound on the fiber population of one runtime.
pub const MAX_FIBERS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FiberState {
    Ready,
    Running,
    Parked,
    Finished,
}

struct FiberSlot {
    state: Mutex<FiberState>,
    cv: Condvar,
}

thread_local! {
    static CURRENT_FIBER: Cell<Option<FiberId>> = const { Cell::new(None) };
}

/// Returns the id of the fiber executing on this thread, if any.
pub fn current_fiber() -> Option<FiberId> {
    CURRENT_FIBER.with(|c| c.get())
}

/// Cooperative fiber scheduler.
///
/// Fibers are worker threads coordinated by a baton: the scheduler grants
/// one fiber at a time and blocks until that fiber yields, parks, or
/// finishes, so at most one fiber executes at any instant. All shared state
/// therefore keeps single-threaded reasoning; the locks below exist for
/// soundness across the backing threads and are never contended.
///
/// `run` alternates FIFO ready-queue passes with a completion-drain hook and
/// drains the ready queue one final time after the stop flag is observed.
pub struct FiberRuntime {
    fibers: Mutex<Vec<Arc<FiberSlot>>>,
    ready: Mutex<ReadyRing>,
    fibers_run: AtomicU64,
    /// A panic that escaped a fiber, rethrown on the scheduler thread.
    panicked: Mutex<Option<Box<dyn Any + Send>>>,
}

impl FiberRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fibers: Mutex::new(Vec::new()),
            ready: Mutex::new(ReadyRing::new(MAX_FIBERS)),
            fibers_run: AtomicU64::new(0),
            panicked: Mutex::new(None),
        })
    }

    /// Creates a fiber and enqueues it on the ready queue without executing
    /// it. The fiber first runs when the scheduler grants it.
    pub fn spawn<F>(self: &Arc<Self>, f: F) -> FiberId
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = Arc::new(FiberSlot {
            state: Mutex::new(FiberState::Ready),
            cv: Condvar::new(),
        });

        let id = {
            let mut fibers = self.fibers.lock();
            fibers.push(Arc::clone(&slot));
            fibers.len() - 1
        };
        assert!(id < MAX_FIBERS, "fiber population exceeds MAX_FIBERS");
        self.ready.lock().push(id);

        let rt = Arc::clone(self);
        thread::spawn(move || {
            CURRENT_FIBER.with(|c| c.set(Some(id)));

            // cold start: wait for the first grant
            {
                let mut state = slot.state.lock();
                while *state != FiberState::Running {
                    slot.cv.wait(&mut state);
                }
            }

            let outcome = catch_unwind(AssertUnwindSafe(f));
            if let Err(payload) = outcome {
                *rt.panicked.lock() = Some(payload);
            }

            let mut state = slot.state.lock();
            *state = FiberState::Finished;
            slot.cv.notify_all();
        });

        id
    }

    /// Re-enqueues the calling fiber and hops back to the scheduler.
    pub fn yield_now(&self) {
        let id = match current_fiber() {
            Some(id) => id,
            None => panic!("yield_now() outside fiber"),
        };
        let slot = self.slot(id);

        let mut state = slot.state.lock();
        *state = FiberState::Ready;
        self.ready.lock().push(id);
        slot.cv.notify_all();
        while *state != FiberState::Running {
            slot.cv.wait(&mut state);
        }
    }

    /// Suspends the calling fiber without enqueueing it. Resumes only after
    /// `wake` re-enqueues it and the scheduler grants it.
    pub fn park(&self) {
        let id = match current_fiber() {
            Some(id) => id,
            None => panic!("park() outside fiber"),
        };
        let slot = self.slot(id);

        let mut state = slot.state.lock();
        *state = FiberState::Parked;
        slot.cv.notify_all();
        while *state != FiberState::Running {
            slot.cv.wait(&mut state);
        }
    }

    /// Enqueues `id` if it is parked. No-op (returns false) when the fiber
    /// is ready, running, or finished.
    pub fn wake(&self, id: FiberId) -> bool {
        let slot = self.slot(id);
        let mut state = slot.state.lock();
        if *state == FiberState::Parked {
            *state = FiberState::Ready;
            self.ready.lock().push(id);
            true
        } else {
            false
        }
    }

    /// Scheduler loop: resume everything ready, then let `poll` reap I/O
    /// completions, until `stop` is set; then drain the ready queue once.
    pub fn run<P: FnMut()>(&self, stop: &AtomicBool, mut poll: P) {
        while !stop.load(Ordering::Relaxed) {
            let n = self.ready.lock().len();
            for _ in 0..n {
                let id = self.ready.lock().pop();
                match id {
                    Some(id) => self.resume(id),
                    None => break,
                }
            }
            poll();
            if n == 0 {
                thread::yield_now();
            }
        }

        loop {
            let id = self.ready.lock().pop();
            match id {
                Some(id) => self.resume(id),
                None => break,
            }
        }
    }

    /// Number of fiber resumptions performed so far.
    pub fn fibers_run(&self) -> u64 {
        self.fibers_run.load(Ordering::Relaxed)
    }

    fn resume(&self, id: FiberId) {
        let slot = self.slot(id);
        {
            let mut state = slot.state.lock();
            debug_assert_eq!(*state, FiberState::Ready);
            *state = FiberState::Running;
            slot.cv.notify_all();
            while *state == FiberState::Running {
                slot.cv.wait(&mut state);
            }
        }
        self.fibers_run.fetch_add(1, Ordering::Relaxed);

        // a fatal error inside a fiber takes the whole engine down
        if let Some(payload) = self.panicked.lock().take() {
            resume_unwind(payload);
        }
    }

    fn slot(&self, id: FiberId) -> Arc<FiberSlot> {
        Arc::clone(&self.fibers.lock()[id])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn run_to_completion(rt: &Arc<FiberRuntime>, fibers: usize, done: &AtomicUsize) {
        let stop = AtomicBool::new(false);
        rt.run(&stop, || {
            if done.load(Ordering::Relaxed) == fibers {
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    #[test]
    fn test_spawn_runs_in_fifo_order() {
        let rt = FiberRuntime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let log = Arc::clone(&log);
            let done = Arc::clone(&done);
            rt.spawn(move || {
                log.lock().push(i);
                done.fetch_add(1, Ordering::Relaxed);
            });
        }

        run_to_completion(&rt, 3, &done);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(rt.fibers_run(), 3);
    }

    #[test]
    fn test_yield_interleaves_round_robin() {
        let rt = FiberRuntime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        for name in ["a", "b"] {
            let rt2 = Arc::clone(&rt);
            let log = Arc::clone(&log);
            let done = Arc::clone(&done);
            rt.spawn(move || {
                log.lock().push(format!("{name}1"));
                rt2.yield_now();
                log.lock().push(format!("{name}2"));
                done.fetch_add(1, Ordering::Relaxed);
            });
        }

        run_to_completion(&rt, 2, &done);
        assert_eq!(*log.lock(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_park_and_wake() {
        let rt = FiberRuntime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        let a_id = {
            let rt2 = Arc::clone(&rt);
            let log = Arc::clone(&log);
            let done = Arc::clone(&done);
            rt.spawn(move || {
                log.lock().push("a-park");
                rt2.park();
                log.lock().push("a-resume");
                done.fetch_add(1, Ordering::Relaxed);
            })
        };

        {
            let rt2 = Arc::clone(&rt);
            let log = Arc::clone(&log);
            let done = Arc::clone(&done);
            rt.spawn(move || {
                assert!(rt2.wake(a_id));
                log.lock().push("b");
                done.fetch_add(1, Ordering::Relaxed);
            });
        }

        run_to_completion(&rt, 2, &done);
        assert_eq!(*log.lock(), vec!["a-park", "b", "a-resume"]);
    }

    #[test]
    fn test_wake_is_noop_unless_parked() {
        let rt = FiberRuntime::new();
        let done = Arc::new(AtomicUsize::new(0));

        let id = {
            let done = Arc::clone(&done);
            rt.spawn(move || {
                done.fetch_add(1, Ordering::Relaxed);
            })
        };

        run_to_completion(&rt, 1, &done);
        // finished fiber: wake must be a no-op
        assert!(!rt.wake(id));
    }
}
