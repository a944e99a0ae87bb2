use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{FiberId, FiberRuntime};

/// A long-lived fiber that parks until signalled.
///
/// The fiber runs `loop_fn` until the stop flag is set; whenever `loop_fn`
/// returns true the fiber parks. `wakeup` enqueues it iff it is currently
/// sleeping, tracked by the `running` flag: the flag flips to false strictly
/// before the park and back to true on wakeup, and since no other fiber
/// executes between the flip and the park, a wakeup can never be lost.
///
/// Used for the eviction fiber.
pub struct SleepingFiber {
    rt: Arc<FiberRuntime>,
    id: FiberId,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl SleepingFiber {
    /// Spawns the fiber. `loop_fn` returns true to park, false to run again.
    pub fn spawn<F>(rt: Arc<FiberRuntime>, mut loop_fn: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        let id = {
            let rt = Arc::clone(&rt);
            let stop = Arc::clone(&stop);
            let running = Arc::clone(&running);
            rt.clone().spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if loop_fn() {
                        running.store(false, Ordering::Relaxed);
                        rt.park();
                    }
                }
            })
        };

        Self {
            rt,
            id,
            stop,
            running,
        }
    }

    /// Enqueues the fiber if it is sleeping; no-op while it runs.
    pub fn wakeup(&self) {
        if self.running.load(Ordering::Relaxed) {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        self.rt.wake(self.id);
    }

    /// Asks the fiber to exit its loop at the next resumption.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_sleeping_fiber_parks_and_wakes() {
        let rt = FiberRuntime::new();
        let rounds = Arc::new(AtomicUsize::new(0));

        let sleeper = {
            let rounds = Arc::clone(&rounds);
            SleepingFiber::spawn(Arc::clone(&rt), move || {
                rounds.fetch_add(1, Ordering::Relaxed);
                true // park after each round
            })
        };

        // driver fiber pokes the sleeper twice
        let done = Arc::new(AtomicBool::new(false));
        {
            let rt2 = Arc::clone(&rt);
            let done = Arc::clone(&done);
            let sleeper_id = sleeper.id;
            let running = Arc::clone(&sleeper.running);
            rt.spawn(move || {
                // first round ran at spawn; wake for two more
                for _ in 0..2 {
                    if !running.load(Ordering::Relaxed) {
                        running.store(true, Ordering::Relaxed);
                        rt2.wake(sleeper_id);
                    }
                    rt2.yield_now();
                }
                done.store(true, Ordering::Relaxed);
            });
        }

        let stop = AtomicBool::new(false);
        rt.run(&stop, || {
            if done.load(Ordering::Relaxed) {
                stop.store(true, Ordering::Relaxed);
            }
        });

        sleeper.stop();
        assert!(rounds.load(Ordering::Relaxed) >= 2);
    }
}
