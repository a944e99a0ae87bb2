mod ready_ring;
mod scheduler;
mod sleeping;

pub use scheduler::{current_fiber, FiberId, FiberRuntime, MAX_FIBERS};
pub use sleeping::SleepingFiber;
