#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use keel::buffer::{BufferManager, ExclusiveGuard, SharedGuard};
use keel::common::{Config, Pid};
use keel::runtime::FiberRuntime;

pub type Worker = Box<dyn FnOnce(Arc<BufferManager>) + Send>;

/// Builds an engine over `path`, runs `workers` as fibers, and drives the
/// scheduler until the last worker finished.
pub fn run_workers_at(path: &Path, cfg: Config, workers: Vec<Worker>) -> Arc<BufferManager> {
    let rt = FiberRuntime::new();
    let bm = BufferManager::open(cfg, Arc::clone(&rt), path).unwrap();
    bm.start_evictor();

    let stop = Arc::new(AtomicBool::new(false));
    let remaining = Arc::new(AtomicUsize::new(workers.len()));
    for worker in workers {
        let bm = Arc::clone(&bm);
        let stop = Arc::clone(&stop);
        let remaining = Arc::clone(&remaining);
        rt.spawn(move || {
            worker(Arc::clone(&bm));
            if remaining.fetch_sub(1, Ordering::Relaxed) == 1 {
                bm.stop_evictor();
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    {
        let bm = Arc::clone(&bm);
        rt.run(&stop, move || {
            bm.io().flush();
            bm.io().drain();
        });
    }
    bm
}

/// Single-worker engine run over a fresh temporary file, returning the
/// worker's result.
pub fn with_engine<T, F>(cfg: Config, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(Arc<BufferManager>) -> T + Send + 'static,
{
    let file = tempfile::NamedTempFile::new().unwrap();
    with_engine_at(file.path(), cfg, f)
}

/// Single-worker engine run over `path`.
pub fn with_engine_at<T, F>(path: &Path, cfg: Config, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(Arc<BufferManager>) -> T + Send + 'static,
{
    let result: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let out = Arc::clone(&result);
    run_workers_at(
        path,
        cfg,
        vec![Box::new(move |bm| {
            *out.lock().unwrap() = Some(f(bm));
        })],
    );
    let value = result.lock().unwrap().take().unwrap();
    value
}

/// Fixes `pid` shared, going through the restart protocol until it lands.
pub fn fix_shared_loop(bm: &BufferManager, pid: Pid) -> SharedGuard<'_> {
    loop {
        let guard = SharedGuard::fix(bm, pid);
        if guard.retry() {
            drop(guard);
            bm.handle_restart();
            continue;
        }
        return guard;
    }
}

/// Fixes `pid` exclusive, going through the restart protocol.
pub fn fix_exclusive_loop(bm: &BufferManager, pid: Pid) -> ExclusiveGuard<'_> {
    loop {
        let guard = ExclusiveGuard::fix(bm, pid);
        if guard.retry() {
            drop(guard);
            bm.handle_restart();
            continue;
        }
        return guard;
    }
}

/// Allocates a page, going through the restart protocol.
pub fn alloc_loop(bm: &BufferManager) -> ExclusiveGuard<'_> {
    loop {
        let guard = ExclusiveGuard::alloc(bm);
        if guard.retry() {
            drop(guard);
            bm.handle_restart();
            continue;
        }
        return guard;
    }
}
