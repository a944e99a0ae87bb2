use std::collections::HashMap;
use std::io::ErrorKind;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::common::{Config, KeelError, Pid, SubmitMode, PAGE_SIZE};
use crate::runtime::{current_fiber, FiberId, FiberRuntime, MAX_FIBERS};

use super::DiskManager;

/// Owned page-sized buffer travelling between fibers and the I/O worker.
pub type PageBuf = Box<[u8; PAGE_SIZE]>;

pub fn zeroed_page() -> PageBuf {
    Box::new([0u8; PAGE_SIZE])
}

/// Adaptive submission decision, factored out of the engine so the policy
/// is testable without I/O.
///
/// Workers queue submissions in memory; each check bumps `f`, the number of
/// fibers that entered an I/O since the last flush. Flush when every worker
/// has contributed (`f == total_io_fibers`), otherwise with probability
/// `exp(f - q) / exp(total_io_fibers / 4)` where `q` is the queued op
/// count. Single ops submitted eagerly keep tail latency low under light
/// load; batching when many workers are in flight amortises kernel entries.
pub struct SubmitHeuristic {
    total_io_fibers: usize,
    submit_always: bool,
    exp: Vec<f64>,
}

impl SubmitHeuristic {
    pub fn new(total_io_fibers: usize, submit_always: bool) -> Self {
        let exp = (0..=MAX_FIBERS).map(|i| (i as f64).exp()).collect();
        Self {
            total_io_fibers,
            submit_always,
            exp,
        }
    }

    /// `f`: fibers since the first queued op, `q`: queued op count,
    /// `rnd`: uniform draw over `[0, 10^6]`.
    pub fn decide(&self, f: usize, q: usize, rnd: u64) -> bool {
        if self.submit_always {
            return true;
        }
        if f == self.total_io_fibers {
            return true;
        }
        let idx = f.saturating_sub(q).min(MAX_FIBERS);
        let denom = (self.total_io_fibers / 4).min(MAX_FIBERS);
        let prob = (1_000_000.0 * self.exp[idx] / self.exp[denom]) as u64;
        rnd <= prob
    }
}

enum IoRequest {
    Read { op: u64, pid: Pid },
    Write { op: u64, pid: Pid, data: PageBuf },
}

struct Completion {
    op: u64,
    result: Result<Option<PageBuf>, String>,
}

/// Op descriptor: the engine-side analog of the user-data word. Carries the
/// originating fiber, the residual completion count, and the read result.
struct IoOp {
    fiber: FiberId,
    remaining: usize,
    data: Option<PageBuf>,
}

struct EngineState {
    queued: Vec<IoRequest>,
    ops: HashMap<u64, IoOp>,
    next_op: u64,
    fibers_since_first_io: usize,
    outstanding: usize,
    rng: SmallRng,
}

/// Submit/complete interface to the kernel stand-in: a background worker
/// thread owning the disk. One channel send is one kernel entry (the
/// submit counter is the observable for batching behavior). `drain` reaps
/// completions without blocking, decrementing each op's residual count and
/// waking the owning fiber at zero.
pub struct IoEngine {
    disk: Arc<DiskManager>,
    rt: Arc<FiberRuntime>,
    heuristic: SubmitHeuristic,
    sync_variant: bool,
    state: Mutex<EngineState>,
    submit_tx: Sender<Vec<IoRequest>>,
    comp_rx: Receiver<Completion>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    reads: AtomicU64,
    writes: AtomicU64,
    submits: AtomicU64,
}

impl IoEngine {
    pub fn new(disk: Arc<DiskManager>, rt: Arc<FiberRuntime>, cfg: &Config) -> Self {
        let (submit_tx, submit_rx) = bounded::<Vec<IoRequest>>(1024);
        let (comp_tx, comp_rx) = bounded::<Completion>(4096);
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let disk = Arc::clone(&disk);
            let shutdown = Arc::clone(&shutdown);
            let mode = cfg.submit_mode;
            thread::spawn(move || {
                Self::worker_loop(disk, submit_rx, comp_tx, shutdown, mode);
            })
        };

        Self {
            disk,
            rt,
            heuristic: SubmitHeuristic::new(cfg.concurrency, cfg.submit_always),
            sync_variant: cfg.sync_variant,
            state: Mutex::new(EngineState {
                queued: Vec::new(),
                ops: HashMap::new(),
                next_op: 0,
                fibers_since_first_io: 0,
                outstanding: 0,
                rng: SmallRng::seed_from_u64(0x9e37_79b9_7f4a_7c15),
            }),
            submit_tx,
            comp_rx,
            shutdown,
            worker: Some(worker),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            submits: AtomicU64::new(0),
        }
    }

    /// Schedules an asynchronous page read and parks the calling fiber
    /// until the completion arrives. Returns the page image.
    pub fn read_page(&self, pid: Pid) -> PageBuf {
        self.reads.fetch_add(1, Ordering::Relaxed);

        if self.sync_variant {
            let mut buf = zeroed_page();
            if let Err(e) = self.disk.read_page(pid, &mut buf[..]) {
                panic!("page read failed: {pid} {e}");
            }
            return buf;
        }

        let fiber = match current_fiber() {
            Some(id) => id,
            None => panic!("async page read outside fiber"),
        };

        let op = {
            let mut st = self.state.lock();
            let op = st.next_op;
            st.next_op += 1;
            st.ops.insert(
                op,
                IoOp {
                    fiber,
                    remaining: 1,
                    data: None,
                },
            );
            st.queued.push(IoRequest::Read { op, pid });
            st.outstanding += 1;
            self.check_submit_locked(&mut st);
            op
        };

        self.rt.park();

        let mut st = self.state.lock();
        let done = match st.ops.remove(&op) {
            Some(d) => d,
            None => panic!("read op {op} lost its descriptor"),
        };
        match done.data {
            Some(buf) => buf,
            None => panic!("read op {op} completed without data"),
        }
    }

    /// Schedules a batch of page writes as one op, flushes unconditionally
    /// (one kernel entry) and parks until every write completed.
    pub fn write_batch(&self, pages: Vec<(Pid, PageBuf)>) {
        assert!(!pages.is_empty(), "empty write batch");
        self.writes.fetch_add(pages.len() as u64, Ordering::Relaxed);

        if self.sync_variant {
            for (pid, data) in &pages {
                if let Err(e) = self.disk.write_page(*pid, &data[..]) {
                    panic!("page write failed: {pid} {e}");
                }
            }
            return;
        }

        let fiber = match current_fiber() {
            Some(id) => id,
            None => panic!("async page write outside fiber"),
        };

        let op = {
            let mut st = self.state.lock();
            let op = st.next_op;
            st.next_op += 1;
            st.ops.insert(
                op,
                IoOp {
                    fiber,
                    remaining: pages.len(),
                    data: None,
                },
            );
            st.outstanding += pages.len();
            for (pid, data) in pages {
                st.queued.push(IoRequest::Write { op, pid, data });
            }
            self.flush_locked(&mut st);
            op
        };

        self.rt.park();

        let mut st = self.state.lock();
        if st.ops.remove(&op).is_none() {
            panic!("write op {op} lost its descriptor");
        }
    }

    /// Called from worker yield points; may flush queued submissions under
    /// the adaptive heuristic. No-op when nothing is queued.
    pub fn check_submit(&self) {
        let mut st = self.state.lock();
        self.check_submit_locked(&mut st);
    }

    /// Flushes queued submissions unconditionally. The scheduler's poll
    /// hook calls this between ready-queue passes: once every runnable
    /// fiber has had its turn, nothing else would submit the stragglers.
    pub fn flush(&self) {
        let mut st = self.state.lock();
        self.flush_locked(&mut st);
    }

    /// Reaps completions without blocking; wakes each op's fiber once its
    /// residual count reaches zero.
    pub fn drain(&self) {
        loop {
            let c = match self.comp_rx.try_recv() {
                Ok(c) => c,
                Err(_) => return,
            };

            let mut st = self.state.lock();
            st.outstanding -= 1;
            let (fiber, ready) = {
                let op = match st.ops.get_mut(&c.op) {
                    Some(op) => op,
                    None => panic!("completion for unknown op {}", c.op),
                };
                match c.result {
                    Ok(Some(buf)) => op.data = Some(buf),
                    Ok(None) => {}
                    Err(msg) => panic!("disk I/O failed: {msg}"),
                }
                op.remaining -= 1;
                (op.fiber, op.remaining == 0)
            };
            drop(st);

            if ready {
                self.rt.wake(fiber);
            }
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of kernel entries (submission flushes) performed.
    pub fn submits(&self) -> u64 {
        self.submits.load(Ordering::Relaxed)
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    fn check_submit_locked(&self, st: &mut EngineState) {
        if st.queued.is_empty() {
            return;
        }
        st.fibers_since_first_io += 1;
        let rnd = st.rng.gen_range(0..=1_000_000u64);
        if self
            .heuristic
            .decide(st.fibers_since_first_io, st.queued.len(), rnd)
        {
            self.flush_locked(st);
        }
    }

    fn flush_locked(&self, st: &mut EngineState) {
        if st.queued.is_empty() {
            return;
        }
        let batch = mem::take(&mut st.queued);
        st.fibers_since_first_io = 0;
        self.submits.fetch_add(1, Ordering::Relaxed);
        if self.submit_tx.send(batch).is_err() {
            panic!("I/O worker disappeared");
        }
    }

    fn worker_loop(
        disk: Arc<DiskManager>,
        rx: Receiver<Vec<IoRequest>>,
        tx: Sender<Completion>,
        shutdown: Arc<AtomicBool>,
        mode: SubmitMode,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                while let Ok(batch) = rx.try_recv() {
                    Self::process_batch(&disk, batch, &tx);
                }
                break;
            }

            let recvd = match mode {
                SubmitMode::Sqpoll | SubmitMode::Iopoll => match rx.try_recv() {
                    Ok(batch) => Some(batch),
                    Err(TryRecvError::Empty) => {
                        std::hint::spin_loop();
                        None
                    }
                    Err(TryRecvError::Disconnected) => break,
                },
                SubmitMode::Defer | SubmitMode::Coop => {
                    match rx.recv_timeout(Duration::from_millis(10)) {
                        Ok(batch) => Some(batch),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            };

            if let Some(batch) = recvd {
                Self::process_batch(&disk, batch, &tx);
            }
        }
    }

    fn process_batch(disk: &DiskManager, batch: Vec<IoRequest>, tx: &Sender<Completion>) {
        for req in batch {
            let completion = match req {
                IoRequest::Read { op, pid } => {
                    let mut buf = zeroed_page();
                    let result = loop {
                        match disk.read_page(pid, &mut buf[..]) {
                            Ok(()) => break Ok(()),
                            // transient: retry internally
                            Err(KeelError::Io(e)) if e.kind() == ErrorKind::Interrupted => continue,
                            Err(e) => break Err(e.to_string()),
                        }
                    };
                    Completion {
                        op,
                        result: result.map(|()| Some(buf)),
                    }
                }
                IoRequest::Write { op, pid, data } => {
                    let result = loop {
                        match disk.write_page(pid, &data[..]) {
                            Ok(()) => break Ok(None),
                            Err(KeelError::Io(e)) if e.kind() == ErrorKind::Interrupted => continue,
                            Err(e) => break Err(e.to_string()),
                        }
                    };
                    Completion { op, result }
                }
            };

            if tx.send(completion).is_err() {
                return;
            }
        }
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_all_present_fast_path() {
        let h = SubmitHeuristic::new(8, false);
        // every worker contributed: submit regardless of the draw
        assert!(h.decide(8, 8, 1_000_000));
        assert!(h.decide(8, 1, 0));
    }

    #[test]
    fn test_heuristic_holds_back_below_all_present() {
        let h = SubmitHeuristic::new(8, false);
        // f == q: probability is exp(0)/exp(2), far below a max draw
        assert!(!h.decide(7, 7, 1_000_000));
        assert!(!h.decide(1, 1, 1_000_000));
        // a tiny draw still submits
        assert!(h.decide(1, 1, 0));
    }

    #[test]
    fn test_heuristic_decays_with_queue_gap() {
        let h = SubmitHeuristic::new(8, false);
        // large f - q saturates the ratio: submit even on a mid draw
        assert!(h.decide(7, 2, 200_000));
        // f - q == 0 rejects the same draw
        assert!(!h.decide(5, 5, 200_000));
    }

    #[test]
    fn test_heuristic_submit_always() {
        let h = SubmitHeuristic::new(8, true);
        assert!(h.decide(1, 1, 1_000_000));
        assert!(h.decide(0, 5, 1_000_000));
    }
}
