use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::{Bid, Config, KeelError, Pid, Result, META_PID, PAGE_SIZE};
use crate::runtime::{current_fiber, FiberRuntime, SleepingFiber};
use crate::storage::disk::{DiskManager, IoEngine, PageBuf};

use super::{Frame, FrameDesc, PageTable};

/// Why the last fix operation returned null. Written by the failing
/// operation, read by `handle_restart`; the last cause sticks around until
/// the next failure, so callers must not enter `handle_restart` without a
/// preceding fix failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    /// PID not resident: fault it in.
    PageFault(Pid),
    /// A read is populating the frame: wait on its wait list.
    WaitIo(Bid),
    /// Free list empty during allocation: yield so the evictor runs.
    Alloc,
}

struct BufState {
    table: PageTable,
    /// Free physical slots, LIFO.
    free: Vec<Bid>,
    next_pid: u64,
    phys_used: u64,
    restart: Option<RestartCause>,
    next_tree_slot: u32,
}

/// The buffer manager: maps PIDs to physical frames, services page faults
/// through the I/O engine, and reclaims frames with a clock-second-chance
/// eviction fiber.
///
/// Workers never block while holding a fix. A fix that cannot complete
/// records a restart cause and returns None; the caller unwinds every guard
/// it holds and calls `handle_restart`, which faults, waits, or yields, and
/// then the caller retries from the top of its traversal.
pub struct BufferManager {
    cfg: Config,
    /// Number of physical frames.
    page_count: u64,
    /// Number of logical pages the backing device can address.
    logical_capacity: u64,
    frames: Vec<Frame>,
    state: Mutex<BufState>,
    io: IoEngine,
    rt: Arc<FiberRuntime>,
    evictor: Mutex<Option<SleepingFiber>>,
    fixes: AtomicU64,
    restarts: AtomicU64,
}

impl BufferManager {
    /// Opens the backing device and builds the manager: frame array, page
    /// table, free list, and the resident metadata page (PID 0 pinned to
    /// frame 0, dirty and marked).
    pub fn open<P: AsRef<Path>>(
        cfg: Config,
        rt: Arc<FiberRuntime>,
        path: P,
    ) -> Result<Arc<Self>> {
        let page_count = cfg.page_count();
        if page_count < 2 {
            return Err(KeelError::InvalidConfig(format!(
                "phys_size holds only {page_count} frames; need at least 2"
            )));
        }
        if cfg.evict_batch == 0 || cfg.concurrency == 0 {
            return Err(KeelError::InvalidConfig(
                "evict_batch and concurrency must be non-zero".into(),
            ));
        }

        let table_size = ((page_count as f64 * cfg.page_table_factor) as usize)
            .max(page_count as usize)
            .next_power_of_two();
        debug!(
            "page_count={} page_table_sz={} ratio={:.2}",
            page_count,
            table_size,
            table_size as f64 / page_count as f64
        );
        let mut table = PageTable::new(table_size);

        let frames: Vec<Frame> = (0..page_count).map(|_| Frame::new()).collect();

        // push free slots in descending order so the first pop gives 1,2,...
        // slot 0 belongs to the metadata page
        let mut free = Vec::with_capacity(page_count as usize);
        for i in (1..page_count).rev() {
            free.push(Bid(i));
        }

        let mut meta_desc = FrameDesc::new(Bid(0));
        meta_desc.set_dirty(true);
        meta_desc.set_marked(true);
        let inserted = table.insert(META_PID.as_u64(), meta_desc);
        assert!(inserted);
        frames[0].meta().lock().pid = META_PID;

        let disk = Arc::new(DiskManager::new(path)?);
        let io = IoEngine::new(disk, Arc::clone(&rt), &cfg);

        Ok(Arc::new(Self {
            logical_capacity: cfg.logical_capacity(),
            page_count,
            frames,
            state: Mutex::new(BufState {
                table,
                free,
                next_pid: 1,
                phys_used: 1,
                restart: None,
                next_tree_slot: 0,
            }),
            io,
            rt,
            cfg,
            evictor: Mutex::new(None),
            fixes: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }))
    }

    /// Spawns the eviction fiber. Call once, before running the scheduler.
    pub fn start_evictor(self: &Arc<Self>) {
        let mut slot = self.evictor.lock();
        assert!(slot.is_none(), "eviction fiber already started");

        let weak = Arc::downgrade(self);
        *slot = Some(SleepingFiber::spawn(Arc::clone(&self.rt), move || {
            let Some(bm) = weak.upgrade() else {
                return true;
            };
            if bm.free_is_low() {
                bm.evict();
                false // check again before parking
            } else {
                true // park
            }
        }));
    }

    /// Asks the eviction fiber to exit; it finishes at its next resumption.
    pub fn stop_evictor(&self) {
        if let Some(evictor) = &*self.evictor.lock() {
            evictor.stop();
        }
    }

    /// Fixes `pid` in shared mode. On success the frame is `in_use|marked`
    /// and its BID is returned. On a miss or an in-flight read, records the
    /// restart cause and returns None.
    pub fn fix_shared(&self, pid: Pid) -> Option<Bid> {
        self.fix(pid, false)
    }

    /// As `fix_shared`, additionally marking the frame dirty.
    pub fn fix_exclusive(&self, pid: Pid) -> Option<Bid> {
        self.fix(pid, true)
    }

    fn fix(&self, pid: Pid, exclusive: bool) -> Option<Bid> {
        self.fixes.fetch_add(1, Ordering::Relaxed);

        enum Hit {
            Miss,
            IoBusy(Bid),
            Fixed(Bid),
        }

        let mut st = self.state.lock();
        let hit = match st.table.find(pid.as_u64()) {
            None => Hit::Miss,
            Some(d) => {
                if d.io_lock() {
                    Hit::IoBusy(d.bid())
                } else {
                    assert!(!d.in_use(), "{pid} is already fixed");
                    d.set_in_use(true);
                    d.set_marked(true);
                    if exclusive {
                        d.set_dirty(true);
                    }
                    Hit::Fixed(d.bid())
                }
            }
        };

        match hit {
            Hit::Miss => {
                self.restarts.fetch_add(1, Ordering::Relaxed);
                st.restart = Some(RestartCause::PageFault(pid));
                None
            }
            Hit::IoBusy(bid) => {
                self.restarts.fetch_add(1, Ordering::Relaxed);
                st.restart = Some(RestartCause::WaitIo(bid));
                None
            }
            Hit::Fixed(bid) => Some(bid),
        }
    }

    pub fn unfix_shared(&self, pid: Pid) {
        let mut st = self.state.lock();
        let d = match st.table.find(pid.as_u64()) {
            Some(d) => d,
            None => panic!("unfix of non-resident {pid}"),
        };
        assert!(d.in_use(), "unfix of unfixed {pid}");
        d.set_in_use(false);
        d.set_marked(true);
    }

    pub fn unfix_exclusive(&self, pid: Pid) {
        let mut st = self.state.lock();
        let d = match st.table.find(pid.as_u64()) {
            Some(d) => d,
            None => panic!("unfix of non-resident {pid}"),
        };
        assert!(d.in_use(), "unfix of unfixed {pid}");
        d.set_in_use(false);
        d.set_dirty(true);
        d.set_marked(true);
        assert!(!d.io_lock());
    }

    /// Allocates and fixes a fresh zeroed page (`dirty|in_use|marked`).
    /// Returns None with an `Alloc` restart cause when no frame is free;
    /// the caller restarts and the evictor makes progress.
    pub fn alloc_page(&self) -> Option<(Pid, Bid)> {
        self.ensure_free_pages();

        let mut st = self.state.lock();
        let bid = match st.free.pop() {
            Some(bid) => bid,
            None => {
                self.restarts.fetch_add(1, Ordering::Relaxed);
                st.restart = Some(RestartCause::Alloc);
                return None;
            }
        };
        st.phys_used += 1;

        let pid = Pid(st.next_pid);
        st.next_pid += 1;
        assert!(
            st.next_pid <= self.logical_capacity,
            "logical address space exhausted"
        );
        debug!("alloc {pid} -> {bid}");

        let mut desc = FrameDesc::new(bid);
        desc.set_dirty(true);
        desc.set_in_use(true);
        desc.set_marked(true);
        let inserted = st.table.insert(pid.as_u64(), desc);
        assert!(inserted);
        drop(st);

        let frame = &self.frames[bid.as_usize()];
        {
            let mut meta = frame.meta().lock();
            meta.pid = pid;
            meta.waiters.clear();
        }
        frame.data().write().fill(0);

        Some((pid, bid))
    }

    /// Dispatches on the recorded restart cause. The caller has already
    /// released every guard it held.
    pub fn handle_restart(&self) {
        let cause = self.state.lock().restart;
        match cause {
            Some(RestartCause::PageFault(pid)) => self.handle_fault(pid),
            Some(RestartCause::WaitIo(bid)) => self.handle_wait(bid),
            Some(RestartCause::Alloc) => {
                self.io.check_submit();
                self.rt.yield_now();
            }
            None => panic!("handle_restart without a recorded restart cause"),
        }
    }

    /// Page-fault path: claim a free frame, install an `io_lock|marked`
    /// descriptor, issue the read, park, and on wake publish the page and
    /// wake every fiber that queued on the frame meanwhile.
    pub fn handle_fault(&self, pid: Pid) {
        self.ensure_free_pages();

        let bid = {
            let mut st = self.state.lock();
            let bid = match st.free.pop() {
                Some(bid) => bid,
                None => {
                    drop(st);
                    debug!("evictor too slow, yielding");
                    self.io.check_submit();
                    self.rt.yield_now();
                    return;
                }
            };
            st.phys_used += 1;

            let mut desc = FrameDesc::new(bid);
            desc.set_io_lock(true);
            desc.set_marked(true);
            let inserted = st.table.insert(pid.as_u64(), desc);
            assert!(inserted, "fault for already-resident {pid}");
            bid
        };
        debug!("fault {pid} -> {bid}");

        let me = match current_fiber() {
            Some(id) => id,
            None => panic!("page fault outside fiber"),
        };
        let frame = &self.frames[bid.as_usize()];
        {
            let mut meta = frame.meta().lock();
            meta.pid = pid;
            meta.waiters.clear();
            meta.waiters.push(me);
        }

        let image: PageBuf = self.io.read_page(pid);
        frame.copy_from(&image[..]);

        let waiters = {
            let mut meta = frame.meta().lock();
            std::mem::take(&mut meta.waiters)
        };
        assert_eq!(waiters.first(), Some(&me), "wait-list head is not the reader");
        for &w in waiters.iter().skip(1) {
            self.rt.wake(w);
        }

        {
            let mut st = self.state.lock();
            let d = match st.table.find(pid.as_u64()) {
                Some(d) => d,
                None => panic!("{pid} vanished during fault"),
            };
            assert!(d.io_lock());
            d.set_io_lock(false);
        }
        debug!("fault done {pid} -> {bid}");
    }

    /// Wait path: queue behind the fiber reading into `bid` and park. The
    /// reader wakes the whole list before clearing `io_lock`.
    pub fn handle_wait(&self, bid: Bid) {
        let me = match current_fiber() {
            Some(id) => id,
            None => panic!("io wait outside fiber"),
        };

        let pid = {
            let mut meta = self.frames[bid.as_usize()].meta().lock();
            assert!(
                !meta.waiters.is_empty(),
                "wait on {bid} with no pending read"
            );
            // keep the io-initiating fiber at the head
            meta.waiters.insert(1, me);
            meta.pid
        };

        {
            let mut st = self.state.lock();
            let d = match st.table.find(pid.as_u64()) {
                Some(d) => d,
                None => panic!("{pid} vanished while waited on"),
            };
            assert!(d.io_lock());
        }

        self.rt.park();
    }

    /// Wakes the eviction fiber when the free list runs low.
    pub fn ensure_free_pages(&self) {
        if self.free_is_low() {
            if let Some(evictor) = &*self.evictor.lock() {
                evictor.wakeup();
            }
        }
    }

    fn free_is_low(&self) -> bool {
        let free_len = self.state.lock().free.len();
        free_len as f64 <= self.page_count as f64 * self.cfg.free_target
    }

    /// One eviction round: sweep the clock hand for victims (second chance
    /// via the mark bit), write dirty victims as one batch, then re-check
    /// and release every victim that stayed clean and unused.
    fn evict(&self) {
        let mut to_write: Vec<(Bid, Pid)> = Vec::with_capacity(self.cfg.evict_batch);
        let mut to_evict: Vec<Bid> = Vec::with_capacity(self.cfg.evict_batch);

        {
            let mut st = self.state.lock();
            let frames = &self.frames;
            let batch = self.cfg.evict_batch;
            st.table.clock_sweep_next(|key, d| {
                let pid = Pid(key);
                let bid = d.bid();
                assert_eq!(
                    frames[bid.as_usize()].pid(),
                    pid,
                    "frame back-pointer mismatch at {bid}"
                );

                if pid == META_PID {
                    return false;
                }
                if d.in_use() || d.io_lock() || d.evicting() {
                    return false;
                }
                // second chance
                if d.marked() {
                    d.set_marked(false);
                    return false;
                }

                d.set_evicting(true);
                if d.dirty() {
                    d.set_dirty(false);
                    to_write.push((bid, pid));
                } else {
                    to_evict.push(bid);
                }
                to_write.len() + to_evict.len() == batch
            });
        }

        if !to_write.is_empty() {
            debug!("evicting: writing {} pages", to_write.len());
            // snapshot the images now; the worker never touches frame memory
            let batch: Vec<(Pid, PageBuf)> = to_write
                .iter()
                .map(|&(bid, pid)| {
                    let mut buf = Box::new([0u8; PAGE_SIZE]);
                    self.frames[bid.as_usize()].copy_to(&mut buf[..]);
                    (pid, buf)
                })
                .collect();
            self.io.write_batch(batch);
        }

        let mut freed = 0;
        {
            let mut st = self.state.lock();
            let written = to_write.iter().map(|&(bid, _)| bid);
            for bid in to_evict.iter().copied().chain(written) {
                let pid = self.frames[bid.as_usize()].pid();
                let keep = {
                    let d = match st.table.find(pid.as_u64()) {
                        Some(d) => d,
                        None => panic!("{pid} vanished while evicting"),
                    };
                    assert!(d.evicting());
                    d.set_evicting(false);
                    if d.in_use() {
                        // re-fixed during the sweep
                        true
                    } else if d.dirty() {
                        // a writer touched it again
                        true
                    } else {
                        assert!(!d.io_lock());
                        false
                    }
                };
                if keep {
                    continue;
                }
                let erased = st.table.erase(pid.as_u64());
                assert!(erased);
                st.free.push(bid);
                freed += 1;
            }
            st.phys_used -= freed;
        }
        debug!("eviction round freed {freed}");
    }

    pub(crate) fn frame(&self, bid: Bid) -> &Frame {
        &self.frames[bid.as_usize()]
    }

    pub(crate) fn take_tree_slot(&self) -> u32 {
        let mut st = self.state.lock();
        let slot = st.next_tree_slot;
        st.next_tree_slot += 1;
        assert!(
            (slot as usize) < PAGE_SIZE / 8,
            "metadata page root directory full"
        );
        slot
    }

    pub fn io(&self) -> &IoEngine {
        &self.io
    }

    pub fn runtime(&self) -> &Arc<FiberRuntime> {
        &self.rt
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn free_frames(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn phys_used(&self) -> u64 {
        self.state.lock().phys_used
    }

    pub fn fixes(&self) -> u64 {
        self.fixes.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn restart_cause(&self) -> Option<RestartCause> {
        self.state.lock().restart
    }
}
