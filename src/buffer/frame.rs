use parking_lot::{Mutex, RwLock};

use crate::common::{Bid, Pid, PAGE_SIZE};
use crate::runtime::FiberId;

/// Tagged frame descriptor: five flag bits in the low bits, the BID in the
/// remaining high bits.
///
/// - `in_use`: currently fixed by a worker
/// - `dirty`: written since the last successful flush
/// - `evicting`: chosen by the current clock sweep
/// - `io_lock`: an asynchronous read is populating the frame
/// - `marked`: the clock second-chance bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc(u64);

impl FrameDesc {
    const IN_USE: u64 = 1 << 0;
    const DIRTY: u64 = 1 << 1;
    const EVICTING: u64 = 1 << 2;
    const IO_LOCK: u64 = 1 << 3;
    const MARKED: u64 = 1 << 4;
    const SHIFT: u32 = 5;

    pub fn new(bid: Bid) -> Self {
        Self(bid.as_u64() << Self::SHIFT)
    }

    pub fn bid(&self) -> Bid {
        Bid(self.0 >> Self::SHIFT)
    }

    pub fn in_use(&self) -> bool {
        self.0 & Self::IN_USE != 0
    }

    pub fn dirty(&self) -> bool {
        self.0 & Self::DIRTY != 0
    }

    pub fn evicting(&self) -> bool {
        self.0 & Self::EVICTING != 0
    }

    pub fn io_lock(&self) -> bool {
        self.0 & Self::IO_LOCK != 0
    }

    pub fn marked(&self) -> bool {
        self.0 & Self::MARKED != 0
    }

    pub fn set_in_use(&mut self, b: bool) {
        self.set(Self::IN_USE, b)
    }

    pub fn set_dirty(&mut self, b: bool) {
        self.set(Self::DIRTY, b)
    }

    pub fn set_evicting(&mut self, b: bool) {
        self.set(Self::EVICTING, b)
    }

    pub fn set_io_lock(&mut self, b: bool) {
        self.set(Self::IO_LOCK, b)
    }

    pub fn set_marked(&mut self, b: bool) {
        self.set(Self::MARKED, b)
    }

    fn set(&mut self, bit: u64, b: bool) {
        if b {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// Bookkeeping attached to a physical frame: back-pointer to its current
/// PID plus the list of fibers waiting on the in-flight read. The head of
/// the wait list is the fiber that issued the read; later waiters slot in
/// right behind it.
pub struct FrameMeta {
    pub pid: Pid,
    pub waiters: Vec<FiberId>,
}

/// A physical frame: metadata plus the page bytes.
pub struct Frame {
    meta: Mutex<FrameMeta>,
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            meta: Mutex::new(FrameMeta {
                pid: Pid(u64::MAX),
                waiters: Vec::new(),
            }),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn meta(&self) -> &Mutex<FrameMeta> {
        &self.meta
    }

    pub fn data(&self) -> &RwLock<Box<[u8; PAGE_SIZE]>> {
        &self.data
    }

    pub fn pid(&self) -> Pid {
        self.meta.lock().pid
    }

    /// Copies the page image out (used when issuing a write-back).
    pub fn copy_to(&self, out: &mut [u8]) {
        assert_eq!(out.len(), PAGE_SIZE);
        out.copy_from_slice(&self.data.read()[..]);
    }

    /// Copies a freshly read page image in.
    pub fn copy_from(&self, src: &[u8]) {
        assert_eq!(src.len(), PAGE_SIZE);
        self.data.write().copy_from_slice(src);
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}
