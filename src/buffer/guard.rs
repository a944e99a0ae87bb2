use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{Bid, Pid, PAGE_SIZE};

use super::BufferManager;

/// Scoped shared fix of a page.
///
/// The constructor performs the fix; when it observes a restart condition
/// the guard is empty and `retry` returns true — the caller must release
/// everything it holds and go through `handle_restart`. Dropping a held
/// guard unfixes the page.
pub struct SharedGuard<'a> {
    bm: &'a BufferManager,
    pid: Option<Pid>,
    bid: Bid,
    data: Option<RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>>,
}

impl<'a> SharedGuard<'a> {
    pub fn fix(bm: &'a BufferManager, pid: Pid) -> Self {
        match bm.fix_shared(pid) {
            Some(bid) => Self {
                bm,
                pid: Some(pid),
                bid,
                data: Some(bm.frame(bid).data().read()),
            },
            None => Self {
                bm,
                pid: None,
                bid: Bid(0),
                data: None,
            },
        }
    }

    /// True when the fix observed a restart condition.
    pub fn retry(&self) -> bool {
        self.data.is_none()
    }

    pub fn pid(&self) -> Pid {
        match self.pid {
            Some(pid) => pid,
            None => panic!("pid() on an empty guard"),
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            Some(g) => &g[..],
            None => panic!("access through an empty guard"),
        }
    }

    /// Unfixes early. Idempotent.
    pub fn release(&mut self) {
        if let Some(pid) = self.pid.take() {
            self.data = None;
            self.bm.unfix_shared(pid);
        }
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Scoped exclusive fix of a page. Release marks the page dirty.
pub struct ExclusiveGuard<'a> {
    bm: &'a BufferManager,
    pid: Option<Pid>,
    bid: Bid,
    data: Option<RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>>,
}

impl<'a> ExclusiveGuard<'a> {
    pub fn fix(bm: &'a BufferManager, pid: Pid) -> Self {
        match bm.fix_exclusive(pid) {
            Some(bid) => Self {
                bm,
                pid: Some(pid),
                bid,
                data: Some(bm.frame(bid).data().write()),
            },
            None => Self {
                bm,
                pid: None,
                bid: Bid(0),
                data: None,
            },
        }
    }

    /// Upgrades a held shared guard without re-checking the fix. No other
    /// fiber can run between the lock swap, so the upgrade cannot fail;
    /// release will mark the page dirty.
    pub fn upgrade(mut shared: SharedGuard<'a>) -> Self {
        let pid = match shared.pid.take() {
            Some(pid) => pid,
            None => panic!("upgrade of an empty guard"),
        };
        let bid = shared.bid;
        let bm = shared.bm;
        shared.data = None; // give up the read lock first

        Self {
            bm,
            pid: Some(pid),
            bid,
            data: Some(bm.frame(bid).data().write()),
        }
    }

    /// Allocates a fresh zeroed page and wraps it exclusively. Empty when
    /// the free list is exhausted (`Alloc` restart recorded).
    pub fn alloc(bm: &'a BufferManager) -> Self {
        match bm.alloc_page() {
            Some((pid, bid)) => Self {
                bm,
                pid: Some(pid),
                bid,
                data: Some(bm.frame(bid).data().write()),
            },
            None => Self {
                bm,
                pid: None,
                bid: Bid(0),
                data: None,
            },
        }
    }

    pub fn retry(&self) -> bool {
        self.data.is_none()
    }

    pub fn pid(&self) -> Pid {
        match self.pid {
            Some(pid) => pid,
            None => panic!("pid() on an empty guard"),
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            Some(g) => &g[..],
            None => panic!("access through an empty guard"),
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            Some(g) => &mut g[..],
            None => panic!("access through an empty guard"),
        }
    }

    pub fn release(&mut self) {
        if let Some(pid) = self.pid.take() {
            self.data = None;
            self.bm.unfix_exclusive(pid);
        }
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
