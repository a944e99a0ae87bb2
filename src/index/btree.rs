use std::sync::Arc;

use log::trace;

use crate::buffer::{BufferManager, ExclusiveGuard, SharedGuard};
use crate::common::{Pid, META_PID, PAGE_SIZE};

use super::node::{Node, NodeMut, MAX_KV_SIZE, UNDER_FULL_SIZE};

/// The metadata page: a directory of B-tree root PIDs, indexed by the slot
/// id handed out at tree creation.
pub struct MetaView<'a> {
    data: &'a [u8],
}

impl<'a> MetaView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn root(&self, slot: u32) -> Pid {
        let off = slot as usize * 8;
        Pid(u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap()))
    }
}

pub struct MetaViewMut<'a> {
    data: &'a mut [u8],
}

impl<'a> MetaViewMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn set_root(&mut self, slot: u32, pid: Pid) {
        let off = slot as usize * 8;
        self.data[off..off + 8].copy_from_slice(&pid.as_u64().to_le_bytes());
    }
}

/// Outcome of one traversal attempt. `Restart` unwinds to the caller's
/// retry loop which goes through `handle_restart`; `Again` retries from the
/// root without it (the attempt made progress, e.g. a split).
enum Step<T> {
    Done(T),
    Again,
    Restart,
}

/// Latch-coupled B-tree over the buffer manager. Every traversal holds at
/// most a parent/child pair of fixes and never suspends while holding one:
/// a fix that cannot complete empties the guard, the attempt unwinds, and
/// the operation retries from the root after `handle_restart`.
pub struct BTree {
    bm: Arc<BufferManager>,
    slot: u32,
    /// Split leaves near the tail instead of the middle (ordered inserts).
    pub split_ordered: bool,
}

impl BTree {
    /// Allocates a root leaf and registers it in the metadata page.
    /// Must run inside a fiber.
    pub fn create(bm: Arc<BufferManager>) -> Self {
        let slot = bm.take_tree_slot();
        loop {
            let created = {
                let mut meta = ExclusiveGuard::fix(&bm, META_PID);
                if meta.retry() {
                    false
                } else {
                    let mut root = ExclusiveGuard::alloc(&bm);
                    if root.retry() {
                        false
                    } else {
                        NodeMut::new(root.data_mut()).init(true);
                        MetaViewMut::new(meta.data_mut()).set_root(slot, root.pid());
                        true
                    }
                }
            };
            if created {
                return Self {
                    bm,
                    slot,
                    split_ordered: false,
                };
            }
            bm.handle_restart();
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Point lookup; invokes `f` on the payload under the shared fix.
    pub fn lookup<T, F: FnOnce(&[u8]) -> T>(&self, key: &[u8], f: F) -> Option<T> {
        let node = self.find_leaf(key, false);
        let v = Node::new(node.data());
        let (pos, found) = v.lower_bound(key);
        if !found {
            return None;
        }
        Some(f(v.payload(pos)))
    }

    /// In-place payload update under an exclusive fix. The payload length
    /// cannot change; use remove + insert for that.
    pub fn update_in_place<F: FnOnce(&mut [u8])>(&self, key: &[u8], f: F) -> bool {
        let node = self.find_leaf(key, false);
        let (pos, found) = Node::new(node.data()).lower_bound(key);
        if !found {
            return false;
        }
        let mut locked = ExclusiveGuard::upgrade(node);
        let mut nm = NodeMut::new(locked.data_mut());
        f(nm.payload_mut(pos));
        true
    }

    /// Inserts `key`/`payload`; an existing key is updated. May split, and
    /// split propagation can grow a new root through the metadata page.
    pub fn insert(&self, key: &[u8], payload: &[u8]) {
        assert!(
            key.len() + payload.len() <= MAX_KV_SIZE,
            "key/payload too large for a node"
        );
        loop {
            match self.try_insert(key, payload) {
                Step::Done(()) => return,
                Step::Again => continue,
                Step::Restart => self.bm.handle_restart(),
            }
        }
    }

    /// Removes `key`, merging an underfull leaf into its right sibling when
    /// possible. Returns false when the key was not present.
    pub fn remove(&self, key: &[u8]) -> bool {
        loop {
            match self.try_remove(key) {
                Step::Done(hit) => return hit,
                Step::Again => continue,
                Step::Restart => self.bm.handle_restart(),
            }
        }
    }

    /// Ascending scan from `key`. To avoid coupling across leaves the scan
    /// copies the upper fence, releases the leaf, and re-descends from the
    /// root with an upper-bound search. `f` returning false stops the scan.
    pub fn scan_asc<F: FnMut(&[u8], &[u8]) -> bool>(&self, key: &[u8], mut f: F) {
        let mut node = self.find_leaf(key, false);
        let mut pos = Node::new(node.data()).lower_bound(key).0;
        let mut full_key = Vec::new();

        loop {
            let fence = {
                let v = Node::new(node.data());
                while pos < v.count() {
                    v.write_full_key(pos, &mut full_key);
                    if !f(&full_key, v.payload(pos)) {
                        return;
                    }
                    pos += 1;
                }
                if !v.has_right_neighbour() {
                    return;
                }
                v.upper_fence().to_vec()
            };
            drop(node);
            node = self.find_leaf(&fence, true);
            pos = 0;
        }
    }

    /// Descending scan from the greatest key <= `key`. Re-descends through
    /// the lower fence.
    pub fn scan_desc<F: FnMut(&[u8], &[u8]) -> bool>(&self, key: &[u8], mut f: F) {
        let mut node = self.find_leaf(key, false);
        let (p, exact) = Node::new(node.data()).lower_bound(key);
        let mut pos: isize = if exact { p as isize } else { p as isize - 1 };
        let mut full_key = Vec::new();

        loop {
            let fence = {
                let v = Node::new(node.data());
                while pos >= 0 {
                    let s = pos as usize;
                    v.write_full_key(s, &mut full_key);
                    if !f(&full_key, v.payload(s)) {
                        return;
                    }
                    pos -= 1;
                }
                if !v.has_lower_fence() {
                    return;
                }
                v.lower_fence().to_vec()
            };
            drop(node);
            node = self.find_leaf(&fence, false);
            pos = Node::new(node.data()).count() as isize - 1;
        }
    }

    /// Descends to the leaf for `key`, looping through `handle_restart` on
    /// any fault along the way. `upper` selects upper-bound routing (used
    /// by scans hopping over an inclusive fence).
    fn find_leaf(&self, key: &[u8], upper: bool) -> SharedGuard<'_> {
        loop {
            match self.try_find_leaf(key, upper) {
                Some(guard) => return guard,
                None => self.bm.handle_restart(),
            }
        }
    }

    fn try_find_leaf(&self, key: &[u8], upper: bool) -> Option<SharedGuard<'_>> {
        let bm = self.bm.as_ref();

        let mut meta = SharedGuard::fix(bm, META_PID);
        if meta.retry() {
            return None;
        }
        let root = MetaView::new(meta.data()).root(self.slot);
        let mut node = SharedGuard::fix(bm, root);
        if node.retry() {
            return None;
        }
        meta.release();

        loop {
            let (is_leaf, child) = {
                let v = Node::new(node.data());
                if v.is_leaf() {
                    (true, Pid(0))
                } else {
                    let child = if upper {
                        v.lookup_inner_upper(key)
                    } else {
                        v.lookup_inner(key)
                    };
                    (false, child)
                }
            };
            if is_leaf {
                return Some(node);
            }
            node = SharedGuard::fix(bm, child);
            if node.retry() {
                return None;
            }
        }
    }

    fn try_insert(&self, key: &[u8], payload: &[u8]) -> Step<()> {
        let bm = self.bm.as_ref();

        let mut parent = SharedGuard::fix(bm, META_PID);
        if parent.retry() {
            return Step::Restart;
        }
        let root = MetaView::new(parent.data()).root(self.slot);
        let mut node = SharedGuard::fix(bm, root);
        if node.retry() {
            return Step::Restart;
        }

        loop {
            let is_leaf = Node::new(node.data()).is_leaf();
            if is_leaf {
                break;
            }
            parent = node;
            let child = Node::new(parent.data()).lookup_inner(key);
            node = SharedGuard::fix(bm, child);
            if node.retry() {
                return Step::Restart;
            }
        }

        if Node::new(node.data()).has_space_for(key.len(), payload.len()) {
            // only lock the leaf
            let mut locked = ExclusiveGuard::upgrade(node);
            drop(parent);
            NodeMut::new(locked.data_mut()).upsert_in_page(key, payload);
            return Step::Done(());
        }

        // lock parent and leaf, split, and restart from the root
        let parent_locked = ExclusiveGuard::upgrade(parent);
        let node_locked = ExclusiveGuard::upgrade(node);
        match self.try_split(node_locked, parent_locked) {
            Step::Restart => Step::Restart,
            _ => Step::Again,
        }
    }

    /// Splits `node`. When the parent is the metadata page a new inner
    /// root is allocated and spliced in first. When the parent cannot hold
    /// the separator, everything is released and the parent is split
    /// through `ensure_space`.
    fn try_split<'a>(
        &'a self,
        node: ExclusiveGuard<'a>,
        parent: ExclusiveGuard<'a>,
    ) -> Step<()> {
        let mut node = node;
        let mut parent = parent;

        if parent.pid() == META_PID {
            let mut new_root = ExclusiveGuard::alloc(self.bm.as_ref());
            if new_root.retry() {
                return Step::Restart;
            }
            {
                let mut nm = NodeMut::new(new_root.data_mut());
                nm.init(false);
                nm.set_upper_inner(node.pid());
            }
            MetaViewMut::new(parent.data_mut()).set_root(self.slot, new_root.pid());
            parent = new_root;
        }

        let (sep, sep_slot) = {
            let v = Node::new(node.data());
            let info = v.find_separator(self.split_ordered);
            let mut sep = vec![0u8; info.len];
            v.write_separator(&mut sep, info);
            (sep, info.slot)
        };

        if Node::new(parent.data()).has_space_for(sep.len(), 8) {
            return self.split_node(&mut node, &mut parent, sep_slot, &sep);
        }

        // the parent must be split first; release everything and restart
        // from the root to do it
        let to_split = parent.pid();
        drop(node);
        drop(parent);
        self.ensure_space(to_split, &sep);
        Step::Done(())
    }

    fn split_node(
        &self,
        node: &mut ExclusiveGuard,
        parent: &mut ExclusiveGuard,
        sep_slot: usize,
        sep: &[u8],
    ) -> Step<()> {
        let mut right = ExclusiveGuard::alloc(self.bm.as_ref());
        if right.retry() {
            return Step::Restart;
        }
        let left_pid = node.pid();
        let right_pid = right.pid();
        trace!("split {left_pid} -> {right_pid}");

        let mut left_buf = [0u8; PAGE_SIZE];
        {
            let v = Node::new(node.data());
            let is_leaf = v.is_leaf();
            let lower = v.lower_fence().to_vec();
            let upper = v.upper_fence().to_vec();

            let mut left = NodeMut::new(&mut left_buf);
            left.init(is_leaf);
            left.set_fences(&lower, sep);

            let mut rnode = NodeMut::new(right.data_mut());
            rnode.init(is_leaf);
            rnode.set_fences(sep, &upper);

            // point the parent's entry for this subtree at the right half
            let (old_slot, at_upper) = {
                let pv = Node::new(parent.data());
                let (old_slot, _) = pv.lower_bound(sep);
                if old_slot == pv.count() {
                    assert_eq!(pv.upper_inner(), left_pid);
                    (old_slot, true)
                } else {
                    assert_eq!(pv.child(old_slot), left_pid);
                    (old_slot, false)
                }
            };
            if at_upper {
                NodeMut::new(parent.data_mut()).set_upper_inner(right_pid);
            } else {
                NodeMut::new(parent.data_mut())
                    .payload_mut(old_slot)
                    .copy_from_slice(&right_pid.as_u64().to_le_bytes());
            }
            NodeMut::new(parent.data_mut())
                .insert_in_page(sep, &left_pid.as_u64().to_le_bytes());

            if is_leaf {
                v.copy_range_to(&mut left, 0, 0, sep_slot + 1);
                let left_count = left.view().count();
                v.copy_range_to(&mut rnode, 0, left_count, v.count() - left_count);
                left.set_next_leaf(right_pid);
                rnode.set_next_raw(v.next_raw());
            } else {
                // the separator moves up: count == 1 + left + right
                v.copy_range_to(&mut left, 0, 0, sep_slot);
                let left_count = left.view().count();
                v.copy_range_to(&mut rnode, 0, left_count + 1, v.count() - left_count - 1);
                left.set_upper_inner(v.child(left_count));
                rnode.set_next_raw(v.next_raw());
            }
            left.make_hint();
            rnode.make_hint();
        }
        node.data_mut().copy_from_slice(&left_buf);
        Step::Done(())
    }

    /// Walks down to the node `to_split` (identified by PID) and splits it
    /// so it can hold `key` plus a child pointer. Loops internally.
    fn ensure_space(&self, to_split: Pid, key: &[u8]) {
        loop {
            match self.try_ensure_space(to_split, key) {
                Step::Done(()) => return,
                Step::Again => continue,
                Step::Restart => self.bm.handle_restart(),
            }
        }
    }

    fn try_ensure_space(&self, to_split: Pid, key: &[u8]) -> Step<()> {
        let bm = self.bm.as_ref();

        let mut parent = SharedGuard::fix(bm, META_PID);
        if parent.retry() {
            return Step::Restart;
        }
        let root = MetaView::new(parent.data()).root(self.slot);
        let mut node = SharedGuard::fix(bm, root);
        if node.retry() {
            return Step::Restart;
        }

        while Node::new(node.data()).is_inner() && node.pid() != to_split {
            parent = node;
            let child = Node::new(parent.data()).lookup_inner(key);
            node = SharedGuard::fix(bm, child);
            if node.retry() {
                return Step::Restart;
            }
        }

        if node.pid() == to_split {
            if Node::new(node.data()).has_space_for(key.len(), 8) {
                // someone else split it during the restart window
                return Step::Done(());
            }
            let parent_locked = ExclusiveGuard::upgrade(parent);
            let node_locked = ExclusiveGuard::upgrade(node);
            return match self.try_split(node_locked, parent_locked) {
                Step::Restart => Step::Restart,
                _ => Step::Done(()),
            };
        }
        Step::Done(())
    }

    fn try_remove(&self, key: &[u8]) -> Step<bool> {
        let bm = self.bm.as_ref();

        let mut parent = SharedGuard::fix(bm, META_PID);
        if parent.retry() {
            return Step::Restart;
        }
        let root = MetaView::new(parent.data()).root(self.slot);
        let mut node = SharedGuard::fix(bm, root);
        if node.retry() {
            return Step::Restart;
        }

        let mut pos = 0usize;
        loop {
            let (is_leaf, next_pid, p) = {
                let v = Node::new(node.data());
                if v.is_leaf() {
                    (true, Pid(0), 0)
                } else {
                    let (p, _) = v.lower_bound(key);
                    let next = if p == v.count() {
                        v.upper_inner()
                    } else {
                        v.child(p)
                    };
                    (false, next, p)
                }
            };
            if is_leaf {
                break;
            }
            pos = p;
            parent = node;
            node = SharedGuard::fix(bm, next_pid);
            if node.retry() {
                return Step::Restart;
            }
        }

        let (slot, found) = Node::new(node.data()).lower_bound(key);
        if !found {
            return Step::Done(false);
        }

        let merge_path = {
            let v = Node::new(node.data());
            let entry = v.key_len(slot) + v.payload_len(slot);
            let parent_is_meta = parent.pid() == META_PID;
            let parent_count = if parent_is_meta {
                0
            } else {
                Node::new(parent.data()).count()
            };
            v.free_space_after_compaction() + entry >= UNDER_FULL_SIZE
                && !parent_is_meta
                && parent_count >= 2
                && pos + 1 < parent_count
        };

        if merge_path {
            // underfull and a right sibling exists
            let mut parent_locked = ExclusiveGuard::upgrade(parent);
            let mut node_locked = ExclusiveGuard::upgrade(node);
            let right_pid = Node::new(parent_locked.data()).child(pos + 1);
            let right_locked = ExclusiveGuard::fix(bm, right_pid);
            if right_locked.retry() {
                return Step::Restart;
            }
            NodeMut::new(node_locked.data_mut()).remove_slot(slot);
            if Node::new(right_locked.data()).free_space_after_compaction()
                >= PAGE_SIZE - UNDER_FULL_SIZE
            {
                let left_pid = node_locked.pid();
                let mut parent_nm = NodeMut::new(parent_locked.data_mut());
                let mut node_nm = NodeMut::new(node_locked.data_mut());
                // the emptied right page stays allocated for the evictor;
                // its PID is simply unreferenced from here on
                node_nm.merge_from_right(
                    left_pid,
                    pos,
                    &mut parent_nm,
                    Node::new(right_locked.data()),
                );
            }
            Step::Done(true)
        } else {
            let mut node_locked = ExclusiveGuard::upgrade(node);
            drop(parent);
            NodeMut::new(node_locked.data_mut()).remove_slot(slot);
            Step::Done(true)
        }
    }
}
