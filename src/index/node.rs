use crate::common::{Pid, PAGE_SIZE};

// Node layout (4 KiB): header, slot directory growing from the front, heap
// (key/payload bytes plus fence keys) growing from the back.
//
//   0   next_leaf (leaf) / upper_inner (inner)    u64
//   8   lower fence offset / len                  u16 x2   (exclusive)
//  12   upper fence offset / len                  u16 x2   (inclusive)
//  16   count                                     u16
//  18   is_leaf                                   u8
//  20   space_used                                u16
//  22   data_offset                               u16
//  24   prefix_len                                u16
//  28   hint[16]                                  u32 x16
//  96   slot directory
//
// Slots: (offset u16, key_len u16, payload_len u16, head4 u32). Stored keys
// are suffixes after the common fence prefix; head4 holds the first up to
// four suffix bytes big-endian for cheap comparisons.

pub const HEADER_SIZE: usize = 96;
pub const SLOT_SIZE: usize = 10;
pub const HINT_COUNT: usize = 16;
pub const NO_NEIGHBOUR: u64 = u64::MAX;

/// Nodes whose freeable space reaches this are underfull and merge.
pub const UNDER_FULL_SIZE: usize = PAGE_SIZE / 2 + PAGE_SIZE / 4;

/// Largest key+payload a caller may insert: a freshly split leaf must be
/// able to hold one maximal entry next to its fences.
pub const MAX_KV_SIZE: usize = PAGE_SIZE - HEADER_SIZE - 2 * SLOT_SIZE - 64;

const OFF_NEXT: usize = 0;
const OFF_LOWER_OFF: usize = 8;
const OFF_LOWER_LEN: usize = 10;
const OFF_UPPER_OFF: usize = 12;
const OFF_UPPER_LEN: usize = 14;
const OFF_COUNT: usize = 16;
const OFF_IS_LEAF: usize = 18;
const OFF_SPACE_USED: usize = 20;
const OFF_DATA_OFFSET: usize = 22;
const OFF_PREFIX_LEN: usize = 24;
const OFF_HINT: usize = 28;

fn get_u16(d: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(d[off..off + 2].try_into().unwrap())
}

fn get_u32(d: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(d[off..off + 4].try_into().unwrap())
}

fn get_u64(d: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(d[off..off + 8].try_into().unwrap())
}

fn put_u16(d: &mut [u8], off: usize, v: u16) {
    d[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(d: &mut [u8], off: usize, v: u32) {
    d[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(d: &mut [u8], off: usize, v: u64) {
    d[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// First up to four bytes of a key suffix, big-endian, zero padded.
pub fn head4(key: &[u8]) -> u32 {
    match key.len() {
        0 => 0,
        1 => (key[0] as u32) << 24,
        2 => (u16::from_be_bytes([key[0], key[1]]) as u32) << 16,
        3 => ((u16::from_be_bytes([key[0], key[1]]) as u32) << 16) | ((key[2] as u32) << 8),
        _ => u32::from_be_bytes([key[0], key[1], key[2], key[3]]),
    }
}

/// Where to split a node, see `Node::find_separator`. When `truncated`, the
/// separator takes `len` bytes from slot+1 instead of the full slot key.
#[derive(Debug, Clone, Copy)]
pub struct SeparatorInfo {
    pub len: usize,
    pub slot: usize,
    pub truncated: bool,
}

/// Read-only view over a node page.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    data: &'a [u8],
}

impl<'a> Node<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn count(&self) -> usize {
        get_u16(self.data, OFF_COUNT) as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.data[OFF_IS_LEAF] == 1
    }

    pub fn is_inner(&self) -> bool {
        !self.is_leaf()
    }

    pub fn next_raw(&self) -> u64 {
        get_u64(self.data, OFF_NEXT)
    }

    /// Leaf: right neighbour in the leaf chain.
    pub fn has_right_neighbour(&self) -> bool {
        self.next_raw() != NO_NEIGHBOUR
    }

    pub fn next_leaf(&self) -> Pid {
        Pid(self.next_raw())
    }

    /// Inner: child for keys above every separator.
    pub fn upper_inner(&self) -> Pid {
        Pid(self.next_raw())
    }

    pub fn lower_fence(&self) -> &'a [u8] {
        let off = get_u16(self.data, OFF_LOWER_OFF) as usize;
        let len = get_u16(self.data, OFF_LOWER_LEN) as usize;
        &self.data[off..off + len]
    }

    pub fn upper_fence(&self) -> &'a [u8] {
        let off = get_u16(self.data, OFF_UPPER_OFF) as usize;
        let len = get_u16(self.data, OFF_UPPER_LEN) as usize;
        &self.data[off..off + len]
    }

    pub fn has_lower_fence(&self) -> bool {
        get_u16(self.data, OFF_LOWER_LEN) != 0
    }

    pub fn prefix_len(&self) -> usize {
        get_u16(self.data, OFF_PREFIX_LEN) as usize
    }

    /// The common prefix bytes (shared by every key on the page).
    pub fn prefix(&self) -> &'a [u8] {
        let off = get_u16(self.data, OFF_LOWER_OFF) as usize;
        &self.data[off..off + self.prefix_len()]
    }

    pub fn space_used(&self) -> usize {
        get_u16(self.data, OFF_SPACE_USED) as usize
    }

    pub fn data_offset(&self) -> usize {
        get_u16(self.data, OFF_DATA_OFFSET) as usize
    }

    fn slot_base(&self, slot: usize) -> usize {
        HEADER_SIZE + slot * SLOT_SIZE
    }

    pub fn slot_offset(&self, slot: usize) -> usize {
        get_u16(self.data, self.slot_base(slot)) as usize
    }

    pub fn key_len(&self, slot: usize) -> usize {
        get_u16(self.data, self.slot_base(slot) + 2) as usize
    }

    pub fn payload_len(&self, slot: usize) -> usize {
        get_u16(self.data, self.slot_base(slot) + 4) as usize
    }

    pub fn head(&self, slot: usize) -> u32 {
        get_u32(self.data, self.slot_base(slot) + 6)
    }

    fn hint(&self, i: usize) -> u32 {
        get_u32(self.data, OFF_HINT + i * 4)
    }

    /// Key suffix stored at `slot` (without the common prefix).
    pub fn key(&self, slot: usize) -> &'a [u8] {
        let off = self.slot_offset(slot);
        &self.data[off..off + self.key_len(slot)]
    }

    pub fn payload(&self, slot: usize) -> &'a [u8] {
        let off = self.slot_offset(slot) + self.key_len(slot);
        &self.data[off..off + self.payload_len(slot)]
    }

    /// Reassembles the full key (prefix + suffix) into `out`.
    pub fn write_full_key(&self, slot: usize, out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(self.prefix());
        out.extend_from_slice(self.key(slot));
    }

    /// Inner nodes store child PIDs as 8-byte payloads.
    pub fn child(&self, slot: usize) -> Pid {
        let p = self.payload(slot);
        Pid(u64::from_le_bytes(p[..8].try_into().unwrap()))
    }

    pub fn free_space(&self) -> usize {
        self.data_offset() - (HEADER_SIZE + self.count() * SLOT_SIZE)
    }

    pub fn free_space_after_compaction(&self) -> usize {
        PAGE_SIZE - (HEADER_SIZE + self.count() * SLOT_SIZE) - self.space_used()
    }

    pub fn space_needed(&self, key_len: usize, payload_len: usize) -> usize {
        assert!(key_len >= self.prefix_len());
        SLOT_SIZE + (key_len - self.prefix_len()) + payload_len
    }

    pub fn has_space_for(&self, key_len: usize, payload_len: usize) -> bool {
        self.space_needed(key_len, payload_len) <= self.free_space_after_compaction()
    }

    fn search_hint(&self, key_head: u32, lower: &mut usize, upper: &mut usize) {
        if self.count() > HINT_COUNT * 2 {
            let dist = *upper / (HINT_COUNT + 1);
            let mut pos = 0;
            while pos < HINT_COUNT {
                if self.hint(pos) >= key_head {
                    break;
                }
                pos += 1;
            }
            let mut pos2 = pos;
            while pos2 < HINT_COUNT {
                if self.hint(pos2) != key_head {
                    break;
                }
                pos2 += 1;
            }
            *lower = pos * dist;
            if pos2 < HINT_COUNT {
                *upper = (pos2 + 1) * dist;
            }
        }
    }

    /// First slot with key >= `skey`, plus whether it matches exactly.
    pub fn lower_bound(&self, skey: &[u8]) -> (usize, bool) {
        use std::cmp::Ordering;

        let prefix = self.prefix();
        let n = skey.len().min(prefix.len());
        match skey[..n].cmp(&prefix[..n]) {
            Ordering::Less => return (0, false),
            Ordering::Greater => return (self.count(), false),
            Ordering::Equal => {}
        }
        if skey.len() < prefix.len() {
            return (0, false);
        }
        let key = &skey[prefix.len()..];
        let key_head = head4(key);

        let mut lower = 0;
        let mut upper = self.count();
        self.search_hint(key_head, &mut lower, &mut upper);

        while lower < upper {
            let mid = (upper - lower) / 2 + lower;
            let mid_head = self.head(mid);
            if key_head < mid_head {
                upper = mid;
            } else if key_head > mid_head {
                lower = mid + 1;
            } else {
                match key.cmp(self.key(mid)) {
                    Ordering::Less => upper = mid,
                    Ordering::Greater => lower = mid + 1,
                    Ordering::Equal => return (mid, true),
                }
            }
        }
        (lower, false)
    }

    /// First slot with key > `skey`.
    pub fn upper_bound(&self, skey: &[u8]) -> usize {
        use std::cmp::Ordering;

        let prefix = self.prefix();
        let n = skey.len().min(prefix.len());
        match skey[..n].cmp(&prefix[..n]) {
            Ordering::Less => return 0,
            Ordering::Greater => return self.count(),
            Ordering::Equal => {}
        }
        if skey.len() < prefix.len() {
            return 0;
        }
        let key = &skey[prefix.len()..];
        let key_head = head4(key);

        let mut lower = 0;
        let mut upper = self.count();
        self.search_hint(key_head, &mut lower, &mut upper);

        while lower < upper {
            let mid = (upper - lower) / 2 + lower;
            let mid_head = self.head(mid);
            if key_head < mid_head {
                upper = mid;
            } else if key_head > mid_head {
                lower = mid + 1;
            } else {
                match key.cmp(self.key(mid)) {
                    Ordering::Less => upper = mid,
                    Ordering::Greater | Ordering::Equal => lower = mid + 1,
                }
            }
        }
        lower
    }

    pub fn lookup_inner(&self, key: &[u8]) -> Pid {
        let (pos, _) = self.lower_bound(key);
        if pos == self.count() {
            self.upper_inner()
        } else {
            self.child(pos)
        }
    }

    pub fn lookup_inner_upper(&self, key: &[u8]) -> Pid {
        let pos = self.upper_bound(key);
        if pos == self.count() {
            self.upper_inner()
        } else {
            self.child(pos)
        }
    }

    pub fn common_prefix(&self, slot_a: usize, slot_b: usize) -> usize {
        assert!(slot_a < self.count());
        let a = self.key(slot_a);
        let b = self.key(slot_b);
        let limit = a.len().min(b.len());
        let mut i = 0;
        while i < limit && a[i] == b[i] {
            i += 1;
        }
        i
    }

    /// Separator choice. Inner nodes split in the middle. Leaves split near
    /// the tail for ordered inserts, otherwise a window near the middle is
    /// scanned for the boundary maximising common-prefix savings; the
    /// separator is truncated to one byte past the boundary's common prefix
    /// when that shortens it.
    pub fn find_separator(&self, split_ordered: bool) -> SeparatorInfo {
        let count = self.count();
        assert!(count >= 1);

        if count == 1 {
            // near-page-sized entries split around the only slot
            return SeparatorInfo {
                len: self.prefix_len() + self.key_len(0),
                slot: 0,
                truncated: false,
            };
        }

        if self.is_inner() {
            let slot = count / 2;
            return SeparatorInfo {
                len: self.prefix_len() + self.key_len(slot),
                slot,
                truncated: false,
            };
        }

        let best_slot = if split_ordered {
            count - 2
        } else if count > 16 {
            let lower = count / 2 - count / 16;
            let upper = count / 2;

            let best_prefix_len = self.common_prefix(lower, 0);
            let mut best = lower;
            if best_prefix_len != self.common_prefix(upper - 1, 0) {
                best = lower + 1;
                while best < upper && self.common_prefix(best, 0) == best_prefix_len {
                    best += 1;
                }
            }
            best
        } else {
            (count - 1) / 2
        };

        let common = self.common_prefix(best_slot, best_slot + 1);
        if best_slot + 1 < count
            && self.key_len(best_slot) > common
            && self.key_len(best_slot + 1) > common + 1
        {
            return SeparatorInfo {
                len: self.prefix_len() + common + 1,
                slot: best_slot,
                truncated: true,
            };
        }

        SeparatorInfo {
            len: self.prefix_len() + self.key_len(best_slot),
            slot: best_slot,
            truncated: false,
        }
    }

    pub fn write_separator(&self, out: &mut [u8], info: SeparatorInfo) {
        assert_eq!(out.len(), info.len);
        let prefix_len = self.prefix_len();
        out[..prefix_len].copy_from_slice(self.prefix());
        let src = self.key(info.slot + info.truncated as usize);
        out[prefix_len..].copy_from_slice(&src[..info.len - prefix_len]);
    }

    /// Copies `n` slots into `dst`, re-cutting key suffixes for the
    /// destination's prefix.
    pub fn copy_range_to(&self, dst: &mut NodeMut, dst_slot: usize, src_slot: usize, n: usize) {
        let src_prefix = self.prefix_len();
        let dst_prefix = dst.view().prefix_len();

        if src_prefix <= dst_prefix {
            // the prefix grows: strip extra leading bytes from each suffix
            let diff = dst_prefix - src_prefix;
            for i in 0..n {
                let key_len = self.key_len(src_slot + i);
                let payload_len = self.payload_len(src_slot + i);
                assert!(key_len >= diff);
                let new_key_len = key_len - diff;
                let space = new_key_len + payload_len;

                let off = dst.view().data_offset() - space;
                dst.set_data_offset(off);
                dst.add_space_used(space);

                let src_off = self.slot_offset(src_slot + i) + diff;
                dst.data[off..off + space]
                    .copy_from_slice(&self.data[src_off..src_off + space]);
                let head = head4(&self.data[src_off..src_off + new_key_len]);
                dst.set_slot(dst_slot + i, off, new_key_len, payload_len, head);
            }
        } else {
            let mut full = Vec::new();
            for i in 0..n {
                full.clear();
                full.extend_from_slice(self.prefix());
                full.extend_from_slice(self.key(src_slot + i));
                dst.store_key_value(dst_slot + i, &full, self.payload(src_slot + i));
            }
        }

        let new_count = dst.view().count() + n;
        dst.set_count(new_count);
        assert!(dst.view().data_offset() >= HEADER_SIZE + new_count * SLOT_SIZE);
    }
}

/// Mutable view over a node page.
pub struct NodeMut<'a> {
    data: &'a mut [u8],
}

impl<'a> NodeMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn view(&self) -> Node<'_> {
        Node::new(self.data)
    }

    pub fn init(&mut self, is_leaf: bool) {
        self.data.fill(0);
        self.data[OFF_IS_LEAF] = is_leaf as u8;
        self.set_next_raw(NO_NEIGHBOUR);
        self.set_data_offset(PAGE_SIZE);
    }

    pub fn set_next_raw(&mut self, v: u64) {
        put_u64(self.data, OFF_NEXT, v);
    }

    pub fn set_next_leaf(&mut self, pid: Pid) {
        self.set_next_raw(pid.as_u64());
    }

    pub fn set_upper_inner(&mut self, pid: Pid) {
        self.set_next_raw(pid.as_u64());
    }

    fn set_count(&mut self, v: usize) {
        put_u16(self.data, OFF_COUNT, v as u16);
    }

    fn set_data_offset(&mut self, v: usize) {
        put_u16(self.data, OFF_DATA_OFFSET, v as u16);
    }

    fn add_space_used(&mut self, v: usize) {
        let used = get_u16(self.data, OFF_SPACE_USED) as usize + v;
        put_u16(self.data, OFF_SPACE_USED, used as u16);
    }

    fn sub_space_used(&mut self, v: usize) {
        let used = get_u16(self.data, OFF_SPACE_USED) as usize - v;
        put_u16(self.data, OFF_SPACE_USED, used as u16);
    }

    fn set_prefix_len(&mut self, v: usize) {
        put_u16(self.data, OFF_PREFIX_LEN, v as u16);
    }

    fn set_hint(&mut self, i: usize, v: u32) {
        put_u32(self.data, OFF_HINT + i * 4, v);
    }

    fn set_slot(&mut self, slot: usize, offset: usize, key_len: usize, payload_len: usize, head: u32) {
        let base = HEADER_SIZE + slot * SLOT_SIZE;
        put_u16(self.data, base, offset as u16);
        put_u16(self.data, base + 2, key_len as u16);
        put_u16(self.data, base + 4, payload_len as u16);
        put_u32(self.data, base + 6, head);
    }

    pub fn payload_mut(&mut self, slot: usize) -> &mut [u8] {
        let v = self.view();
        let off = v.slot_offset(slot) + v.key_len(slot);
        let len = v.payload_len(slot);
        &mut self.data[off..off + len]
    }

    fn insert_fence(&mut self, lower: bool, key: &[u8]) {
        assert!(self.view().free_space() >= key.len());
        let off = self.view().data_offset() - key.len();
        self.set_data_offset(off);
        self.add_space_used(key.len());
        if lower {
            put_u16(self.data, OFF_LOWER_OFF, off as u16);
            put_u16(self.data, OFF_LOWER_LEN, key.len() as u16);
        } else {
            put_u16(self.data, OFF_UPPER_OFF, off as u16);
            put_u16(self.data, OFF_UPPER_LEN, key.len() as u16);
        }
        self.data[off..off + key.len()].copy_from_slice(key);
    }

    pub fn set_fences(&mut self, lower: &[u8], upper: &[u8]) {
        self.insert_fence(true, lower);
        self.insert_fence(false, upper);
        let mut p = 0;
        while p < lower.len().min(upper.len()) && lower[p] == upper[p] {
            p += 1;
        }
        self.set_prefix_len(p);
    }

    /// Raw store into `slot` (the directory entry must already be vacant).
    pub fn store_key_value(&mut self, slot: usize, skey: &[u8], payload: &[u8]) {
        let prefix_len = self.view().prefix_len();
        assert!(skey.len() >= prefix_len);
        let key = &skey[prefix_len..];

        let space = key.len() + payload.len();
        let off = self.view().data_offset() - space;
        self.set_data_offset(off);
        self.add_space_used(space);

        self.data[off..off + key.len()].copy_from_slice(key);
        self.data[off + key.len()..off + space].copy_from_slice(payload);
        self.set_slot(slot, off, key.len(), payload.len(), head4(key));
    }

    /// Sorted insert at the lower-bound slot.
    pub fn insert_in_page(&mut self, key: &[u8], payload: &[u8]) {
        let needed = self.view().space_needed(key.len(), payload.len());
        if needed > self.view().free_space() {
            assert!(needed <= self.view().free_space_after_compaction());
            self.compactify();
        }

        let (slot, _) = self.view().lower_bound(key);
        let count = self.view().count();
        let start = HEADER_SIZE + slot * SLOT_SIZE;
        let end = HEADER_SIZE + count * SLOT_SIZE;
        self.data.copy_within(start..end, start + SLOT_SIZE);
        self.store_key_value(slot, key, payload);
        self.set_count(count + 1);
        self.update_hint(slot);
    }

    /// Leaf insert where an exact-match key is replaced (a second insert of
    /// a key is an update).
    pub fn upsert_in_page(&mut self, key: &[u8], payload: &[u8]) {
        let (slot, found) = self.view().lower_bound(key);
        if found {
            self.remove_slot(slot);
        }
        self.insert_in_page(key, payload);
    }

    pub fn remove_slot(&mut self, slot: usize) {
        let v = self.view();
        let count = v.count();
        let entry = v.key_len(slot) + v.payload_len(slot);
        self.sub_space_used(entry);

        let start = HEADER_SIZE + (slot + 1) * SLOT_SIZE;
        let end = HEADER_SIZE + count * SLOT_SIZE;
        self.data.copy_within(start..end, start - SLOT_SIZE);
        self.set_count(count - 1);
        self.make_hint();
    }

    /// Rewrites the node with the heap fully packed at the end.
    pub fn compactify(&mut self) {
        let should = self.view().free_space_after_compaction();

        let mut tmp_buf = [0u8; PAGE_SIZE];
        {
            let v = self.view();
            let lower = v.lower_fence().to_vec();
            let upper = v.upper_fence().to_vec();
            let mut tmp = NodeMut::new(&mut tmp_buf);
            tmp.init(v.is_leaf());
            tmp.set_fences(&lower, &upper);
            v.copy_range_to(&mut tmp, 0, 0, v.count());
            tmp.set_next_raw(v.next_raw());
        }
        self.data.copy_from_slice(&tmp_buf);
        self.make_hint();
        assert_eq!(self.view().free_space(), should);
    }

    pub fn make_hint(&mut self) {
        let count = self.view().count();
        let dist = count / (HINT_COUNT + 1);
        for i in 0..HINT_COUNT {
            let head = self.view().head(dist * (i + 1));
            self.set_hint(i, head);
        }
    }

    fn update_hint(&mut self, slot: usize) {
        let count = self.view().count();
        let dist = count / (HINT_COUNT + 1);
        let mut begin = 0;
        if count > 2 * HINT_COUNT + 1 && (count - 1) / (HINT_COUNT + 1) == dist && slot / dist > 1 {
            begin = slot / dist - 1;
        }
        for i in begin..HINT_COUNT {
            let head = self.view().head(dist * (i + 1));
            self.set_hint(i, head);
        }
    }

    /// Merges the right sibling into this leaf if the result fits; inner
    /// merge is deliberately unimplemented and reports success without
    /// changes. `slot_in_parent` is this node's separator slot.
    pub fn merge_from_right(
        &mut self,
        left_pid: Pid,
        slot_in_parent: usize,
        parent: &mut NodeMut,
        right: Node,
    ) -> bool {
        if self.view().is_inner() {
            return true;
        }
        assert!(right.is_leaf());
        assert!(parent.view().is_inner());

        let mut tmp_buf = [0u8; PAGE_SIZE];
        {
            let v = self.view();
            let lower = v.lower_fence().to_vec();
            let upper = right.upper_fence().to_vec();
            let mut tmp = NodeMut::new(&mut tmp_buf);
            tmp.init(true);
            tmp.set_fences(&lower, &upper);

            let tmp_prefix = tmp.view().prefix_len();
            let left_grow = (v.prefix_len() - tmp_prefix) * v.count();
            let right_grow = (right.prefix_len() - tmp_prefix) * right.count();
            let space_upper_bound = v.space_used()
                + right.space_used()
                + HEADER_SIZE
                + (v.count() + right.count()) * SLOT_SIZE
                + left_grow
                + right_grow;
            if space_upper_bound > PAGE_SIZE {
                return false;
            }

            v.copy_range_to(&mut tmp, 0, 0, v.count());
            right.copy_range_to(&mut tmp, v.count(), 0, right.count());
            tmp.make_hint();
            tmp.set_next_raw(right.next_raw());
        }

        parent
            .payload_mut(slot_in_parent + 1)
            .copy_from_slice(&left_pid.as_u64().to_le_bytes());
        parent.remove_slot(slot_in_parent);
        self.data.copy_from_slice(&tmp_buf);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf() -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        NodeMut::new(&mut buf).init(true);
        buf
    }

    #[test]
    fn test_head4_orders_like_bytes() {
        assert!(head4(b"a") < head4(b"ab"));
        assert!(head4(b"ab") < head4(b"b"));
        assert_eq!(head4(b"abcd"), head4(b"abcdx"));
        assert_eq!(head4(b""), 0);
    }

    #[test]
    fn test_init_leaf() {
        let buf = leaf();
        let v = Node::new(&buf);
        assert!(v.is_leaf());
        assert_eq!(v.count(), 0);
        assert!(!v.has_right_neighbour());
        assert_eq!(v.free_space(), PAGE_SIZE - HEADER_SIZE);
        assert_eq!(v.prefix_len(), 0);
    }

    #[test]
    fn test_insert_keeps_keys_sorted() {
        let mut buf = leaf();
        let mut node = NodeMut::new(&mut buf);

        for key in [b"delta", b"alpha", b"echo!", b"bravo"] {
            node.insert_in_page(key, b"v");
        }

        let v = node.view();
        assert_eq!(v.count(), 4);
        let keys: Vec<&[u8]> = (0..4).map(|i| v.key(i)).collect();
        assert_eq!(keys, vec![&b"alpha"[..], b"bravo", b"delta", b"echo!"]);

        let (pos, found) = v.lower_bound(b"bravo");
        assert!(found);
        assert_eq!(pos, 1);
        let (pos, found) = v.lower_bound(b"carol");
        assert!(!found);
        assert_eq!(pos, 2);
        assert_eq!(v.upper_bound(b"bravo"), 2);
    }

    #[test]
    fn test_upsert_replaces_existing_key() {
        let mut buf = leaf();
        let mut node = NodeMut::new(&mut buf);

        node.upsert_in_page(b"k", b"old");
        node.upsert_in_page(b"k", b"newer");

        let v = node.view();
        assert_eq!(v.count(), 1);
        assert_eq!(v.payload(0), b"newer");
    }

    #[test]
    fn test_remove_slot() {
        let mut buf = leaf();
        let mut node = NodeMut::new(&mut buf);
        node.insert_in_page(b"a", b"1");
        node.insert_in_page(b"b", b"2");
        node.insert_in_page(b"c", b"3");

        node.remove_slot(1);
        let v = node.view();
        assert_eq!(v.count(), 2);
        assert_eq!(v.key(0), b"a");
        assert_eq!(v.key(1), b"c");
    }

    #[test]
    fn test_compaction_space_accounting() {
        let mut buf = leaf();
        let mut node = NodeMut::new(&mut buf);

        for i in 0..40u32 {
            node.insert_in_page(&i.to_be_bytes(), &[0xAA; 20]);
        }
        for i in (0..40u32).step_by(2) {
            let (slot, found) = node.view().lower_bound(&i.to_be_bytes());
            assert!(found);
            node.remove_slot(slot);
        }

        node.compactify();
        let v = node.view();
        // free + used + header + slot directory account for the whole page
        assert_eq!(
            v.free_space() + v.space_used() + HEADER_SIZE + v.count() * SLOT_SIZE,
            PAGE_SIZE
        );
        for i in (1..40u32).step_by(2) {
            let (_, found) = v.lower_bound(&i.to_be_bytes());
            assert!(found, "key {i} lost in compaction");
        }
    }

    #[test]
    fn test_fences_and_prefix() {
        let mut buf = leaf();
        let mut node = NodeMut::new(&mut buf);
        node.set_fences(b"user100", b"user199");

        let v = node.view();
        assert_eq!(v.lower_fence(), b"user100");
        assert_eq!(v.upper_fence(), b"user199");
        assert_eq!(v.prefix_len(), 5);
        assert_eq!(v.prefix(), b"user1");

        node.insert_in_page(b"user150", b"x");
        let v = node.view();
        assert_eq!(v.key(0), b"50"); // suffix after the common prefix
        let (_, found) = v.lower_bound(b"user150");
        assert!(found);
        // keys outside the prefix range compare against it
        assert_eq!(v.lower_bound(b"user0"), (0, false));
        assert_eq!(v.lower_bound(b"user2"), (v.count(), false));
    }

    #[test]
    fn test_find_separator_ordered() {
        let mut buf = leaf();
        let mut node = NodeMut::new(&mut buf);
        for i in 0..10u64 {
            node.insert_in_page(&i.to_be_bytes(), b"");
        }
        let info = node.view().find_separator(true);
        assert_eq!(info.slot, 8);
    }

    #[test]
    fn test_find_separator_single_slot() {
        let mut buf = leaf();
        let mut node = NodeMut::new(&mut buf);
        node.insert_in_page(b"only", b"payload");
        let info = node.view().find_separator(false);
        assert_eq!(info.slot, 0);
        assert!(!info.truncated);
        assert_eq!(info.len, 4);
    }

    #[test]
    fn test_separator_truncation() {
        let mut buf = leaf();
        let mut node = NodeMut::new(&mut buf);
        node.insert_in_page(b"aaaa", b"");
        node.insert_in_page(b"abzz", b"");

        let info = node.view().find_separator(false);
        // slots share one byte; the separator truncates to common + 1
        assert_eq!(info.slot, 0);
        assert!(info.truncated);
        assert_eq!(info.len, 2);
        let mut sep = vec![0u8; info.len];
        node.view().write_separator(&mut sep, info);
        assert_eq!(sep, b"ab");
        // the separator still partitions: left key <= sep < right key
        assert!(&b"aaaa"[..] <= &sep[..]);
        assert!(&sep[..] < &b"abzz"[..]);
    }

    #[test]
    fn test_copy_range_preserves_entries() {
        let mut src_buf = leaf();
        let mut src = NodeMut::new(&mut src_buf);
        src.set_fences(b"k1", b"k9");
        src.insert_in_page(b"k2", b"two");
        src.insert_in_page(b"k5", b"five");

        let mut dst_buf = leaf();
        {
            let mut dst = NodeMut::new(&mut dst_buf);
            dst.init(true);
            dst.set_fences(b"k2", b"k5");
            src.view().copy_range_to(&mut dst, 0, 0, 2);
        }
        let v = Node::new(&dst_buf);
        assert_eq!(v.count(), 2);
        let (_, found) = v.lower_bound(b"k2");
        assert!(found);
        assert_eq!(v.payload(0), b"two");
        assert_eq!(v.payload(1), b"five");
    }

    #[test]
    fn test_merge_leaves() {
        let mut left_buf = leaf();
        let mut right_buf = leaf();
        let mut parent_buf = [0u8; PAGE_SIZE];

        {
            let mut left = NodeMut::new(&mut left_buf);
            left.set_fences(b"", b"m");
            left.insert_in_page(b"a", b"1");
            left.insert_in_page(b"b", b"2");
        }
        {
            let mut right = NodeMut::new(&mut right_buf);
            right.init(true);
            right.set_fences(b"m", b"z");
            right.insert_in_page(b"p", b"3");
        }
        {
            let mut parent = NodeMut::new(&mut parent_buf);
            parent.init(false);
            parent.set_upper_inner(Pid(99));
            parent.insert_in_page(b"m", &Pid(10).as_u64().to_le_bytes());
            parent.insert_in_page(b"z", &Pid(11).as_u64().to_le_bytes());
        }

        let mut left = NodeMut::new(&mut left_buf);
        let mut parent = NodeMut::new(&mut parent_buf);
        let merged = left.merge_from_right(Pid(10), 0, &mut parent, Node::new(&right_buf));
        assert!(merged);

        let v = left.view();
        assert_eq!(v.count(), 3);
        assert_eq!(v.upper_fence(), b"z");
        let (_, found) = v.lower_bound(b"p");
        assert!(found);

        let pv = parent.view();
        assert_eq!(pv.count(), 1);
        assert_eq!(pv.child(0), Pid(10));
    }
}
