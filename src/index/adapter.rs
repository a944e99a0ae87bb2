use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::BufferManager;

use super::BTree;

/// A record type storable through the adapter: a typed key with an
/// order-preserving folding (see the `key` module helpers) and a byte
/// serialization for the payload.
pub trait Record: Sized {
    type Key;

    fn fold_key(key: &Self::Key, out: &mut Vec<u8>);
    fn unfold_key(bytes: &[u8]) -> Self::Key;

    fn to_bytes(&self, out: &mut Vec<u8>);
    fn from_bytes(bytes: &[u8]) -> Self;
}

/// Narrow typed facade over one B-tree; workload drivers store one record
/// type per adapter. Restart conditions never surface here: operations
/// complete or abort.
pub struct Adapter<R: Record> {
    tree: BTree,
    _marker: PhantomData<R>,
}

impl<R: Record> Adapter<R> {
    pub fn new(bm: Arc<BufferManager>) -> Self {
        Self {
            tree: BTree::create(bm),
            _marker: PhantomData,
        }
    }

    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    pub fn insert(&self, key: &R::Key, record: &R) {
        let mut k = Vec::new();
        R::fold_key(key, &mut k);
        let mut payload = Vec::new();
        record.to_bytes(&mut payload);
        self.tree.insert(&k, &payload);
    }

    /// Invokes `f` on the record if present; shared fix for the duration.
    pub fn lookup1<T, F: FnOnce(&R) -> T>(&self, key: &R::Key, f: F) -> Option<T> {
        let mut k = Vec::new();
        R::fold_key(key, &mut k);
        self.tree.lookup(&k, |payload| f(&R::from_bytes(payload)))
    }

    /// Read-modify-write under an exclusive fix. The re-serialized record
    /// must keep its length.
    pub fn update1<F: FnOnce(&mut R)>(&self, key: &R::Key, f: F) -> bool {
        let mut k = Vec::new();
        R::fold_key(key, &mut k);
        self.tree.update_in_place(&k, |payload| {
            let mut record = R::from_bytes(payload);
            f(&mut record);
            let mut out = Vec::with_capacity(payload.len());
            record.to_bytes(&mut out);
            assert_eq!(out.len(), payload.len(), "update1 changed the record size");
            payload.copy_from_slice(&out);
        })
    }

    /// Returns false if the record was not found.
    pub fn erase(&self, key: &R::Key) -> bool {
        let mut k = Vec::new();
        R::fold_key(key, &mut k);
        self.tree.remove(&k)
    }

    /// Ascending scan from `key`; `f` returning false stops it.
    pub fn scan<F: FnMut(&R::Key, &R) -> bool>(&self, key: &R::Key, mut f: F) {
        let mut k = Vec::new();
        R::fold_key(key, &mut k);
        self.tree.scan_asc(&k, |kb, payload| {
            f(&R::unfold_key(kb), &R::from_bytes(payload))
        });
    }

    /// Descending scan from the greatest key <= `key`.
    pub fn scan_desc<F: FnMut(&R::Key, &R) -> bool>(&self, key: &R::Key, mut f: F) {
        let mut k = Vec::new();
        R::fold_key(key, &mut k);
        self.tree.scan_desc(&k, |kb, payload| {
            f(&R::unfold_key(kb), &R::from_bytes(payload))
        });
    }

    pub fn count(&self) -> u64 {
        let mut n = 0;
        self.tree.scan_asc(&[], |_, _| {
            n += 1;
            true
        });
        n
    }
}
