//! Keel - a fiber-scheduled buffer manager with a latch-coupled B-tree
//!
//! This crate provides a storage-engine core for OLTP-style workloads: a
//! page cache with clock-second-chance eviction and batched asynchronous
//! write-back, a cooperative fiber runtime that multiplexes many in-flight
//! I/O operations, and a B-tree that restarts transparently on page faults.
//!
//! # Architecture
//!
//! - **Runtime** (`runtime`): cooperative fiber scheduler
//!   - `FiberRuntime`: spawn/yield/park/wake over a FIFO ready ring; `run`
//!     alternates ready passes with an I/O completion drain
//!   - `SleepingFiber`: park-in-a-loop idiom for the eviction fiber
//!
//! - **Storage Layer** (`storage`): the kernel-facing edge
//!   - `DiskManager`: the backing device as a flat array of logical pages
//!   - `IoEngine`: batched submit/complete interface with an adaptive
//!     submission heuristic; a background worker thread plays the kernel
//!
//! - **Buffer Manager** (`buffer`): PID -> frame mapping
//!   - `PageTable`: robin-hood map with backshift deletion and a clock hand
//!   - `BufferManager`: fix/unfix, page-fault handling, restart protocol,
//!     eviction fiber
//!   - `SharedGuard`/`ExclusiveGuard`: scoped fixes with a retry signal
//!
//! - **Index** (`index`): the access path
//!   - `BTree`: latch-coupled search, insert with split, remove with
//!     underfull merge, fence-hopping ordered scans
//!   - `Adapter`: typed facade folding record keys into order-preserving
//!     byte strings
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//! use keel::buffer::BufferManager;
//! use keel::common::Config;
//! use keel::index::BTree;
//! use keel::runtime::FiberRuntime;
//!
//! let rt = FiberRuntime::new();
//! let bm = BufferManager::open(Config::default(), Arc::clone(&rt), "keel.db").unwrap();
//! bm.start_evictor();
//!
//! let stop = Arc::new(AtomicBool::new(false));
//! {
//!     let bm = Arc::clone(&bm);
//!     let stop = Arc::clone(&stop);
//!     rt.spawn(move || {
//!         let tree = BTree::create(Arc::clone(&bm));
//!         tree.insert(b"hello", b"world");
//!         assert_eq!(tree.lookup(b"hello", |p| p.to_vec()), Some(b"world".to_vec()));
//!         bm.stop_evictor();
//!         stop.store(true, Ordering::Relaxed);
//!     });
//! }
//! let io = Arc::clone(&bm);
//! rt.run(&stop, move || {
//!     io.io().flush();
//!     io.io().drain();
//! });
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod runtime;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{Bid, Config, KeelError, Pid, Result, PAGE_SIZE};
