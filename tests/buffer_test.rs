mod common;

use keel::buffer::RestartCause;
use keel::common::{Config, Pid, PAGE_SIZE};
use keel::storage::disk::DiskManager;

use common::*;

fn small_pool(frames: u64) -> Config {
    Config {
        phys_size: frames * PAGE_SIZE as u64,
        free_target: 0.25,
        evict_batch: 2,
        ..Config::default()
    }
}

#[test]
fn test_alloc_write_read_back() {
    with_engine(small_pool(16), |bm| {
        let pid = {
            let mut guard = alloc_loop(&bm);
            guard.data_mut()[0] = 42;
            guard.data_mut()[100] = 255;
            guard.pid()
        };
        assert_eq!(pid, Pid(1));

        let guard = fix_shared_loop(&bm, pid);
        assert_eq!(guard.data()[0], 42);
        assert_eq!(guard.data()[100], 255);
        drop(guard);

        // counter identity at a quiescent point
        assert_eq!(
            bm.phys_used() + bm.free_frames() as u64,
            bm.page_count()
        );
    });
}

#[test]
fn test_eviction_under_pressure() {
    // 4 frames, one of which pins the metadata page
    with_engine(small_pool(4), |bm| {
        let mut pids = Vec::new();
        for i in 0..4u8 {
            let mut guard = alloc_loop(&bm);
            for b in guard.data_mut().iter_mut() {
                *b = 0xA0 + i;
            }
            pids.push(guard.pid());
        }

        // rereading everything in order forces at least two disk reads
        for (i, &pid) in pids.iter().enumerate() {
            let guard = fix_shared_loop(&bm, pid);
            assert!(
                guard.data().iter().all(|&b| b == 0xA0 + i as u8),
                "{pid} content lost across eviction"
            );
        }
        assert!(bm.io().reads() >= 2, "reads={}", bm.io().reads());
        assert!(bm.io().writes() >= 2, "writes={}", bm.io().writes());
        assert_eq!(
            bm.phys_used() + bm.free_frames() as u64,
            bm.page_count()
        );
    });
}

#[test]
fn test_refix_after_eviction_faults_fresh_frame() {
    with_engine(small_pool(4), |bm| {
        let target = {
            let mut guard = alloc_loop(&bm);
            guard.data_mut().fill(0x7E);
            guard.pid()
        };

        // three usable frames and seven more pages: the target's frame is
        // certainly reused, so the target went through write-back
        for _ in 0..7 {
            let mut guard = alloc_loop(&bm);
            guard.data_mut().fill(0x11);
        }

        let restarts_before = bm.restarts();
        let guard = fix_shared_loop(&bm, target);
        assert!(guard.data().iter().all(|&b| b == 0x7E));
        drop(guard);
        assert!(bm.restarts() > restarts_before);
    });
}

#[test]
fn test_alloc_exhaustion_sets_restart_cause() {
    with_engine(
        Config {
            free_target: 0.0, // evictor only fires on an empty free list
            ..small_pool(4)
        },
        |bm| {
            // exactly one free frame left
            let p1 = alloc_loop(&bm).pid();
            let p2 = alloc_loop(&bm).pid();
            assert_eq!(bm.free_frames(), 1);

            // the last frame still allocates
            let p3 = alloc_loop(&bm).pid();
            assert!(p1 < p2 && p2 < p3);
            assert_eq!(bm.free_frames(), 0);

            // the next consumer observes the allocation stall
            let guard = keel::buffer::ExclusiveGuard::alloc(&bm);
            assert!(guard.retry());
            assert_eq!(bm.restart_cause(), Some(RestartCause::Alloc));
        },
    );
}

#[test]
fn test_concurrent_fault_takes_wait_path() {
    let file = tempfile::NamedTempFile::new().unwrap();

    // seed the backing device directly: page 7 with a known pattern
    {
        let disk = DiskManager::new(file.path()).unwrap();
        let mut img = [0u8; PAGE_SIZE];
        img.fill(0xAB);
        disk.write_page(Pid(7), &img).unwrap();
    }

    let mut cfg = small_pool(8);
    cfg.concurrency = 2;

    let reader = |bm: std::sync::Arc<keel::buffer::BufferManager>| {
        let guard = fix_shared_loop(&bm, Pid(7));
        assert!(guard.data().iter().all(|&b| b == 0xAB));
    };

    let bm = run_workers_at(
        file.path(),
        cfg,
        vec![Box::new(reader), Box::new(reader)],
    );

    // one fiber faulted, the other waited on the same in-flight read
    assert_eq!(bm.io().reads(), 1);
    assert!(bm.restarts() >= 2, "restarts={}", bm.restarts());
}

#[test]
fn test_unfix_of_unknown_pid_is_fatal() {
    let result = std::panic::catch_unwind(|| {
        with_engine(small_pool(8), |bm| {
            bm.unfix_shared(Pid(4242));
        });
    });
    assert!(result.is_err());
}
