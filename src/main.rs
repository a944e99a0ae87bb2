use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keel::buffer::BufferManager;
use keel::common::{Config, PAGE_SIZE};
use keel::index::{key, BTree};
use keel::runtime::FiberRuntime;

fn main() {
    env_logger::init();

    println!("Keel - fiber-scheduled buffer manager");
    println!("=====================================\n");

    // pool smaller than the working set so eviction and refaulting show up
    let cfg = Config {
        phys_size: 64 * PAGE_SIZE as u64,
        concurrency: 2,
        ..Config::default()
    };

    let rt = FiberRuntime::new();
    let bm = BufferManager::open(cfg, Arc::clone(&rt), "keel.db").expect("open buffer manager");
    bm.start_evictor();
    println!("buffer pool: {} frames", bm.page_count());

    let stop = Arc::new(AtomicBool::new(false));
    {
        let bm = Arc::clone(&bm);
        let stop = Arc::clone(&stop);
        rt.spawn(move || {
            let tree = BTree::create(Arc::clone(&bm));

            for i in 0..10_000u64 {
                let mut k = Vec::new();
                key::fold_u64(&mut k, i);
                tree.insert(&k, &i.to_le_bytes());
            }
            println!("inserted 10000 records");

            let mut k = Vec::new();
            key::fold_u64(&mut k, 4242);
            let hit = tree.lookup(&k, |payload| {
                u64::from_le_bytes(payload.try_into().unwrap())
            });
            println!("lookup 4242 -> {hit:?}");

            let mut scanned = 0u64;
            let mut start = Vec::new();
            key::fold_u64(&mut start, 9990);
            tree.scan_asc(&start, |_, _| {
                scanned += 1;
                true
            });
            println!("scan from 9990 visited {scanned} records");

            bm.stop_evictor();
            stop.store(true, Ordering::Relaxed);
        });
    }

    {
        let bm = Arc::clone(&bm);
        rt.run(&stop, move || {
            bm.io().flush();
            bm.io().drain();
        });
    }

    println!(
        "\nstats: fixes={} restarts={} reads={} writes={} kernel entries={}",
        bm.fixes(),
        bm.restarts(),
        bm.io().reads(),
        bm.io().writes(),
        bm.io().submits()
    );
}
