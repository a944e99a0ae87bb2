/// Size of a page in bytes (4 KB)
pub const PAGE_SIZE: usize = 4096;

/// How the I/O worker polls its submission queue.
///
/// `Sqpoll` and `Iopoll` busy-poll (lowest latency, one core burned);
/// `Defer` and `Coop` block with a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    Defer,
    Coop,
    Sqpoll,
    Iopoll,
}

/// Engine tunables. All sizes are in bytes.
#[derive(Debug, Clone)]
pub struct Config {
    /// Logical address space; bounds PID allocation.
    pub virt_size: u64,
    /// Resident memory budget; dictates the frame count.
    pub phys_size: u64,
    /// Max frames chosen per eviction round.
    pub evict_batch: usize,
    /// The evictor wakes when the free ratio falls below this.
    pub free_target: f64,
    /// Over-provision factor for the page table.
    pub page_table_factor: f64,
    /// Number of worker fibers issuing I/O.
    pub concurrency: usize,
    /// Submission-queue poll discipline of the I/O worker.
    pub submit_mode: SubmitMode,
    /// Disable the adaptive heuristic; flush on every submission.
    pub submit_always: bool,
    /// Calibration toggle: blocking in-fiber I/O instead of the async path.
    pub sync_variant: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            virt_size: 256 << 20,
            phys_size: 16 << 20,
            evict_batch: 64,
            free_target: 0.1,
            page_table_factor: 1.5,
            concurrency: 1,
            submit_mode: SubmitMode::Defer,
            submit_always: false,
            sync_variant: false,
        }
    }
}

impl Config {
    /// Number of physical frames this configuration provides.
    pub fn page_count(&self) -> u64 {
        self.phys_size / PAGE_SIZE as u64
    }

    /// Number of logical pages addressable on the backing device.
    pub fn logical_capacity(&self) -> u64 {
        self.virt_size / PAGE_SIZE as u64
    }
}
