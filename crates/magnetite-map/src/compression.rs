use crate::block::{CompressOutcome, StateBit, VoxelBlock, UNREGISTERED};

use magnetite_core::bytes::Bytes;
use magnetite_core::glam::I16Vec3;
use magnetite_core::SmallKeyHashSet;
use parking_lot::{Condvar, Mutex};
use slab::Slab;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const DEFAULT_HIGH_TIDE: Bytes = Bytes::gibibytes(4);
const DEFAULT_LOW_TIDE: Bytes = Bytes::gibibytes(3);
/// Blocks written within this window are not compression candidates.
const DEFAULT_GRACE_MS: u64 = 200;
/// Worker wake interval when no candidate notifications arrive.
const SCAN_INTERVAL: Duration = Duration::from_millis(200);

/// A compression failure, reported at most once per region per scan cycle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompressionEvent {
    pub region: I16Vec3,
    pub layer: u16,
    pub message: String,
}

/// State shared between the map's blocks, the public queue handle and the worker thread.
pub(crate) struct QueueState {
    high_tide: AtomicU64,
    low_tide: AtomicU64,
    grace_ms: AtomicU64,
    resident_bytes: AtomicU64,
    epoch: Instant,
    registry: Mutex<Slab<Weak<VoxelBlock>>>,
    signal: Mutex<bool>,
    work_available: Condvar,
    shutdown: AtomicBool,
    events: Mutex<Vec<CompressionEvent>>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            high_tide: AtomicU64::new(DEFAULT_HIGH_TIDE.byte_count()),
            low_tide: AtomicU64::new(DEFAULT_LOW_TIDE.byte_count()),
            grace_ms: AtomicU64::new(DEFAULT_GRACE_MS),
            resident_bytes: AtomicU64::new(0),
            epoch: Instant::now(),
            registry: Mutex::new(Slab::new()),
            signal: Mutex::new(false),
            work_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Milliseconds since queue creation; the clock stamped into block touch times.
    pub(crate) fn clock_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn register_block(&self, block: &Arc<VoxelBlock>) {
        let id = self.registry.lock().insert(Arc::downgrade(block));
        block.registry_id.store(id, Ordering::Relaxed);
        self.on_resident_grow(block.uncompressed_byte_size() as u64);
    }

    pub(crate) fn deregister_block(&self, registry_id: usize, resident_bytes: Option<u64>) {
        if registry_id != UNREGISTERED {
            self.registry.lock().try_remove(registry_id);
        }
        if let Some(bytes) = resident_bytes {
            self.resident_bytes.fetch_sub(bytes, Ordering::SeqCst);
        }
    }

    pub(crate) fn on_resident_grow(&self, bytes: u64) {
        let resident = self.resident_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if resident > self.high_tide.load(Ordering::Relaxed) {
            self.notify();
        }
    }

    pub(crate) fn on_resident_shrink(&self, bytes: u64) {
        self.resident_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }

    /// Called when a block's reference count drops to zero.
    pub(crate) fn notify_candidate(&self) {
        if self.resident_bytes.load(Ordering::SeqCst) > self.high_tide.load(Ordering::Relaxed) {
            self.notify();
        }
    }

    fn notify(&self) {
        let mut pending = self.signal.lock();
        *pending = true;
        self.work_available.notify_one();
    }

    /// One watermark-driven scan: while resident bytes exceed the low tide, compress the
    /// least recently used unreferenced blocks.
    fn run_cycle(&self) {
        if self.resident_bytes.load(Ordering::SeqCst) <= self.high_tide.load(Ordering::Relaxed) {
            return;
        }

        let now = self.clock_ms();
        let grace = self.grace_ms.load(Ordering::Relaxed);
        // Upgrade under the registry lock, filter outside it: dropping the last handle to
        // a block re-enters deregistration.
        let blocks: Vec<Arc<VoxelBlock>> = {
            let registry = self.registry.lock();
            registry.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        let mut candidates: Vec<(u64, Arc<VoxelBlock>)> = blocks
            .into_iter()
            .filter(|block| {
                let state = block.state.load();
                !state.bit_is_set(StateBit::Compressed as u8)
                    && !state.bit_is_set(StateBit::SkipCycle as u8)
                    && block.reference_count() == 0
                    && now.saturating_sub(block.last_touched()) >= grace
            })
            .map(|block| (block.last_touched(), block))
            .collect();
        candidates.sort_by_key(|(touched, _)| *touched);

        let low_tide = self.low_tide.load(Ordering::Relaxed);
        let mut reported: SmallKeyHashSet<I16Vec3> = SmallKeyHashSet::default();
        for (_, block) in candidates {
            if self.resident_bytes.load(Ordering::SeqCst) <= low_tide {
                break;
            }
            if let CompressOutcome::Failed(message) = block.try_compress() {
                let origin = block.origin();
                if reported.insert(origin.region) {
                    log::warn!(
                        "voxel block compression failed in region {:?} layer {}: {}",
                        origin.region,
                        origin.layer,
                        message
                    );
                }
                self.events.lock().push(CompressionEvent {
                    region: origin.region,
                    layer: origin.layer,
                    message,
                });
            }
        }

        // Failed blocks become candidates again next cycle. Upgraded blocks are released
        // outside the registry lock: dropping the last handle to a block re-enters
        // deregistration.
        let blocks: Vec<Arc<VoxelBlock>> = {
            let registry = self.registry.lock();
            registry.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for block in blocks {
            block.state.unset_bit(StateBit::SkipCycle as u8);
        }
    }

    fn worker_loop(&self) {
        loop {
            {
                let mut pending = self.signal.lock();
                if !*pending {
                    self.work_available.wait_for(&mut pending, SCAN_INTERVAL);
                }
                *pending = false;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            self.run_cycle();
        }
    }
}

/// The background service that keeps the resident voxel block memory bounded.
///
/// The map registers every block it creates. When resident (uncompressed) bytes exceed the
/// high tide, the worker compresses least-recently-used blocks with no outstanding buffers
/// until resident bytes fall to the low tide or candidates run out. In test mode no worker
/// thread runs; [`CompressionQueue::process_now`] drives scans deterministically.
pub struct CompressionQueue {
    state: Arc<QueueState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    test_mode: bool,
}

impl CompressionQueue {
    pub fn new(test_mode: bool) -> Self {
        let state = Arc::new(QueueState::new());
        let worker = (!test_mode).then(|| {
            let worker_state = Arc::clone(&state);
            thread::Builder::new()
                .name("voxel-block-compression".to_owned())
                .spawn(move || worker_state.worker_loop())
                .expect("failed to spawn compression worker")
        });
        Self {
            state,
            worker: Mutex::new(worker),
            test_mode,
        }
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn high_tide(&self) -> Bytes {
        Bytes(self.state.high_tide.load(Ordering::Relaxed))
    }

    pub fn set_high_tide(&self, tide: Bytes) {
        self.state.high_tide.store(tide.byte_count(), Ordering::Relaxed);
    }

    pub fn low_tide(&self) -> Bytes {
        Bytes(self.state.low_tide.load(Ordering::Relaxed))
    }

    pub fn set_low_tide(&self, tide: Bytes) {
        self.state.low_tide.store(tide.byte_count(), Ordering::Relaxed);
    }

    /// Blocks touched more recently than this many milliseconds are skipped by a scan.
    pub fn set_grace_interval_ms(&self, grace_ms: u64) {
        self.state.grace_ms.store(grace_ms, Ordering::Relaxed);
    }

    /// Total uncompressed bytes currently resident across all registered blocks.
    pub fn resident_bytes(&self) -> Bytes {
        Bytes(self.state.resident_bytes.load(Ordering::SeqCst))
    }

    /// Runs one scan cycle on the calling thread. Primarily for test mode.
    pub fn process_now(&self) {
        self.state.run_cycle();
    }

    /// Takes all compression failure events recorded since the previous drain.
    pub fn drain_events(&self) -> Vec<CompressionEvent> {
        std::mem::take(&mut *self.state.events.lock())
    }

    pub(crate) fn state(&self) -> &Arc<QueueState> {
        &self.state
    }
}

impl Drop for CompressionQueue {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.state.notify();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
