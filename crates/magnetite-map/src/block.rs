use crate::bitset::AtomicBitset8;
use crate::buffer::{VoxelBuffer, VoxelBufferMut};
use crate::compression::QueueState;
use crate::error::{Error, Result};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use magnetite_core::glam::I16Vec3;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum StateBit {
    /// Set while the storage slot holds compressed bytes.
    Compressed = 0,
    /// Claimed by the compression worker for the duration of a compression attempt.
    Compressing = 1,
    /// Set when a writer acquires the block; aborts an in-flight compression attempt.
    Dirty = 2,
    /// Set when a compression attempt failed; skipped until the end of the current cycle.
    SkipCycle = 3,
}

/// Storage for one voxel block. The discriminant is mirrored in the
/// [`StateBit::Compressed`] bit so state checks don't need the lock.
pub(crate) enum BlockSlot {
    Uncompressed(Vec<u8>),
    Compressed(Box<[u8]>),
}

/// Identifies the `(region, layer)` a block belongs to, for failure reporting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockOrigin {
    pub region: I16Vec3,
    pub layer: u16,
}

pub(crate) const UNREGISTERED: usize = usize::MAX;

/// The reference counted byte buffer for one voxel layer within one region.
///
/// A block is either *uncompressed* (accessible) or *compressed* (opaque bytes). Access goes
/// through scoped [`VoxelBuffer`]/[`VoxelBufferMut`] handles which retain the block and
/// decompress it if required; while any handle is live the block cannot transition to
/// compressed. Compression is initiated only by the compression queue.
pub struct VoxelBlock {
    slot: RwLock<BlockSlot>,
    pub(crate) state: AtomicBitset8,
    ref_count: AtomicU32,
    uncompressed_size: usize,
    compressed_size: AtomicUsize,
    last_touched: AtomicU64,
    pub(crate) registry_id: AtomicUsize,
    origin: BlockOrigin,
    queue: Option<Arc<QueueState>>,
}

impl VoxelBlock {
    /// Allocates an uncompressed block of `voxel_count` voxels, each filled with the
    /// `voxel_fill` byte pattern, and registers it with `queue` when present.
    pub(crate) fn new(
        voxel_count: usize,
        voxel_fill: &[u8],
        origin: BlockOrigin,
        queue: Option<Arc<QueueState>>,
    ) -> Arc<Self> {
        let uncompressed_size = voxel_count * voxel_fill.len();
        let mut bytes = Vec::with_capacity(uncompressed_size);
        for _ in 0..voxel_count {
            bytes.extend_from_slice(voxel_fill);
        }

        let block = Arc::new(Self {
            slot: RwLock::new(BlockSlot::Uncompressed(bytes)),
            state: AtomicBitset8::default(),
            ref_count: AtomicU32::new(0),
            uncompressed_size,
            compressed_size: AtomicUsize::new(0),
            last_touched: AtomicU64::new(0),
            registry_id: AtomicUsize::new(UNREGISTERED),
            origin,
            queue,
        });

        if let Some(queue) = &block.queue {
            queue.register_block(&block);
        }
        block.touch();

        block
    }

    pub fn origin(&self) -> BlockOrigin {
        self.origin
    }

    /// Bytes of one fully decompressed block.
    pub fn uncompressed_byte_size(&self) -> usize {
        self.uncompressed_size
    }

    /// Bytes of the compressed representation, or zero while none exists.
    pub fn compressed_byte_size(&self) -> usize {
        self.compressed_size.load(Ordering::Relaxed)
    }

    pub fn is_compressed(&self) -> bool {
        self.state.bit_is_set(StateBit::Compressed as u8)
    }

    /// Milliseconds (on the owning queue's clock) of the most recent access.
    pub fn last_touched(&self) -> u64 {
        self.last_touched.load(Ordering::Relaxed)
    }

    pub(crate) fn reference_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Increments the reference count, pinning the block in its uncompressed state once a
    /// buffer acquires it.
    pub fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases one reference. On the drop to zero the block becomes a compression
    /// candidate again.
    pub fn release(&self) {
        let previous = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0);
        if previous == 1 {
            if let Some(queue) = &self.queue {
                queue.notify_candidate();
            }
        }
    }

    /// Acquires a scoped read view, decompressing first if required.
    pub fn buffer(&self) -> Result<VoxelBuffer<'_>> {
        VoxelBuffer::new(self)
    }

    /// Acquires a scoped write view, decompressing first if required and marking the block
    /// dirty.
    pub fn buffer_mut(&self) -> Result<VoxelBufferMut<'_>> {
        VoxelBufferMut::new(self)
    }

    pub(crate) fn touch(&self) {
        let now = self.queue.as_ref().map_or_else(
            || self.last_touched.load(Ordering::Relaxed) + 1,
            |queue| queue.clock_ms(),
        );
        self.last_touched.store(now, Ordering::Relaxed);
    }

    pub(crate) fn read_slot(&self) -> Result<RwLockReadGuard<'_, BlockSlot>> {
        let guard = self.slot.read();
        if matches!(*guard, BlockSlot::Uncompressed(_)) {
            return Ok(guard);
        }
        drop(guard);
        self.decompress_for_access()
    }

    pub(crate) fn write_slot(&self) -> Result<RwLockWriteGuard<'_, BlockSlot>> {
        // Dirty is raised before blocking on the lock so an in-flight compression attempt
        // observes the pending write and aborts.
        self.state.set_bit(StateBit::Dirty as u8);
        let mut guard = self.slot.write();
        self.decompress_in_place(&mut guard)?;
        Ok(guard)
    }

    #[cold]
    fn decompress_for_access(&self) -> Result<RwLockReadGuard<'_, BlockSlot>> {
        let mut guard = self.slot.write();
        self.decompress_in_place(&mut guard)?;
        Ok(RwLockWriteGuard::downgrade(guard))
    }

    fn decompress_in_place(&self, guard: &mut RwLockWriteGuard<'_, BlockSlot>) -> Result<()> {
        let BlockSlot::Compressed(compressed) = &**guard else {
            return Ok(());
        };

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(self.uncompressed_size)
            .map_err(|_| Error::OutOfMemory)?;
        let mut decoder = FrameDecoder::new(compressed.as_ref());
        io::copy(&mut decoder, &mut bytes).map_err(|_| Error::CorruptBlock)?;
        if bytes.len() != self.uncompressed_size {
            return Err(Error::CorruptBlock);
        }

        **guard = BlockSlot::Uncompressed(bytes);
        self.state.unset_bit(StateBit::Compressed as u8);
        self.compressed_size.store(0, Ordering::Relaxed);
        if let Some(queue) = &self.queue {
            queue.on_resident_grow(self.uncompressed_size as u64);
        }
        Ok(())
    }

    /// A single compression attempt, driven by the compression queue. Aborts when the block
    /// is retained, written, or already claimed.
    pub(crate) fn try_compress(&self) -> CompressOutcome {
        if !self.state.try_set_bit(StateBit::Compressing as u8) {
            return CompressOutcome::Busy;
        }
        let outcome = self.try_compress_claimed();
        self.state.unset_bit(StateBit::Compressing as u8);
        outcome
    }

    fn try_compress_claimed(&self) -> CompressOutcome {
        if self.reference_count() != 0 {
            return CompressOutcome::Retained;
        }
        let Some(mut guard) = self.slot.try_write() else {
            return CompressOutcome::Busy;
        };
        let BlockSlot::Uncompressed(bytes) = &*guard else {
            return CompressOutcome::AlreadyCompressed;
        };

        // Clear Dirty before compressing; a writer that arrives mid-compression raises it
        // again before blocking on the lock, and the recheck below drops our stale result.
        self.state.unset_bit(StateBit::Dirty as u8);

        let compressed = match Self::compress_bytes(bytes) {
            Ok(compressed) => compressed,
            Err(error) => {
                self.state.set_bit(StateBit::SkipCycle as u8);
                return CompressOutcome::Failed(error);
            }
        };

        if self.reference_count() != 0 || self.state.bit_is_set(StateBit::Dirty as u8) {
            return CompressOutcome::Retained;
        }

        self.compressed_size.store(compressed.len(), Ordering::Relaxed);
        *guard = BlockSlot::Compressed(compressed.into_boxed_slice());
        self.state.set_bit(StateBit::Compressed as u8);
        if let Some(queue) = &self.queue {
            queue.on_resident_shrink(self.uncompressed_size as u64);
        }
        CompressOutcome::Compressed
    }

    fn compress_bytes(bytes: &[u8]) -> std::result::Result<Vec<u8>, String> {
        let mut encoder = FrameEncoder::new(Vec::new());
        let mut reader = bytes;
        io::copy(&mut reader, &mut encoder).map_err(|e| e.to_string())?;
        encoder.finish().map_err(|e| e.to_string())
    }
}

impl Drop for VoxelBlock {
    fn drop(&mut self) {
        if let Some(queue) = &self.queue {
            let resident = matches!(*self.slot.get_mut(), BlockSlot::Uncompressed(_));
            queue.deregister_block(
                self.registry_id.load(Ordering::Relaxed),
                resident.then_some(self.uncompressed_size as u64),
            );
        }
    }
}

/// The result of one compression attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum CompressOutcome {
    Compressed,
    AlreadyCompressed,
    /// A buffer retained the block before the transition committed.
    Retained,
    /// The slot lock or the compressing claim was contended.
    Busy,
    Failed(String),
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use super::*;

    fn test_block() -> Arc<VoxelBlock> {
        let origin = BlockOrigin {
            region: I16Vec3::ZERO,
            layer: 0,
        };
        VoxelBlock::new(512, &1.0f32.to_le_bytes(), origin, None)
    }

    #[test]
    fn compression_round_trip_preserves_bytes() {
        let block = test_block();
        let before = block.buffer().unwrap().bytes().to_vec();

        assert_eq!(block.try_compress(), CompressOutcome::Compressed);
        assert!(block.is_compressed());
        assert!(block.compressed_byte_size() > 0);
        assert!(block.compressed_byte_size() < block.uncompressed_byte_size());

        let after = block.buffer().unwrap();
        assert!(!block.is_compressed());
        assert_eq!(after.bytes(), &before[..]);
    }

    #[test]
    fn retained_block_refuses_compression() {
        let block = test_block();
        let buffer = block.buffer().unwrap();
        assert_eq!(block.try_compress(), CompressOutcome::Retained);
        assert!(!block.is_compressed());
        drop(buffer);
        assert_eq!(block.try_compress(), CompressOutcome::Compressed);
    }

    #[test]
    fn writes_survive_recompression() {
        let block = test_block();
        {
            let mut buffer = block.buffer_mut().unwrap();
            buffer.write::<f32>(16, 42.0);
        }
        assert_eq!(block.try_compress(), CompressOutcome::Compressed);
        let buffer = block.buffer().unwrap();
        assert_eq!(buffer.read::<f32>(16), 42.0);
        assert_eq!(buffer.read::<f32>(20), 1.0);
    }

    #[test]
    fn concurrent_readers_decompress_once() {
        let block = test_block();
        assert_eq!(block.try_compress(), CompressOutcome::Compressed);

        let block_ref = &block;
        crossbeam::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(move |_| {
                    let buffer = block_ref.buffer().unwrap();
                    assert_eq!(buffer.read::<f32>(0), 1.0);
                });
            }
        })
        .unwrap();
        assert!(!block.is_compressed());
    }
}
