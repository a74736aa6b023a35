use crate::block::{BlockSlot, VoxelBlock};
use crate::error::Result;

use bytemuck::Pod;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

/// A scoped read view of a [`VoxelBlock`]'s voxel memory.
///
/// Acquisition retains the block and decompresses it when required; the retain is released
/// on drop. While any buffer is live the block cannot be compressed.
pub struct VoxelBuffer<'a> {
    guard: RwLockReadGuard<'a, BlockSlot>,
    block: &'a VoxelBlock,
}

impl<'a> VoxelBuffer<'a> {
    pub(crate) fn new(block: &'a VoxelBlock) -> Result<Self> {
        block.retain();
        match block.read_slot() {
            Ok(guard) => {
                block.touch();
                Ok(Self { guard, block })
            }
            Err(error) => {
                block.release();
                Err(error)
            }
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &*self.guard {
            BlockSlot::Uncompressed(bytes) => bytes,
            // read_slot only returns with the slot decompressed.
            BlockSlot::Compressed(_) => unreachable!(),
        }
    }

    pub fn voxel_memory_size(&self) -> usize {
        self.block.uncompressed_byte_size()
    }

    /// Reads a [`Pod`] value at `byte_offset`. Offsets are not required to be aligned.
    #[inline]
    pub fn read<T: Pod>(&self, byte_offset: usize) -> T {
        let bytes = self.bytes();
        bytemuck::pod_read_unaligned(&bytes[byte_offset..byte_offset + std::mem::size_of::<T>()])
    }
}

impl<'a> Drop for VoxelBuffer<'a> {
    fn drop(&mut self) {
        self.block.release();
    }
}

/// A scoped write view of a [`VoxelBlock`]'s voxel memory. Acquisition marks the block
/// dirty, which aborts any in-flight compression attempt.
pub struct VoxelBufferMut<'a> {
    guard: RwLockWriteGuard<'a, BlockSlot>,
    block: &'a VoxelBlock,
}

impl<'a> VoxelBufferMut<'a> {
    pub(crate) fn new(block: &'a VoxelBlock) -> Result<Self> {
        block.retain();
        match block.write_slot() {
            Ok(guard) => {
                block.touch();
                Ok(Self { guard, block })
            }
            Err(error) => {
                block.release();
                Err(error)
            }
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &*self.guard {
            BlockSlot::Uncompressed(bytes) => bytes,
            BlockSlot::Compressed(_) => unreachable!(),
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut *self.guard {
            BlockSlot::Uncompressed(bytes) => bytes,
            BlockSlot::Compressed(_) => unreachable!(),
        }
    }

    pub fn voxel_memory_size(&self) -> usize {
        self.block.uncompressed_byte_size()
    }

    #[inline]
    pub fn read<T: Pod>(&self, byte_offset: usize) -> T {
        let bytes = self.bytes();
        bytemuck::pod_read_unaligned(&bytes[byte_offset..byte_offset + std::mem::size_of::<T>()])
    }

    #[inline]
    pub fn write<T: Pod>(&mut self, byte_offset: usize, value: T) {
        let raw = bytemuck::bytes_of(&value);
        self.bytes_mut()[byte_offset..byte_offset + raw.len()].copy_from_slice(raw);
    }
}

impl<'a> Drop for VoxelBufferMut<'a> {
    fn drop(&mut self) {
        self.block.release();
    }
}
