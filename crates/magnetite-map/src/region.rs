use crate::block::{BlockOrigin, VoxelBlock};
use crate::compression::QueueState;
use crate::layout::{MapLayout, UNOBSERVED_OCCUPANCY};

use bitflags::bitflags;
use magnetite_core::glam::{DVec3, I16Vec3, U8Vec3};
use ndshape::{RuntimeShape, Shape};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RegionFlags: u32 {
        /// The region has been written since the last serialization.
        const DIRTY = 1 << 0;
    }
}

const FIRST_VALID_INVALID: u32 = u32::MAX;

/// Linearizes a local voxel coordinate within a block of the given dimensions, x fastest.
#[inline]
pub fn linear_index(local: U8Vec3, dims: U8Vec3) -> usize {
    let shape = RuntimeShape::<u32, 3>::new([dims.x as u32, dims.y as u32, dims.z as u32]);
    shape.linearize([local.x as u32, local.y as u32, local.z as u32]) as usize
}

/// Delinearizes a voxel index within a block of the given dimensions.
#[inline]
pub fn local_from_index(index: usize, dims: U8Vec3) -> U8Vec3 {
    let shape = RuntimeShape::<u32, 3>::new([dims.x as u32, dims.y as u32, dims.z as u32]);
    let [x, y, z] = shape.delinearize(index as u32);
    U8Vec3::new(x as u8, y as u8, z as u8)
}

/// One fixed-size 3D tile of voxels: one [`VoxelBlock`] per layout layer plus bookkeeping.
///
/// Regions are created lazily on first write and never evicted; only their blocks compress.
pub struct Region {
    coord: I16Vec3,
    centre: DVec3,
    blocks: Vec<Arc<VoxelBlock>>,
    /// Wall-clock (sample time) stamp of the last write, as `f64` bits.
    touched_time: AtomicU64,
    /// Map stamp of the last write to any layer.
    dirty_stamp: AtomicU64,
    /// Map stamp of the last write, per layer.
    touched_stamps: Vec<AtomicU64>,
    /// Packed local key of the earliest known occupied voxel, or `FIRST_VALID_INVALID`.
    first_valid_index: AtomicU32,
    flags: AtomicU32,
}

impl Region {
    pub(crate) fn new(
        coord: I16Vec3,
        centre: DVec3,
        layout: &MapLayout,
        region_dims: U8Vec3,
        queue: Option<&Arc<QueueState>>,
    ) -> Arc<Self> {
        let blocks = layout
            .layers()
            .iter()
            .map(|layer| {
                VoxelBlock::new(
                    layer.voxel_count(region_dims),
                    &layer.default_voxel_bytes(),
                    BlockOrigin {
                        region: coord,
                        layer: layer.layer_index() as u16,
                    },
                    queue.cloned(),
                )
            })
            .collect();
        let touched_stamps = layout.layers().iter().map(|_| AtomicU64::new(0)).collect();

        Arc::new(Self {
            coord,
            centre,
            blocks,
            touched_time: AtomicU64::new(0f64.to_bits()),
            dirty_stamp: AtomicU64::new(0),
            touched_stamps,
            first_valid_index: AtomicU32::new(FIRST_VALID_INVALID),
            flags: AtomicU32::new(0),
        })
    }

    pub fn coord(&self) -> I16Vec3 {
        self.coord
    }

    /// World-space centre of this region.
    pub fn centre(&self) -> DVec3 {
        self.centre
    }

    /// The block holding `layer`'s voxels for this region. Blocks are stored in layer order
    /// and always match the map layout's layer count.
    pub fn layer_block(&self, layer: usize) -> Option<&Arc<VoxelBlock>> {
        self.blocks.get(layer)
    }

    pub fn layer_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn touched_time(&self) -> f64 {
        f64::from_bits(self.touched_time.load(Ordering::Relaxed))
    }

    pub(crate) fn set_touched_time(&self, time: f64) {
        self.touched_time.store(time.to_bits(), Ordering::Relaxed);
    }

    pub fn dirty_stamp(&self) -> u64 {
        self.dirty_stamp.load(Ordering::Relaxed)
    }

    pub fn touched_stamp(&self, layer: usize) -> u64 {
        self.touched_stamps[layer].load(Ordering::Relaxed)
    }

    pub fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub(crate) fn clear_dirty_flag(&self) {
        self.flags.fetch_and(!RegionFlags::DIRTY.bits(), Ordering::Relaxed);
    }

    /// Records a write to `layer` at the map stamp `stamp`.
    pub(crate) fn touch(&self, layer: usize, stamp: u64, time: Option<f64>) {
        self.dirty_stamp.store(stamp, Ordering::Relaxed);
        self.touched_stamps[layer].store(stamp, Ordering::Relaxed);
        self.flags.fetch_or(RegionFlags::DIRTY.bits(), Ordering::Relaxed);
        if let Some(time) = time {
            self.set_touched_time(time);
        }
    }

    /// The earliest known occupied voxel, a search starting hint maintained on writes.
    pub fn first_valid_key(&self) -> Option<U8Vec3> {
        let packed = self.first_valid_index.load(Ordering::Relaxed);
        (packed != FIRST_VALID_INVALID).then(|| {
            U8Vec3::new(packed as u8, (packed >> 8) as u8, (packed >> 16) as u8)
        })
    }

    /// Lowers the first-valid hint to `local` if it precedes the current hint in linear
    /// order.
    pub(crate) fn update_first_valid(&self, local: U8Vec3, dims: U8Vec3) {
        let candidate_linear = linear_index(local, dims) as u32;
        let packed = local.x as u32 | (local.y as u32) << 8 | (local.z as u32) << 16;
        let mut current = self.first_valid_index.load(Ordering::Relaxed);
        loop {
            let current_linear = if current == FIRST_VALID_INVALID {
                u32::MAX
            } else {
                linear_index(
                    U8Vec3::new(current as u8, (current >> 8) as u8, (current >> 16) as u8),
                    dims,
                ) as u32
            };
            if candidate_linear >= current_linear {
                return;
            }
            match self.first_valid_index.compare_exchange_weak(
                current,
                packed,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Rebuilds the first-valid hint by scanning the occupancy layer. Used after load.
    pub(crate) fn search_first_valid(&self, layout: &MapLayout, region_dims: U8Vec3) {
        let Some(occupancy) = layout.occupancy_layer() else {
            return;
        };
        let Some(block) = self.layer_block(occupancy) else {
            return;
        };
        let layer = layout.layer_ptr(occupancy).expect("index from layout");
        let dims = layer.layer_dims(region_dims);
        let voxel_size = layer.voxel_byte_size();
        let Ok(buffer) = block.buffer() else {
            return;
        };

        self.first_valid_index.store(FIRST_VALID_INVALID, Ordering::Relaxed);
        for index in 0..layer.voxel_count(region_dims) {
            let value: f32 = buffer.read(index * voxel_size);
            if value != UNOBSERVED_OCCUPANCY {
                self.update_first_valid(local_from_index(index, dims), dims);
                return;
            }
        }
    }
}
