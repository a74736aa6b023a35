use bytemuck::{Pod, Zeroable};
use magnetite_core::glam::DVec3;
use static_assertions::const_assert_eq;

const AXIS_BITS: u32 = 10;
const AXIS_MASK: u32 = (1 << AXIS_BITS) - 1;
const AXIS_QUANTA: f64 = AXIS_MASK as f64;

/// The mean sample position within a voxel: a quantized sub-voxel offset and the number of
/// samples accumulated into it.
///
/// The offset packs 10 bits per axis, quantizing `[-0.5, 0.5]` voxel extents relative to
/// the voxel centre. `coord` is only meaningful while `count > 0`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct VoxelMean {
    pub coord: u32,
    pub count: u32,
}

unsafe impl Zeroable for VoxelMean {}
unsafe impl Pod for VoxelMean {}

const_assert_eq!(std::mem::size_of::<VoxelMean>(), 8);

/// Quantizes an offset from the voxel centre into the packed sub-voxel coordinate.
pub fn sub_voxel_coord(offset: DVec3, resolution: f64) -> u32 {
    let mut packed = 0;
    for axis in 0..3 {
        let normalized = (offset[axis] / resolution + 0.5).clamp(0.0, 1.0);
        let quantized = (normalized * AXIS_QUANTA).round() as u32 & AXIS_MASK;
        packed |= quantized << (axis as u32 * AXIS_BITS);
    }
    packed
}

/// Recovers the offset from the voxel centre encoded by `coord`.
pub fn sub_voxel_position(coord: u32, resolution: f64) -> DVec3 {
    let axis = |i: u32| {
        let quantized = (coord >> (i * AXIS_BITS)) & AXIS_MASK;
        (quantized as f64 / AXIS_QUANTA - 0.5) * resolution
    };
    DVec3::new(axis(0), axis(1), axis(2))
}

impl VoxelMean {
    /// The mean position relative to the voxel centre. Only defined when `count > 0`.
    pub fn position(&self, resolution: f64) -> DVec3 {
        sub_voxel_position(self.coord, resolution)
    }

    /// Folds a new sample offset (relative to the voxel centre) into the running mean,
    /// saturating the count.
    pub fn update(&mut self, sample_offset: DVec3, resolution: f64) {
        let mean = if self.count > 0 {
            self.position(resolution)
        } else {
            DVec3::ZERO
        };
        let mean = mean + (sample_offset - mean) / (self.count as f64 + 1.0);
        self.coord = sub_voxel_coord(mean, resolution);
        self.count = self.count.saturating_add(1);
    }

    /// Discards the accumulated mean, e.g. on a covariance reset.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
