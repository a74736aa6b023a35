use magnetite_core::glam::{I16Vec3, IVec3, U8Vec3};

/// Addresses a single voxel with a two-level coordinate: the `region` containing the voxel,
/// in region-lattice coordinates, and the `local` coordinate of the voxel within that region.
///
/// Each `local` component lies in `[0, region_dim_axis)` where the region voxel dimensions
/// are fixed per map. A key is either *bounded* (valid) or the *null* sentinel.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Key {
    region: I16Vec3,
    local: U8Vec3,
}

impl Key {
    /// The invalid key.
    pub const NULL: Self = Self {
        region: I16Vec3::splat(i16::MIN),
        local: U8Vec3::splat(u8::MAX),
    };

    #[inline]
    pub fn new(region: I16Vec3, local: U8Vec3) -> Self {
        Self { region, local }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    #[inline]
    pub fn region_key(&self) -> I16Vec3 {
        self.region
    }

    #[inline]
    pub fn local_key(&self) -> U8Vec3 {
        self.local
    }

    #[inline]
    pub fn set_region_key(&mut self, region: I16Vec3) {
        self.region = region;
    }

    #[inline]
    pub fn set_local_key(&mut self, local: U8Vec3) {
        self.local = local;
    }

    /// The absolute voxel coordinate along `axis`, spanning region and local parts.
    #[inline]
    pub fn axis_coord(&self, axis: usize, region_dims: U8Vec3) -> i64 {
        self.region[axis] as i64 * region_dims[axis] as i64 + self.local[axis] as i64
    }

    /// Moves the key `step` voxels along `axis`, carrying into the region coordinate as
    /// required. A negative step behaves as a true mathematical floor: stepping back one
    /// voxel from local zero lands on the last voxel of the previous region.
    pub fn step_axis(&mut self, axis: usize, step: i32, region_dims: U8Vec3) {
        if step == 0 {
            return;
        }

        let dim = region_dims[axis] as i32;
        let mut region = self.region[axis] as i32;
        let mut local = self.local[axis] as i32 + step;

        if step > 0 {
            region += local / dim;
            local %= dim;
        } else {
            region += (local - (dim - 1)) / dim;
            local = ((local % dim) + dim) % dim;
        }

        self.region[axis] = region as i16;
        self.local[axis] = local as u8;
    }

    /// Returns a copy of this key stepped `step` voxels along `axis`.
    #[inline]
    pub fn stepped_axis(&self, axis: usize, step: i32, region_dims: U8Vec3) -> Self {
        let mut key = *self;
        key.step_axis(axis, step, region_dims);
        key
    }

    /// The signed per-axis voxel count from `self` to `other`: zero when the keys are equal,
    /// positive when `other` is in the positive axis direction.
    pub fn range_between(&self, other: &Key, region_dims: U8Vec3) -> IVec3 {
        IVec3::new(
            (other.axis_coord(0, region_dims) - self.axis_coord(0, region_dims)) as i32,
            (other.axis_coord(1, region_dims) - self.axis_coord(1, region_dims)) as i32,
            (other.axis_coord(2, region_dims) - self.axis_coord(2, region_dims)) as i32,
        )
    }

    /// True when `self` lies within the axis-aligned key range `[min, max]` on every axis.
    pub fn bounded(&self, min: &Key, max: &Key, region_dims: U8Vec3) -> bool {
        (0..3).all(|axis| {
            let c = self.axis_coord(axis, region_dims);
            c >= min.axis_coord(axis, region_dims) && c <= max.axis_coord(axis, region_dims)
        })
    }

    /// Clamps this key to `[min, max]` along one axis.
    pub fn clamp_to_axis(&mut self, axis: usize, min: &Key, max: &Key, region_dims: U8Vec3) {
        let c = self.axis_coord(axis, region_dims);
        let lo = min.axis_coord(axis, region_dims);
        let hi = max.axis_coord(axis, region_dims);
        let clamped = c.clamp(lo, hi);
        if clamped != c {
            self.step_axis(axis, (clamped - c) as i32, region_dims);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DIMS: U8Vec3 = U8Vec3::new(32, 32, 32);

    #[test]
    fn step_within_region() {
        let mut key = Key::new(I16Vec3::ZERO, U8Vec3::new(4, 5, 6));
        key.step_axis(0, 10, DIMS);
        assert_eq!(key.region_key(), I16Vec3::ZERO);
        assert_eq!(key.local_key(), U8Vec3::new(14, 5, 6));
    }

    #[test]
    fn step_carries_into_next_region() {
        let mut key = Key::new(I16Vec3::ZERO, U8Vec3::new(30, 0, 0));
        key.step_axis(0, 5, DIMS);
        assert_eq!(key.region_key(), I16Vec3::new(1, 0, 0));
        assert_eq!(key.local_key(), U8Vec3::new(3, 0, 0));
    }

    #[test]
    fn negative_step_floors_into_previous_region() {
        let mut key = Key::new(I16Vec3::ZERO, U8Vec3::new(0, 0, 0));
        key.step_axis(1, -1, DIMS);
        assert_eq!(key.region_key(), I16Vec3::new(0, -1, 0));
        assert_eq!(key.local_key(), U8Vec3::new(0, 31, 0));

        // Stepping back one full region dimension lands on the same local coordinate.
        let mut key = Key::new(I16Vec3::ZERO, U8Vec3::new(7, 7, 7));
        key.step_axis(2, -32, DIMS);
        assert_eq!(key.region_key(), I16Vec3::new(0, 0, -1));
        assert_eq!(key.local_key(), U8Vec3::new(7, 7, 7));
    }

    #[test]
    fn step_round_trip_is_identity() {
        let start = Key::new(I16Vec3::new(-2, 3, 0), U8Vec3::new(1, 31, 16));
        for axis in 0..3 {
            for step in [-67, -32, -1, 1, 32, 67] {
                let key = start.stepped_axis(axis, step, DIMS).stepped_axis(axis, -step, DIMS);
                assert_eq!(key, start, "axis {axis} step {step}");
            }
        }
    }

    #[test]
    fn range_between_spans_regions() {
        let a = Key::new(I16Vec3::ZERO, U8Vec3::new(31, 0, 0));
        let b = Key::new(I16Vec3::new(1, 0, 0), U8Vec3::new(0, 0, 0));
        assert_eq!(a.range_between(&b, DIMS), IVec3::new(1, 0, 0));
        assert_eq!(b.range_between(&a, DIMS), IVec3::new(-1, 0, 0));
    }

    #[test]
    fn bounded_and_clamp() {
        let min = Key::new(I16Vec3::splat(-1), U8Vec3::ZERO);
        let max = Key::new(I16Vec3::splat(1), U8Vec3::splat(31));
        let mut key = Key::new(I16Vec3::new(2, 0, 0), U8Vec3::new(5, 5, 5));
        assert!(!key.bounded(&min, &max, DIMS));
        key.clamp_to_axis(0, &min, &max, DIMS);
        assert!(key.bounded(&min, &max, DIMS));
        assert_eq!(key.region_key().x, 1);
        assert_eq!(key.local_key().x, 31);
    }
}
