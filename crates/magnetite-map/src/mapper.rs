pub mod ndt;
pub mod occupancy;

pub use ndt::{enable_ndt, NdtMode, NdtParams, RayMapperNdt};
pub use occupancy::RayMapperOccupancy;

use crate::error::{Error, Result};
use crate::map::OccupancyMap;
use crate::ray_filter::RayFlags;
use crate::region::Region;

use magnetite_core::glam::{DVec3, I16Vec3};
use std::sync::Arc;

/// A batch of rays to integrate: consecutive `(origin, sample)` point pairs plus optional
/// parallel per-ray attribute arrays.
#[derive(Clone, Copy)]
pub struct RayBatch<'a> {
    /// Alternating sensor origin / sample endpoint world positions. Even length.
    pub rays: &'a [DVec3],
    /// One intensity per ray, when the source provides them.
    pub intensities: Option<&'a [f32]>,
    /// One timestamp per ray, monotonic over the batch.
    pub timestamps: Option<&'a [f64]>,
    /// Flags applied to every ray in the batch.
    pub flags: RayFlags,
}

impl<'a> RayBatch<'a> {
    pub fn new(rays: &'a [DVec3]) -> Self {
        Self {
            rays,
            intensities: None,
            timestamps: None,
            flags: RayFlags::empty(),
        }
    }

    pub fn with_intensities(mut self, intensities: &'a [f32]) -> Self {
        self.intensities = Some(intensities);
        self
    }

    pub fn with_timestamps(mut self, timestamps: &'a [f64]) -> Self {
        self.timestamps = Some(timestamps);
        self
    }

    pub fn with_flags(mut self, flags: RayFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn ray_count(&self) -> usize {
        self.rays.len() / 2
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.rays.len() % 2 != 0 {
            return Err(Error::BadInput("ray array length must be even".to_owned()));
        }
        let count = self.ray_count();
        if self.intensities.is_some_and(|i| i.len() != count) {
            return Err(Error::BadInput("intensity array length must match ray count".to_owned()));
        }
        if self.timestamps.is_some_and(|t| t.len() != count) {
            return Err(Error::BadInput("timestamp array length must match ray count".to_owned()));
        }
        Ok(())
    }
}

/// Integrates sensor rays into an occupancy map.
///
/// Implementations walk each accepted ray through the grid and apply per-voxel updates in
/// traversal order. Integration returns the number of rays accepted; rays dropped by the
/// ray filter are counted out silently.
pub trait RayMapper {
    fn integrate_rays(&mut self, batch: &RayBatch<'_>) -> Result<usize>;
}

/// One-entry region memo: consecutive voxels along a ray usually land in the same region,
/// so most lookups skip the region dictionary lock.
#[derive(Default)]
pub(crate) struct RegionCache {
    coord: Option<I16Vec3>,
    region: Option<Arc<Region>>,
}

impl RegionCache {
    pub fn fetch(&mut self, map: &OccupancyMap, coord: I16Vec3) -> &Arc<Region> {
        if self.coord != Some(coord) {
            self.region = Some(map.get_or_create_region(coord));
            self.coord = Some(coord);
        }
        self.region.as_ref().expect("filled above")
    }
}
