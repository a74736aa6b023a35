use crate::compression::CompressionQueue;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::layout::{self, MapLayout, UNOBSERVED_OCCUPANCY};
use crate::map_info::MapInfo;
use crate::ray_filter::RayFilterFn;
use crate::region::Region;

use bitflags::bitflags;
use magnetite_core::geometry::Aabb;
use magnetite_core::glam::{DVec3, I16Vec3, U8Vec3};
use magnetite_core::SmallKeyHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Converts a log-odds occupancy value to a probability.
#[inline]
pub fn value_to_probability(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

/// Converts a probability to a log-odds occupancy value.
#[inline]
pub fn probability_to_value(probability: f32) -> f32 {
    (probability / (1.0 - probability)).ln()
}

bitflags! {
    /// Flags augmenting map creation.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct MapFlags: u32 {
        /// Keep idle voxel blocks compressed in memory. Compression runs off thread.
        const COMPRESSED = 1 << 0;
        /// Track the mean sample position within each voxel.
        const VOXEL_MEAN = 1 << 1;
        /// Accumulate the traversal (chord length) of rays through each voxel.
        const TRAVERSAL = 1 << 2;
        /// Track a quantized last-touch time for each sample voxel.
        const TOUCH_TIME = 1 << 3;
        /// Track an estimate of the average incident ray direction per sample voxel.
        const INCIDENT_NORMAL = 1 << 4;
    }
}

impl MapFlags {
    pub const DEFAULT: Self = Self::COMPRESSED;
}

/// The occupancy update model: log-odds adjustments and their clamping policy.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OccupancyParams {
    /// Log-odds adjustment applied when a sample lands in a voxel. Positive.
    pub hit_value: f32,
    /// Log-odds adjustment applied when a ray passes through a voxel. Negative.
    pub miss_value: f32,
    /// Voxels at or above this value are occupied; observed voxels below it are free.
    pub occupancy_threshold_value: f32,
    pub min_voxel_value: f32,
    pub max_voxel_value: f32,
    /// Once a voxel reaches the minimum value, ignore further misses.
    pub saturate_at_min_value: bool,
    /// Once a voxel reaches the maximum value, ignore further hits.
    pub saturate_at_max_value: bool,
}

impl Default for OccupancyParams {
    fn default() -> Self {
        Self {
            hit_value: probability_to_value(0.7),
            miss_value: probability_to_value(0.4),
            occupancy_threshold_value: 0.0,
            min_voxel_value: -2.0,
            max_voxel_value: 3.5,
            saturate_at_min_value: false,
            saturate_at_max_value: false,
        }
    }
}

/// Occupancy classification of a single voxel value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OccupancyType {
    Occupied,
    Free,
    Unobserved,
}

/// A probabilistic sparse voxel occupancy map.
///
/// The map owns a dictionary of lazily created [`Region`]s, each holding one compressible
/// [`VoxelBlock`](crate::VoxelBlock) per layout layer. Ray mappers mutate voxels through
/// scoped buffers; the optional compression queue reclaims idle blocks in the background.
///
/// The map is designed for a single logical ray integrator at a time; see the crate docs
/// for the concurrency contract.
pub struct OccupancyMap {
    origin: DVec3,
    resolution: f64,
    region_voxel_dims: U8Vec3,
    region_spatial_dims: DVec3,
    layout: MapLayout,
    regions: Mutex<SmallKeyHashMap<I16Vec3, Arc<Region>>>,
    stamp: AtomicU64,
    params: OccupancyParams,
    flags: MapFlags,
    ray_filter: Option<Box<RayFilterFn>>,
    info: MapInfo,
    compression: Option<Arc<CompressionQueue>>,
    /// Timestamp of the first integrated sample; the origin of the touch-time layer clock.
    first_sample_time: Mutex<Option<f64>>,
}

impl OccupancyMap {
    /// Creates a map with voxel edge length `resolution` (world units) and the given region
    /// voxel dimensions. The layout is populated according to `flags`; the occupancy layer
    /// is always present.
    pub fn new(resolution: f64, region_voxel_dims: U8Vec3, flags: MapFlags) -> Self {
        assert!(resolution > 0.0);
        assert!(region_voxel_dims.min_element() >= 1);

        let mut map_layout = MapLayout::new();
        layout::add_occupancy(&mut map_layout);
        if flags.contains(MapFlags::VOXEL_MEAN) {
            layout::add_mean(&mut map_layout);
        }
        if flags.contains(MapFlags::TRAVERSAL) {
            layout::add_traversal(&mut map_layout);
        }
        if flags.contains(MapFlags::TOUCH_TIME) {
            layout::add_touch_time(&mut map_layout);
        }
        if flags.contains(MapFlags::INCIDENT_NORMAL) {
            layout::add_incident_normal(&mut map_layout);
        }

        let compression = flags
            .contains(MapFlags::COMPRESSED)
            .then(|| Arc::new(CompressionQueue::new(false)));

        Self {
            origin: DVec3::ZERO,
            resolution,
            region_spatial_dims: region_voxel_dims.as_dvec3() * resolution,
            region_voxel_dims,
            layout: map_layout,
            regions: Mutex::new(SmallKeyHashMap::default()),
            stamp: AtomicU64::new(0),
            params: OccupancyParams::default(),
            flags,
            ray_filter: None,
            info: MapInfo::new(),
            compression,
            first_sample_time: Mutex::new(None),
        }
    }

    /// Replaces the compression service. Only legal before any region exists; a test-mode
    /// queue never spawns a worker and is driven with
    /// [`CompressionQueue::process_now`](crate::CompressionQueue::process_now).
    pub fn enable_compression(&mut self, test_mode: bool) -> Result<&CompressionQueue> {
        if self.region_count() != 0 {
            return Err(Error::StateInvalid("cannot change compression with regions allocated"));
        }
        self.flags |= MapFlags::COMPRESSED;
        self.compression = Some(Arc::new(CompressionQueue::new(test_mode)));
        Ok(self.compression.as_deref().expect("just set"))
    }

    pub fn compression(&self) -> Option<&CompressionQueue> {
        self.compression.as_deref()
    }

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    /// Sets the world position of the map origin. Only legal before any region exists.
    pub fn set_origin(&mut self, origin: DVec3) -> Result<()> {
        if self.region_count() != 0 {
            return Err(Error::StateInvalid("cannot move the origin with regions allocated"));
        }
        self.origin = origin;
        Ok(())
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn region_voxel_dims(&self) -> U8Vec3 {
        self.region_voxel_dims
    }

    /// World-space edge lengths of one region.
    pub fn region_spatial_dims(&self) -> DVec3 {
        self.region_spatial_dims
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: MapFlags) {
        self.flags = flags;
    }

    pub fn params(&self) -> &OccupancyParams {
        &self.params
    }

    pub fn set_params(&mut self, params: OccupancyParams) {
        self.params = params;
    }

    pub fn set_hit_probability(&mut self, probability: f32) {
        self.params.hit_value = probability_to_value(probability);
    }

    pub fn set_miss_probability(&mut self, probability: f32) {
        self.params.miss_value = probability_to_value(probability);
    }

    pub fn set_occupancy_threshold_probability(&mut self, probability: f32) {
        self.params.occupancy_threshold_value = probability_to_value(probability);
    }

    pub fn hit_value(&self) -> f32 {
        self.params.hit_value
    }

    pub fn miss_value(&self) -> f32 {
        self.params.miss_value
    }

    pub fn occupancy_threshold_value(&self) -> f32 {
        self.params.occupancy_threshold_value
    }

    pub fn layout(&self) -> &MapLayout {
        &self.layout
    }

    /// Mutable layout access. Once the map has regions, layout changes are forbidden.
    pub fn layout_mut(&mut self) -> Result<&mut MapLayout> {
        if self.region_count() != 0 {
            return Err(Error::StateInvalid("cannot change the layout with regions allocated"));
        }
        Ok(&mut self.layout)
    }

    pub(crate) fn replace_layout(&mut self, layout: MapLayout) -> Result<()> {
        if self.region_count() != 0 {
            return Err(Error::StateInvalid("cannot change the layout with regions allocated"));
        }
        self.layout = layout;
        Ok(())
    }

    pub fn info(&self) -> &MapInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut MapInfo {
        &mut self.info
    }

    /// The per-ray filter applied before walking. When unset, integration applies the
    /// default filter, which rejects rays with non-finite endpoints.
    pub fn ray_filter(&self) -> Option<&RayFilterFn> {
        self.ray_filter.as_deref()
    }

    pub fn set_ray_filter(&mut self, filter: Box<RayFilterFn>) {
        self.ray_filter = Some(filter);
    }

    pub fn clear_ray_filter(&mut self) {
        self.ray_filter = None;
    }

    /// The monotone map stamp: bumped once per ray integration call.
    pub fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Relaxed)
    }

    pub(crate) fn touch_stamp(&self) -> u64 {
        self.stamp.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn note_sample_time(&self, time: f64) {
        let mut first = self.first_sample_time.lock();
        if first.is_none() {
            *first = Some(time);
        }
    }

    /// Milliseconds from the first integrated sample to `time`, for the touch-time layer.
    pub fn touch_time_ms(&self, time: f64) -> u32 {
        let base = (*self.first_sample_time.lock()).unwrap_or(time);
        ((time - base).max(0.0) * 1000.0).min(u32::MAX as f64) as u32
    }

    // ------------------------------------------------------------------------------------
    // Key geometry
    // ------------------------------------------------------------------------------------

    /// World-space centre of the region with the given region coordinate.
    pub fn region_centre(&self, region: I16Vec3) -> DVec3 {
        self.origin + self.region_spatial_dims * region.as_dvec3()
    }

    /// World-space minimum corner of a region.
    pub fn region_min(&self, region: I16Vec3) -> DVec3 {
        self.region_centre(region) - 0.5 * self.region_spatial_dims
    }

    /// The key of the voxel containing `point`.
    pub fn voxel_key(&self, point: DVec3) -> Key {
        let region_f = ((point - self.origin) / self.region_spatial_dims + DVec3::splat(0.5)).floor();
        let region = I16Vec3::new(region_f.x as i16, region_f.y as i16, region_f.z as i16);
        let local_f = ((point - self.region_min(region)) / self.resolution).floor();
        let max = self.region_voxel_dims.as_dvec3() - DVec3::ONE;
        let local_f = local_f.clamp(DVec3::ZERO, max);
        Key::new(
            region,
            U8Vec3::new(local_f.x as u8, local_f.y as u8, local_f.z as u8),
        )
    }

    /// World-space centre of the voxel at `key`.
    pub fn voxel_centre(&self, key: Key) -> DVec3 {
        self.region_min(key.region_key())
            + (key.local_key().as_dvec3() + DVec3::splat(0.5)) * self.resolution
    }

    /// Classifies an occupancy value against the map's threshold.
    pub fn occupancy_type(&self, value: f32) -> OccupancyType {
        if value == UNOBSERVED_OCCUPANCY {
            OccupancyType::Unobserved
        } else if value >= self.params.occupancy_threshold_value {
            OccupancyType::Occupied
        } else {
            OccupancyType::Free
        }
    }

    // ------------------------------------------------------------------------------------
    // Region dictionary
    // ------------------------------------------------------------------------------------

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn region(&self, coord: I16Vec3) -> Option<Arc<Region>> {
        self.regions.lock().get(&coord).cloned()
    }

    /// Fetches the region at `coord`, creating and registering it when absent. Insertion
    /// holds the map-wide region lock.
    pub fn get_or_create_region(&self, coord: I16Vec3) -> Arc<Region> {
        let mut regions = self.regions.lock();
        Arc::clone(regions.entry(coord).or_insert_with(|| {
            Region::new(
                coord,
                self.region_centre(coord),
                &self.layout,
                self.region_voxel_dims,
                self.compression.as_ref().map(|q| q.state()),
            )
        }))
    }

    /// A stable snapshot of all regions at the moment of the call.
    pub fn regions(&self) -> Vec<Arc<Region>> {
        self.regions.lock().values().cloned().collect()
    }

    // ------------------------------------------------------------------------------------
    // Voxel queries
    // ------------------------------------------------------------------------------------

    /// Reads the occupancy value at `key`, or `None` when its region does not exist.
    pub fn occupancy_value(&self, key: Key) -> Option<f32> {
        let layer_index = self.layout.occupancy_layer()?;
        let region = self.region(key.region_key())?;
        let layer = self.layout.layer_ptr(layer_index).expect("index from layout");
        let block = region.layer_block(layer_index)?;
        let buffer = block.buffer().ok()?;
        let index = crate::region::linear_index(
            key.local_key(),
            layer.layer_dims(self.region_voxel_dims),
        );
        Some(buffer.read(index * layer.voxel_byte_size()))
    }

    /// The world-space bounds of observed voxels, or `None` for an empty map.
    pub fn calculate_extents(&self) -> Option<Aabb> {
        let layer_index = self.layout.occupancy_layer()?;
        let layer = self.layout.layer_ptr(layer_index)?.clone();
        let dims = layer.layer_dims(self.region_voxel_dims);
        let voxel_size = layer.voxel_byte_size();

        let mut min = DVec3::splat(f64::INFINITY);
        let mut max = DVec3::splat(f64::NEG_INFINITY);
        let mut any = false;
        let half_voxel = DVec3::splat(0.5 * self.resolution);

        for region in self.regions() {
            let Some(block) = region.layer_block(layer_index) else {
                continue;
            };
            let Ok(buffer) = block.buffer() else {
                continue;
            };
            for index in 0..layer.voxel_count(self.region_voxel_dims) {
                let value: f32 = buffer.read(index * voxel_size);
                if value == UNOBSERVED_OCCUPANCY {
                    continue;
                }
                let local = crate::region::local_from_index(index, dims);
                let centre = self.voxel_centre(Key::new(region.coord(), local));
                min = min.min(centre - half_voxel);
                max = max.max(centre + half_voxel);
                any = true;
            }
        }

        any.then(|| Aabb::new(min, max))
    }
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
    use approx::assert_relative_eq;

    fn test_map() -> OccupancyMap {
        OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::empty())
    }

    #[test]
    fn region_zero_is_centred_on_the_origin() {
        let map = test_map();
        assert_eq!(map.region_centre(I16Vec3::ZERO), DVec3::ZERO);
        assert_relative_eq!(map.region_min(I16Vec3::ZERO).x, -1.6);
        assert_relative_eq!(map.region_spatial_dims().x, 3.2);
    }

    #[test]
    fn voxel_key_centre_round_trip() {
        let map = test_map();
        for point in [
            DVec3::ZERO,
            DVec3::new(0.95, 0.0, 0.0),
            DVec3::new(-0.05, 2.0, -7.3),
            DVec3::new(10.0, -10.0, 0.55),
        ] {
            let key = map.voxel_key(point);
            let centre = map.voxel_centre(key);
            // The centre must be in the same voxel.
            assert_eq!(map.voxel_key(centre), key, "point {point:?}");
            assert!((centre - point).abs().max_element() <= map.resolution());
        }
    }

    #[test]
    fn voxel_centres_are_offset_half_a_voxel_from_the_origin() {
        let map = test_map();
        let key = map.voxel_key(DVec3::ZERO);
        assert_relative_eq!(map.voxel_centre(key).x, 0.05);
        let key = map.voxel_key(DVec3::new(0.95, 0.0, 0.0));
        assert_relative_eq!(map.voxel_centre(key).x, 0.95);
    }

    #[test]
    fn stepping_matches_world_geometry() {
        let map = test_map();
        let key = map.voxel_key(DVec3::new(0.05, 0.05, 0.05));
        for axis in 0..3 {
            for step in [-70, -1, 1, 70] {
                let stepped = key.stepped_axis(axis, step, map.region_voxel_dims());
                let expected =
                    map.voxel_centre(key) + step as f64 * map.resolution() * DVec3::AXES[axis];
                assert_relative_eq!(map.voxel_centre(stepped)[axis], expected[axis], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn regions_are_created_lazily() {
        let map = test_map();
        assert_eq!(map.region_count(), 0);
        let coord = I16Vec3::new(1, -1, 0);
        let region = map.get_or_create_region(coord);
        assert_eq!(map.region_count(), 1);
        assert_eq!(region.coord(), coord);
        assert_eq!(region.centre(), map.region_centre(coord));
        // A second fetch returns the same region.
        assert!(Arc::ptr_eq(&region, &map.get_or_create_region(coord)));
    }

    #[test]
    fn layout_locks_once_regions_exist() {
        let mut map = test_map();
        assert!(map.layout_mut().is_ok());
        map.get_or_create_region(I16Vec3::ZERO);
        assert!(matches!(map.layout_mut(), Err(Error::StateInvalid(_))));
        assert!(matches!(map.set_origin(DVec3::ONE), Err(Error::StateInvalid(_))));
    }

    #[test]
    fn probability_value_round_trip() {
        assert_relative_eq!(value_to_probability(0.0), 0.5);
        assert_relative_eq!(probability_to_value(0.7), 0.8473, epsilon = 1e-4);
        assert_relative_eq!(
            value_to_probability(probability_to_value(0.3)),
            0.3,
            epsilon = 1e-6
        );
    }
}
