use crate::error::{Error, Result};
use crate::incident::update_incident_normal;
use crate::key::Key;
use crate::layout::UNOBSERVED_OCCUPANCY;
use crate::line_walker::walk_segment_keys;
use crate::map::{OccupancyMap, OccupancyParams};
use crate::mapper::{RayBatch, RayMapper, RegionCache};
use crate::mean::VoxelMean;
use crate::ray_filter::{good_ray_filter, RayFlags};
use crate::region::{linear_index, Region};

use magnetite_core::glam::DVec3;
use std::sync::Arc;

/// Applies `adjustment` to an occupancy value under the map's clamping policy. Returns
/// `None` when saturation suppresses the update. The first write to an unobserved voxel
/// stores the adjustment directly.
pub(crate) fn adjusted_occupancy(
    value: f32,
    adjustment: f32,
    params: &OccupancyParams,
) -> Option<f32> {
    if value == UNOBSERVED_OCCUPANCY {
        return Some(adjustment.clamp(params.min_voxel_value, params.max_voxel_value));
    }
    if adjustment < 0.0 && params.saturate_at_min_value && value <= params.min_voxel_value {
        return None;
    }
    if adjustment > 0.0 && params.saturate_at_max_value && value >= params.max_voxel_value {
        return None;
    }
    Some((value + adjustment).clamp(params.min_voxel_value, params.max_voxel_value))
}

/// End voxels with any of these flags receive the miss update instead of the hit update.
pub(crate) const END_AS_MISS: RayFlags = RayFlags::EXCLUDE_SAMPLE
    .union(RayFlags::CLIPPED_END)
    .union(RayFlags::END_POINT_AS_FREE);

#[derive(Clone, Copy)]
pub(crate) struct LayerAccess {
    pub index: usize,
    pub voxel_size: usize,
}

pub(crate) fn layer_access(
    map: &OccupancyMap,
    index: Option<usize>,
    require_full_dims: bool,
) -> Result<Option<LayerAccess>> {
    let Some(index) = index else {
        return Ok(None);
    };
    let layer = map
        .layout()
        .layer_ptr(index)
        .ok_or_else(|| Error::BadInput(format!("layout has no layer {index}")))?;
    if require_full_dims && layer.subsampling() != [0; 3] {
        return Err(Error::BadInput(format!(
            "layer {} must match the occupancy dimensions",
            layer.name()
        )));
    }
    Ok(Some(LayerAccess {
        index,
        voxel_size: layer.voxel_byte_size(),
    }))
}

/// The standard log-odds ray integrator.
///
/// Walks each accepted ray through the grid, applying the miss adjustment to the voxels
/// the ray passes through and the hit adjustment to the sample voxel, then updating
/// whichever optional layers the map carries (mean, traversal, incident normal, touch
/// time).
pub struct RayMapperOccupancy<'a> {
    map: &'a OccupancyMap,
    occupancy: LayerAccess,
    mean: Option<LayerAccess>,
    traversal: Option<LayerAccess>,
    incident: Option<LayerAccess>,
    touch_time: Option<LayerAccess>,
}

impl<'a> RayMapperOccupancy<'a> {
    pub fn new(map: &'a OccupancyMap) -> Result<Self> {
        let layout = map.layout();
        let occupancy = layer_access(map, layout.occupancy_layer(), true)?
            .ok_or_else(|| Error::BadInput("map has no occupancy layer".to_owned()))?;
        Ok(Self {
            map,
            occupancy,
            mean: layer_access(map, layout.mean_layer(), true)?,
            traversal: layer_access(map, layout.traversal_layer(), true)?,
            incident: layer_access(map, layout.incident_layer(), true)?,
            touch_time: layer_access(map, layout.touch_time_layer(), true)?,
        })
    }

    fn apply_miss(
        &self,
        region: &Region,
        local_index: usize,
        stamp: u64,
        timestamp: Option<f64>,
        key: Key,
    ) -> Result<()> {
        let params = self.map.params();
        let block = region
            .layer_block(self.occupancy.index)
            .expect("blocks match layout");
        let mut buffer = block.buffer_mut()?;
        let offset = local_index * self.occupancy.voxel_size;
        let value: f32 = buffer.read(offset);
        if let Some(updated) = adjusted_occupancy(value, params.miss_value, params) {
            buffer.write(offset, updated);
            region.touch(self.occupancy.index, stamp, timestamp);
            region.update_first_valid(key.local_key(), self.map.region_voxel_dims());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_hit(
        &self,
        region: &Region,
        local_index: usize,
        key: Key,
        origin: DVec3,
        sample: DVec3,
        stamp: u64,
        timestamp: Option<f64>,
    ) -> Result<()> {
        let params = self.map.params();
        {
            let block = region
                .layer_block(self.occupancy.index)
                .expect("blocks match layout");
            let mut buffer = block.buffer_mut()?;
            let offset = local_index * self.occupancy.voxel_size;
            let value: f32 = buffer.read(offset);
            if let Some(updated) = adjusted_occupancy(value, params.hit_value, params) {
                buffer.write(offset, updated);
                region.touch(self.occupancy.index, stamp, timestamp);
                region.update_first_valid(key.local_key(), self.map.region_voxel_dims());
            }
        }

        let mut sample_count = 0;
        if let Some(mean) = &self.mean {
            let block = region.layer_block(mean.index).expect("blocks match layout");
            let mut buffer = block.buffer_mut()?;
            let offset = local_index * mean.voxel_size;
            let mut voxel_mean: VoxelMean = buffer.read(offset);
            sample_count = voxel_mean.count;
            let sample_offset = sample - self.map.voxel_centre(key);
            voxel_mean.update(sample_offset, self.map.resolution());
            buffer.write(offset, voxel_mean);
            region.touch(mean.index, stamp, timestamp);
        }

        if let Some(incident) = &self.incident {
            let block = region
                .layer_block(incident.index)
                .expect("blocks match layout");
            let mut buffer = block.buffer_mut()?;
            let offset = local_index * incident.voxel_size;
            let packed: u32 = buffer.read(offset);
            let incident_ray = (origin - sample).as_vec3();
            buffer.write(offset, update_incident_normal(packed, incident_ray, sample_count));
            region.touch(incident.index, stamp, timestamp);
        }

        if let (Some(touch_time), Some(time)) = (&self.touch_time, timestamp) {
            let block = region
                .layer_block(touch_time.index)
                .expect("blocks match layout");
            let mut buffer = block.buffer_mut()?;
            buffer.write(
                local_index * touch_time.voxel_size,
                self.map.touch_time_ms(time),
            );
            region.touch(touch_time.index, stamp, timestamp);
        }

        Ok(())
    }

    fn accumulate_traversal(
        &self,
        region: &Region,
        local_index: usize,
        chord: f64,
        stamp: u64,
        timestamp: Option<f64>,
    ) -> Result<()> {
        let Some(traversal) = &self.traversal else {
            return Ok(());
        };
        let block = region
            .layer_block(traversal.index)
            .expect("blocks match layout");
        let mut buffer = block.buffer_mut()?;
        let offset = local_index * traversal.voxel_size;
        let length: f32 = buffer.read(offset);
        buffer.write(offset, length + chord as f32);
        region.touch(traversal.index, stamp, timestamp);
        Ok(())
    }
}

impl<'a> RayMapper for RayMapperOccupancy<'a> {
    fn integrate_rays(&mut self, batch: &RayBatch<'_>) -> Result<usize> {
        batch.validate()?;

        let map = self.map;
        let stamp = map.touch_stamp();
        let dims = map.region_voxel_dims();
        let occupancy_dims = map
            .layout()
            .layer_ptr(self.occupancy.index)
            .expect("validated in new")
            .layer_dims(dims);

        let mut accepted = 0;
        let mut cache = RegionCache::default();
        for ray_index in 0..batch.ray_count() {
            let mut origin = batch.rays[2 * ray_index];
            let mut sample = batch.rays[2 * ray_index + 1];
            let mut ray_flags = batch.flags;

            let keep = match map.ray_filter() {
                Some(filter) => filter(&mut origin, &mut sample, &mut ray_flags),
                None => good_ray_filter(&mut origin, &mut sample, &mut ray_flags, 0.0),
            };
            if !keep {
                continue;
            }

            let timestamp = batch.timestamps.map(|t| t[ray_index]);
            if let Some(time) = timestamp {
                map.note_sample_time(time);
            }

            let mut failure = None;
            walk_segment_keys(map, origin, sample, &mut |visit| {
                let region = Arc::clone(cache.fetch(map, visit.key.region_key()));
                let local_index = linear_index(visit.key.local_key(), occupancy_dims);

                let result = if !visit.is_end_voxel {
                    if ray_flags.contains(RayFlags::EXCLUDE_RAY) {
                        Ok(())
                    } else {
                        self.apply_miss(&region, local_index, stamp, timestamp, visit.key)
                    }
                } else if ray_flags.intersects(END_AS_MISS) {
                    self.apply_miss(&region, local_index, stamp, timestamp, visit.key)
                } else {
                    self.apply_hit(
                        &region,
                        local_index,
                        visit.key,
                        origin,
                        sample,
                        stamp,
                        timestamp,
                    )
                };

                let result = result.and_then(|_| {
                    self.accumulate_traversal(
                        &region,
                        local_index,
                        visit.exit_range - visit.enter_range,
                        stamp,
                        timestamp,
                    )
                });

                match result {
                    Ok(()) => true,
                    Err(error) => {
                        failure = Some(error);
                        false
                    }
                }
            });
            if let Some(error) = failure {
                return Err(error);
            }

            accepted += 1;
        }

        Ok(accepted)
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
    use crate::map::MapFlags;

    use approx::assert_relative_eq;
    use magnetite_core::glam::U8Vec3;

    fn test_map(flags: MapFlags) -> OccupancyMap {
        let mut map = OccupancyMap::new(0.1, U8Vec3::splat(32), flags);
        map.set_params(OccupancyParams {
            hit_value: 0.85,
            miss_value: -0.4,
            occupancy_threshold_value: 0.0,
            min_voxel_value: -2.0,
            max_voxel_value: 3.5,
            saturate_at_min_value: false,
            saturate_at_max_value: false,
        });
        map
    }

    fn integrate(map: &OccupancyMap, rays: &[DVec3], flags: RayFlags) -> usize {
        let mut mapper = RayMapperOccupancy::new(map).unwrap();
        mapper
            .integrate_rays(&RayBatch::new(rays).with_flags(flags))
            .unwrap()
    }

    #[test]
    fn one_ray_marks_interior_free_and_end_occupied() {
        let map = test_map(MapFlags::empty());
        let rays = [DVec3::ZERO, DVec3::new(0.95, 0.0, 0.0)];
        assert_eq!(integrate(&map, &rays, RayFlags::empty()), 1);

        for i in 0..9 {
            let key = map.voxel_key(DVec3::new(0.05 + 0.1 * i as f64, 0.0, 0.0));
            assert_eq!(map.occupancy_value(key), Some(-0.4), "interior voxel {i}");
        }
        let end_key = map.voxel_key(DVec3::new(0.95, 0.0, 0.0));
        assert_eq!(map.occupancy_value(end_key), Some(0.85));

        // A voxel beyond the sample stays unobserved.
        let beyond = map.voxel_key(DVec3::new(1.05, 0.0, 0.0));
        assert_eq!(map.occupancy_value(beyond), Some(UNOBSERVED_OCCUPANCY));
    }

    #[test]
    fn exclude_ray_skips_interior_voxels() {
        let map = test_map(MapFlags::empty());
        let rays = [DVec3::ZERO, DVec3::new(0.55, 0.0, 0.0)];
        integrate(&map, &rays, RayFlags::EXCLUDE_RAY);

        let interior = map.voxel_key(DVec3::new(0.25, 0.0, 0.0));
        assert_eq!(map.occupancy_value(interior), Some(UNOBSERVED_OCCUPANCY));
        let end = map.voxel_key(DVec3::new(0.55, 0.0, 0.0));
        assert_eq!(map.occupancy_value(end), Some(0.85));
    }

    #[test]
    fn exclude_sample_turns_the_end_voxel_into_a_miss() {
        let map = test_map(MapFlags::empty());
        let rays = [DVec3::ZERO, DVec3::new(0.35, 0.0, 0.0)];
        integrate(&map, &rays, RayFlags::EXCLUDE_SAMPLE);

        let end = map.voxel_key(DVec3::new(0.35, 0.0, 0.0));
        assert_eq!(map.occupancy_value(end), Some(-0.4));
    }

    #[test]
    fn values_clamp_and_saturate() {
        let mut map = test_map(MapFlags::empty());
        let mut params = *map.params();
        params.max_voxel_value = 2.0;
        params.saturate_at_max_value = true;
        map.set_params(params);

        let rays = [DVec3::new(0.02, 0.0, 0.0), DVec3::new(0.05, 0.0, 0.0)];
        for _ in 0..10 {
            integrate(&map, &rays, RayFlags::empty());
        }
        let key = map.voxel_key(DVec3::new(0.05, 0.0, 0.0));
        assert_eq!(map.occupancy_value(key), Some(2.0));
    }

    #[test]
    fn mean_layer_accumulates_sample_positions() {
        let map = test_map(MapFlags::VOXEL_MEAN);
        let sample = DVec3::new(0.07, 0.0, 0.0);
        let rays = [DVec3::ZERO, sample, DVec3::new(0.0, 0.1, 0.0), sample];
        integrate(&map, &rays, RayFlags::empty());

        let key = map.voxel_key(sample);
        let region = map.region(key.region_key()).unwrap();
        let mean_layer = map.layout().mean_layer().unwrap();
        let layer = map.layout().layer_ptr(mean_layer).unwrap();
        let buffer = region.layer_block(mean_layer).unwrap().buffer().unwrap();
        let index = linear_index(key.local_key(), layer.layer_dims(map.region_voxel_dims()));
        let mean: VoxelMean = buffer.read(index * layer.voxel_byte_size());

        assert_eq!(mean.count, 2);
        let position = map.voxel_centre(key) + mean.position(map.resolution());
        assert_relative_eq!(position.x, sample.x, epsilon = 1e-3);
    }

    #[test]
    fn traversal_layer_accumulates_chord_lengths() {
        let map = test_map(MapFlags::TRAVERSAL);
        // Cross one full voxel then half of the end voxel.
        let rays = [DVec3::new(0.01, 0.05, 0.05), DVec3::new(0.15, 0.05, 0.05)];
        integrate(&map, &rays, RayFlags::empty());

        let traversal_layer = map.layout().traversal_layer().unwrap();
        let layer = map.layout().layer_ptr(traversal_layer).unwrap();
        let first = map.voxel_key(DVec3::new(0.05, 0.05, 0.05));
        let region = map.region(first.region_key()).unwrap();
        let buffer = region.layer_block(traversal_layer).unwrap().buffer().unwrap();

        let index = linear_index(first.local_key(), layer.layer_dims(map.region_voxel_dims()));
        let first_chord: f32 = buffer.read(index * layer.voxel_byte_size());
        assert_relative_eq!(first_chord, 0.09, epsilon = 1e-5);

        let end = map.voxel_key(DVec3::new(0.15, 0.05, 0.05));
        let index = linear_index(end.local_key(), layer.layer_dims(map.region_voxel_dims()));
        let end_chord: f32 = buffer.read(index * layer.voxel_byte_size());
        assert_relative_eq!(end_chord, 0.05, epsilon = 1e-5);
    }

    #[test]
    fn nan_rays_are_rejected_not_fatal() {
        let map = test_map(MapFlags::empty());
        let rays = [
            DVec3::new(f64::NAN, 0.0, 0.0),
            DVec3::new(0.55, 0.0, 0.0),
            DVec3::ZERO,
            DVec3::new(0.55, 0.0, 0.0),
        ];
        assert_eq!(integrate(&map, &rays, RayFlags::empty()), 1);
    }

    #[test]
    fn integration_advances_the_map_stamp() {
        let map = test_map(MapFlags::empty());
        let before = map.stamp();
        let rays = [DVec3::ZERO, DVec3::new(0.15, 0.0, 0.0)];
        integrate(&map, &rays, RayFlags::empty());
        assert!(map.stamp() > before);

        let key = map.voxel_key(DVec3::new(0.15, 0.0, 0.0));
        let region = map.region(key.region_key()).unwrap();
        assert_eq!(region.dirty_stamp(), map.stamp());
    }
}
