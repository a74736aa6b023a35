use crate::covariance::{calculate_hit_with_covariance, calculate_miss_ndt, CovarianceVoxel};
use crate::error::{Error, Result};
use crate::incident::update_incident_normal;
use crate::intensity::{HitMissCount, IntensityMeanCov};
use crate::key::Key;
use crate::layout::{self, UNOBSERVED_OCCUPANCY};
use crate::line_walker::walk_segment_keys;
use crate::map::{probability_to_value, OccupancyMap};
use crate::mapper::occupancy::{layer_access, LayerAccess, END_AS_MISS};
use crate::mapper::{RayBatch, RayMapper, RegionCache};
use crate::mean::VoxelMean;
use crate::ray_filter::{good_ray_filter, RayFlags};
use crate::region::{linear_index, Region};

use magnetite_core::glam::DVec3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Selects which NDT layer set a map carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NdtMode {
    /// Occupancy refinement only: mean and covariance layers.
    Occupancy,
    /// Traversability-material mode: additionally tracks per-voxel intensity statistics
    /// and hit/miss counts.
    TraversabilityMaterial,
}

/// Tuning for the NDT update model.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NdtParams {
    /// Sensor range noise (standard deviation, world units). Seeds fresh covariances and
    /// scales the sample likelihood in the miss model.
    pub sensor_noise: f32,
    /// Samples required in a voxel before its Gaussian participates in miss updates.
    pub sample_threshold: u32,
    /// Occupancy value below which a hit reseeds the voxel's covariance and mean.
    pub reinitialise_threshold: f32,
    /// Samples required before the reinitialise threshold may trigger, preventing
    /// oscillation around the threshold.
    pub reinitialise_sample_count: u32,
}

impl Default for NdtParams {
    fn default() -> Self {
        Self {
            sensor_noise: 0.05,
            sample_threshold: 4,
            reinitialise_threshold: probability_to_value(0.25),
            reinitialise_sample_count: 10,
        }
    }
}

/// Adds the layers the NDT mapper requires to `map`'s layout. Must run before the map
/// allocates regions.
pub fn enable_ndt(map: &mut OccupancyMap, mode: NdtMode) -> Result<()> {
    let map_layout = map.layout_mut()?;
    layout::add_occupancy(map_layout);
    layout::add_mean(map_layout);
    layout::add_covariance(map_layout);
    if mode == NdtMode::TraversabilityMaterial {
        layout::add_intensity(map_layout);
        layout::add_hit_miss(map_layout);
    }
    Ok(())
}

/// The normal distributions transform ray integrator.
///
/// Maintains a Gaussian over the sample positions in each voxel (mean and packed
/// square-root covariance) alongside the occupancy value. Hits append the sample to the
/// distribution; misses through voxels with an established distribution are modulated by
/// how strongly the ray actually contradicts the stored surface, which preserves thin
/// structure that plain log-odds misses would erode.
pub struct RayMapperNdt<'a> {
    map: &'a OccupancyMap,
    params: NdtParams,
    occupancy: LayerAccess,
    mean: LayerAccess,
    covariance: LayerAccess,
    traversal: Option<LayerAccess>,
    incident: Option<LayerAccess>,
    touch_time: Option<LayerAccess>,
    intensity: Option<LayerAccess>,
    hit_miss: Option<LayerAccess>,
}

impl<'a> RayMapperNdt<'a> {
    pub fn new(map: &'a OccupancyMap, params: NdtParams) -> Result<Self> {
        let map_layout = map.layout();
        let required = |index: Option<usize>, name: &str| {
            layer_access(map, index, true)?
                .ok_or_else(|| Error::BadInput(format!("ndt mapper requires the {name} layer")))
        };
        Ok(Self {
            map,
            params,
            occupancy: required(map_layout.occupancy_layer(), "occupancy")?,
            mean: required(map_layout.mean_layer(), "mean")?,
            covariance: required(map_layout.covariance_layer(), "covariance")?,
            traversal: layer_access(map, map_layout.traversal_layer(), true)?,
            incident: layer_access(map, map_layout.incident_layer(), true)?,
            touch_time: layer_access(map, map_layout.touch_time_layer(), true)?,
            intensity: layer_access(map, map_layout.intensity_layer(), true)?,
            hit_miss: layer_access(map, map_layout.hit_miss_layer(), true)?,
        })
    }

    pub fn params(&self) -> &NdtParams {
        &self.params
    }

    fn read_mean(&self, region: &Region, local_index: usize) -> Result<VoxelMean> {
        let block = region.layer_block(self.mean.index).expect("blocks match layout");
        let buffer = block.buffer()?;
        Ok(buffer.read(local_index * self.mean.voxel_size))
    }

    fn read_covariance(&self, region: &Region, local_index: usize) -> Result<CovarianceVoxel> {
        let block = region
            .layer_block(self.covariance.index)
            .expect("blocks match layout");
        let buffer = block.buffer()?;
        Ok(buffer.read(local_index * self.covariance.voxel_size))
    }

    fn apply_ndt_miss(
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
        let voxel_mean = self.read_mean(region, local_index)?;
        let cov = self.read_covariance(region, local_index)?;
        let mean_position = self.map.voxel_centre(key)
            + voxel_mean.position(self.map.resolution());

        let block = region
            .layer_block(self.occupancy.index)
            .expect("blocks match layout");
        let mut buffer = block.buffer_mut()?;
        let offset = local_index * self.occupancy.voxel_size;
        let value: f32 = buffer.read(offset);

        if value != UNOBSERVED_OCCUPANCY
            && params.saturate_at_min_value
            && value <= params.min_voxel_value
        {
            return Ok(());
        }

        let mut updated = value;
        calculate_miss_ndt(
            &cov,
            &mut updated,
            origin,
            sample,
            mean_position,
            voxel_mean.count,
            UNOBSERVED_OCCUPANCY,
            params.miss_value,
            self.params.sensor_noise,
            self.params.sample_threshold,
        );
        let updated = updated.clamp(params.min_voxel_value, params.max_voxel_value);
        buffer.write(offset, updated);
        drop(buffer);
        region.touch(self.occupancy.index, stamp, timestamp);
        region.update_first_valid(key.local_key(), self.map.region_voxel_dims());

        if let Some(hit_miss) = &self.hit_miss {
            if updated < value {
                let block = region
                    .layer_block(hit_miss.index)
                    .expect("blocks match layout");
                let mut buffer = block.buffer_mut()?;
                let offset = local_index * hit_miss.voxel_size;
                let mut counts: HitMissCount = buffer.read(offset);
                counts.record_miss();
                buffer.write(offset, counts);
                region.touch(hit_miss.index, stamp, timestamp);
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_ndt_hit(
        &self,
        region: &Region,
        local_index: usize,
        key: Key,
        origin: DVec3,
        sample: DVec3,
        intensity: Option<f32>,
        stamp: u64,
        timestamp: Option<f64>,
    ) -> Result<()> {
        let params = self.map.params();
        let mut voxel_mean = self.read_mean(region, local_index)?;
        let mut cov = self.read_covariance(region, local_index)?;
        let voxel_centre = self.map.voxel_centre(key);
        let mean_position = voxel_centre + voxel_mean.position(self.map.resolution());

        let occupancy_block = region
            .layer_block(self.occupancy.index)
            .expect("blocks match layout");
        let mut occupancy_buffer = occupancy_block.buffer_mut()?;
        let occupancy_offset = local_index * self.occupancy.voxel_size;
        let value: f32 = occupancy_buffer.read(occupancy_offset);

        let saturated = value != UNOBSERVED_OCCUPANCY
            && params.saturate_at_max_value
            && value >= params.max_voxel_value;

        let mut updated = value;
        let reset = calculate_hit_with_covariance(
            &mut cov,
            &mut updated,
            sample,
            mean_position,
            voxel_mean.count,
            params.hit_value,
            UNOBSERVED_OCCUPANCY,
            self.params.sensor_noise,
            self.params.reinitialise_threshold,
            self.params.reinitialise_sample_count,
        );
        let updated = if saturated {
            value
        } else {
            updated.clamp(params.min_voxel_value, params.max_voxel_value)
        };
        occupancy_buffer.write(occupancy_offset, updated);
        drop(occupancy_buffer);
        region.touch(self.occupancy.index, stamp, timestamp);
        region.update_first_valid(key.local_key(), self.map.region_voxel_dims());

        {
            let block = region
                .layer_block(self.covariance.index)
                .expect("blocks match layout");
            let mut buffer = block.buffer_mut()?;
            buffer.write(local_index * self.covariance.voxel_size, cov);
            region.touch(self.covariance.index, stamp, timestamp);
        }

        if reset {
            voxel_mean.clear();
        }
        let prior_count = voxel_mean.count;
        {
            let block = region.layer_block(self.mean.index).expect("blocks match layout");
            let mut buffer = block.buffer_mut()?;
            voxel_mean.update(sample - voxel_centre, self.map.resolution());
            buffer.write(local_index * self.mean.voxel_size, voxel_mean);
            region.touch(self.mean.index, stamp, timestamp);
        }

        if let (Some(access), Some(intensity)) = (&self.intensity, intensity) {
            let block = region.layer_block(access.index).expect("blocks match layout");
            let mut buffer = block.buffer_mut()?;
            let offset = local_index * access.voxel_size;
            let mut stats: IntensityMeanCov = buffer.read(offset);
            stats.update_hit(intensity, prior_count, reset);
            buffer.write(offset, stats);
            region.touch(access.index, stamp, timestamp);
        }

        if let Some(access) = &self.hit_miss {
            let block = region.layer_block(access.index).expect("blocks match layout");
            let mut buffer = block.buffer_mut()?;
            let offset = local_index * access.voxel_size;
            let mut counts: HitMissCount = buffer.read(offset);
            counts.record_hit(reset);
            buffer.write(offset, counts);
            region.touch(access.index, stamp, timestamp);
        }

        if let Some(access) = &self.incident {
            let block = region.layer_block(access.index).expect("blocks match layout");
            let mut buffer = block.buffer_mut()?;
            let offset = local_index * access.voxel_size;
            let packed: u32 = buffer.read(offset);
            let incident_ray = (origin - sample).as_vec3();
            buffer.write(offset, update_incident_normal(packed, incident_ray, prior_count));
            region.touch(access.index, stamp, timestamp);
        }

        if let (Some(access), Some(time)) = (&self.touch_time, timestamp) {
            let block = region.layer_block(access.index).expect("blocks match layout");
            let mut buffer = block.buffer_mut()?;
            buffer.write(local_index * access.voxel_size, self.map.touch_time_ms(time));
            region.touch(access.index, stamp, timestamp);
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

impl<'a> RayMapper for RayMapperNdt<'a> {
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
            let intensity = batch.intensities.map(|i| i[ray_index]);
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
                        self.apply_ndt_miss(
                            &region,
                            local_index,
                            visit.key,
                            origin,
                            sample,
                            stamp,
                            timestamp,
                        )
                    }
                } else if ray_flags.intersects(END_AS_MISS) {
                    self.apply_ndt_miss(
                        &region,
                        local_index,
                        visit.key,
                        origin,
                        sample,
                        stamp,
                        timestamp,
                    )
                } else {
                    self.apply_ndt_hit(
                        &region,
                        local_index,
                        visit.key,
                        origin,
                        sample,
                        intensity,
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
    use crate::map::{MapFlags, OccupancyParams};

    use magnetite_core::glam::U8Vec3;

    fn ndt_map(mode: NdtMode) -> OccupancyMap {
        let mut map = OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::empty());
        map.set_params(OccupancyParams {
            hit_value: 0.85,
            miss_value: -0.4,
            occupancy_threshold_value: 0.0,
            min_voxel_value: -4.0,
            max_voxel_value: 4.0,
            saturate_at_min_value: false,
            saturate_at_max_value: false,
        });
        enable_ndt(&mut map, mode).unwrap();
        map
    }

    fn voxel_mean(map: &OccupancyMap, key: Key) -> VoxelMean {
        let mean_layer = map.layout().mean_layer().unwrap();
        let layer = map.layout().layer_ptr(mean_layer).unwrap();
        let region = map.region(key.region_key()).unwrap();
        let buffer = region.layer_block(mean_layer).unwrap().buffer().unwrap();
        let index = linear_index(key.local_key(), layer.layer_dims(map.region_voxel_dims()));
        buffer.read(index * layer.voxel_byte_size())
    }

    fn voxel_covariance(map: &OccupancyMap, key: Key) -> CovarianceVoxel {
        let cov_layer = map.layout().covariance_layer().unwrap();
        let layer = map.layout().layer_ptr(cov_layer).unwrap();
        let region = map.region(key.region_key()).unwrap();
        let buffer = region.layer_block(cov_layer).unwrap().buffer().unwrap();
        let index = linear_index(key.local_key(), layer.layer_dims(map.region_voxel_dims()));
        buffer.read(index * layer.voxel_byte_size())
    }

    #[test]
    fn mapper_requires_the_ndt_layers() {
        let map = OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::empty());
        assert!(matches!(
            RayMapperNdt::new(&map, NdtParams::default()),
            Err(Error::BadInput(_))
        ));
    }

    #[test]
    fn hits_accumulate_the_distribution() {
        let map = ndt_map(NdtMode::Occupancy);
        let mut mapper = RayMapperNdt::new(&map, NdtParams::default()).unwrap();

        let target = DVec3::new(0.55, 0.05, 0.05);
        let mut rays = Vec::new();
        for i in 0..16 {
            rays.push(DVec3::new(-0.5, 0.05, 0.05));
            rays.push(target + DVec3::new(0.0, 0.002 * (i % 4) as f64, 0.001 * (i % 3) as f64));
        }
        let accepted = mapper.integrate_rays(&RayBatch::new(&rays)).unwrap();
        assert_eq!(accepted, 16);

        let key = map.voxel_key(target);
        assert_eq!(voxel_mean(&map, key).count, 16);
        let p = voxel_covariance(&map, key).covariance_matrix();
        // The seed keeps the diagonal positive.
        assert!(p.col(0)[0] > 0.0);
        let value = map.occupancy_value(key).unwrap();
        assert!(value > 0.0);
    }

    #[test]
    fn established_distribution_resists_grazing_misses() {
        let map = ndt_map(NdtMode::Occupancy);
        let mut mapper = RayMapperNdt::new(&map, NdtParams::default()).unwrap();

        // Build a distribution tight around the voxel centre plane.
        let target = DVec3::new(0.55, 0.05, 0.05);
        let mut rays = Vec::new();
        for i in 0..12 {
            rays.push(DVec3::new(-0.5, 0.05, 0.05));
            rays.push(target + DVec3::new(0.0, 0.002 * (i % 4) as f64, 0.0));
        }
        mapper.integrate_rays(&RayBatch::new(&rays)).unwrap();
        let key = map.voxel_key(target);
        let value_before = map.occupancy_value(key).unwrap();

        // A ray crossing the voxel far from the stored distribution barely contradicts the
        // surface: the NDT miss is much weaker than the standard -0.4 adjustment.
        let graze = [DVec3::new(-0.5, 0.01, 0.05), DVec3::new(1.5, 0.01, 0.05)];
        mapper.integrate_rays(&RayBatch::new(&graze)).unwrap();
        let value_after = map.occupancy_value(key).unwrap();
        assert!((value_before - value_after).abs() < 0.1);
        assert!(value_after > 0.0);

        // A ray straight through the distribution with its sample well beyond contradicts
        // it strongly, far beyond the standard adjustment.
        let through = [DVec3::new(-0.5, 0.05, 0.05), DVec3::new(1.5, 0.05, 0.05)];
        mapper.integrate_rays(&RayBatch::new(&through)).unwrap();
        let value_final = map.occupancy_value(key).unwrap();
        assert!(value_after - value_final > 1.0);
    }

    #[test]
    fn decayed_voxel_reseeds_mean_and_covariance() {
        let map = ndt_map(NdtMode::Occupancy);
        let params = NdtParams {
            reinitialise_threshold: -1.0,
            reinitialise_sample_count: 4,
            ..NdtParams::default()
        };
        let mut mapper = RayMapperNdt::new(&map, params).unwrap();

        let target = DVec3::new(0.55, 0.05, 0.05);
        let key = map.voxel_key(target);

        // Establish the distribution.
        let mut rays = Vec::new();
        for i in 0..20 {
            rays.push(DVec3::new(-0.5, 0.05, 0.05));
            rays.push(target + DVec3::new(0.0, 0.002 * (i % 4) as f64, 0.0));
        }
        mapper.integrate_rays(&RayBatch::new(&rays)).unwrap();
        let count_before = voxel_mean(&map, key).count;
        assert_eq!(count_before, 20);

        // Decay the voxel below the reset threshold with pass-through rays.
        let through = [DVec3::new(-0.5, 0.05, 0.05), DVec3::new(1.5, 0.05, 0.05)];
        for _ in 0..60 {
            mapper.integrate_rays(&RayBatch::new(&through)).unwrap();
            if map.occupancy_value(key).unwrap() < -1.0 {
                break;
            }
        }
        assert!(map.occupancy_value(key).unwrap() < -1.0);

        // The next hit reseeds the distribution.
        let fresh = [DVec3::new(0.55, 0.9, 0.05), target];
        mapper.integrate_rays(&RayBatch::new(&fresh)).unwrap();
        assert_eq!(voxel_mean(&map, key).count, 1);
        let p = voxel_covariance(&map, key).covariance_matrix();
        let noise = params.sensor_noise as f64;
        assert!((p.col(0)[0] - noise * noise).abs() < 1e-9);
        assert!(p.col(1)[0].abs() < 1e-9);
        assert_eq!(map.occupancy_value(key).unwrap(), 0.85);
    }

    #[test]
    fn traversability_mode_tracks_intensity_and_counts() {
        let map = ndt_map(NdtMode::TraversabilityMaterial);
        let mut mapper = RayMapperNdt::new(&map, NdtParams::default()).unwrap();

        let target = DVec3::new(0.55, 0.05, 0.05);
        let rays = [
            DVec3::new(-0.5, 0.05, 0.05),
            target,
            DVec3::new(-0.5, 0.05, 0.05),
            target,
        ];
        let intensities = [10.0f32, 20.0];
        mapper
            .integrate_rays(&RayBatch::new(&rays).with_intensities(&intensities))
            .unwrap();

        let key = map.voxel_key(target);
        let hit_miss_layer = map.layout().hit_miss_layer().unwrap();
        let layer = map.layout().layer_ptr(hit_miss_layer).unwrap();
        let region = map.region(key.region_key()).unwrap();
        let buffer = region.layer_block(hit_miss_layer).unwrap().buffer().unwrap();
        let index = linear_index(key.local_key(), layer.layer_dims(map.region_voxel_dims()));
        let counts: HitMissCount = buffer.read(index * layer.voxel_byte_size());
        assert_eq!(counts.hit, 2);

        let intensity_layer = map.layout().intensity_layer().unwrap();
        let layer = map.layout().layer_ptr(intensity_layer).unwrap();
        let buffer = region.layer_block(intensity_layer).unwrap().buffer().unwrap();
        let stats: IntensityMeanCov = buffer.read(index * layer.voxel_byte_size());
        assert_eq!(stats.mean, 15.0);
    }
}
