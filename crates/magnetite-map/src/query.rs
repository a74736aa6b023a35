use crate::error::Result;
use crate::key::Key;
use crate::layout::UNOBSERVED_OCCUPANCY;
use crate::map::{OccupancyMap, OccupancyType};
use crate::map_info::{info_key, MapInfo, MapValue};
use crate::mapper::{RayBatch, RayMapper};
use crate::region::local_from_index;

use magnetite_core::glam::DVec3;

/// One time-ordered sensor sample, as produced by an external point cloud reader.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplePoint {
    pub timestamp: f64,
    pub origin: DVec3,
    pub sample: DVec3,
    pub intensity: f32,
}

/// The contract external point-cloud sources implement: samples are yielded in monotonic
/// timestamp order.
pub trait CloudReader {
    fn number_of_points(&self) -> u64;
    fn next_sample(&mut self) -> Option<SamplePoint>;
}

/// Drains `reader` into `mapper` in batches of `batch_size` rays. Returns the total number
/// of rays accepted.
pub fn integrate_cloud(
    mapper: &mut dyn RayMapper,
    reader: &mut dyn CloudReader,
    batch_size: usize,
) -> Result<u64> {
    let batch_size = batch_size.max(1);
    let mut rays = Vec::with_capacity(batch_size * 2);
    let mut intensities = Vec::with_capacity(batch_size);
    let mut timestamps = Vec::with_capacity(batch_size);
    let mut accepted = 0u64;

    loop {
        rays.clear();
        intensities.clear();
        timestamps.clear();
        while timestamps.len() < batch_size {
            let Some(point) = reader.next_sample() else {
                break;
            };
            rays.push(point.origin);
            rays.push(point.sample);
            intensities.push(point.intensity);
            timestamps.push(point.timestamp);
        }
        if timestamps.is_empty() {
            return Ok(accepted);
        }
        accepted += mapper.integrate_rays(
            &RayBatch::new(&rays)
                .with_intensities(&intensities)
                .with_timestamps(&timestamps),
        )? as u64;
    }
}

/// Collects the world-space centres of all occupied voxels: the map's point cloud product.
pub fn occupied_voxel_centres(map: &OccupancyMap) -> Vec<DVec3> {
    let Some(occupancy) = map.layout().occupancy_layer() else {
        return Vec::new();
    };
    let layer = map.layout().layer_ptr(occupancy).expect("index from layout").clone();
    let dims = layer.layer_dims(map.region_voxel_dims());
    let voxel_size = layer.voxel_byte_size();
    let voxel_count = layer.voxel_count(map.region_voxel_dims());

    let mut centres = Vec::new();
    for region in map.regions() {
        let Some(block) = region.layer_block(occupancy) else {
            continue;
        };
        let Ok(buffer) = block.buffer() else {
            continue;
        };
        // The first-valid hint skips the leading run of untouched voxels.
        let start = region
            .first_valid_key()
            .map_or(voxel_count, |local| crate::region::linear_index(local, dims));
        for index in start..voxel_count {
            let value: f32 = buffer.read(index * voxel_size);
            if value == UNOBSERVED_OCCUPANCY {
                continue;
            }
            if map.occupancy_type(value) == OccupancyType::Occupied {
                let key = Key::new(region.coord(), local_from_index(index, dims));
                centres.push(map.voxel_centre(key));
            }
        }
    }
    centres
}

/// Heightmap generation parameters, exchanged with heightmap collaborators through
/// [`MapInfo`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeightmapInfo {
    /// Signed up-axis index: 0/1/2 for +X/+Y/+Z, negative for the opposing direction.
    pub axis: i8,
    pub axis_vector: DVec3,
    pub clearance: f64,
}

/// Marks `info` as describing a heightmap with the given up axis and clearance.
pub fn set_heightmap_info(info: &mut MapInfo, heightmap: HeightmapInfo) {
    info.set(info_key::HEIGHTMAP, MapValue::Bool(true));
    info.set(info_key::HEIGHTMAP_AXIS, MapValue::I8(heightmap.axis));
    info.set(info_key::HEIGHTMAP_AXIS_X, MapValue::F64(heightmap.axis_vector.x));
    info.set(info_key::HEIGHTMAP_AXIS_Y, MapValue::F64(heightmap.axis_vector.y));
    info.set(info_key::HEIGHTMAP_AXIS_Z, MapValue::F64(heightmap.axis_vector.z));
    info.set(info_key::HEIGHTMAP_CLEARANCE, MapValue::F64(heightmap.clearance));
}

/// Reads heightmap parameters back out of `info`, if it describes a heightmap.
pub fn heightmap_info(info: &MapInfo) -> Option<HeightmapInfo> {
    if !info.get_bool(info_key::HEIGHTMAP)? {
        return None;
    }
    Some(HeightmapInfo {
        axis: info.get_i8(info_key::HEIGHTMAP_AXIS)?,
        axis_vector: DVec3::new(
            info.get_f64(info_key::HEIGHTMAP_AXIS_X)?,
            info.get_f64(info_key::HEIGHTMAP_AXIS_Y)?,
            info.get_f64(info_key::HEIGHTMAP_AXIS_Z)?,
        ),
        clearance: info.get_f64(info_key::HEIGHTMAP_CLEARANCE)?,
    })
}
