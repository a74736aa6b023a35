//! The magnetite occupancy map data engine.
//!
//! # Voxels
//!
//! The map is a sparse grid of fixed-size [`Region`]s (typically 32³ voxels), created
//! lazily on first write and held in a flat dictionary keyed by region coordinate. Each
//! per-voxel attribute is a distinct [layer](crate::MapLayout) with its own
//! [`VoxelBlock`] per region, so disabled features cost no memory and no serialization.
//! Every voxel carries a log-odds occupancy estimate; optional layers add the mean sample
//! position, a packed square-root covariance, traversal length, an incident-normal
//! estimate, intensity statistics, hit/miss counts and a touch time.
//!
//! # Ray integration
//!
//! Sensor rays enter through a [`RayMapper`]: the ray filter may clip or reject each ray,
//! the line walker yields the voxels the ray crosses in order, and the mapper applies
//! per-voxel occupancy updates. [`RayMapperOccupancy`] applies the standard log-odds
//! hit/miss model; [`RayMapperNdt`] refines both updates with the per-voxel Gaussian
//! (normal distributions transform), which preserves structure that plain misses erode.
//!
//! # Memory
//!
//! Voxel blocks are reference counted and compressible. Scoped [`VoxelBuffer`] handles
//! retain a block and decompress it on access; once all handles release, the block becomes
//! a candidate for the background [`CompressionQueue`], which keeps total resident bytes
//! between a low and high watermark by compressing the least recently used blocks.
//!
//! # Concurrency
//!
//! The map supports one logical ray integrator at a time; the compression worker runs on
//! its own thread and only transforms storage representation, never observable values.
//! Region dictionary access is mutex guarded, block state transitions are atomic and the
//! map stamp is advanced atomically per integration call. Serialize and load accept a
//! progress sink with cooperative cancellation at region granularity.

mod bitset;
mod block;
mod buffer;
mod compression;
mod covariance;
mod error;
mod incident;
mod intensity;
mod key;
mod layout;
mod line_walker;
mod map;
mod map_info;
mod mapper;
mod mean;
mod query;
mod ray_filter;
mod region;
mod serialise;

pub use block::{BlockOrigin, VoxelBlock};
pub use buffer::{VoxelBuffer, VoxelBufferMut};
pub use compression::{CompressionEvent, CompressionQueue};
pub use covariance::{calculate_hit_with_covariance, calculate_miss_ndt, CovarianceVoxel};
pub use error::{Error, Result};
pub use incident::{decode_normal, encode_normal, update_incident_normal};
pub use intensity::{HitMissCount, IntensityMeanCov};
pub use key::Key;
pub use layout::{
    add_clearance, add_covariance, add_hit_miss, add_incident_normal, add_intensity, add_mean,
    add_occupancy, add_touch_time, add_traversal, default_layer, FillValue, LayerFlags, MapLayer,
    MapLayout, MemberType, VoxelMember, UNOBSERVED_OCCUPANCY,
};
pub use line_walker::{walk_segment_keys, SegmentVisit};
pub use map::{
    probability_to_value, value_to_probability, MapFlags, OccupancyMap, OccupancyParams,
    OccupancyType,
};
pub use map_info::{info_key, MapInfo, MapValue};
pub use mapper::{
    enable_ndt, NdtMode, NdtParams, RayBatch, RayMapper, RayMapperNdt, RayMapperOccupancy,
};
pub use mean::{sub_voxel_coord, sub_voxel_position, VoxelMean};
pub use query::{
    heightmap_info, integrate_cloud, occupied_voxel_centres, set_heightmap_info, CloudReader,
    HeightmapInfo, SamplePoint,
};
pub use ray_filter::{clip_ray_filter, good_ray_filter, RayFilterFn, RayFlags};
pub use region::{linear_index, local_from_index, Region, RegionFlags};
pub use serialise::{
    load, load_from, save, save_to, MapVersion, NoProgress, SerialiseProgress, MAP_MAGIC,
};
