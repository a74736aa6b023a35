use magnetite_core::glam::{DVec3, U8Vec3};
use magnetite_map::{
    add_covariance, add_intensity, add_mean, add_occupancy, load_from, save_to, MapFlags,
    NdtParams, OccupancyMap, RayBatch, RayMapper, RayMapperNdt,
};

use std::io::Cursor;

/// A map with occupancy, mean, covariance and intensity layers, populated by NDT
/// integration of a small synthetic scan.
fn build_map() -> OccupancyMap {
    let mut map = OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::empty());
    {
        let layout = map.layout_mut().unwrap();
        add_occupancy(layout);
        add_mean(layout);
        add_covariance(layout);
        add_intensity(layout);
    }

    let mut mapper = RayMapperNdt::new(&map, NdtParams::default()).unwrap();
    let mut rays = Vec::new();
    let mut intensities = Vec::new();
    let mut timestamps = Vec::new();
    for i in 0..200 {
        let angle = i as f64 * 0.05;
        rays.push(DVec3::ZERO);
        rays.push(DVec3::new(
            1.5 * angle.cos(),
            1.5 * angle.sin(),
            0.1 * (i % 7) as f64,
        ));
        intensities.push((i % 32) as f32);
        timestamps.push(10.0 + i as f64 * 0.001);
    }
    mapper
        .integrate_rays(
            &RayBatch::new(&rays)
                .with_intensities(&intensities)
                .with_timestamps(&timestamps),
        )
        .unwrap();
    map
}

#[test]
fn serialize_deterministic_across_round_trip() {
    let map = build_map();
    assert!(map.region_count() > 1);

    let mut first = Vec::new();
    save_to(&mut first, &map, None).unwrap();

    let loaded = load_from(&mut Cursor::new(&first), None).unwrap();
    let mut second = Vec::new();
    save_to(&mut second, &loaded, None).unwrap();

    assert_eq!(first, second);
}

#[test]
fn round_trip_preserves_every_layer_byte() {
    let map = build_map();
    let mut bytes = Vec::new();
    save_to(&mut bytes, &map, None).unwrap();
    let loaded = load_from(&mut Cursor::new(&bytes), None).unwrap();

    assert_eq!(loaded.layout(), map.layout());
    assert_eq!(loaded.region_count(), map.region_count());
    assert_eq!(loaded.params(), map.params());

    for region in map.regions() {
        let loaded_region = loaded.region(region.coord()).unwrap();
        assert_eq!(loaded_region.touched_time(), region.touched_time());
        for layer in map.layout().layers() {
            let original = region.layer_block(layer.layer_index()).unwrap();
            let restored = loaded_region.layer_block(layer.layer_index()).unwrap();
            let original_buffer = original.buffer().unwrap();
            let restored_buffer = restored.buffer().unwrap();
            assert_eq!(
                original_buffer.bytes(),
                restored_buffer.bytes(),
                "layer {} of region {:?}",
                layer.name(),
                region.coord()
            );
        }
    }
}
