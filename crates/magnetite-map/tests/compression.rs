use magnetite_core::bytes::Bytes;
use magnetite_core::glam::{I16Vec3, U8Vec3};
use magnetite_map::{Key, MapFlags, OccupancyMap};

/// One region coordinate per index, spread over a 10x10x10 lattice.
fn region_coord(index: i16) -> I16Vec3 {
    I16Vec3::new(index % 10, (index / 10) % 10, index / 100)
}

#[test]
fn tide_driven_compression_round_trip() {
    // 16^3 voxel regions: 16 KiB of occupancy bytes per region, about 15.6 MiB across
    // 1000 regions.
    let mut map = OccupancyMap::new(0.1, U8Vec3::splat(16), MapFlags::empty());
    let queue = {
        let queue = map.enable_compression(true).unwrap();
        queue.set_high_tide(Bytes::mebibytes(10));
        queue.set_low_tide(Bytes::mebibytes(5));
        queue.set_grace_interval_ms(0);
        map.compression().unwrap()
    };
    let high_tide = queue.high_tide();

    // Touch 1000 regions, stamping one voxel in each with a recognizable value.
    for i in 0..1000i16 {
        let region = map.get_or_create_region(region_coord(i));
        let occupancy = map.layout().occupancy_layer().unwrap();
        let block = region.layer_block(occupancy).unwrap();
        let mut buffer = block.buffer_mut().unwrap();
        buffer.write::<f32>(0, i as f32);
    }
    // 1000 x 16 KiB of occupancy bytes.
    assert_eq!(
        map.compression().unwrap().resident_bytes(),
        Bytes(1000 * 16 * 1024)
    );

    // A scan cycle reclaims down to the low tide.
    map.compression().unwrap().process_now();
    assert!(map.compression().unwrap().resident_bytes() <= Bytes::mebibytes(5));
    assert!(map.compression().unwrap().drain_events().is_empty());

    // Read one voxel back from every region; decompression must reproduce the
    // pre-compression bytes while scans keep the resident size bounded.
    for i in 0..1000i16 {
        let key = Key::new(region_coord(i), U8Vec3::ZERO);
        assert_eq!(map.occupancy_value(key), Some(i as f32), "region {i}");
        if i % 64 == 0 {
            map.compression().unwrap().process_now();
        }
    }
    map.compression().unwrap().process_now();
    assert!(map.compression().unwrap().resident_bytes() <= high_tide);
}

#[test]
fn compressed_blocks_promote_back_on_write() {
    let mut map = OccupancyMap::new(0.1, U8Vec3::splat(16), MapFlags::empty());
    {
        let queue = map.enable_compression(true).unwrap();
        queue.set_high_tide(Bytes(0));
        queue.set_low_tide(Bytes(0));
        queue.set_grace_interval_ms(0);
    }

    let coord = I16Vec3::ZERO;
    let occupancy = map.layout().occupancy_layer().unwrap();
    {
        let region = map.get_or_create_region(coord);
        let block = region.layer_block(occupancy).unwrap();
        block.buffer_mut().unwrap().write::<f32>(64, 2.5);
    }

    map.compression().unwrap().process_now();
    {
        let region = map.region(coord).unwrap();
        assert!(region.layer_block(occupancy).unwrap().is_compressed());
    }

    // Writing decompresses, preserves the other bytes and re-marks the block dirty.
    {
        let region = map.region(coord).unwrap();
        let block = region.layer_block(occupancy).unwrap();
        let mut buffer = block.buffer_mut().unwrap();
        assert_eq!(buffer.read::<f32>(64), 2.5);
        buffer.write::<f32>(128, -1.5);
    }

    map.compression().unwrap().process_now();
    let region = map.region(coord).unwrap();
    let block = region.layer_block(occupancy).unwrap();
    assert!(block.is_compressed());
    let buffer = block.buffer().unwrap();
    assert_eq!(buffer.read::<f32>(64), 2.5);
    assert_eq!(buffer.read::<f32>(128), -1.5);
}

#[test]
fn background_worker_reclaims_without_explicit_scans() {
    let mut map = OccupancyMap::new(0.1, U8Vec3::splat(16), MapFlags::COMPRESSED);
    {
        let queue = map.compression().unwrap();
        queue.set_high_tide(Bytes::kibibytes(64));
        queue.set_low_tide(Bytes::kibibytes(32));
        queue.set_grace_interval_ms(0);
    }

    for i in 0..16i16 {
        let region = map.get_or_create_region(region_coord(i));
        let occupancy = map.layout().occupancy_layer().unwrap();
        region
            .layer_block(occupancy)
            .unwrap()
            .buffer_mut()
            .unwrap()
            .write::<f32>(0, i as f32);
    }

    // 16 regions x 16 KiB = 256 KiB resident, well over the high tide. Wait for the
    // worker thread to catch up.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let resident = map.compression().unwrap().resident_bytes();
        if resident <= Bytes::kibibytes(64) {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "worker never reclaimed below the high tide (resident {resident})"
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    // Values survive the background compression.
    for i in 0..16i16 {
        let key = Key::new(region_coord(i), U8Vec3::ZERO);
        assert_eq!(map.occupancy_value(key), Some(i as f32));
    }

}
