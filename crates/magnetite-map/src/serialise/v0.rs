//! The legacy minor-zero region encoding: no layout block, occupancy and clearance values
//! interleaved per voxel. Read-only; saving always emits the current format.

use super::{read_dvec3, read_exact, read_f64, read_i32, SerialiseProgress};
use crate::error::{Error, Result};
use crate::layout::{self, MapLayout};
use crate::map::{MapFlags, OccupancyMap};

use magnetite_core::glam::I16Vec3;
use std::io::Read;

/// The never-populated legacy layer some old maps carried. Accepted and zeroed on load,
/// dropped on the next save.
const COARSE_CLEARANCE_LAYER: &str = "coarseClearance";

pub(super) fn load_regions(
    reader: &mut impl Read,
    map: &mut OccupancyMap,
    region_count: u32,
    flags: MapFlags,
    mut progress: Option<&mut dyn SerialiseProgress>,
) -> Result<()> {
    // The legacy format predates serialized layouts; it always stored exactly the default
    // occupancy plus clearance pair.
    let mut map_layout = MapLayout::new();
    layout::add_occupancy(&mut map_layout);
    layout::add_clearance(&mut map_layout);
    map.replace_layout(map_layout)?;
    if flags.contains(MapFlags::COMPRESSED) {
        map.enable_compression(false)?;
    }

    let occupancy = map.layout().occupancy_layer().expect("default layout");
    let clearance = map.layout().clearance_layer().expect("default layout");
    let occupancy_size = map.layout().layer_ptr(occupancy).expect("default layout").voxel_byte_size();
    let clearance_size = map.layout().layer_ptr(clearance).expect("default layout").voxel_byte_size();

    let dims = map.region_voxel_dims();
    let voxel_count = dims.x as usize * dims.y as usize * dims.z as usize;
    let node_byte_count = 2 * std::mem::size_of::<f32>() * voxel_count;
    if node_byte_count > u32::MAX as usize {
        return Err(Error::ValueOverflow);
    }

    for _ in 0..region_count {
        if progress.as_ref().is_some_and(|p| p.quit()) {
            return Err(Error::Aborted);
        }

        // Legacy records stored 32-bit region coordinates.
        let coord = [read_i32(reader)?, read_i32(reader)?, read_i32(reader)?];
        for c in coord {
            if c < i16::MIN as i32 || c > i16::MAX as i32 {
                return Err(Error::ValueOverflow);
            }
        }
        let coord = I16Vec3::new(coord[0] as i16, coord[1] as i16, coord[2] as i16);
        let _centre = read_dvec3(reader)?;
        let touched_time = read_f64(reader)?;

        let mut node_data = vec![0u8; node_byte_count];
        read_exact(reader, &mut node_data)?;

        let region = map.get_or_create_region(coord);
        region.set_touched_time(touched_time);

        if let Some(coarse) = map.layout().layer_index(COARSE_CLEARANCE_LAYER) {
            let block = region.layer_block(coarse).expect("blocks match layout");
            block.buffer_mut()?.bytes_mut().fill(0);
        }

        // The legacy node interleaved occupancy and clearance floats; split them out.
        {
            let occupancy_block = region.layer_block(occupancy).expect("blocks match layout");
            let mut occupancy_buffer = occupancy_block.buffer_mut()?;
            let clearance_block = region.layer_block(clearance).expect("blocks match layout");
            let mut clearance_buffer = clearance_block.buffer_mut()?;
            for i in 0..voxel_count {
                let base = 2 * std::mem::size_of::<f32>() * i;
                occupancy_buffer.bytes_mut()[i * occupancy_size..i * occupancy_size + 4]
                    .copy_from_slice(&node_data[base..base + 4]);
                clearance_buffer.bytes_mut()[i * clearance_size..i * clearance_size + 4]
                    .copy_from_slice(&node_data[base + 4..base + 8]);
            }
        }

        region.search_first_valid(map.layout(), dims);
        if let Some(progress) = progress.as_mut() {
            progress.increment();
        }
    }

    Ok(())
}
