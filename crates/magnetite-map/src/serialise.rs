mod v0;

use crate::error::{Error, Result};
use crate::layout::{FillValue, LayerFlags, MapLayout, MemberType};
use crate::map::{MapFlags, OccupancyMap, OccupancyParams};
use crate::map_info::{MapInfo, MapValue};

use magnetite_core::glam::{DVec3, I16Vec3, U8Vec3};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// The file magic leading every serialized map. Files carry the `.ohm` extension by
/// convention.
pub const MAP_MAGIC: [u8; 4] = *b"ohm\0";

/// A serialized map format version.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct MapVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl MapVersion {
    /// The version written by [`save`].
    pub const CURRENT: Self = Self {
        major: 0,
        minor: 4,
        patch: 0,
    };

    /// Loading accepts any minor/patch of a supported major. Minor zero carries the legacy
    /// region encoding handled by the `v0` module.
    pub fn supported_for_load(&self) -> bool {
        self.major == Self::CURRENT.major
    }

    pub fn is_legacy(&self) -> bool {
        self.major == 0 && self.minor == 0
    }
}

impl fmt::Display for MapVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Progress reporting and cancellation for long serialize/load operations.
///
/// The serializer sets the target from the region count, increments once per region and
/// consults [`SerialiseProgress::quit`] at region boundaries, returning
/// [`Error::Aborted`] when it reads true.
pub trait SerialiseProgress {
    fn quit(&self) -> bool {
        false
    }

    fn set_target(&mut self, target: u64) {
        let _ = target;
    }

    fn increment(&mut self) {}
}

/// No-op progress, for callers that don't track it.
pub struct NoProgress;

impl SerialiseProgress for NoProgress {}

// ----------------------------------------------------------------------------------------
// Little-endian primitives
// ----------------------------------------------------------------------------------------

fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Truncated
        } else {
            Error::Io(e)
        }
    })
}

macro_rules! impl_read_write {
    ($write_name:ident, $read_name:ident, $t:ty) => {
        fn $write_name(writer: &mut impl Write, value: $t) -> Result<()> {
            writer.write_all(&value.to_le_bytes())?;
            Ok(())
        }

        fn $read_name(reader: &mut impl Read) -> Result<$t> {
            let mut buf = [0u8; std::mem::size_of::<$t>()];
            read_exact(reader, &mut buf)?;
            Ok(<$t>::from_le_bytes(buf))
        }
    };
}

impl_read_write!(write_u8, read_u8, u8);
impl_read_write!(write_u16, read_u16, u16);
impl_read_write!(write_u32, read_u32, u32);
impl_read_write!(write_u64, read_u64, u64);
impl_read_write!(write_i8, read_i8, i8);
impl_read_write!(write_i16, read_i16, i16);
impl_read_write!(write_i32, read_i32, i32);
impl_read_write!(write_i64, read_i64, i64);
impl_read_write!(write_f32, read_f32, f32);
impl_read_write!(write_f64, read_f64, f64);

fn write_name(writer: &mut impl Write, name: &str) -> Result<()> {
    if name.len() > u16::MAX as usize {
        return Err(Error::ValueOverflow);
    }
    write_u16(writer, name.len() as u16)?;
    writer.write_all(name.as_bytes())?;
    Ok(())
}

fn read_name(reader: &mut impl Read) -> Result<String> {
    let len = read_u16(reader)? as usize;
    let mut bytes = vec![0u8; len];
    read_exact(reader, &mut bytes)?;
    String::from_utf8(bytes).map_err(|_| Error::LayoutMismatch("non-utf8 name".to_owned()))
}

fn write_dvec3(writer: &mut impl Write, v: DVec3) -> Result<()> {
    write_f64(writer, v.x)?;
    write_f64(writer, v.y)?;
    write_f64(writer, v.z)
}

fn read_dvec3(reader: &mut impl Read) -> Result<DVec3> {
    Ok(DVec3::new(read_f64(reader)?, read_f64(reader)?, read_f64(reader)?))
}

// ----------------------------------------------------------------------------------------
// MapInfo
// ----------------------------------------------------------------------------------------

fn write_map_value(writer: &mut impl Write, value: &MapValue) -> Result<()> {
    write_u8(writer, value.type_code())?;
    match value {
        MapValue::Bool(v) => write_u8(writer, *v as u8),
        MapValue::I8(v) => write_i8(writer, *v),
        MapValue::U8(v) => write_u8(writer, *v),
        MapValue::I16(v) => write_i16(writer, *v),
        MapValue::U16(v) => write_u16(writer, *v),
        MapValue::I32(v) => write_i32(writer, *v),
        MapValue::U32(v) => write_u32(writer, *v),
        MapValue::I64(v) => write_i64(writer, *v),
        MapValue::U64(v) => write_u64(writer, *v),
        MapValue::F32(v) => write_f32(writer, *v),
        MapValue::F64(v) => write_f64(writer, *v),
        MapValue::Str(v) => {
            if v.len() > u32::MAX as usize {
                return Err(Error::ValueOverflow);
            }
            write_u32(writer, v.len() as u32)?;
            writer.write_all(v.as_bytes())?;
            Ok(())
        }
    }
}

fn read_map_value(reader: &mut impl Read) -> Result<MapValue> {
    let code = read_u8(reader)?;
    Ok(match code {
        1 => MapValue::Bool(read_u8(reader)? != 0),
        2 => MapValue::I8(read_i8(reader)?),
        3 => MapValue::U8(read_u8(reader)?),
        4 => MapValue::I16(read_i16(reader)?),
        5 => MapValue::U16(read_u16(reader)?),
        6 => MapValue::I32(read_i32(reader)?),
        7 => MapValue::U32(read_u32(reader)?),
        8 => MapValue::I64(read_i64(reader)?),
        9 => MapValue::U64(read_u64(reader)?),
        10 => MapValue::F32(read_f32(reader)?),
        11 => MapValue::F64(read_f64(reader)?),
        12 => {
            let len = read_u32(reader)? as usize;
            let mut bytes = vec![0u8; len];
            read_exact(reader, &mut bytes)?;
            MapValue::Str(
                String::from_utf8(bytes)
                    .map_err(|_| Error::LayoutMismatch("non-utf8 map info value".to_owned()))?,
            )
        }
        _ => return Err(Error::LayoutMismatch(format!("unknown map info type code {code}"))),
    })
}

fn write_map_info(writer: &mut impl Write, info: &MapInfo) -> Result<()> {
    write_u32(writer, info.len() as u32)?;
    let mut entries: Vec<(&str, &MapValue)> = info.iter().collect();
    entries.sort_by_key(|(name, _)| *name);
    for (name, value) in entries {
        write_name(writer, name)?;
        write_map_value(writer, value)?;
    }
    Ok(())
}

fn read_map_info(reader: &mut impl Read) -> Result<MapInfo> {
    let count = read_u32(reader)?;
    let mut info = MapInfo::new();
    for _ in 0..count {
        let name = read_name(reader)?;
        let value = read_map_value(reader)?;
        info.set(&name, value);
    }
    Ok(info)
}

// ----------------------------------------------------------------------------------------
// Layout
// ----------------------------------------------------------------------------------------

fn write_layout(writer: &mut impl Write, layout: &MapLayout) -> Result<()> {
    write_u32(writer, layout.layer_count() as u32)?;
    for layer in layout.layers() {
        write_name(writer, layer.name())?;
        write_u16(writer, layer.flags().bits())?;
        for s in layer.subsampling() {
            write_u8(writer, s)?;
        }
        write_u32(writer, layer.members().len() as u32)?;
        for member in layer.members() {
            write_name(writer, member.name())?;
            write_u8(writer, member.member_type().type_code())?;
            write_u16(writer, member.offset() as u16)?;
            writer.write_all(&member.default_value().0)?;
        }
    }
    Ok(())
}

fn read_layout(reader: &mut impl Read) -> Result<MapLayout> {
    let layer_count = read_u32(reader)?;
    let mut layout = MapLayout::new();
    for _ in 0..layer_count {
        let name = read_name(reader)?;
        let flags = LayerFlags::from_bits_truncate(read_u16(reader)?);
        let subsampling = [read_u8(reader)?, read_u8(reader)?, read_u8(reader)?];
        let member_count = read_u32(reader)?;

        let layer = layout
            .add_layer(&name, flags)
            .map_err(|_| Error::LayoutMismatch(format!("duplicate layer {name}")))?;
        layer.set_subsampling(subsampling);
        for _ in 0..member_count {
            let member_name = read_name(reader)?;
            let type_code = read_u8(reader)?;
            let member_type = MemberType::from_type_code(type_code).ok_or_else(|| {
                Error::LayoutMismatch(format!("unknown member type code {type_code}"))
            })?;
            let expected_offset = read_u16(reader)?;
            let mut default = [0u8; 8];
            read_exact(reader, &mut default)?;
            let index = layer.add_member(&member_name, member_type, FillValue(default));
            let assigned = layer.members()[index].offset();
            if assigned != expected_offset as usize {
                return Err(Error::LayoutMismatch(format!(
                    "member {member_name} offset {expected_offset} does not match layout rules"
                )));
            }
        }
    }
    Ok(layout)
}

// ----------------------------------------------------------------------------------------
// Save
// ----------------------------------------------------------------------------------------

/// Serializes `map` to `path`, creating or truncating the file.
pub fn save(
    path: &Path,
    map: &OccupancyMap,
    progress: Option<&mut dyn SerialiseProgress>,
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    save_to(&mut writer, map, progress)?;
    writer.flush()?;
    Ok(())
}

/// Serializes `map` into `writer` using the current format version.
///
/// Regions are written in sorted coordinate order, making the output deterministic for a
/// given map state. Layers flagged [`LayerFlags::SKIP_SERIALISE`] are omitted.
pub fn save_to(
    writer: &mut impl Write,
    map: &OccupancyMap,
    mut progress: Option<&mut dyn SerialiseProgress>,
) -> Result<()> {
    let mut regions = map.regions();
    regions.sort_by_key(|r| {
        let c = r.coord();
        (c.x, c.y, c.z)
    });
    if regions.len() > u32::MAX as usize {
        return Err(Error::ValueOverflow);
    }

    if let Some(progress) = progress.as_mut() {
        progress.set_target(regions.len() as u64);
    }

    // Header.
    writer.write_all(&MAP_MAGIC)?;
    write_u16(writer, MapVersion::CURRENT.major)?;
    write_u16(writer, MapVersion::CURRENT.minor)?;
    write_u16(writer, MapVersion::CURRENT.patch)?;
    write_u32(writer, regions.len() as u32)?;
    write_dvec3(writer, map.origin())?;
    write_f64(writer, map.resolution())?;
    let dims = map.region_voxel_dims();
    writer.write_all(&[dims.x, dims.y, dims.z])?;
    let params = map.params();
    write_f32(writer, params.hit_value)?;
    write_f32(writer, params.miss_value)?;
    write_f32(writer, params.occupancy_threshold_value)?;
    write_f32(writer, params.min_voxel_value)?;
    write_f32(writer, params.max_voxel_value)?;
    write_u8(writer, params.saturate_at_min_value as u8)?;
    write_u8(writer, params.saturate_at_max_value as u8)?;
    write_u32(writer, map.flags().bits())?;
    write_map_info(writer, map.info())?;

    write_layout(writer, map.layout())?;

    // Regions.
    for region in &regions {
        if progress.as_ref().is_some_and(|p| p.quit()) {
            return Err(Error::Aborted);
        }

        let coord = region.coord();
        write_i16(writer, coord.x)?;
        write_i16(writer, coord.y)?;
        write_i16(writer, coord.z)?;
        write_dvec3(writer, region.centre())?;
        write_f64(writer, region.touched_time())?;

        for layer in map.layout().layers() {
            if layer.flags().contains(LayerFlags::SKIP_SERIALISE) {
                continue;
            }
            let block = region
                .layer_block(layer.layer_index())
                .ok_or_else(|| Error::LayoutMismatch(format!("region missing layer {}", layer.name())))?;
            let buffer = block.buffer()?;
            let bytes = buffer.bytes();
            if bytes.len() > u32::MAX as usize {
                return Err(Error::ValueOverflow);
            }
            write_u32(writer, bytes.len() as u32)?;
            writer.write_all(bytes)?;
        }

        region.clear_dirty_flag();
        if let Some(progress) = progress.as_mut() {
            progress.increment();
        }
    }

    Ok(())
}

// ----------------------------------------------------------------------------------------
// Load
// ----------------------------------------------------------------------------------------

struct MapHeader {
    version: MapVersion,
    region_count: u32,
    origin: DVec3,
    resolution: f64,
    region_voxel_dims: U8Vec3,
    params: OccupancyParams,
    flags: MapFlags,
    info: MapInfo,
}

fn read_header(reader: &mut impl Read) -> Result<MapHeader> {
    let mut magic = [0u8; 4];
    read_exact(reader, &mut magic)?;
    if magic != MAP_MAGIC {
        return Err(Error::BadMagic);
    }

    let version = MapVersion {
        major: read_u16(reader)?,
        minor: read_u16(reader)?,
        patch: read_u16(reader)?,
    };
    if !version.supported_for_load() {
        return Err(Error::UnsupportedVersion(version));
    }

    let region_count = read_u32(reader)?;
    let origin = read_dvec3(reader)?;
    let resolution = read_f64(reader)?;
    let mut dims = [0u8; 3];
    read_exact(reader, &mut dims)?;
    let params = OccupancyParams {
        hit_value: read_f32(reader)?,
        miss_value: read_f32(reader)?,
        occupancy_threshold_value: read_f32(reader)?,
        min_voxel_value: read_f32(reader)?,
        max_voxel_value: read_f32(reader)?,
        saturate_at_min_value: read_u8(reader)? != 0,
        saturate_at_max_value: read_u8(reader)? != 0,
    };
    let flags = MapFlags::from_bits_truncate(read_u32(reader)?);
    let info = read_map_info(reader)?;

    Ok(MapHeader {
        version,
        region_count,
        origin,
        resolution,
        region_voxel_dims: U8Vec3::new(dims[0], dims[1], dims[2]),
        params,
        flags,
        info,
    })
}

/// Loads a map from `path`.
pub fn load(path: &Path, progress: Option<&mut dyn SerialiseProgress>) -> Result<OccupancyMap> {
    load_from(&mut BufReader::new(File::open(path)?), progress)
}

/// Loads a map from `reader`. Accepts the current format and the legacy minor-zero
/// encoding.
pub fn load_from(
    reader: &mut impl Read,
    mut progress: Option<&mut dyn SerialiseProgress>,
) -> Result<OccupancyMap> {
    let header = read_header(reader)?;
    if !(header.resolution > 0.0 && header.resolution.is_finite())
        || header.region_voxel_dims.min_element() < 1
    {
        return Err(Error::LayoutMismatch(
            "header resolution or region dimensions are invalid".to_owned(),
        ));
    }

    let mut map = OccupancyMap::new(header.resolution, header.region_voxel_dims, MapFlags::empty());
    map.set_origin(header.origin)?;
    map.set_params(header.params);
    map.set_flags(header.flags);
    *map.info_mut() = header.info;

    if let Some(progress) = progress.as_mut() {
        progress.set_target(header.region_count as u64);
    }

    if header.version.is_legacy() {
        v0::load_regions(reader, &mut map, header.region_count, header.flags, progress)?;
        return Ok(map);
    }

    let layout = read_layout(reader)?;
    map.replace_layout(layout)?;
    if header.flags.contains(MapFlags::COMPRESSED) {
        map.enable_compression(false)?;
    }

    for _ in 0..header.region_count {
        if progress.as_ref().is_some_and(|p| p.quit()) {
            return Err(Error::Aborted);
        }

        let coord = I16Vec3::new(read_i16(reader)?, read_i16(reader)?, read_i16(reader)?);
        let _centre = read_dvec3(reader)?;
        let touched_time = read_f64(reader)?;

        let region = map.get_or_create_region(coord);
        region.set_touched_time(touched_time);

        for layer in map.layout().layers() {
            if layer.flags().contains(LayerFlags::SKIP_SERIALISE) {
                continue;
            }
            let size = read_u32(reader)? as usize;
            let expected = layer.voxel_count(map.region_voxel_dims()) * layer.voxel_byte_size();
            if size != expected {
                return Err(Error::LayoutMismatch(format!(
                    "layer {} block is {size} bytes, layout requires {expected}",
                    layer.name()
                )));
            }
            let block = region
                .layer_block(layer.layer_index())
                .ok_or_else(|| Error::LayoutMismatch(format!("region missing layer {}", layer.name())))?;
            let mut buffer = block.buffer_mut()?;
            read_exact(reader, &mut buffer.bytes_mut()[..size])?;
        }

        region.search_first_valid(map.layout(), map.region_voxel_dims());
        if let Some(progress) = progress.as_mut() {
            progress.increment();
        }
    }

    Ok(map)
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
