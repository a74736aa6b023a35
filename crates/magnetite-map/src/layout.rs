use crate::error::{Error, Result};

use bitflags::bitflags;
use magnetite_core::glam::U8Vec3;

/// The occupancy value of a voxel no ray has ever touched. Never produced by an occupancy
/// adjustment: the first write to an unobserved voxel stores the adjustment directly.
pub const UNOBSERVED_OCCUPANCY: f32 = f32::INFINITY;

/// Well known layer names used by the engine.
pub mod default_layer {
    pub const OCCUPANCY: &str = "occupancy";
    pub const MEAN: &str = "mean";
    pub const COVARIANCE: &str = "covariance";
    pub const TRAVERSAL: &str = "traversal";
    pub const CLEARANCE: &str = "clearance";
    pub const INCIDENT: &str = "incident";
    pub const INTENSITY: &str = "intensity";
    pub const HIT_MISS: &str = "hit_miss";
    pub const TOUCH_TIME: &str = "touch_time";
}

bitflags! {
    /// Per-layer behavioral flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct LayerFlags: u16 {
        /// The layer is skipped when serializing the map.
        const SKIP_SERIALISE = 1 << 0;
    }
}

/// The primitive type of one member within a voxel schema.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemberType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl MemberType {
    pub const fn byte_size(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Natural alignment of the member within a voxel.
    pub const fn alignment(self) -> usize {
        self.byte_size()
    }

    pub const fn type_code(self) -> u8 {
        match self {
            Self::Bool => 1,
            Self::I8 => 2,
            Self::U8 => 3,
            Self::I16 => 4,
            Self::U16 => 5,
            Self::I32 => 6,
            Self::U32 => 7,
            Self::I64 => 8,
            Self::U64 => 9,
            Self::F32 => 10,
            Self::F64 => 11,
        }
    }

    pub fn from_type_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Bool,
            2 => Self::I8,
            3 => Self::U8,
            4 => Self::I16,
            5 => Self::U16,
            6 => Self::I32,
            7 => Self::U32,
            8 => Self::I64,
            9 => Self::U64,
            10 => Self::F32,
            11 => Self::F64,
            _ => return None,
        })
    }
}

/// Encodes a default-fill value as the 8 raw little-endian bytes stored in a schema.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FillValue(pub [u8; 8]);

impl From<f32> for FillValue {
    fn from(v: f32) -> Self {
        let mut bytes = [0; 8];
        bytes[..4].copy_from_slice(&v.to_le_bytes());
        Self(bytes)
    }
}

impl From<f64> for FillValue {
    fn from(v: f64) -> Self {
        Self(v.to_le_bytes())
    }
}

impl From<u32> for FillValue {
    fn from(v: u32) -> Self {
        let mut bytes = [0; 8];
        bytes[..4].copy_from_slice(&v.to_le_bytes());
        Self(bytes)
    }
}

impl From<u64> for FillValue {
    fn from(v: u64) -> Self {
        Self(v.to_le_bytes())
    }
}

impl From<i64> for FillValue {
    fn from(v: i64) -> Self {
        Self(v.to_le_bytes())
    }
}

impl From<bool> for FillValue {
    fn from(v: bool) -> Self {
        let mut bytes = [0; 8];
        bytes[0] = v as u8;
        Self(bytes)
    }
}

/// One named, typed member of a voxel schema.
#[derive(Clone, Debug, PartialEq)]
pub struct VoxelMember {
    name: String,
    member_type: MemberType,
    offset: u16,
    default_value: FillValue,
}

impl VoxelMember {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member_type(&self) -> MemberType {
        self.member_type
    }

    /// Byte offset of this member within one voxel.
    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    pub fn default_value(&self) -> FillValue {
        self.default_value
    }

    /// The default-fill bytes for this member, truncated to the member size.
    pub fn default_bytes(&self) -> &[u8] {
        &self.default_value.0[..self.member_type.byte_size()]
    }
}

/// One voxel attribute stored across all regions: a name, behavioral flags, an optional
/// per-axis power-of-two subsampling and an ordered voxel schema.
///
/// Member offsets are assigned densely in insertion order with natural alignment; the total
/// voxel byte size is aligned to 4 bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct MapLayer {
    name: String,
    index: usize,
    flags: LayerFlags,
    subsampling: [u8; 3],
    members: Vec<VoxelMember>,
    end_offset: u16,
}

impl MapLayer {
    fn new(name: String, index: usize, flags: LayerFlags) -> Self {
        Self {
            name,
            index,
            flags,
            subsampling: [0; 3],
            members: Vec::new(),
            end_offset: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The index assigned to this layer on insertion into the layout.
    pub fn layer_index(&self) -> usize {
        self.index
    }

    pub fn flags(&self) -> LayerFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: LayerFlags) {
        self.flags = flags;
    }

    /// Per-axis power-of-two downsampling shifts applied to the region voxel dimensions.
    pub fn subsampling(&self) -> [u8; 3] {
        self.subsampling
    }

    pub fn set_subsampling(&mut self, subsampling: [u8; 3]) {
        self.subsampling = subsampling;
    }

    /// Appends a member to the voxel schema, assigning the next naturally aligned offset.
    /// Returns the member index.
    pub fn add_member(
        &mut self,
        name: &str,
        member_type: MemberType,
        default_value: FillValue,
    ) -> usize {
        let align = member_type.alignment() as u16;
        let offset = (self.end_offset + align - 1) & !(align - 1);
        self.members.push(VoxelMember {
            name: name.to_owned(),
            member_type,
            offset,
            default_value,
        });
        self.end_offset = offset + member_type.byte_size() as u16;
        self.members.len() - 1
    }

    pub fn members(&self) -> &[VoxelMember] {
        &self.members
    }

    /// Case-sensitive member lookup.
    pub fn member(&self, name: &str) -> Option<&VoxelMember> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Total bytes of one voxel in this layer, aligned to 4 bytes.
    pub fn voxel_byte_size(&self) -> usize {
        ((self.end_offset as usize) + 3) & !3
    }

    /// The voxel dimensions of this layer's blocks, after subsampling.
    pub fn layer_dims(&self, region_dims: U8Vec3) -> U8Vec3 {
        U8Vec3::new(
            (region_dims.x >> self.subsampling[0]).max(1),
            (region_dims.y >> self.subsampling[1]).max(1),
            (region_dims.z >> self.subsampling[2]).max(1),
        )
    }

    /// Number of voxels in one of this layer's blocks.
    pub fn voxel_count(&self, region_dims: U8Vec3) -> usize {
        let dims = self.layer_dims(region_dims);
        dims.x as usize * dims.y as usize * dims.z as usize
    }

    /// The fill pattern for one default-initialized voxel.
    pub fn default_voxel_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.voxel_byte_size()];
        for member in &self.members {
            let offset = member.offset();
            bytes[offset..offset + member.member_type.byte_size()]
                .copy_from_slice(member.default_bytes());
        }
        bytes
    }
}

/// The ordered set of voxel layers a map stores.
///
/// Layout mutation is only legal before the map allocates its first region; see
/// [`OccupancyMap::layout_mut`](crate::OccupancyMap::layout_mut).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapLayout {
    layers: Vec<MapLayer>,
}

impl MapLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer. Layer names are unique; a duplicate is an error.
    pub fn add_layer(&mut self, name: &str, flags: LayerFlags) -> Result<&mut MapLayer> {
        if self.layer(name).is_some() {
            return Err(Error::BadInput(format!("duplicate layer name: {name}")));
        }
        let index = self.layers.len();
        self.layers.push(MapLayer::new(name.to_owned(), index, flags));
        Ok(&mut self.layers[index])
    }

    /// Case-sensitive layer lookup by name. O(layer count).
    pub fn layer(&self, name: &str) -> Option<&MapLayer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<&mut MapLayer> {
        self.layers.iter_mut().find(|l| l.name == name)
    }

    pub fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == name)
    }

    pub fn layer_ptr(&self, index: usize) -> Option<&MapLayer> {
        self.layers.get(index)
    }

    pub fn layers(&self) -> &[MapLayer] {
        &self.layers
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn occupancy_layer(&self) -> Option<usize> {
        self.layer_index(default_layer::OCCUPANCY)
    }

    pub fn mean_layer(&self) -> Option<usize> {
        self.layer_index(default_layer::MEAN)
    }

    pub fn covariance_layer(&self) -> Option<usize> {
        self.layer_index(default_layer::COVARIANCE)
    }

    pub fn traversal_layer(&self) -> Option<usize> {
        self.layer_index(default_layer::TRAVERSAL)
    }

    pub fn clearance_layer(&self) -> Option<usize> {
        self.layer_index(default_layer::CLEARANCE)
    }

    pub fn incident_layer(&self) -> Option<usize> {
        self.layer_index(default_layer::INCIDENT)
    }

    pub fn intensity_layer(&self) -> Option<usize> {
        self.layer_index(default_layer::INTENSITY)
    }

    pub fn hit_miss_layer(&self) -> Option<usize> {
        self.layer_index(default_layer::HIT_MISS)
    }

    pub fn touch_time_layer(&self) -> Option<usize> {
        self.layer_index(default_layer::TOUCH_TIME)
    }
}

// The canonical add functions below are idempotent: adding a layer that already exists
// returns the existing index.
macro_rules! get_or_add_layer {
    ($layout:expr, $name:expr) => {
        match $layout.layer_index($name) {
            Some(index) => return index,
            None => $layout.add_layer($name, LayerFlags::empty()).expect("checked absent"),
        }
    };
}

/// Adds the occupancy layer: one `f32` log-odds value per voxel, defaulting to the
/// unobserved sentinel.
pub fn add_occupancy(layout: &mut MapLayout) -> usize {
    let layer = get_or_add_layer!(layout, default_layer::OCCUPANCY);
    layer.add_member("value", MemberType::F32, UNOBSERVED_OCCUPANCY.into());
    layer.layer_index()
}

/// Adds the voxel mean layer: a packed sub-voxel sample position and a sample count.
pub fn add_mean(layout: &mut MapLayout) -> usize {
    let layer = get_or_add_layer!(layout, default_layer::MEAN);
    layer.add_member("coord", MemberType::U32, 0u32.into());
    layer.add_member("count", MemberType::U32, 0u32.into());
    layer.layer_index()
}

/// Adds the covariance layer: the packed lower-triangular square root of the per-voxel
/// sample covariance.
pub fn add_covariance(layout: &mut MapLayout) -> usize {
    let layer = get_or_add_layer!(layout, default_layer::COVARIANCE);
    for name in ["p00", "p10", "p11", "p20", "p21", "p22"] {
        layer.add_member(name, MemberType::F32, 0.0f32.into());
    }
    layer.layer_index()
}

/// Adds the traversal layer: accumulated chord length of all rays through each voxel.
pub fn add_traversal(layout: &mut MapLayout) -> usize {
    let layer = get_or_add_layer!(layout, default_layer::TRAVERSAL);
    layer.add_member("length", MemberType::F32, 0.0f32.into());
    layer.layer_index()
}

/// Adds the clearance layer. Only populated by external query code; carried here for the
/// legacy serialization format.
pub fn add_clearance(layout: &mut MapLayout) -> usize {
    let layer = get_or_add_layer!(layout, default_layer::CLEARANCE);
    layer.add_member("value", MemberType::F32, (-1.0f32).into());
    layer.layer_index()
}

/// Adds the incident normal layer: a quantized estimate of the average ray direction into
/// each sample voxel.
pub fn add_incident_normal(layout: &mut MapLayout) -> usize {
    let layer = get_or_add_layer!(layout, default_layer::INCIDENT);
    layer.add_member("packed_normal", MemberType::U32, 0u32.into());
    layer.layer_index()
}

/// Adds the intensity layer: running mean and covariance of sample intensities.
pub fn add_intensity(layout: &mut MapLayout) -> usize {
    let layer = get_or_add_layer!(layout, default_layer::INTENSITY);
    layer.add_member("mean", MemberType::F32, 0.0f32.into());
    layer.add_member("cov", MemberType::F32, 0.0f32.into());
    layer.layer_index()
}

/// Adds the hit/miss count layer.
pub fn add_hit_miss(layout: &mut MapLayout) -> usize {
    let layer = get_or_add_layer!(layout, default_layer::HIT_MISS);
    layer.add_member("hit", MemberType::U32, 0u32.into());
    layer.add_member("miss", MemberType::U32, 0u32.into());
    layer.layer_index()
}

/// Adds the touch time layer: quantized milliseconds since the map's first sample timestamp.
pub fn add_touch_time(layout: &mut MapLayout) -> usize {
    let layer = get_or_add_layer!(layout, default_layer::TOUCH_TIME);
    layer.add_member("time", MemberType::U32, 0u32.into());
    layer.layer_index()
}
