use magnetite_core::SmallKeyHashMap;

/// A value stored in [`MapInfo`].
#[derive(Clone, Debug, PartialEq)]
pub enum MapValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
}

impl MapValue {
    pub(crate) fn type_code(&self) -> u8 {
        match self {
            Self::Bool(_) => 1,
            Self::I8(_) => 2,
            Self::U8(_) => 3,
            Self::I16(_) => 4,
            Self::U16(_) => 5,
            Self::I32(_) => 6,
            Self::U32(_) => 7,
            Self::I64(_) => 8,
            Self::U64(_) => 9,
            Self::F32(_) => 10,
            Self::F64(_) => 11,
            Self::Str(_) => 12,
        }
    }
}

/// Keys consumed by heightmap generation collaborators.
pub mod info_key {
    pub const HEIGHTMAP: &str = "heightmap";
    pub const HEIGHTMAP_AXIS: &str = "heightmap-axis";
    pub const HEIGHTMAP_AXIS_X: &str = "heightmap-axis-x";
    pub const HEIGHTMAP_AXIS_Y: &str = "heightmap-axis-y";
    pub const HEIGHTMAP_AXIS_Z: &str = "heightmap-axis-z";
    pub const HEIGHTMAP_CLEARANCE: &str = "heightmap-clearance";
}

/// Arbitrary key/value metadata attached to a map and carried through serialization.
///
/// Collaborators use this to mark derived products; e.g. a heightmap generator records its
/// up axis under the [`info_key`] keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapInfo {
    entries: SmallKeyHashMap<String, MapValue>,
}

impl MapInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: MapValue) {
        self.entries.insert(name.to_owned(), value);
    }

    pub fn get(&self, name: &str) -> Option<&MapValue> {
        self.entries.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<MapValue> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in unspecified order. Serialization sorts by name for determinism.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MapValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            MapValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i8(&self, name: &str) -> Option<i8> {
        match self.get(name)? {
            MapValue::I8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            MapValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            MapValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}
