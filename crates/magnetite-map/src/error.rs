use crate::serialise::MapVersion;

use thiserror::Error;

/// Errors raised by the occupancy map engine.
///
/// Ray-level problems (NaN endpoints, filter rejections) are handled silently by the ray
/// filter and never surface here; integration reports the number of rays accepted instead.
/// Compression failures are reported through the compression queue's event log and also
/// never surface through integration.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller-supplied data is malformed: odd ray array length, mismatched attribute array
    /// lengths, or a reference to a layer the layout does not contain.
    #[error("bad input: {0}")]
    BadInput(String),

    /// An operation is not legal in the map's current state, e.g. mutating the voxel layout
    /// after regions have been allocated.
    #[error("invalid state: {0}")]
    StateInvalid(&'static str),

    /// A buffer allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// A compressed voxel block failed to decompress.
    #[error("corrupt voxel block")]
    CorruptBlock,

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The stream does not start with the expected file magic.
    #[error("bad file magic")]
    BadMagic,

    /// The file was written by an incompatible major version.
    #[error("unsupported map version {0}")]
    UnsupportedVersion(MapVersion),

    /// The serialized layout does not describe a loadable map, or a region record disagrees
    /// with the layout.
    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),

    /// A serialized size field exceeds addressable limits.
    #[error("value overflow")]
    ValueOverflow,

    /// The stream ended before the advertised content.
    #[error("truncated stream")]
    Truncated,

    /// A serialize or load operation was cancelled by the caller.
    #[error("aborted")]
    Aborted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
