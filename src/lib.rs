use crate::chunk::ChunkPos;

pub mod aabb;
pub mod chunk;
pub mod config;
pub mod debug;
pub mod job;
pub mod mesher;
pub mod persistence;
pub mod query;
pub mod residency;
pub mod sdf;
pub mod terrain;
pub mod util;

pub mod math {
    pub use nalgebra::{Matrix3, Matrix4, Point2, Point3, Vector2, Vector3, Vector4};
}

pub mod prelude {
    pub use super::util;

    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
    pub use anyhow::{anyhow, bail};

    pub use nalgebra::{point, vector};
}

pub use crate::{
    chunk::BlockKind,
    config::TerrainConfig,
    terrain::{Terrain, TerrainReader},
};

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
}

impl Axis {
    pub fn unit(&self) -> nalgebra::Vector3<i32> {
        match self {
            Axis::X => nalgebra::vector![1, 0, 0],
            Axis::Y => nalgebra::vector![0, 1, 0],
            Axis::Z => nalgebra::vector![0, 0, 1],
        }
    }

    /// the other two axes, in cyclic order
    pub fn others(&self) -> (Axis, Axis) {
        match self {
            Axis::X => (Axis::Y, Axis::Z),
            Axis::Y => (Axis::Z, Axis::X),
            Axis::Z => (Axis::X, Axis::Y),
        }
    }

    pub fn enumerate<F>(mut func: F)
    where
        F: FnMut(Axis),
    {
        func(Axis::X);
        func(Axis::Y);
        func(Axis::Z);
    }
}

/// Failures that are visible to callers. Errors inside background meshing
/// jobs never surface here; they are reduced to [`TerrainError::Saturation`]
/// diagnostics or swallowed with a log line, and queries reduce failures to
/// "no hit"/"touched unloaded".
#[derive(Debug, thiserror::Error)]
pub enum TerrainError {
    #[error("shape transform is not invertible")]
    SingularTransform,

    #[error("unknown shape type `{0}`")]
    UnknownShapeType(String),

    #[error("smoothing must be non-negative, got {0}")]
    NegativeSmoothing(f32),

    #[error("corner radius {radius} exceeds smallest half extent {limit}")]
    CornerRadiusTooLarge { radius: f32, limit: f32 },

    #[error("cap multiplier must be within [0, 1], got {0}")]
    CapOutOfRange(f32),

    #[error("operation applies to {expected} shapes only")]
    WrongShapeVariant { expected: &'static str },

    #[error("shape id is stale or unknown")]
    UnknownShape,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("heightmap sample count {got} does not match {width}x{height}")]
    HeightfieldSizeMismatch {
        width: usize,
        height: usize,
        got: usize,
    },

    #[error("chunk {pos:?} exceeded its vertex or index budget")]
    Saturation { pos: ChunkPos },

    #[error("chunk pool exhausted")]
    ResourceExhausted,
}
