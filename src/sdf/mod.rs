//! Analytic signed-distance shapes and the boolean operators that combine
//! them. A shape is a tagged variant with a shared header; evaluating one is
//! a single match on the tag, and save/load persists the tag instead of
//! needing runtime type queries.

use crate::{aabb::Aabb, util, TerrainError};
use nalgebra::{point, vector, Matrix4, Point3, Vector3};
use std::sync::Arc;

pub mod cache;
pub mod composer;
pub mod heightmap;

pub use self::{
    cache::SdfCache,
    composer::{Composer, ComposerSnapshot, ShapeId},
    heightmap::Heightfield,
};

/// How a shape participates in the composed field, in stack order.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CsgOp {
    Union = 0,
    Subtraction = 1,
    SmoothUnion = 2,
    SmoothSubtraction = 3,
    /// Contributes only to material selection; never moves the surface.
    Material = 4,
}

impl CsgOp {
    pub fn from_u8(value: u8) -> Option<CsgOp> {
        Some(match value {
            0 => CsgOp::Union,
            1 => CsgOp::Subtraction,
            2 => CsgOp::SmoothUnion,
            3 => CsgOp::SmoothSubtraction,
            4 => CsgOp::Material,
            _ => return None,
        })
    }
}

pub fn op_union(d1: f32, d2: f32) -> f32 {
    d1.min(d2)
}

pub fn op_subtraction(d1: f32, d2: f32) -> f32 {
    d1.max(-d2)
}

/// Polynomial smooth minimum. Equivalent to the exponential formulation but
/// with no overflow cases and exact outside the blend band.
pub fn op_smooth_union(d1: f32, d2: f32, k: f32) -> f32 {
    if k <= 0.0 {
        return op_union(d1, d2);
    }
    let h = (k - (d1 - d2).abs()).max(0.0);
    d1.min(d2) - h * h / (4.0 * k)
}

pub fn op_smooth_subtraction(d1: f32, d2: f32, k: f32) -> f32 {
    if k <= 0.0 {
        return op_subtraction(d1, d2);
    }
    let h = (k - (d1 + d2).abs()).max(0.0);
    d1.max(-d2) + h * h / (4.0 * k)
}

/// Signed distance to a box with the given half extents, `q` in the box's
/// axis-aligned frame.
fn box_distance(q: Point3<f32>, half: Vector3<f32>) -> f32 {
    let d = vector![q.x.abs() - half.x, q.y.abs() - half.y, q.z.abs() - half.z];
    let outside = vector![d.x.max(0.0), d.y.max(0.0), d.z.max(0.0)].norm();
    let inside = d.x.max(d.y).max(d.z).min(0.0);
    outside + inside
}

#[derive(Clone, Debug)]
pub enum ShapeKind {
    Box {
        corner_radius: f32,
    },
    Cylinder {
        /// End-cap radius multipliers in `[0, 1]`, applied at the +Z and -Z
        /// caps respectively.
        top: f32,
        bottom: f32,
    },
    Heightmap {
        map: Arc<Heightfield>,
    },
}

impl ShapeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ShapeKind::Box { .. } => "box",
            ShapeKind::Cylinder { .. } => "cylinder",
            ShapeKind::Heightmap { .. } => "heightmap",
        }
    }
}

/// One analytic SDF shape: variant payload plus the header every shape
/// carries. Evaluation is `&self` and touches no shared state, so a snapshot
/// of shapes may be read from any number of worker threads.
#[derive(Clone, Debug)]
pub struct Shape {
    pub(crate) kind: ShapeKind,
    pub(crate) op: CsgOp,
    pub(crate) material_id: u8,
    pub(crate) smoothing: f32,

    local_to_world: Matrix4<f32>,
    /// Full inverse; maps world space into the shape's unit cube.
    world_to_local: Matrix4<f32>,
    /// Inverse of the rigid part only; world units survive, so distances
    /// measured in this frame are world distances.
    world_to_rigid: Matrix4<f32>,
    half_size: Vector3<f32>,
    aabb: Aabb,

    pub(crate) dirty: bool,
    /// Where this shape was when it last went clean; published together with
    /// the current box as the invalidation region.
    pub(crate) aabb_prev: Aabb,
}

impl Shape {
    pub fn new(kind: ShapeKind) -> Self {
        let mut shape = Self {
            kind,
            op: CsgOp::Union,
            material_id: 0,
            smoothing: 0.0,
            local_to_world: Matrix4::identity(),
            world_to_local: Matrix4::identity(),
            world_to_rigid: Matrix4::identity(),
            half_size: vector![1.0, 1.0, 1.0],
            aabb: Aabb::new(point![-1.0, -1.0, -1.0], point![1.0, 1.0, 1.0]),
            dirty: false,
            aabb_prev: Aabb::new(point![-1.0, -1.0, -1.0], point![1.0, 1.0, 1.0]),
        };
        shape
            .set_transform(Matrix4::identity())
            .expect("identity transform is invertible");
        shape.aabb_prev = shape.aabb;
        shape
    }

    pub fn kind(&self) -> &ShapeKind {
        &self.kind
    }

    pub fn op(&self) -> CsgOp {
        self.op
    }

    pub fn material_id(&self) -> u8 {
        self.material_id
    }

    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    pub fn transform(&self) -> &Matrix4<f32> {
        &self.local_to_world
    }

    pub fn half_size(&self) -> Vector3<f32> {
        self.half_size
    }

    pub fn aabb(&self) -> Aabb {
        self.aabb
    }

    /// Installs a new local-to-world transform and recomputes the derived
    /// frames and world box. Marks the shape dirty; setting the same
    /// transform twice still yields a single invalidation because the dirty
    /// flag only latches.
    pub fn set_transform(&mut self, transform: Matrix4<f32>) -> Result<(), TerrainError> {
        let world_to_local = transform
            .try_inverse()
            .ok_or(TerrainError::SingularTransform)?;

        let basis_x = transform.fixed_slice::<3, 1>(0, 0).into_owned();
        let basis_y = transform.fixed_slice::<3, 1>(0, 1).into_owned();
        let basis_z = transform.fixed_slice::<3, 1>(0, 2).into_owned();
        let half_size = vector![basis_x.norm(), basis_y.norm(), basis_z.norm()];

        let mut rigid = transform;
        rigid.fixed_slice_mut::<3, 1>(0, 0).copy_from(&(basis_x / half_size.x));
        rigid.fixed_slice_mut::<3, 1>(0, 1).copy_from(&(basis_y / half_size.y));
        rigid.fixed_slice_mut::<3, 1>(0, 2).copy_from(&(basis_z / half_size.z));
        let world_to_rigid = rigid
            .try_inverse()
            .ok_or(TerrainError::SingularTransform)?;

        let mut corners = [point![0.0, 0.0, 0.0]; 8];
        for (i, corner) in corners.iter_mut().enumerate() {
            let local = point![
                if i & 1 == 0 { -1.0 } else { 1.0 },
                if i & 2 == 0 { -1.0 } else { 1.0 },
                if i & 4 == 0 { -1.0 } else { 1.0 }
            ];
            *corner = transform.transform_point(&local);
        }

        self.local_to_world = transform;
        self.world_to_local = world_to_local;
        self.world_to_rigid = world_to_rigid;
        self.half_size = half_size;
        self.aabb = Aabb::from_points(corners);
        self.dirty = true;
        Ok(())
    }

    /// Signed distance from `p` to this shape alone, negative inside.
    pub fn value(&self, p: Point3<f32>) -> f32 {
        match &self.kind {
            &ShapeKind::Box { corner_radius } => {
                let q = self.world_to_rigid.transform_point(&p);
                let radius = corner_radius
                    .min(self.half_size.x.min(self.half_size.y).min(self.half_size.z));
                let half = self.half_size - Vector3::repeat(radius);
                box_distance(q, half) - radius
            }
            &ShapeKind::Cylinder { top, bottom } => {
                let q = self.world_to_rigid.transform_point(&p);
                let t = if self.half_size.z > 0.0 {
                    ((q.z / self.half_size.z + 1.0) * 0.5).clamp(0.0, 1.0)
                } else {
                    0.5
                };
                let radius = util::lerp(bottom, top, t) * self.half_size.x;
                let lateral = (q.x * q.x + q.y * q.y).sqrt() - radius;
                let vertical = q.z.abs() - self.half_size.z;
                let outside = vector![lateral.max(0.0), vertical.max(0.0)].norm();
                lateral.max(vertical).min(0.0) + outside
            }
            ShapeKind::Heightmap { map } => {
                let local = self.world_to_local.transform_point(&p);
                let u = (local.x + 1.0) * 0.5;
                let v = (local.y + 1.0) * 0.5;
                let surface = map.sample(u, v) * 2.0 - 1.0;
                let above = (local.z - surface) * self.half_size.z;

                // the height sheet only exists inside the reference box
                let q = self.world_to_rigid.transform_point(&p);
                above.max(box_distance(q, self.half_size))
            }
        }
    }
}
